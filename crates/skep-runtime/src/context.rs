//! The capability surface handed to a service's callbacks.
//!
//! A context borrows the worker and the service for the duration of one
//! callback. "Blocking" operations never block the worker thread: `call`,
//! `sleep`, and `read` register a continuation under a fresh session id and
//! return immediately; the continuation runs when the reply, timer, or
//! socket data arrives.

use std::any::Any;
use std::net::SocketAddr;
use std::sync::Arc;

use tracing::error;

use skep_protocol::framing::text::ReadRequest;
use skep_protocol::{Buffer, BufferFlags, Message, Value, ptype, worker_of_fd};

use crate::config::ServiceConfig;
use crate::error::Error;
use crate::registry::ProtoRecord;
use crate::router::Router;
use crate::service::{Actor, Service};
use crate::sessions::{CallReply, Resume};
use crate::timer::SessionFire;
use crate::worker::Worker;
use crate::net::socket_manager::SocketCmd;

fn wrap<A, F>(f: F) -> Resume
where
    A: Actor,
    F: FnOnce(&mut A, &mut Context<'_>, CallReply) + 'static,
{
    Box::new(move |any: &mut dyn Any, ctx: &mut Context<'_>, reply: CallReply| {
        match any.downcast_mut::<A>() {
            Some(actor) => f(actor, ctx, reply),
            None => error!("continuation resumed against a different behavior type"),
        }
    })
}

pub struct Context<'a> {
    pub(crate) worker: &'a mut Worker,
    pub(crate) svc: &'a mut Service,
}

impl<'a> Context<'a> {
    pub(crate) fn new(worker: &'a mut Worker, svc: &'a mut Service) -> Self {
        Self { worker, svc }
    }

    pub fn id(&self) -> u32 {
        self.svc.id
    }

    pub fn name(&self) -> &str {
        &self.svc.name
    }

    pub fn worker_id(&self) -> u8 {
        self.worker.id
    }

    pub fn router(&self) -> Arc<Router> {
        Arc::clone(&self.worker.router)
    }

    fn message(&self, to: u32, ptype: u8, session: i32, payload: Buffer) -> Message {
        Message {
            sender: self.svc.id,
            receiver: to,
            session,
            ptype,
            subtype: 0,
            header: String::new(),
            payload: Arc::new(payload),
        }
    }

    // --- messaging -------------------------------------------------------

    /// Fire-and-forget send.
    pub fn send(&mut self, to: u32, ptype: u8, payload: Buffer) -> bool {
        let msg = self.message(to, ptype, 0, payload);
        self.worker.router.send(msg)
    }

    /// Fire-and-forget send addressed by unique name.
    pub fn send_named(&mut self, name: &str, ptype: u8, payload: Buffer) -> bool {
        let mut msg = self.message(0, ptype, 0, payload);
        msg.header = name.to_string();
        self.worker.router.send(msg)
    }

    /// Allocate a session and record `f` as its continuation. The watcher
    /// also remembers `receiver`: if that service exits before replying,
    /// the continuation runs with `Err("target exited")`.
    pub fn make_response<A, F>(&mut self, receiver: u32, f: F) -> i32
    where
        A: Actor,
        F: FnOnce(&mut A, &mut Context<'_>, CallReply) + 'static,
    {
        self.svc.sessions.allocate(wrap::<A, F>(f), receiver)
    }

    /// Request/response: send `payload` to `to`, suspend on a fresh
    /// session, resume `f` with the reply. A non-zero `timeout_ms` races a
    /// timer against the reply; whichever loses is cancelled.
    pub fn call<A, F>(&mut self, to: u32, ptype: u8, payload: Buffer, timeout_ms: u32, f: F) -> i32
    where
        A: Actor,
        F: FnOnce(&mut A, &mut Context<'_>, CallReply) + 'static,
    {
        let session = self.make_response::<A, F>(to, f);

        if timeout_ms > 0 {
            let now = self.worker.now_ms();
            self.worker
                .timers
                .once_session(self.svc.id, session, SessionFire::Timeout, timeout_ms, now);
        }

        let msg = self.message(to, ptype, -session, payload);
        if !self.worker.router.send(msg) {
            // Resolution failures with a named receiver already produced an
            // error reply; cover the direct-id path too.
            self.worker
                .router
                .reply_error(self.svc.id, session, "service not found");
        }
        session
    }

    /// `call` with a structured payload on the `LUA` protocol.
    pub fn call_value<A, F>(&mut self, to: u32, args: &Value, timeout_ms: u32, f: F) -> Result<i32, Error>
    where
        A: Actor,
        F: FnOnce(&mut A, &mut Context<'_>, CallReply) + 'static,
    {
        let payload = args.pack()?;
        Ok(self.call(to, ptype::LUA, payload, timeout_ms, f))
    }

    /// Reply to a request. A zero session is a no-op: the sender did not
    /// ask for a reply.
    pub fn response(&mut self, to: u32, ptype: u8, session: i32, payload: Buffer) -> bool {
        if session == 0 {
            return true;
        }
        let msg = self.message(to, ptype, session.abs(), payload);
        self.worker.router.send(msg)
    }

    pub fn respond_value(&mut self, to: u32, session: i32, value: &Value) -> Result<bool, Error> {
        let payload = value.pack()?;
        Ok(self.response(to, ptype::LUA, session, payload))
    }

    /// Make a live session inert: a late reply is dropped without
    /// resuming. Idempotent.
    pub fn cancel_session(&mut self, session: i32) {
        self.svc.sessions.cancel(session);
    }

    /// Suspend for `ms` milliseconds, then resume `f`.
    pub fn sleep<A, F>(&mut self, ms: u32, f: F) -> i32
    where
        A: Actor,
        F: FnOnce(&mut A, &mut Context<'_>, CallReply) + 'static,
    {
        let session = self.make_response::<A, F>(self.svc.id, f);
        let now = self.worker.now_ms();
        self.worker
            .timers
            .once_session(self.svc.id, session, SessionFire::Wake, ms, now);
        session
    }

    /// Run an admin command line (`"<worker> <cmd> [args…]"`), resuming `f`
    /// with the text reply.
    pub fn call_command<A, F>(&mut self, cmdline: &str, f: F) -> i32
    where
        A: Actor,
        F: FnOnce(&mut A, &mut Context<'_>, CallReply) + 'static,
    {
        let session = self.make_response::<A, F>(0, f);
        self.worker.router.runcmd(self.svc.id, cmdline, session);
        session
    }

    // --- timers ----------------------------------------------------------

    /// Arm a repeating timer; `times == -1` repeats until removed. Fires
    /// the service's `timer` callback.
    pub fn repeated(&mut self, interval_ms: u32, times: i32) -> u32 {
        let now = self.worker.now_ms();
        let id = self.worker.timers.repeated(self.svc.id, interval_ms, times, now);
        self.svc.timers.insert(id);
        id
    }

    /// Cancel a timer; allowed from the timer's own fire.
    pub fn remove_timer(&mut self, id: u32) {
        self.svc.timers.remove(&id);
        self.worker.timers.remove(id);
    }

    // --- sockets ---------------------------------------------------------

    /// Open a listener on this worker. Accepted connections frame with
    /// `proto` and deliver events to this service.
    pub fn listen(&mut self, addr: &str, proto: u8) -> Result<u32, Error> {
        self.worker
            .sockets
            .listen(&self.worker.registry, addr, proto, self.svc.id)
    }

    /// The bound address of a listener on this worker; useful when
    /// listening on port zero.
    pub fn listener_addr(&self, fd: u32) -> Option<SocketAddr> {
        self.worker.sockets.local_addr(fd)
    }

    /// Start an outbound connection from this worker.
    pub fn connect(&mut self, addr: &str, proto: u8) -> Result<u32, Error> {
        let now = self.worker.now_ms();
        self.worker
            .sockets
            .connect(&self.worker.registry, addr, proto, self.svc.id, now)
    }

    fn route_socket(&mut self, fd: u32, cmd: SocketCmd) -> bool {
        if worker_of_fd(fd) == u16::from(self.worker.id) {
            let now = self.worker.now_ms();
            self.worker.sockets.socket_cmd(&self.worker.registry, cmd, now);
            true
        } else {
            self.worker.router.socket_cmd(fd, cmd)
        }
    }

    /// Read from a connection, resuming `f` with the bytes. Exact-size and
    /// delimiter reads apply to text-framed connections; only one read may
    /// be outstanding per connection.
    pub fn read<A, F>(&mut self, fd: u32, req: ReadRequest, f: F) -> i32
    where
        A: Actor,
        F: FnOnce(&mut A, &mut Context<'_>, CallReply) + 'static,
    {
        let session = self.make_response::<A, F>(0, f);
        let owner = self.svc.id;
        if !self.route_socket(fd, SocketCmd::Read { fd, req, owner, session }) {
            self.worker.router.reply_error(owner, session, "closed");
        }
        session
    }

    /// Queue a write; the connection applies its framing.
    pub fn write(&mut self, fd: u32, mut buf: Buffer) -> bool {
        buf.set_flags(BufferFlags::NEEDS_FRAMING);
        self.route_socket(fd, SocketCmd::Send { fd, buf: Arc::new(buf) })
    }

    /// Queue a write without framing; the bytes go out verbatim.
    pub fn write_raw(&mut self, fd: u32, buf: Buffer) -> bool {
        self.route_socket(fd, SocketCmd::Send { fd, buf: Arc::new(buf) })
    }

    /// Queue a framed write and close the connection once it drains.
    pub fn write_then_close(&mut self, fd: u32, mut buf: Buffer) -> bool {
        buf.set_flags(BufferFlags::NEEDS_FRAMING | BufferFlags::CLOSE_AFTER_SEND);
        self.route_socket(fd, SocketCmd::Send { fd, buf: Arc::new(buf) })
    }

    pub fn close_socket(&mut self, fd: u32) -> bool {
        self.route_socket(fd, SocketCmd::Close { fd })
    }

    /// Idle timeout in seconds; zero disables. Enforced by a coarse
    /// ten-second sweep on the owning worker.
    pub fn set_socket_timeout(&mut self, fd: u32, secs: u64) -> bool {
        self.route_socket(fd, SocketCmd::SetTimeout { fd, secs })
    }

    /// Enable the chunked length-prefix extension: `"r"`, `"w"`, `"rw"`,
    /// or `"none"`.
    pub fn set_enable_chunked(&mut self, fd: u32, mode: &str) -> Result<bool, Error> {
        let mode = mode.parse()?;
        Ok(self.route_socket(fd, SocketCmd::SetChunkMode { fd, mode }))
    }

    pub fn set_send_queue_limits(&mut self, fd: u32, warn: usize, max: usize) -> bool {
        self.route_socket(fd, SocketCmd::SetQueueLimits { fd, warn, max })
    }

    // --- lifecycle -------------------------------------------------------

    /// Finish this service. Takes effect when the current callback
    /// returns: the service is unregistered, then destroyed.
    pub fn quit(&mut self) {
        self.svc.quit = true;
    }

    /// True once a stop has been requested for this service.
    pub fn exiting(&self) -> bool {
        self.svc.exiting
    }

    /// True while another service holds a retain handle on this one.
    pub fn retained(&self) -> bool {
        self.svc.retain_count > 0
    }

    /// Hold `id` alive across a stop; it learns of the last release via a
    /// `SYSTEM` message with header `"release"`.
    pub fn retain(&mut self, id: u32) -> bool {
        self.worker.router.retain(id)
    }

    pub fn release(&mut self, id: u32) -> bool {
        self.worker.router.release(id, self.svc.id)
    }

    /// Create a service; round-robin worker placement unless `worker_hint`
    /// is non-zero.
    pub fn new_service(&mut self, conf: ServiceConfig, worker_hint: u8) -> bool {
        self.worker.router.new_service(conf, worker_hint, None)
    }

    /// Create a service and resume `f` with its id (packed as an `Int`).
    pub fn call_new_service<A, F>(&mut self, conf: ServiceConfig, worker_hint: u8, f: F) -> i32
    where
        A: Actor,
        F: FnOnce(&mut A, &mut Context<'_>, CallReply) + 'static,
    {
        let session = self.make_response::<A, F>(0, f);
        if !self
            .worker
            .router
            .spawn_service(conf, worker_hint, Some((self.svc.id, session)), None)
        {
            self.worker.router.reply_error(self.svc.id, session, "worker unavailable");
        }
        session
    }

    /// Ask a service to exit; acknowledged on unregister.
    pub fn remove_service(&mut self, id: u32) -> bool {
        self.worker.router.remove_service(id, None)
    }

    // --- environment & accounting ---------------------------------------

    pub fn set_env(&mut self, name: &str, value: &str) {
        self.worker.router.set_env(name, value);
    }

    pub fn get_env(&self, name: &str) -> Option<String> {
        self.worker.router.get_env(name)
    }

    /// Account sandbox memory against the service's limit.
    pub fn alloc(&mut self, bytes: u64) -> Result<(), Error> {
        self.svc.alloc(bytes)
    }

    pub fn free(&mut self, bytes: u64) {
        self.svc.free(bytes)
    }

    pub fn mem_used(&self) -> u64 {
        self.svc.mem_used
    }

    /// Nanoseconds this service has spent inside its callbacks.
    pub fn cpu_cost(&self) -> u64 {
        self.svc.cpu_cost_ns
    }

    pub fn register_protocol(&mut self, record: ProtoRecord) {
        self.svc.protocols.register(record);
    }
}
