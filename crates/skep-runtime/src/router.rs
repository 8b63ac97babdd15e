//! Process-global directory: service-to-worker routing, the unique-name
//! registry, the environment store, worker fan-out, and the live-fd set.
//!
//! Service ids encode their worker in the high 8 bits and fds in the high
//! 16, so routing is a bit extraction with no shared table. The unique-name
//! registry is the only multi-writer directory; it sits behind a
//! writer-preferring lock and registration fails atomically on collision.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicUsize, Ordering};
use std::time::Duration;

use crossbeam_channel::{Sender, bounded};
use mio::Waker;
use parking_lot::{Mutex, RwLock};
use tracing::{debug, warn};

use skep_protocol::{Buffer, Message, ptype, worker_of_fd, worker_of_service};

use crate::config::ServiceConfig;
use crate::error::Error;
use crate::net::socket_manager::SocketCmd;
use crate::service::ActorFactory;
use crate::worker::WorkerInput;

pub(crate) struct WorkerHandle {
    pub id: u8,
    pub sender: Sender<WorkerInput>,
    pub waker: Arc<Waker>,
}

impl WorkerHandle {
    fn post(&self, input: WorkerInput) -> bool {
        if self.sender.send(input).is_err() {
            return false;
        }
        if let Err(e) = self.waker.wake() {
            warn!("worker {} wake failed: {e}", self.id);
        }
        true
    }
}

pub struct Router {
    workers: Vec<WorkerHandle>,
    types: HashMap<String, ActorFactory>,
    unique: RwLock<HashMap<String, u32>>,
    env: RwLock<HashMap<String, String>>,
    live_fds: Mutex<HashSet<u32>>,
    next_worker: AtomicUsize,
    stopping: AtomicBool,
    exit_code: AtomicI32,
}

impl Router {
    pub(crate) fn new(workers: Vec<WorkerHandle>, types: HashMap<String, ActorFactory>) -> Self {
        Self {
            workers,
            types,
            unique: RwLock::new(HashMap::new()),
            env: RwLock::new(HashMap::new()),
            live_fds: Mutex::new(HashSet::new()),
            next_worker: AtomicUsize::new(0),
            stopping: AtomicBool::new(false),
            exit_code: AtomicI32::new(0),
        }
    }

    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }

    /// Workers are numbered from one; zero in an id's high bits would make
    /// "resolve receiver by name" ambiguous.
    fn handle(&self, worker_id: u8) -> Option<&WorkerHandle> {
        if worker_id == 0 {
            return None;
        }
        self.workers.get(worker_id as usize - 1)
    }

    pub(crate) fn post_to(&self, worker_id: u8, input: WorkerInput) -> bool {
        match self.handle(worker_id) {
            Some(handle) => handle.post(input),
            None => false,
        }
    }

    /// Route a message to its receiver's worker. A zero receiver with a
    /// non-empty header is resolved through the unique-name registry first.
    pub fn send(&self, mut msg: Message) -> bool {
        if msg.receiver == 0 {
            if msg.header.is_empty() {
                return false;
            }
            match self.get_unique_service(&msg.header) {
                Some(id) => msg.receiver = id,
                None => {
                    debug!("unique name '{}' did not resolve", msg.header);
                    if msg.session < 0 {
                        self.reply_error(msg.sender, -msg.session, "service not found");
                    }
                    return false;
                }
            }
        }

        let worker = worker_of_service(msg.receiver);
        self.post_to(worker, WorkerInput::Message(msg))
    }

    /// Error reply closing out a session; used when a request cannot be
    /// delivered at all.
    pub(crate) fn reply_error(&self, to: u32, session: i32, text: &str) {
        if to == 0 || session <= 0 {
            return;
        }
        let msg = Message {
            sender: 0,
            receiver: to,
            session,
            ptype: ptype::ERROR,
            subtype: 0,
            header: String::new(),
            payload: Arc::new(Buffer::from_slice(text.as_bytes())),
        };
        self.send(msg);
    }

    /// Fan one message out to every worker; each delivers it to all local
    /// services. The payload is shared, not copied.
    pub fn broadcast(&self, msg: Message) {
        for handle in &self.workers {
            handle.post(WorkerInput::Broadcast(msg.clone()));
        }
    }

    /// Create a service asynchronously. The selected worker constructs the
    /// behavior, registers a unique name, and runs `start`. `reply`
    /// addresses a `(service, session)` that receives the new id; `notify`
    /// is a channel for non-service callers.
    pub(crate) fn spawn_service(
        &self,
        conf: ServiceConfig,
        worker_hint: u8,
        reply: Option<(u32, i32)>,
        notify: Option<Sender<Result<u32, String>>>,
    ) -> bool {
        let worker = if worker_hint > 0 {
            worker_hint
        } else {
            (self.next_worker.fetch_add(1, Ordering::Relaxed) % self.worker_count()) as u8 + 1
        };
        self.post_to(worker, WorkerInput::Spawn { conf, reply, notify })
    }

    pub fn new_service(&self, conf: ServiceConfig, worker_hint: u8, reply: Option<(u32, i32)>) -> bool {
        self.spawn_service(conf, worker_hint, reply, None)
    }

    /// Create a service and wait for its id. For callers outside any
    /// worker (bootstrap, tests).
    pub fn new_service_blocking(
        &self,
        conf: ServiceConfig,
        worker_hint: u8,
        timeout: Duration,
    ) -> Result<u32, Error> {
        let name = conf.name.clone();
        let (tx, rx) = bounded(1);
        if !self.spawn_service(conf, worker_hint, None, Some(tx)) {
            return Err(Error::WorkerUnavailable(worker_hint));
        }
        match rx.recv_timeout(timeout) {
            Ok(Ok(id)) => Ok(id),
            Ok(Err(text)) => Err(Error::ServiceInit(name, text)),
            Err(_) => Err(Error::ServiceInit(name, "creation timed out".to_string())),
        }
    }

    /// Ask a service to exit. The acknowledgement, if requested, is sent
    /// when the service is unregistered, not when destroy completes.
    pub fn remove_service(&self, id: u32, reply: Option<(u32, i32)>) -> bool {
        self.post_to(worker_of_service(id), WorkerInput::Remove { id, reply })
    }

    /// Admin text channel: `runcmd(from, "<worker> <cmd> [args…]", session)`.
    pub fn runcmd(&self, from: u32, cmdline: &str, session: i32) -> bool {
        let mut parts = cmdline.splitn(2, ' ');
        let Some(worker) = parts.next().and_then(|w| w.parse::<u8>().ok()) else {
            self.reply_error(from, session, "runcmd: missing worker id");
            return false;
        };
        let line = parts.next().unwrap_or("").to_string();
        self.post_to(worker, WorkerInput::RunCmd { from, line, session })
    }

    pub fn get_unique_service(&self, name: &str) -> Option<u32> {
        self.unique.read().get(name).copied()
    }

    /// Register `name -> id`; fails atomically if the name exists.
    pub fn set_unique_service(&self, name: &str, id: u32) -> bool {
        let mut table = self.unique.write();
        if table.contains_key(name) {
            return false;
        }
        table.insert(name.to_string(), id);
        true
    }

    pub(crate) fn remove_unique_service(&self, name: &str, id: u32) {
        let mut table = self.unique.write();
        if table.get(name) == Some(&id) {
            table.remove(name);
        }
    }

    pub fn set_env(&self, name: &str, value: &str) {
        self.env.write().insert(name.to_string(), value.to_string());
    }

    pub fn get_env(&self, name: &str) -> Option<String> {
        self.env.read().get(name).cloned()
    }

    /// Retain/release handles for graceful-exit coordination.
    pub(crate) fn retain(&self, id: u32) -> bool {
        self.post_to(worker_of_service(id), WorkerInput::Retain { id })
    }

    pub(crate) fn release(&self, id: u32, from: u32) -> bool {
        self.post_to(worker_of_service(id), WorkerInput::Release { id, from })
    }

    /// Route a socket operation to the worker owning the fd.
    pub(crate) fn socket_cmd(&self, fd: u32, cmd: SocketCmd) -> bool {
        let worker = worker_of_fd(fd);
        if worker > u8::MAX as u16 {
            return false;
        }
        self.post_to(worker as u8, WorkerInput::Socket(cmd))
    }

    pub(crate) fn try_reserve_fd(&self, fd: u32) -> bool {
        self.live_fds.lock().insert(fd)
    }

    pub(crate) fn release_fd(&self, fd: u32) {
        self.live_fds.lock().remove(&fd);
    }

    #[cfg(test)]
    pub(crate) fn fd_is_live(&self, fd: u32) -> bool {
        self.live_fds.lock().contains(&fd)
    }

    pub(crate) fn factory(&self, service_type: &str) -> Option<&ActorFactory> {
        self.types.get(service_type)
    }

    /// A service left its worker's table: drop its unique name and tell
    /// every other service, so coroutines awaiting its replies fail fast.
    pub(crate) fn unregister_service(&self, id: u32, name: &str, unique: bool) {
        if unique {
            self.remove_unique_service(name, id);
        }
        let exit_note = Message {
            sender: id,
            receiver: 0,
            session: 0,
            ptype: ptype::SYSTEM,
            subtype: 0,
            header: "exit".to_string(),
            payload: Arc::new(Buffer::new()),
        };
        self.broadcast(exit_note);
    }

    /// Move the runtime to `stopping` and signal every worker. The first
    /// caller's exit code wins.
    pub fn stop(&self, code: i32) {
        if self.stopping.swap(true, Ordering::SeqCst) {
            return;
        }
        self.exit_code.store(code, Ordering::SeqCst);
        for handle in &self.workers {
            handle.post(WorkerInput::Stop);
        }
    }

    pub fn is_stopping(&self) -> bool {
        self.stopping.load(Ordering::SeqCst)
    }

    pub fn exit_code(&self) -> i32 {
        self.exit_code.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bare_router() -> Router {
        Router::new(Vec::new(), HashMap::new())
    }

    #[test]
    fn unique_registration_is_first_wins() {
        let router = bare_router();
        assert!(router.set_unique_service("gate", 0x0100_0001));
        assert!(!router.set_unique_service("gate", 0x0200_0001));
        assert_eq!(router.get_unique_service("gate"), Some(0x0100_0001));

        // Removal checks the id, so a loser cannot evict the winner.
        router.remove_unique_service("gate", 0x0200_0001);
        assert_eq!(router.get_unique_service("gate"), Some(0x0100_0001));
        router.remove_unique_service("gate", 0x0100_0001);
        assert_eq!(router.get_unique_service("gate"), None);
    }

    #[test]
    fn env_values_are_opaque_strings() {
        let router = bare_router();
        assert_eq!(router.get_env("a"), None);
        router.set_env("a", "1");
        router.set_env("a", "2");
        assert_eq!(router.get_env("a").as_deref(), Some("2"));
    }

    #[test]
    fn fd_reservation_prevents_reuse_while_live() {
        let router = bare_router();
        let fd = (3u32 << 16) | 7;
        assert!(router.try_reserve_fd(fd));
        assert!(!router.try_reserve_fd(fd));
        assert!(router.fd_is_live(fd));
        router.release_fd(fd);
        assert!(!router.fd_is_live(fd));
        assert!(router.try_reserve_fd(fd));
    }

    #[test]
    fn send_to_nowhere_fails() {
        let router = bare_router();
        // Receiver zero and no header: nothing to resolve.
        let msg = Message::new(1, 0, ptype::TEXT, Buffer::new());
        assert!(!router.send(msg));
        // Named receiver that is not registered.
        let msg = Message::new(1, 0, ptype::TEXT, Buffer::new()).with_header("nobody");
        assert!(!router.send(msg));
    }

    #[test]
    fn stop_is_sticky_and_first_code_wins() {
        let router = bare_router();
        assert!(!router.is_stopping());
        router.stop(3);
        router.stop(0);
        assert!(router.is_stopping());
        assert_eq!(router.exit_code(), 3);
    }
}
