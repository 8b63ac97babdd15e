//! Per-worker table of listeners and connections, the fd allocator, and the
//! glue between mio readiness events and connection state machines.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use mio::net::{TcpListener, TcpStream};
use mio::{Interest, Registry, Token};
use socket2::{Domain, Socket, Type};
use tracing::{debug, warn};

use skep_protocol::framing::length::ChunkMode;
use skep_protocol::framing::text::ReadRequest;
use skep_protocol::{Buffer, Message, SocketEvent, ptype};

use crate::error::Error;
use crate::metrics::NetStats;
use crate::net::MAX_SOCKET_NUM;
use crate::net::connection::{ConnState, Connection, Gone};
use crate::router::Router;

struct ListenerEntry {
    token: Token,
    listener: TcpListener,
    proto: u8,
    owner: u32,
}

pub(crate) struct SocketManager {
    worker_id: u8,
    router: Arc<Router>,
    listeners: HashMap<u32, ListenerEntry>,
    conns: HashMap<u32, Connection>,
    tokens: HashMap<Token, u32>,
    counter: u16,
    pub stats: NetStats,
}

/// A socket operation routed to the owning worker.
#[derive(Debug)]
pub(crate) enum SocketCmd {
    Send { fd: u32, buf: Arc<Buffer> },
    Read { fd: u32, req: ReadRequest, owner: u32, session: i32 },
    Close { fd: u32 },
    SetTimeout { fd: u32, secs: u64 },
    SetChunkMode { fd: u32, mode: ChunkMode },
    SetQueueLimits { fd: u32, warn: usize, max: usize },
}

impl SocketManager {
    pub fn new(worker_id: u8, router: Arc<Router>) -> Self {
        Self {
            worker_id,
            router,
            listeners: HashMap::new(),
            conns: HashMap::new(),
            tokens: HashMap::new(),
            counter: 0,
            stats: NetStats::default(),
        }
    }

    pub fn take_stats(&mut self) -> NetStats {
        std::mem::take(&mut self.stats)
    }

    fn alloc_fd(&mut self) -> Result<u32, Error> {
        for _ in 0..u16::MAX {
            self.counter = self.counter.wrapping_add(1);
            let low = u32::from(self.counter % MAX_SOCKET_NUM) + 1;
            let fd = (u32::from(self.worker_id) << 16) | low;
            if !self.listeners.contains_key(&fd)
                && !self.conns.contains_key(&fd)
                && self.router.try_reserve_fd(fd)
            {
                return Ok(fd);
            }
        }
        Err(Error::FdExhausted(self.worker_id))
    }

    fn token_of(fd: u32) -> Token {
        Token((fd & 0xFFFF) as usize)
    }

    /// Open a listening socket owned by `owner`. Accepted connections use
    /// `proto` framing and deliver their events to the same owner.
    pub fn listen(
        &mut self,
        registry: &Registry,
        addr: &str,
        proto: u8,
        owner: u32,
    ) -> Result<u32, Error> {
        let addr: SocketAddr = addr
            .parse()
            .map_err(|_| Error::Config(format!("bad listen address '{addr}'")))?;

        let socket = Socket::new(Domain::for_address(addr), Type::STREAM, None)?;
        socket.set_reuse_address(true)?;
        socket.set_nonblocking(true)?;
        socket.bind(&addr.into())?;
        socket.listen(1024)?;

        let mut listener = TcpListener::from_std(socket.into());
        let fd = self.alloc_fd()?;
        let token = Self::token_of(fd);
        registry.register(&mut listener, token, Interest::READABLE)?;

        self.tokens.insert(token, fd);
        self.listeners.insert(
            fd,
            ListenerEntry {
                token,
                listener,
                proto,
                owner,
            },
        );
        Ok(fd)
    }

    /// Local address of a listener, for tests binding port zero.
    pub fn local_addr(&self, fd: u32) -> Option<SocketAddr> {
        self.listeners.get(&fd).and_then(|l| l.listener.local_addr().ok())
    }

    /// Start a non-blocking outbound connection. The `connect` event is
    /// delivered once the socket (and for websockets, the handshake)
    /// completes.
    pub fn connect(
        &mut self,
        registry: &Registry,
        addr: &str,
        proto: u8,
        owner: u32,
        now: i64,
    ) -> Result<u32, Error> {
        let peer: SocketAddr = addr
            .parse()
            .map_err(|_| Error::Config(format!("bad connect address '{addr}'")))?;

        let mut stream = TcpStream::connect(peer)?;
        let fd = self.alloc_fd()?;
        let token = Self::token_of(fd);
        registry.register(&mut stream, token, Interest::READABLE | Interest::WRITABLE)?;

        let conn = Connection::outbound(fd, token, stream, proto, owner, now, addr.to_string());
        self.tokens.insert(token, fd);
        self.conns.insert(fd, conn);
        self.stats.connects += 1;
        Ok(fd)
    }

    pub fn handle_event(&mut self, registry: &Registry, event: &mio::event::Event, now: i64) {
        let Some(&fd) = self.tokens.get(&event.token()) else {
            return;
        };

        if self.listeners.contains_key(&fd) {
            self.accept_all(registry, fd, now);
            return;
        }

        let mut out = Vec::new();
        let mut result = Ok(());

        if let Some(conn) = self.conns.get_mut(&fd) {
            if event.is_writable() {
                if conn.state == ConnState::Connecting {
                    result = conn.on_connected(&mut out);
                }
                if result.is_ok() {
                    result = conn.flush(&mut self.stats).map(|_| ());
                }
            }
            if result.is_ok() && event.is_readable() {
                result = conn.handle_readable(now, &mut out, &mut self.stats);
            }
            // The receive path may have queued responses (pong, handshake).
            if result.is_ok() {
                result = conn.flush(&mut self.stats).map(|_| ());
            }
            if result.is_ok() {
                Self::update_interest(registry, conn);
            }
        }

        if let Err(gone) = result {
            self.finish(registry, fd, gone, &mut out);
        }
        self.deliver(out);
    }

    fn accept_all(&mut self, registry: &Registry, listener_fd: u32, now: i64) {
        let mut out = Vec::new();

        loop {
            let entry = self.listeners.get_mut(&listener_fd).expect("listener exists");
            match entry.listener.accept() {
                Ok((stream, _addr)) => {
                    let (proto, owner) = (entry.proto, entry.owner);
                    let fd = match self.alloc_fd() {
                        Ok(fd) => fd,
                        Err(e) => {
                            warn!("accept dropped: {e}");
                            continue;
                        }
                    };
                    let token = Self::token_of(fd);
                    let mut stream = stream;
                    if let Err(e) = registry.register(&mut stream, token, Interest::READABLE) {
                        warn!("accept register failed: {e}");
                        self.router.release_fd(fd);
                        continue;
                    }

                    let conn = Connection::accepted(fd, token, stream, proto, owner, now);
                    // Websocket accepts are announced after the handshake.
                    if proto != ptype::WS {
                        out.push(conn_event(&conn, SocketEvent::Accept));
                    }
                    self.tokens.insert(token, fd);
                    self.conns.insert(fd, conn);
                    self.stats.accepts += 1;
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                Err(e) => {
                    warn!("accept error: {e}");
                    break;
                }
            }
        }
        self.deliver(out);
    }

    pub fn socket_cmd(&mut self, registry: &Registry, cmd: SocketCmd, now: i64) {
        let _ = now;
        let mut out = Vec::new();

        match cmd {
            SocketCmd::Send { fd, buf } => {
                let Some(conn) = self.conns.get_mut(&fd) else {
                    debug!("send to closed fd {fd:#010x} dropped");
                    return;
                };
                match conn.enqueue(buf) {
                    Ok(()) => Self::update_interest(registry, conn),
                    Err(gone) => self.finish(registry, fd, gone, &mut out),
                }
            }
            SocketCmd::Read { fd, req, owner, session } => {
                let Some(conn) = self.conns.get_mut(&fd) else {
                    out.push(read_error(fd, owner, session, "closed"));
                    self.deliver(out);
                    return;
                };
                if let Err(e) = conn.start_read(req, owner, session, &mut out) {
                    out.push(read_error(fd, owner, session, &e.to_string()));
                }
            }
            SocketCmd::Close { fd } => self.close_local(registry, fd),
            SocketCmd::SetTimeout { fd, secs } => {
                if let Some(conn) = self.conns.get_mut(&fd) {
                    conn.timeout_ms = (secs * 1000) as i64;
                }
            }
            SocketCmd::SetChunkMode { fd, mode } => {
                if let Some(conn) = self.conns.get_mut(&fd) {
                    conn.set_chunk_mode(mode);
                }
            }
            SocketCmd::SetQueueLimits { fd, warn, max } => {
                if let Some(conn) = self.conns.get_mut(&fd) {
                    conn.set_queue_limits(warn, max);
                }
            }
        }
        self.deliver(out);
    }

    /// Coarse idle sweep; connections past their timeout are closed with
    /// the `timeout` taxonomy code.
    pub fn sweep(&mut self, registry: &Registry, now: i64) {
        let expired: Vec<u32> = self
            .conns
            .values()
            .filter(|c| c.timed_out(now))
            .map(|c| c.fd)
            .collect();

        for fd in expired {
            let mut out = Vec::new();
            self.finish(registry, fd, Gone::Error("timeout".to_string()), &mut out);
            self.deliver(out);
        }
    }

    /// Drop every socket owned by a service being destroyed. Quiet: the
    /// owner is going away and cannot observe close events.
    pub fn close_owned(&mut self, registry: &Registry, service_id: u32) {
        let fds: Vec<u32> = self
            .listeners
            .iter()
            .filter(|(_, l)| l.owner == service_id)
            .map(|(fd, _)| *fd)
            .chain(
                self.conns
                    .values()
                    .filter(|c| c.owner == service_id)
                    .map(|c| c.fd),
            )
            .collect();

        for fd in fds {
            self.close_local(registry, fd);
        }
    }

    fn close_local(&mut self, registry: &Registry, fd: u32) {
        if let Some(mut entry) = self.listeners.remove(&fd) {
            let _ = registry.deregister(&mut entry.listener);
            self.tokens.remove(&entry.token);
            self.router.release_fd(fd);
            return;
        }
        if let Some(mut conn) = self.conns.remove(&fd) {
            let _ = registry.deregister(&mut conn.stream);
            self.tokens.remove(&conn.token);
            self.router.release_fd(fd);
            self.stats.closes += 1;
        }
    }

    /// Tear down after a remote-side termination, delivering the error and
    /// close events and failing any parked read.
    fn finish(&mut self, registry: &Registry, fd: u32, gone: Gone, out: &mut Vec<Message>) {
        let Some(mut conn) = self.conns.remove(&fd) else {
            return;
        };
        let _ = registry.deregister(&mut conn.stream);
        self.tokens.remove(&conn.token);
        self.stats.closes += 1;

        if let Some(pending) = conn.pending_read.take() {
            let reason = match &gone {
                Gone::Error(text) => text.clone(),
                Gone::Clean => "closed".to_string(),
            };
            out.push(read_error(fd, pending.owner, pending.session, &reason));
        }

        if let Gone::Error(text) = &gone {
            let mut msg = conn_event(&conn, SocketEvent::Error);
            msg.payload = Arc::new(Buffer::from_slice(text.as_bytes()));
            out.push(msg);
        }
        out.push(conn_event(&conn, SocketEvent::Close));

        self.router.release_fd(fd);
    }

    fn update_interest(registry: &Registry, conn: &mut Connection) {
        let interest = if conn.wants_writable() {
            Interest::READABLE | Interest::WRITABLE
        } else {
            Interest::READABLE
        };
        if let Err(e) = registry.reregister(&mut conn.stream, conn.token, interest) {
            debug!("reregister failed: {e}");
        }
    }

    fn deliver(&self, out: Vec<Message>) {
        for msg in out {
            self.router.send(msg);
        }
    }
}

fn conn_event(conn: &Connection, kind: SocketEvent) -> Message {
    Message {
        sender: conn.fd,
        receiver: conn.owner,
        session: 0,
        ptype: conn.proto,
        subtype: kind as u8,
        header: String::new(),
        payload: Arc::new(Buffer::new()),
    }
}

/// Fail a parked or unroutable read: an `ERROR` reply resuming the session
/// with the reason text.
fn read_error(fd: u32, owner: u32, session: i32, reason: &str) -> Message {
    Message {
        sender: fd,
        receiver: owner,
        session,
        ptype: ptype::ERROR,
        subtype: 0,
        header: String::new(),
        payload: Arc::new(Buffer::from_slice(reason.as_bytes())),
    }
}
