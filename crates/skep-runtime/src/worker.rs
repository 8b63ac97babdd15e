//! One worker: an OS thread multiplexing its mailbox, socket readiness, and
//! timer deadlines on a single mio poll.
//!
//! Dispatch contract: messages for a given service run strictly serially,
//! in mailbox FIFO order. The mailbox is drained in batches bounded by a
//! length snapshot so socket completions are never starved. A service is
//! lifted out of the table for the duration of one callback; everything a
//! callback needs reaches it through `Context`.

use std::any::Any;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, Sender};
use mio::{Events, Poll, Registry, Token};
use tracing::{debug, error, info, warn};

use skep_protocol::{Buffer, Message, Value, ptype};

use crate::config::ServiceConfig;
use crate::context::Context;
use crate::error::Error;
use crate::metrics::WorkerStats;
use crate::net::SWEEP_INTERVAL_MS;
use crate::net::socket_manager::{SocketCmd, SocketManager};
use crate::router::Router;
use crate::service::{Actor, Service};
use crate::sessions::{Reply, Take};
use crate::timer::{Fired, SessionFire, TimerKind, TimerWheel};

/// Token reserved for the cross-thread waker; sockets use their fd's low
/// 16 bits, which are never zero.
pub(crate) const WAKER_TOKEN: Token = Token(0);

pub(crate) enum WorkerInput {
    Message(Message),
    Broadcast(Message),
    Spawn {
        conf: ServiceConfig,
        reply: Option<(u32, i32)>,
        notify: Option<Sender<Result<u32, String>>>,
    },
    Remove {
        id: u32,
        reply: Option<(u32, i32)>,
    },
    Bootstrap {
        services: Vec<ServiceConfig>,
        ack: Sender<Result<(), String>>,
    },
    StartBatch,
    RunCmd {
        from: u32,
        line: String,
        session: i32,
    },
    Retain {
        id: u32,
    },
    Release {
        id: u32,
        from: u32,
    },
    Socket(SocketCmd),
    Stop,
}

pub(crate) struct Worker {
    pub(crate) id: u8,
    pub(crate) router: Arc<Router>,
    pub(crate) registry: Registry,
    pub(crate) timers: TimerWheel,
    pub(crate) sockets: SocketManager,
    pub(crate) stats: WorkerStats,
    poll: Poll,
    events: Events,
    receiver: Receiver<WorkerInput>,
    services: HashMap<u32, Service>,
    start_order: Vec<u32>,
    next_seq: u32,
    epoch: Instant,
    stopping: bool,
    next_sweep: i64,
    stats_tx: Option<Sender<WorkerStats>>,
    stats_interval_ms: i64,
    next_stats: i64,
}

impl Worker {
    pub fn new(
        id: u8,
        poll: Poll,
        receiver: Receiver<WorkerInput>,
        router: Arc<Router>,
        stats_tx: Option<Sender<WorkerStats>>,
        stats_interval: Duration,
    ) -> Result<Self, Error> {
        let registry = poll.registry().try_clone()?;
        let sockets = SocketManager::new(id, Arc::clone(&router));
        let stats_interval_ms = stats_interval.as_millis() as i64;
        Ok(Self {
            id,
            router,
            registry,
            timers: TimerWheel::new(),
            sockets,
            stats: WorkerStats::default(),
            poll,
            events: Events::with_capacity(1024),
            receiver,
            services: HashMap::new(),
            start_order: Vec::new(),
            next_seq: 0,
            epoch: Instant::now(),
            stopping: false,
            next_sweep: SWEEP_INTERVAL_MS,
            stats_tx,
            stats_interval_ms,
            next_stats: stats_interval_ms,
        })
    }

    /// Monotonic milliseconds since this worker started.
    pub(crate) fn now_ms(&self) -> i64 {
        self.epoch.elapsed().as_millis() as i64
    }

    fn poll_timeout(&self, now: i64) -> Duration {
        let mut deadline = now + 500;
        if let Some(t) = self.timers.next_deadline() {
            deadline = deadline.min(t);
        }
        deadline = deadline.min(self.next_sweep);
        if self.stats_tx.is_some() {
            deadline = deadline.min(self.next_stats);
        }
        Duration::from_millis(deadline.saturating_sub(now).max(0) as u64)
    }

    pub fn run(&mut self) {
        debug!("worker {} running", self.id);

        loop {
            let timeout = self.poll_timeout(self.now_ms());
            if let Err(e) = self.poll.poll(&mut self.events, Some(timeout)) {
                if e.kind() != std::io::ErrorKind::Interrupted {
                    error!("worker {} poll failed: {e}", self.id);
                }
            }

            let now = self.now_ms();
            for event in self.events.iter() {
                if event.token() == WAKER_TOKEN {
                    continue;
                }
                self.sockets.handle_event(&self.registry, event, now);
            }

            // Bounded drain: only what was queued when this batch began, so
            // a chatty producer cannot starve socket completions.
            let pending = self.receiver.len();
            for _ in 0..pending {
                match self.receiver.try_recv() {
                    Ok(input) => self.handle_input(input),
                    Err(_) => break,
                }
            }

            let now = self.now_ms();
            for fired in self.timers.fire(now) {
                self.handle_timer(fired);
            }

            if now >= self.next_sweep {
                self.sockets.sweep(&self.registry, now);
                self.next_sweep = now + SWEEP_INTERVAL_MS;
            }

            if self.stats_tx.is_some() && now >= self.next_stats {
                self.publish_stats(now);
            }

            if self.stopping && self.services.is_empty() {
                break;
            }
        }

        debug!("worker {} finished", self.id);
    }

    fn handle_input(&mut self, input: WorkerInput) {
        match input {
            WorkerInput::Message(msg) => self.deliver(msg),
            WorkerInput::Broadcast(msg) => {
                let ids: Vec<u32> = self.services.keys().copied().collect();
                for id in ids {
                    let mut each = msg.clone();
                    each.receiver = id;
                    self.deliver(each);
                }
            }
            WorkerInput::Spawn { conf, reply, notify } => self.spawn(conf, reply, notify),
            WorkerInput::Remove { id, reply } => self.remove(id, reply),
            WorkerInput::Bootstrap { services, ack } => self.bootstrap(services, &ack),
            WorkerInput::StartBatch => self.start_batch(),
            WorkerInput::RunCmd { from, line, session } => self.runcmd(from, &line, session),
            WorkerInput::Retain { id } => {
                if let Some(svc) = self.services.get_mut(&id) {
                    svc.retain_count += 1;
                }
            }
            WorkerInput::Release { id, from } => self.release(id, from),
            WorkerInput::Socket(cmd) => {
                let now = self.now_ms();
                self.sockets.socket_cmd(&self.registry, cmd, now);
            }
            WorkerInput::Stop => self.begin_stop(),
        }
    }

    /// Lift the service out of its table, run one callback against it, and
    /// settle the outcome (reinsert, or finalize after `quit`).
    fn call_actor<F>(&mut self, id: u32, f: F) -> bool
    where
        F: FnOnce(&mut Box<dyn Actor>, &mut Context<'_>),
    {
        let Some(mut svc) = self.services.remove(&id) else {
            return false;
        };
        let Some(mut behavior) = svc.behavior.take() else {
            self.services.insert(id, svc);
            return false;
        };

        let begin = Instant::now();
        {
            let mut ctx = Context::new(self, &mut svc);
            f(&mut behavior, &mut ctx);
        }
        let elapsed = begin.elapsed().as_nanos() as u64;
        svc.cpu_cost_ns += elapsed;
        self.stats.cpu_ns += elapsed;

        svc.behavior = Some(behavior);
        if svc.quit {
            self.finalize(svc);
        } else {
            self.services.insert(id, svc);
        }
        true
    }

    fn deliver(&mut self, msg: Message) {
        let target = msg.receiver;
        if !self.services.contains_key(&target) {
            if msg.reply_session() > 0 {
                self.router
                    .reply_error(msg.sender, msg.reply_session(), "service not found");
            } else {
                debug!("message for unknown service {target:#010x} dropped");
            }
            return;
        }

        self.stats.messages += 1;

        if msg.session > 0 {
            self.deliver_reply(target, msg);
        } else if msg.ptype == ptype::SYSTEM && msg.header == "exit" {
            self.deliver_exit_watch(target, msg);
        } else {
            self.deliver_request(target, msg);
        }
    }

    /// Reply path: the session the receiver allocated resumes its
    /// continuation, at most once.
    fn deliver_reply(&mut self, target: u32, msg: Message) {
        self.call_actor(target, move |behavior, ctx| {
            let session = msg.session;
            match ctx.svc.sessions.take(session) {
                Take::Waiting(resume) => {
                    let reply = if msg.ptype == ptype::ERROR {
                        Err(msg.body_text().to_string())
                    } else {
                        let unpack = ctx.svc.protocols.resolve(msg.ptype).and_then(|r| r.unpack);
                        match unpack {
                            Some(f) => match f(msg.body()) {
                                Ok(value) => Ok(Reply { value: Some(value), message: msg }),
                                Err(e) => Err(e.to_string()),
                            },
                            None => Ok(Reply { value: None, message: msg }),
                        }
                    };
                    let any: &mut dyn Any = &mut **behavior;
                    resume(any, ctx, reply);
                }
                Take::Cancelled => {
                    debug!("late reply for cancelled session {session} dropped");
                }
                Take::Unknown => {
                    if msg.ptype == ptype::ERROR {
                        debug!("error reply for unknown session {session} dropped");
                    } else {
                        warn!(
                            "service {target:#010x}: reply for unknown session {session} dropped"
                        );
                    }
                }
            }
        });
    }

    /// A service exited somewhere; fail every continuation that was
    /// awaiting its reply.
    fn deliver_exit_watch(&mut self, target: u32, msg: Message) {
        let dead = msg.sender;
        self.call_actor(target, move |behavior, ctx| {
            for (_session, resume) in ctx.svc.sessions.take_by_receiver(dead) {
                let any: &mut dyn Any = &mut **behavior;
                resume(any, ctx, Err("target exited".to_string()));
            }
        });
    }

    fn deliver_request(&mut self, target: u32, msg: Message) {
        self.call_actor(target, move |behavior, ctx| {
            let dispatchable = ctx.svc.protocols.resolve(msg.ptype).map(|r| r.dispatch);
            let failure = match dispatchable {
                Some(true) => match behavior.dispatch(ctx, &msg) {
                    Ok(()) => None,
                    Err(e) => Some(e.to_string()),
                },
                Some(false) => Some(format!("no dispatch for ptype {}", msg.ptype)),
                None => Some(format!("unknown ptype {}", msg.ptype)),
            };

            if let Some(text) = failure {
                warn!(
                    "service {:#010x} '{}' dispatch failed: {text}",
                    ctx.svc.id, ctx.svc.name
                );
                ctx.worker.stats.dispatch_errors += 1;

                // Requests that expected a reply get the error echoed back
                // on their session.
                let session = msg.reply_session();
                if session > 0 {
                    let err = Message {
                        sender: msg.receiver,
                        receiver: msg.sender,
                        session,
                        ptype: ptype::ERROR,
                        subtype: 0,
                        header: "dispatch".to_string(),
                        payload: Arc::new(Buffer::from_slice(text.as_bytes())),
                    };
                    ctx.worker.router.send(err);
                }
            }
        });
    }

    fn handle_timer(&mut self, fired: Fired) {
        self.stats.timers_fired += 1;
        match fired.kind {
            TimerKind::User => {
                let (id, is_last) = (fired.id, fired.is_last);
                self.call_actor(fired.owner, move |behavior, ctx| {
                    if is_last {
                        ctx.svc.timers.remove(&id);
                    }
                    behavior.timer(ctx, id, is_last);
                });
            }
            TimerKind::Session { session, fire } => {
                let owner = fired.owner;
                self.call_actor(owner, move |behavior, ctx| match fire {
                    SessionFire::Wake => {
                        if let Take::Waiting(resume) = ctx.svc.sessions.take(session) {
                            let wake = Message::new(0, owner, ptype::SYSTEM, Buffer::new())
                                .with_session(session)
                                .with_header("sleep");
                            let any: &mut dyn Any = &mut **behavior;
                            resume(any, ctx, Ok(Reply { value: None, message: wake }));
                        }
                    }
                    SessionFire::Timeout => {
                        // Leave the cancelled sentinel so the reply that
                        // lost the race is dropped silently.
                        if let Some(resume) = ctx.svc.sessions.take_and_cancel(session) {
                            let any: &mut dyn Any = &mut **behavior;
                            resume(any, ctx, Err("timeout".to_string()));
                        }
                    }
                });
            }
        }
    }

    fn alloc_service_id(&mut self) -> Result<u32, Error> {
        for _ in 0..0x00FF_FFFF {
            self.next_seq = (self.next_seq + 1) & 0x00FF_FFFF;
            if self.next_seq == 0 {
                continue;
            }
            let id = (u32::from(self.id) << 24) | self.next_seq;
            if !self.services.contains_key(&id) {
                return Ok(id);
            }
        }
        Err(Error::Config(format!("worker {} service table exhausted", self.id)))
    }

    fn create_service(&mut self, conf: &ServiceConfig) -> Result<u32, Error> {
        let service_type = conf.service_type().to_string();
        if self.router.factory(&service_type).is_none() {
            return Err(Error::UnknownServiceType(service_type));
        }

        let id = self.alloc_service_id()?;
        if conf.unique && !self.router.set_unique_service(&conf.name, id) {
            return Err(Error::DuplicateUniqueName(conf.name.clone()));
        }

        let router = Arc::clone(&self.router);
        let built = router
            .factory(&service_type)
            .expect("factory checked above")(conf);
        let behavior = match built {
            Ok(behavior) => behavior,
            Err(e) => {
                if conf.unique {
                    self.router.remove_unique_service(&conf.name, id);
                }
                return Err(Error::ServiceInit(conf.name.clone(), e.to_string()));
            }
        };

        info!(
            "worker {}: created service {id:#010x} '{}'",
            self.id, conf.name
        );
        self.services.insert(id, Service::new(id, conf, behavior));
        self.start_order.push(id);
        self.stats.services = self.services.len() as u64;
        Ok(id)
    }

    fn run_start(&mut self, id: u32) {
        self.call_actor(id, |behavior, ctx| {
            if ctx.svc.started {
                return;
            }
            ctx.svc.started = true;
            if let Err(e) = behavior.start(ctx) {
                error!("service '{}' start failed: {e}", ctx.svc.name);
                ctx.svc.ok = false;
                ctx.quit();
            }
        });
    }

    fn spawn(
        &mut self,
        conf: ServiceConfig,
        reply: Option<(u32, i32)>,
        notify: Option<Sender<Result<u32, String>>>,
    ) {
        let unique = conf.unique;
        let outcome = self.create_service(&conf).and_then(|id| {
            // Dynamically created services start before their first message.
            self.run_start(id);
            if self.services.contains_key(&id) {
                Ok(id)
            } else {
                Err(Error::ServiceInit(conf.name.clone(), "start failed".to_string()))
            }
        });

        match outcome {
            Ok(id) => {
                if let Some(tx) = notify {
                    let _ = tx.send(Ok(id));
                }
                if let Some((to, session)) = reply {
                    self.reply_value(to, session, &Value::Int(i64::from(id)));
                }
            }
            Err(e) => {
                error!("service creation failed: {e}");
                // Init failure of a unique service is fatal; losing a
                // unique-name race is the caller's problem.
                if unique && !self.stopping && matches!(e, Error::ServiceInit(..)) {
                    self.router.stop(1);
                }
                if let Some(tx) = notify {
                    let _ = tx.send(Err(e.to_string()));
                }
                if let Some((to, session)) = reply {
                    self.router.reply_error(to, session, &e.to_string());
                }
            }
        }
    }

    fn reply_value(&self, to: u32, session: i32, value: &Value) {
        let Ok(payload) = value.pack() else { return };
        let msg = Message::new(0, to, ptype::LUA, payload).with_session(session);
        self.router.send(msg);
    }

    /// Construct this worker's share of the statically configured services.
    /// `start` runs later, once every worker acknowledged construction.
    fn bootstrap(&mut self, services: Vec<ServiceConfig>, ack: &Sender<Result<(), String>>) {
        let mut result = Ok(());
        for conf in services {
            if let Err(e) = self.create_service(&conf) {
                result = Err(e.to_string());
                break;
            }
        }
        let _ = ack.send(result);
    }

    fn start_batch(&mut self) {
        let order = self.start_order.clone();
        for id in order {
            if self.services.contains_key(&id) {
                self.run_start(id);
            }
        }
    }

    fn remove(&mut self, id: u32, reply: Option<(u32, i32)>) {
        let Some(svc) = self.services.get_mut(&id) else {
            if let Some((to, session)) = reply {
                self.router.reply_error(to, session, "service not found");
            }
            return;
        };

        svc.removing = true;
        svc.remove_reply = reply;
        let already_exiting = svc.exiting;
        svc.exiting = true;

        if !already_exiting {
            self.call_actor(id, |behavior, ctx| behavior.exit(ctx));
        }
    }

    fn begin_stop(&mut self) {
        if self.stopping {
            return;
        }
        self.stopping = true;
        info!("worker {} stopping, {} services", self.id, self.services.len());

        let ids: Vec<u32> = self.services.keys().copied().collect();
        for id in ids {
            let already_exiting = match self.services.get_mut(&id) {
                Some(svc) => {
                    let was = svc.exiting;
                    svc.exiting = true;
                    was
                }
                None => continue,
            };
            if !already_exiting {
                self.call_actor(id, |behavior, ctx| behavior.exit(ctx));
            }
        }
    }

    fn release(&mut self, id: u32, from: u32) {
        let notify = match self.services.get_mut(&id) {
            Some(svc) => {
                svc.retain_count = svc.retain_count.saturating_sub(1);
                svc.retain_count == 0 && svc.exiting
            }
            None => false,
        };

        // The last release while exiting is worth a message: the service
        // deferred its quit waiting for it.
        if notify {
            let msg = Message::new(from, id, ptype::SYSTEM, Buffer::new()).with_header("release");
            self.deliver(msg);
        }
    }

    fn runcmd(&mut self, from: u32, line: &str, session: i32) {
        let mut parts = line.split_whitespace();
        let cmd = parts.next().unwrap_or("");
        let args: Vec<&str> = parts.collect();

        let text = match cmd {
            "state" => format!(
                "worker {} services {} mailbox {}",
                self.id,
                self.services.len(),
                self.receiver.len()
            ),
            "services" => {
                let mut entries: Vec<String> = self
                    .services
                    .values()
                    .map(|s| format!("{:#010x}:{}", s.id, s.name))
                    .collect();
                entries.sort();
                entries.join(" ")
            }
            "mem" => {
                let mut entries: Vec<String> = self
                    .services
                    .values()
                    .map(|s| format!("{}:{}", s.name, s.mem_used))
                    .collect();
                entries.sort();
                entries.join(" ")
            }
            "cpu" => {
                let mut entries: Vec<String> = self
                    .services
                    .values()
                    .map(|s| format!("{}:{}", s.name, s.cpu_cost_ns / 1_000_000))
                    .collect();
                entries.sort();
                entries.join(" ")
            }
            "ping" => format!("pong {}", args.join(" ")).trim_end().to_string(),
            other => format!("unknown command '{other}'"),
        };

        let msg = Message::new(0, from, ptype::TEXT, Buffer::from_slice(text.as_bytes()))
            .with_session(session);
        self.router.send(msg);
    }

    /// Tear down an exited service: timers, sockets, directory entry, then
    /// the destroy callback, in that order.
    fn finalize(&mut self, mut svc: Service) {
        info!(
            "worker {}: service {:#010x} '{}' destroyed",
            self.id, svc.id, svc.name
        );

        let timer_ids: Vec<u32> = svc.timers.drain().collect();
        for timer in timer_ids {
            self.timers.remove(timer);
        }
        self.sockets.close_owned(&self.registry, svc.id);

        self.router.unregister_service(svc.id, &svc.name, svc.unique);

        // remove_service acks on unregister, before destroy runs.
        if let Some((to, session)) = svc.remove_reply.take() {
            let msg = Message::new(0, to, ptype::TEXT, Buffer::from_slice(b"ok"))
                .with_session(session);
            self.router.send(msg);
        }

        if let Some(mut behavior) = svc.behavior.take() {
            let mut ctx = Context::new(self, &mut svc);
            behavior.destroy(&mut ctx);
        }

        if svc.unique && !svc.removing && !self.router.is_stopping() {
            error!("unique service '{}' exited unexpectedly, stopping", svc.name);
            self.router.stop(1);
        }

        self.stats.services = self.services.len() as u64;
    }

    fn publish_stats(&mut self, now: i64) {
        if let Some(tx) = &self.stats_tx {
            let mut snapshot = self.stats;
            snapshot.worker_id = self.id;
            snapshot.services = self.services.len() as u64;
            snapshot.net = self.sockets.take_stats();
            let _ = tx.try_send(snapshot);
            self.stats = WorkerStats::default();
        }
        self.next_stats = now + self.stats_interval_ms;
    }
}
