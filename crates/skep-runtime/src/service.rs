//! One actor: identity, the behavior callback set, session map, and the
//! memory/cpu accounting the worker maintains around dispatch.

use std::any::Any;
use std::collections::HashSet;

use skep_protocol::Message;
use tracing::warn;

use crate::config::ServiceConfig;
use crate::context::Context;
use crate::error::Error;
use crate::registry::ProtocolRegistry;
use crate::sessions::SessionMap;

/// First memory watermark; a warning is logged and the watermark doubles
/// each time `mem_used` crosses it.
const MEM_REPORT_START: u64 = 8 * 1024 * 1024;

/// The callback contract between a service and its hosted behavior (the
/// stand-in for an embedded scripting sandbox).
///
/// All callbacks run on the service's owning worker thread, strictly one at
/// a time. `dispatch` must not block; long waits are expressed by suspending
/// on a session (`Context::call`, `Context::sleep`, `Context::read`).
pub trait Actor: Any {
    /// Runs once, before the first message. For statically configured
    /// services this is after every service of the initial batch finished
    /// construction, so their unique names already resolve.
    fn start(&mut self, _ctx: &mut Context<'_>) -> Result<(), Error> {
        Ok(())
    }

    /// Handle one inbound request. Errors are caught at the worker
    /// boundary; when the request expects a reply they are converted to an
    /// `ERROR`-typed reply carrying the text.
    fn dispatch(&mut self, ctx: &mut Context<'_>, msg: &Message) -> Result<(), Error>;

    /// A stop was requested. The service stays alive until it calls
    /// `ctx.quit()`, which the default does immediately.
    fn exit(&mut self, ctx: &mut Context<'_>) {
        ctx.quit();
    }

    /// Runs last, after the service is unlinked from its worker's table.
    fn destroy(&mut self, _ctx: &mut Context<'_>) {}

    /// A user timer armed with `Context::repeated` expired.
    fn timer(&mut self, _ctx: &mut Context<'_>, _id: u32, _is_last: bool) {}
}

/// Creates a behavior from its config, on the owning worker's thread.
pub type ActorFactory =
    Box<dyn Fn(&ServiceConfig) -> Result<Box<dyn Actor>, Error> + Send + Sync>;

pub struct Service {
    pub id: u32,
    pub name: String,
    pub unique: bool,
    pub(crate) behavior: Option<Box<dyn Actor>>,
    pub(crate) sessions: SessionMap,
    pub(crate) protocols: ProtocolRegistry,
    pub(crate) timers: HashSet<u32>,
    pub(crate) mem_used: u64,
    pub(crate) mem_limit: u64,
    pub(crate) mem_report: u64,
    pub(crate) cpu_cost_ns: u64,
    pub(crate) started: bool,
    pub(crate) ok: bool,
    pub(crate) exiting: bool,
    pub(crate) quit: bool,
    pub(crate) removing: bool,
    pub(crate) retain_count: u32,
    /// Where to acknowledge an explicit `remove_service`; answered upon
    /// unregistration, not destruction.
    pub(crate) remove_reply: Option<(u32, i32)>,
}

impl Service {
    pub(crate) fn new(id: u32, conf: &ServiceConfig, behavior: Box<dyn Actor>) -> Self {
        Self {
            id,
            name: conf.name.clone(),
            unique: conf.unique,
            behavior: Some(behavior),
            sessions: SessionMap::new(),
            protocols: ProtocolRegistry::with_defaults(),
            timers: HashSet::new(),
            mem_used: 0,
            mem_limit: conf.memlimit,
            mem_report: MEM_REPORT_START,
            cpu_cost_ns: 0,
            started: false,
            ok: true,
            exiting: false,
            quit: false,
            removing: false,
            retain_count: 0,
            remove_reply: None,
        }
    }

    pub fn worker_id(&self) -> u8 {
        skep_protocol::worker_of_service(self.id)
    }

    /// Account `bytes` of sandbox allocation against the limit.
    pub(crate) fn alloc(&mut self, bytes: u64) -> Result<(), Error> {
        let next = self.mem_used + bytes;
        if self.mem_limit > 0 && next > self.mem_limit {
            return Err(Error::MemLimit {
                requested: bytes,
                limit: self.mem_limit,
            });
        }
        self.mem_used = next;
        while self.mem_used > self.mem_report {
            warn!(
                service = %self.name,
                used = self.mem_used,
                watermark = self.mem_report,
                "memory watermark crossed"
            );
            self.mem_report *= 2;
        }
        Ok(())
    }

    pub(crate) fn free(&mut self, bytes: u64) {
        self.mem_used = self.mem_used.saturating_sub(bytes);
    }
}
