//! # skep-runtime
//!
//! A multi-threaded actor runtime: many lightweight services distributed
//! over a fixed pool of worker threads, communicating only by asynchronous
//! message passing.
//!
//! - **Workers**: each worker is an OS thread running one mio poll that
//!   multiplexes its mailbox, its sockets, and its timers. Services never
//!   move between workers, and nothing a worker owns is touched by another
//!   thread.
//! - **Routing**: a service id encodes its worker in the high 8 bits, a
//!   socket fd in the high 16; the router is a bit extraction plus a
//!   channel send. Unique names live in the one shared directory.
//! - **Sessions**: request/response rides on positive 31-bit session ids.
//!   A suspended call is a stored continuation; the reply, a timeout, or
//!   the peer's exit resumes it exactly once.
//! - **Sockets**: per-worker non-blocking TCP with three framings —
//!   2-byte length prefix (optionally chunked), delimited text, and
//!   RFC 6455 websocket — with per-connection send queues, backpressure
//!   limits, and a coarse idle sweep.

#![forbid(unsafe_code)]

pub mod config;
pub mod context;
pub mod error;
pub mod metrics;
pub mod net;
pub mod registry;
pub mod router;
pub mod server;
pub mod service;
pub mod sessions;
pub mod timer;
pub mod worker;

pub use skep_protocol as protocol;

pub use config::{NodeConfig, ServiceConfig};
pub use context::Context;
pub use error::Error;
pub use net::{MAX_NET_SEND_QUEUE_SIZE, WARN_NET_SEND_QUEUE_SIZE};
pub use registry::{PackFn, ProtoRecord, ProtocolRegistry, UnpackFn};
pub use router::Router;
pub use server::{Server, ServerBuilder};
pub use service::{Actor, ActorFactory, Service};
pub use sessions::{CallReply, Reply, SESSION_MAX};
