//! Message envelope, buffers, structured payloads, and wire framing for the
//! skep actor runtime. This crate owns no threads and does no I/O; the
//! runtime crate drives these codecs from its per-worker event loops.

#![forbid(unsafe_code)]

pub mod buffer;
pub mod error;
pub mod framing;
pub mod message;
pub mod value;

pub use buffer::{Buffer, BufferFlags};
pub use error::Error;
pub use message::{Message, SocketEvent, ptype, worker_of_fd, worker_of_service};
pub use value::Value;
