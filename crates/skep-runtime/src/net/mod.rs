//! The per-worker network layer. All sockets live on the worker that opened
//! them; cross-worker socket operations arrive as routed commands.

pub(crate) mod connection;
pub(crate) mod socket_manager;

/// Outstanding logical writes before a warning is logged.
pub const WARN_NET_SEND_QUEUE_SIZE: usize = 32;

/// Outstanding logical writes before the connection is closed with
/// `send_queue_overflow`.
pub const MAX_NET_SEND_QUEUE_SIZE: usize = 1024;

/// Upper bound on unparsed receive bytes per connection.
pub(crate) const MAX_RECV_BUF: usize = 16 * 1024 * 1024;

/// Interval of the coarse connection timeout sweep, in milliseconds.
pub(crate) const SWEEP_INTERVAL_MS: i64 = 10_000;

/// Sockets per worker; fd low 16 bits are `counter % MAX_SOCKET_NUM + 1`.
pub(crate) const MAX_SOCKET_NUM: u16 = 0xFFFE;
