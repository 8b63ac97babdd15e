//! Per-connection framing policies for delimiting logical messages on a
//! byte stream. Three variants: 2-byte length prefix (with an optional
//! chunked extension for large frames), delimiter/exact-size text reads, and
//! RFC 6455 websocket frames.

pub mod length;
pub mod text;
pub mod ws;
