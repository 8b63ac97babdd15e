use std::sync::Arc;

use crate::buffer::Buffer;

/// Reserved protocol type tags. Runtime registration may add more; values
/// below 16 are reserved for the runtime itself.
pub mod ptype {
    /// Runtime-internal notifications (service exit, retain/release, sleep).
    pub const SYSTEM: u8 = 1;
    /// Plain text payloads and the admin command channel.
    pub const TEXT: u8 = 2;
    /// Arbitrary structured payloads packed with the value codec.
    pub const LUA: u8 = 3;
    /// Length-prefixed socket traffic and socket lifecycle events.
    pub const SOCKET: u8 = 4;
    /// Error replies; the body carries the error text.
    pub const ERROR: u8 = 5;
    /// Websocket traffic and websocket lifecycle events.
    pub const WS: u8 = 6;
    /// Debug/introspection traffic.
    pub const DEBUG: u8 = 7;
}

/// Socket lifecycle subtypes delivered to a connection's owner service.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SocketEvent {
    Connect = 1,
    Accept = 2,
    Message = 3,
    Close = 4,
    Error = 5,
    Ping = 6,
    Pong = 7,
}

impl SocketEvent {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(Self::Connect),
            2 => Some(Self::Accept),
            3 => Some(Self::Message),
            4 => Some(Self::Close),
            5 => Some(Self::Error),
            6 => Some(Self::Ping),
            7 => Some(Self::Pong),
            _ => None,
        }
    }
}

/// The message envelope routed between services.
///
/// Session sign convention: a request that expects a reply is delivered with
/// `session < 0` (the sender allocated `-session` and awaits it); a reply is
/// delivered with `session > 0`, matching the id the sender allocated; zero
/// is fire-and-forget. An `ERROR`-typed reply echoes the same positive id and
/// carries the error text as body.
#[derive(Debug, Clone)]
pub struct Message {
    pub sender: u32,
    pub receiver: u32,
    pub session: i32,
    pub ptype: u8,
    pub subtype: u8,
    pub header: String,
    pub payload: Arc<Buffer>,
}

impl Message {
    pub fn new(sender: u32, receiver: u32, ptype: u8, payload: Buffer) -> Self {
        Self {
            sender,
            receiver,
            session: 0,
            ptype,
            subtype: 0,
            header: String::new(),
            payload: Arc::new(payload),
        }
    }

    pub fn with_session(mut self, session: i32) -> Self {
        self.session = session;
        self
    }

    pub fn with_subtype(mut self, subtype: u8) -> Self {
        self.subtype = subtype;
        self
    }

    pub fn with_header(mut self, header: impl Into<String>) -> Self {
        self.header = header.into();
        self
    }

    /// The reply session a request carries, or zero for fire-and-forget.
    #[inline]
    pub fn reply_session(&self) -> i32 {
        if self.session < 0 { -self.session } else { 0 }
    }

    /// True when this message correlates to a session the receiver allocated.
    #[inline]
    pub fn is_reply(&self) -> bool {
        self.session > 0
    }

    pub fn body(&self) -> &[u8] {
        self.payload.as_slice()
    }

    pub fn body_text(&self) -> &str {
        std::str::from_utf8(self.payload.as_slice()).unwrap_or("")
    }
}

/// Extract the owning worker from a service id (high 8 bits).
#[inline]
pub fn worker_of_service(id: u32) -> u8 {
    (id >> 24) as u8
}

/// Extract the owning worker from a socket fd (high 16 bits).
#[inline]
pub fn worker_of_fd(fd: u32) -> u16 {
    (fd >> 16) as u16
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_sign_convention() {
        let req = Message::new(1, 2, ptype::LUA, Buffer::new()).with_session(-7);
        assert_eq!(req.reply_session(), 7);
        assert!(!req.is_reply());

        let reply = Message::new(2, 1, ptype::LUA, Buffer::new()).with_session(7);
        assert_eq!(reply.reply_session(), 0);
        assert!(reply.is_reply());

        let oneway = Message::new(1, 2, ptype::TEXT, Buffer::new());
        assert_eq!(oneway.reply_session(), 0);
        assert!(!oneway.is_reply());
    }

    #[test]
    fn id_bit_extraction() {
        let id = (3u32 << 24) | 0x00_00_2A;
        assert_eq!(worker_of_service(id), 3);

        let fd = (5u32 << 16) | 0x0101;
        assert_eq!(worker_of_fd(fd), 5);
    }
}
