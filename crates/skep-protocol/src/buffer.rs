use bitflags::bitflags;

use crate::error::Error;

/// Bytes reserved in front of the payload so framing can prepend a length
/// prefix or websocket header without reallocating. The largest prepend is a
/// websocket server header: 2 bytes of opcode/length plus an 8-byte extended
/// length.
pub const DEFAULT_HEAD_ROOM: usize = 16;

bitflags! {
    /// Per-buffer flag bits carried alongside the payload.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct BufferFlags: u8 {
        /// Close the connection once this buffer finishes sending.
        const CLOSE_AFTER_SEND = 0b0000_0001;
        /// Send as a websocket text frame instead of binary.
        const WS_TEXT = 0b0000_0010;
        /// Send as a websocket ping control frame.
        const WS_PING = 0b0000_0100;
        /// Send as a websocket pong control frame.
        const WS_PONG = 0b0000_1000;
        /// The connection must apply its framing header before sending.
        const NEEDS_FRAMING = 0b0001_0000;
    }
}

/// A growable byte buffer with reserved head room, a read cursor, and flags.
///
/// The logical payload occupies `data[head..]`; `prepend` writes into the
/// reserved region in front of it. Invariant: `head <= rpos <= data.len()`.
#[derive(Debug, Clone, Default)]
pub struct Buffer {
    data: Vec<u8>,
    head: usize,
    rpos: usize,
    flags: BufferFlags,
}

impl Buffer {
    pub fn new() -> Self {
        Self::with_head_room(DEFAULT_HEAD_ROOM)
    }

    /// Create an empty buffer reserving `head` bytes of prepend room.
    pub fn with_head_room(head: usize) -> Self {
        let mut data = Vec::with_capacity(head + 64);
        data.resize(head, 0);
        Self {
            data,
            head,
            rpos: head,
            flags: BufferFlags::default(),
        }
    }

    /// Build a buffer around an existing payload, with default head room.
    pub fn from_slice(payload: &[u8]) -> Self {
        let mut buf = Self::with_head_room(DEFAULT_HEAD_ROOM);
        buf.write(payload);
        buf
    }

    #[inline]
    pub fn flags(&self) -> BufferFlags {
        self.flags
    }

    #[inline]
    pub fn set_flags(&mut self, flags: BufferFlags) {
        self.flags |= flags;
    }

    #[inline]
    pub fn has_flag(&self, flag: BufferFlags) -> bool {
        self.flags.contains(flag)
    }

    /// Unread payload bytes.
    #[inline]
    pub fn as_slice(&self) -> &[u8] {
        &self.data[self.rpos..]
    }

    /// Full payload regardless of the read cursor.
    #[inline]
    pub fn payload(&self) -> &[u8] {
        &self.data[self.head..]
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.data.len() - self.rpos
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.rpos == self.data.len()
    }

    /// Append bytes at the tail, advancing the write cursor.
    #[inline]
    pub fn write(&mut self, bytes: &[u8]) {
        self.data.extend_from_slice(bytes);
    }

    /// Write bytes into the reserved head room, in front of the payload.
    pub fn prepend(&mut self, bytes: &[u8]) -> Result<(), Error> {
        if bytes.len() > self.head {
            return Err(Error::HeadRoomExhausted(bytes.len(), self.head));
        }
        let start = self.head - bytes.len();
        self.data[start..self.head].copy_from_slice(bytes);
        if self.rpos == self.head {
            self.rpos = start;
        }
        self.head = start;
        Ok(())
    }

    /// Consume `n` bytes from the front, returning the consumed slice.
    pub fn read(&mut self, n: usize) -> Result<&[u8], Error> {
        if self.len() < n {
            return Err(Error::BufferTooSmall(n, self.len()));
        }
        let start = self.rpos;
        self.rpos += n;
        Ok(&self.data[start..self.rpos])
    }

    /// Advance the read cursor without inspecting the bytes.
    pub fn skip(&mut self, n: usize) -> Result<(), Error> {
        if self.len() < n {
            return Err(Error::BufferTooSmall(n, self.len()));
        }
        self.rpos += n;
        Ok(())
    }

    /// Position the read cursor `offset` bytes past the head.
    pub fn seek(&mut self, offset: usize) -> Result<(), Error> {
        let target = self.head + offset;
        if target > self.data.len() {
            return Err(Error::BufferTooSmall(offset, self.data.len() - self.head));
        }
        self.rpos = target;
        Ok(())
    }

    /// Drop all content and restore the full head reservation.
    pub fn clear(&mut self) {
        let head = DEFAULT_HEAD_ROOM.max(self.head);
        self.data.clear();
        self.data.resize(head, 0);
        self.head = head;
        self.rpos = head;
        self.flags = BufferFlags::default();
    }

    pub fn into_vec(mut self) -> Vec<u8> {
        self.data.split_off(self.rpos)
    }
}

impl From<&[u8]> for Buffer {
    fn from(payload: &[u8]) -> Self {
        Buffer::from_slice(payload)
    }
}

impl From<Vec<u8>> for Buffer {
    fn from(payload: Vec<u8>) -> Self {
        Buffer::from_slice(&payload)
    }
}

impl From<&str> for Buffer {
    fn from(payload: &str) -> Self {
        Buffer::from_slice(payload.as_bytes())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_then_read() {
        let mut buf = Buffer::new();
        buf.write(b"hello world");

        assert_eq!(buf.len(), 11);
        assert_eq!(buf.read(5).unwrap(), b"hello");
        assert_eq!(buf.as_slice(), b" world");
        assert_eq!(buf.len(), 6);
    }

    #[test]
    fn read_past_end_fails() {
        let mut buf = Buffer::from_slice(b"abc");
        assert!(buf.read(4).is_err());
        assert_eq!(buf.read(3).unwrap(), b"abc");
        assert!(buf.is_empty());
    }

    #[test]
    fn prepend_uses_head_room() {
        let mut buf = Buffer::from_slice(b"payload");
        buf.prepend(&[0x00, 0x07]).unwrap();
        assert_eq!(buf.as_slice(), b"\x00\x07payload");
    }

    #[test]
    fn prepend_beyond_reservation_fails() {
        let mut buf = Buffer::with_head_room(2);
        buf.write(b"x");
        buf.prepend(&[1, 2]).unwrap();
        assert!(buf.prepend(&[3]).is_err());
    }

    #[test]
    fn prepend_after_partial_read_keeps_cursor() {
        let mut buf = Buffer::from_slice(b"abcdef");
        buf.read(2).unwrap();
        buf.prepend(&[0xFF]).unwrap();
        // Cursor already moved past the head, prepended byte is not re-read.
        assert_eq!(buf.as_slice(), b"cdef");
    }

    #[test]
    fn seek_repositions_cursor() {
        let mut buf = Buffer::from_slice(b"abcdef");
        buf.read(4).unwrap();
        buf.seek(1).unwrap();
        assert_eq!(buf.as_slice(), b"bcdef");
        assert!(buf.seek(7).is_err());
    }

    #[test]
    fn flags_accumulate() {
        let mut buf = Buffer::new();
        buf.set_flags(BufferFlags::NEEDS_FRAMING);
        buf.set_flags(BufferFlags::CLOSE_AFTER_SEND);
        assert!(buf.has_flag(BufferFlags::NEEDS_FRAMING));
        assert!(buf.has_flag(BufferFlags::CLOSE_AFTER_SEND));
        assert!(!buf.has_flag(BufferFlags::WS_TEXT));
    }
}
