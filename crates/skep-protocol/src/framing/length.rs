//! Length-prefixed framing: `[len: u16 big-endian][payload]`.
//!
//! In chunked mode the high bit of `len` marks "more follows"; a logical
//! message larger than one chunk is carried as a run of continuation chunks
//! ending with a final chunk whose high bit is clear.

use std::ops::Range;
use std::str::FromStr;

use crate::error::Error;

/// Largest payload expressible without chunking: the full 16-bit length.
pub const MAX_PLAIN_FRAME: usize = 0xFFFF;

/// Largest single chunk: 15 bits, the high bit is the continuation marker.
pub const MAX_CHUNK: usize = 0x7FFF;

const CONTINUE_BIT: u16 = 0x8000;

/// Which directions of a connection apply the chunked extension.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ChunkMode {
    pub read: bool,
    pub write: bool,
}

impl FromStr for ChunkMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Error> {
        match s {
            "r" => Ok(Self { read: true, write: false }),
            "w" => Ok(Self { read: false, write: true }),
            "rw" => Ok(Self { read: true, write: true }),
            "none" => Ok(Self::default()),
            other => Err(Error::InvalidChunkMode(other.to_string())),
        }
    }
}

/// Streaming decoder for length-prefixed input. Chunked continuation state
/// is held across calls.
#[derive(Debug, Default)]
pub struct LengthCodec {
    pub chunk: ChunkMode,
    partial: Vec<u8>,
    in_chunk_run: bool,
}

impl LengthCodec {
    pub fn new(chunk: ChunkMode) -> Self {
        Self {
            chunk,
            partial: Vec::new(),
            in_chunk_run: false,
        }
    }

    /// Consume as many whole frames/chunks as `input` holds. Returns the
    /// number of bytes consumed and, when a logical message completed, its
    /// payload. Call again with the remaining input until it reports zero
    /// consumed and no message.
    pub fn decode(&mut self, input: &[u8]) -> Result<(usize, Option<Vec<u8>>), Error> {
        let mut consumed = 0;

        loop {
            let rest = &input[consumed..];
            if rest.len() < 2 {
                return Ok((consumed, None));
            }

            let raw = u16::from_be_bytes([rest[0], rest[1]]);
            let (more, len) = if self.chunk.read {
                ((raw & CONTINUE_BIT) != 0, (raw & !CONTINUE_BIT) as usize)
            } else {
                (false, raw as usize)
            };

            if rest.len() < 2 + len {
                return Ok((consumed, None));
            }

            consumed += 2 + len;

            if more {
                self.in_chunk_run = true;
                self.partial.extend_from_slice(&rest[2..2 + len]);
                continue;
            }

            let message = if self.in_chunk_run {
                self.in_chunk_run = false;
                let mut whole = std::mem::take(&mut self.partial);
                whole.extend_from_slice(&rest[2..2 + len]);
                whole
            } else {
                rest[2..2 + len].to_vec()
            };

            return Ok((consumed, Some(message)));
        }
    }

    /// True when a chunk run started but its final chunk has not arrived.
    pub fn mid_message(&self) -> bool {
        self.in_chunk_run
    }
}

/// Split a payload of `len` bytes into `(header, payload range)` pairs ready
/// for the wire. Without chunked writes a single pair covers the payload, or
/// an error if it exceeds the 16-bit limit.
pub fn encode_headers(len: usize, chunked_write: bool) -> Result<Vec<([u8; 2], Range<usize>)>, Error> {
    if !chunked_write {
        if len > MAX_PLAIN_FRAME {
            return Err(Error::FrameTooLarge(len, MAX_PLAIN_FRAME));
        }
        return Ok(vec![((len as u16).to_be_bytes(), 0..len)]);
    }

    let mut out = Vec::with_capacity(len / MAX_CHUNK + 1);
    let mut offset = 0;
    loop {
        let chunk = (len - offset).min(MAX_CHUNK);
        let last = offset + chunk == len;
        let mut raw = chunk as u16;
        if !last {
            raw |= CONTINUE_BIT;
        }
        out.push((raw.to_be_bytes(), offset..offset + chunk));
        offset += chunk;
        if last {
            break;
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_frame_round_trip() {
        let payload = b"hello";
        let headers = encode_headers(payload.len(), false).unwrap();
        assert_eq!(headers.len(), 1);

        let mut wire = Vec::new();
        wire.extend_from_slice(&headers[0].0);
        wire.extend_from_slice(payload);

        let mut codec = LengthCodec::default();
        let (consumed, msg) = codec.decode(&wire).unwrap();
        assert_eq!(consumed, wire.len());
        assert_eq!(msg.unwrap(), payload);
    }

    #[test]
    fn partial_header_waits() {
        let mut codec = LengthCodec::default();
        assert_eq!(codec.decode(&[0x00]).unwrap(), (0, None));
        assert_eq!(codec.decode(&[0x00, 0x05, b'a']).unwrap(), (0, None));
    }

    #[test]
    fn oversize_plain_write_rejected() {
        assert!(encode_headers(MAX_PLAIN_FRAME + 1, false).is_err());
        assert!(encode_headers(MAX_PLAIN_FRAME, false).is_ok());
    }

    #[test]
    fn chunked_round_trip_large_payload() {
        let payload: Vec<u8> = (0..1_000_000u32).map(|i| (i % 251) as u8).collect();
        let headers = encode_headers(payload.len(), true).unwrap();
        assert!(headers.len() > 1);

        let mut wire = Vec::new();
        for (header, range) in &headers {
            wire.extend_from_slice(header);
            wire.extend_from_slice(&payload[range.clone()]);
        }

        let mut codec = LengthCodec::new(ChunkMode { read: true, write: true });
        let (consumed, msg) = codec.decode(&wire).unwrap();
        assert_eq!(consumed, wire.len());
        assert_eq!(msg.unwrap(), payload);
    }

    #[test]
    fn chunk_run_across_decode_calls() {
        let payload: Vec<u8> = vec![7u8; MAX_CHUNK + 10];
        let headers = encode_headers(payload.len(), true).unwrap();
        assert_eq!(headers.len(), 2);

        let mut wire = Vec::new();
        for (header, range) in &headers {
            wire.extend_from_slice(header);
            wire.extend_from_slice(&payload[range.clone()]);
        }

        let mut codec = LengthCodec::new(ChunkMode { read: true, write: false });
        let split = MAX_CHUNK + 2;
        let (consumed, msg) = codec.decode(&wire[..split]).unwrap();
        assert_eq!(consumed, split);
        assert!(msg.is_none());
        assert!(codec.mid_message());

        let (_, msg) = codec.decode(&wire[split..]).unwrap();
        assert_eq!(msg.unwrap(), payload);
        assert!(!codec.mid_message());
    }

    #[test]
    fn chunk_mode_parses() {
        assert_eq!("rw".parse::<ChunkMode>().unwrap(), ChunkMode { read: true, write: true });
        assert_eq!("none".parse::<ChunkMode>().unwrap(), ChunkMode::default());
        assert!("x".parse::<ChunkMode>().is_err());
    }
}
