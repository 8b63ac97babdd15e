//! Text framing: delimiter-based reads (CRLF by default) or exact-size
//! reads. Text connections read only on demand, so the decoder is a pure
//! function over the receive buffer.

use memchr::memmem;

/// A service's outstanding read on a text connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadRequest {
    /// Read exactly `n` bytes.
    Exact(usize),
    /// Read up to and including the delimiter; the delimiter is consumed
    /// but not delivered.
    Until(Vec<u8>),
    /// Read a CRLF-terminated line.
    Line,
}

pub const CRLF: &[u8] = b"\r\n";

/// Check whether `input` satisfies `req`. Returns `(consumed, delivered)`
/// lengths: `consumed` bytes leave the receive buffer, the first `delivered`
/// of them form the reply payload.
pub fn match_request(input: &[u8], req: &ReadRequest) -> Option<(usize, usize)> {
    match req {
        ReadRequest::Exact(n) => {
            if input.len() >= *n {
                Some((*n, *n))
            } else {
                None
            }
        }
        ReadRequest::Until(delim) => {
            if delim.is_empty() {
                return Some((0, 0));
            }
            memmem::find(input, delim).map(|at| (at + delim.len(), at))
        }
        ReadRequest::Line => memmem::find(input, CRLF).map(|at| (at + CRLF.len(), at)),
    }
}
