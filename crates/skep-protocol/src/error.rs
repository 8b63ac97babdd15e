use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("buffer too small: {0} bytes needed, {1} bytes available")]
    BufferTooSmall(usize, usize),

    #[error("head room exhausted: {0} bytes needed, {1} bytes reserved")]
    HeadRoomExhausted(usize, usize),

    #[error("unknown ptype: {0}")]
    UnknownPtype(u8),

    #[error("unknown value tag: {0:#04x}")]
    UnknownValueTag(u8),

    #[error("value nesting deeper than {0} levels")]
    ValueTooDeep(usize),

    #[error("frame of {0} bytes exceeds the {1} byte limit; enable chunked mode")]
    FrameTooLarge(usize, usize),

    #[error("chunked continuation without a final chunk")]
    UnterminatedChunk,

    #[error("invalid chunk mode '{0}', expected r|w|rw|none")]
    InvalidChunkMode(String),

    #[error("invalid utf-8 in text frame")]
    InvalidText,

    #[error("websocket handshake rejected: {0}")]
    WsHandshake(String),

    #[error("websocket frame invalid: {0}")]
    WsFrame(String),

    #[error("websocket control frame larger than 125 bytes: {0}")]
    WsControlTooLarge(usize),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
