//! Per-socket state machine: framing, the receive path, the send queue with
//! backpressure limits, and the parked single read.

use std::collections::VecDeque;
use std::io::{Read, Write};
use std::ops::Range;
use std::sync::Arc;

use mio::Token;
use mio::net::TcpStream;
use smallvec::SmallVec;
use tracing::warn;

use skep_protocol::framing::length::{ChunkMode, LengthCodec, encode_headers};
use skep_protocol::framing::text::{ReadRequest, match_request};
use skep_protocol::framing::ws;
use skep_protocol::{Buffer, BufferFlags, Message, SocketEvent, ptype};

use crate::error::Error;
use crate::metrics::NetStats;
use crate::net::{MAX_RECV_BUF, MAX_NET_SEND_QUEUE_SIZE, WARN_NET_SEND_QUEUE_SIZE};

const READ_CHUNK: usize = 16 * 1024;

/// Why the connection is going away, as seen by the manager.
#[derive(Debug)]
pub(crate) enum Gone {
    /// Peer misbehaved or the OS reported an error; the owner receives a
    /// `subtype=error` carrying the text, then `subtype=close`.
    Error(String),
    /// Clean shutdown (websocket close frame); only `subtype=close` is
    /// delivered.
    Clean,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ConnState {
    Connecting,
    Handshake,
    Open,
    Closing,
}

pub(crate) enum Framing {
    Length(LengthCodec),
    Text,
    Ws { client: bool },
}

pub(crate) struct PendingRead {
    pub req: ReadRequest,
    pub owner: u32,
    pub session: i32,
}

enum Body {
    Shared(Arc<Buffer>, Range<usize>),
    Owned(Vec<u8>),
}

impl Body {
    fn as_slice(&self) -> &[u8] {
        match self {
            Body::Shared(buf, range) => &buf.as_slice()[range.clone()],
            Body::Owned(bytes) => bytes,
        }
    }
}

struct SendEntry {
    header: SmallVec<[u8; 14]>,
    hpos: usize,
    body: Body,
    bpos: usize,
    /// Last wire entry of one logical write; drops the queued-write count.
    end_of_write: bool,
    close_after: bool,
}

impl SendEntry {
    fn raw(bytes: Vec<u8>) -> Self {
        Self {
            header: SmallVec::new(),
            hpos: 0,
            body: Body::Owned(bytes),
            bpos: 0,
            end_of_write: false,
            close_after: false,
        }
    }
}

pub(crate) struct Connection {
    pub fd: u32,
    pub owner: u32,
    pub token: Token,
    pub stream: TcpStream,
    pub proto: u8,
    pub(crate) state: ConnState,
    framing: Framing,
    recv_buf: Vec<u8>,
    pub pending_read: Option<PendingRead>,
    send_queue: VecDeque<SendEntry>,
    queued_writes: usize,
    warn_limit: usize,
    max_limit: usize,
    warned: bool,
    close_after_send: bool,
    pub last_recv_ms: i64,
    /// Idle timeout in milliseconds; zero disables the sweep for this
    /// connection.
    pub timeout_ms: i64,
    peer: String,
    /// Nonce of an outstanding client websocket handshake.
    ws_key: Option<String>,
}

fn framing_for(proto: u8, client: bool) -> Framing {
    match proto {
        ptype::TEXT => Framing::Text,
        ptype::WS => Framing::Ws { client },
        _ => Framing::Length(LengthCodec::default()),
    }
}

impl Connection {
    pub fn accepted(fd: u32, token: Token, stream: TcpStream, proto: u8, owner: u32, now: i64) -> Self {
        let peer = stream
            .peer_addr()
            .map(|a| a.to_string())
            .unwrap_or_default();
        let state = if proto == ptype::WS {
            ConnState::Handshake
        } else {
            ConnState::Open
        };
        Self {
            fd,
            owner,
            token,
            stream,
            proto,
            state,
            framing: framing_for(proto, false),
            recv_buf: Vec::new(),
            pending_read: None,
            send_queue: VecDeque::new(),
            queued_writes: 0,
            warn_limit: WARN_NET_SEND_QUEUE_SIZE,
            max_limit: MAX_NET_SEND_QUEUE_SIZE,
            warned: false,
            close_after_send: false,
            last_recv_ms: now,
            timeout_ms: 0,
            peer,
            ws_key: None,
        }
    }

    pub fn outbound(fd: u32, token: Token, stream: TcpStream, proto: u8, owner: u32, now: i64, peer: String) -> Self {
        Self {
            fd,
            owner,
            token,
            stream,
            proto,
            state: ConnState::Connecting,
            framing: framing_for(proto, true),
            recv_buf: Vec::new(),
            pending_read: None,
            send_queue: VecDeque::new(),
            queued_writes: 0,
            warn_limit: WARN_NET_SEND_QUEUE_SIZE,
            max_limit: MAX_NET_SEND_QUEUE_SIZE,
            warned: false,
            close_after_send: false,
            last_recv_ms: now,
            timeout_ms: 0,
            peer,
            ws_key: None,
        }
    }

    pub fn wants_writable(&self) -> bool {
        !self.send_queue.is_empty() || self.state == ConnState::Connecting
    }

    pub fn set_queue_limits(&mut self, warn: usize, max: usize) {
        self.warn_limit = warn.max(1);
        self.max_limit = max.max(1);
    }

    pub fn set_chunk_mode(&mut self, mode: ChunkMode) {
        if let Framing::Length(codec) = &mut self.framing {
            codec.chunk = mode;
        }
    }

    fn event(&self, kind: SocketEvent, payload: Buffer, session: i32) -> Message {
        Message {
            sender: self.fd,
            receiver: self.owner,
            session,
            ptype: self.proto,
            subtype: kind as u8,
            header: self.peer.clone(),
            payload: Arc::new(payload),
        }
    }

    /// Completion of a non-blocking connect. Plain protocols open
    /// immediately; a websocket client queues its upgrade request first.
    pub fn on_connected(&mut self, out: &mut Vec<Message>) -> Result<(), Gone> {
        if let Ok(Some(e)) | Err(e) = self.stream.take_error() {
            return Err(Gone::Error(e.to_string()));
        }

        match &self.framing {
            Framing::Ws { client: true } => {
                let (request, key) = ws::client_request(&self.peer, "/");
                self.ws_key = Some(key);
                // Ahead of anything queued before the connect completed.
                self.send_queue.push_front(SendEntry::raw(request.into_bytes()));
                self.state = ConnState::Handshake;
            }
            _ => {
                self.state = ConnState::Open;
                out.push(self.event(SocketEvent::Connect, Buffer::new(), 0));
            }
        }
        Ok(())
    }

    /// Drain the socket into the receive buffer, then run the framing state
    /// machine over whatever accumulated.
    pub fn handle_readable(
        &mut self,
        now: i64,
        out: &mut Vec<Message>,
        stats: &mut NetStats,
    ) -> Result<(), Gone> {
        let mut chunk = [0u8; READ_CHUNK];
        loop {
            match self.stream.read(&mut chunk) {
                Ok(0) => {
                    // Drain what the peer sent before its FIN.
                    self.process(out)?;
                    return Err(Gone::Error("eof".to_string()));
                }
                Ok(n) => {
                    self.last_recv_ms = now;
                    stats.bytes_recv += n as u64;
                    self.recv_buf.extend_from_slice(&chunk[..n]);
                    if self.recv_buf.len() > MAX_RECV_BUF {
                        return Err(Gone::Error("recv buffer overflow".to_string()));
                    }
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(Gone::Error(e.to_string())),
            }
        }
        self.process(out)
    }

    fn process(&mut self, out: &mut Vec<Message>) -> Result<(), Gone> {
        if self.state == ConnState::Handshake {
            self.advance_handshake(out)?;
        }
        if self.state != ConnState::Open && self.state != ConnState::Closing {
            return Ok(());
        }

        match self.framing {
            Framing::Length(_) => self.process_length(out),
            Framing::Text => {
                self.process_text(out);
                Ok(())
            }
            Framing::Ws { .. } => self.process_ws(out),
        }
    }

    fn advance_handshake(&mut self, out: &mut Vec<Message>) -> Result<(), Gone> {
        let Some(end) = ws::find_header_end(&self.recv_buf) else {
            return Ok(());
        };
        let head: Vec<u8> = self.recv_buf.drain(..end).collect();

        match self.ws_key.take() {
            // Client side: validate the 101 against our nonce.
            Some(key) => {
                ws::check_server_response(&head, &key).map_err(|e| Gone::Error(e.to_string()))?;
                self.state = ConnState::Open;
                out.push(self.event(SocketEvent::Connect, Buffer::new(), 0));
            }
            // Server side: answer the upgrade request.
            None => {
                let request =
                    ws::parse_upgrade_request(&head).map_err(|e| Gone::Error(e.to_string()))?;
                let response = ws::handshake_response(&request.key);
                self.send_queue.push_back(SendEntry::raw(response.into_bytes()));
                self.state = ConnState::Open;
                out.push(self.event(SocketEvent::Accept, Buffer::new(), 0));
            }
        }
        Ok(())
    }

    fn process_length(&mut self, out: &mut Vec<Message>) -> Result<(), Gone> {
        let mut frames = Vec::new();
        {
            let Framing::Length(codec) = &mut self.framing else {
                return Ok(());
            };
            loop {
                let (consumed, frame) = codec
                    .decode(&self.recv_buf)
                    .map_err(|e| Gone::Error(e.to_string()))?;
                if consumed == 0 {
                    break;
                }
                self.recv_buf.drain(..consumed);
                if let Some(frame) = frame {
                    frames.push(frame);
                }
            }
        }
        for frame in frames {
            out.push(self.event(SocketEvent::Message, Buffer::from_slice(&frame), 0));
        }
        Ok(())
    }

    fn process_text(&mut self, out: &mut Vec<Message>) {
        let satisfied = match &self.pending_read {
            Some(pending) => match_request(&self.recv_buf, &pending.req),
            None => None,
        };
        let Some((consumed, delivered)) = satisfied else {
            return;
        };
        let Some(pending) = self.pending_read.take() else {
            return;
        };

        let payload = Buffer::from_slice(&self.recv_buf[..delivered]);
        self.recv_buf.drain(..consumed);

        let mut msg = self.event(SocketEvent::Message, payload, pending.session);
        msg.receiver = pending.owner;
        out.push(msg);
    }

    fn process_ws(&mut self, out: &mut Vec<Message>) -> Result<(), Gone> {
        let client = matches!(self.framing, Framing::Ws { client: true });
        if self.state == ConnState::Closing {
            return Ok(());
        }
        loop {
            // Servers require masked frames from clients.
            let decoded =
                ws::decode_frame(&self.recv_buf, !client).map_err(|e| Gone::Error(e.to_string()))?;
            let Some((frame, consumed)) = decoded else {
                return Ok(());
            };
            self.recv_buf.drain(..consumed);

            match frame.opcode {
                ws::Opcode::Ping => {
                    self.queue_ws_control(ws::Opcode::Pong, &frame.payload, client);
                    out.push(self.event(SocketEvent::Ping, Buffer::from_slice(&frame.payload), 0));
                }
                ws::Opcode::Pong => {
                    out.push(self.event(SocketEvent::Pong, Buffer::from_slice(&frame.payload), 0));
                }
                ws::Opcode::Close => {
                    // Answer in kind, then let the reply drain; the flush
                    // path finishes the connection once the queue empties.
                    self.queue_ws_control(ws::Opcode::Close, &frame.payload, client);
                    self.state = ConnState::Closing;
                    self.close_after_send = true;
                    return Ok(());
                }
                ws::Opcode::Text | ws::Opcode::Binary | ws::Opcode::Continuation => {
                    let mut payload = Buffer::from_slice(&frame.payload);
                    if frame.opcode == ws::Opcode::Text {
                        payload.set_flags(BufferFlags::WS_TEXT);
                    }
                    out.push(self.event(SocketEvent::Message, payload, 0));
                }
            }
        }
    }

    fn queue_ws_control(&mut self, opcode: ws::Opcode, payload: &[u8], client: bool) {
        let mask = client.then(ws::random_mask);
        let (header, hlen) = ws::encode_header(opcode, true, payload.len(), mask);

        let mut body = payload.to_vec();
        if let Some(key) = mask {
            ws::mask_in_place(&mut body, key);
        }

        let mut entry = SendEntry::raw(body);
        entry.header.extend_from_slice(&header[..hlen]);
        self.send_queue.push_back(entry);
    }

    /// Queue one logical write. Framing is applied here when the buffer asks
    /// for it; the actual socket write happens on the next writable event.
    pub fn enqueue(&mut self, buf: Arc<Buffer>) -> Result<(), Gone> {
        if self.state == ConnState::Closing {
            return Ok(());
        }
        if self.queued_writes + 1 > self.max_limit {
            return Err(Gone::Error("send_queue_overflow".to_string()));
        }
        if self.queued_writes + 1 > self.warn_limit && !self.warned {
            self.warned = true;
            warn!(
                "fd {:#010x}: send queue above warning level ({} queued)",
                self.fd,
                self.queued_writes + 1
            );
        }

        let close_after = buf.has_flag(BufferFlags::CLOSE_AFTER_SEND);
        let mut entries = if buf.has_flag(BufferFlags::NEEDS_FRAMING) {
            self.frame_entries(&buf)?
        } else {
            vec![SendEntry {
                header: SmallVec::new(),
                hpos: 0,
                body: Body::Shared(Arc::clone(&buf), 0..buf.len()),
                bpos: 0,
                end_of_write: false,
                close_after: false,
            }]
        };

        if let Some(last) = entries.last_mut() {
            last.end_of_write = true;
            last.close_after = close_after;
        }
        self.queued_writes += 1;
        self.send_queue.extend(entries);
        Ok(())
    }

    fn frame_entries(&mut self, buf: &Arc<Buffer>) -> Result<Vec<SendEntry>, Gone> {
        let len = buf.len();
        match &self.framing {
            Framing::Length(codec) => {
                let headers = encode_headers(len, codec.chunk.write)
                    .map_err(|e| Gone::Error(e.to_string()))?;
                Ok(headers
                    .into_iter()
                    .map(|(header, range)| {
                        let mut entry = SendEntry {
                            header: SmallVec::new(),
                            hpos: 0,
                            body: Body::Shared(Arc::clone(buf), range),
                            bpos: 0,
                            end_of_write: false,
                            close_after: false,
                        };
                        entry.header.extend_from_slice(&header);
                        entry
                    })
                    .collect())
            }
            Framing::Text => Ok(vec![SendEntry {
                header: SmallVec::new(),
                hpos: 0,
                body: Body::Shared(Arc::clone(buf), 0..len),
                bpos: 0,
                end_of_write: false,
                close_after: false,
            }]),
            Framing::Ws { client } => {
                let flags = buf.flags();
                let opcode = if flags.contains(BufferFlags::WS_PING) {
                    ws::Opcode::Ping
                } else if flags.contains(BufferFlags::WS_PONG) {
                    ws::Opcode::Pong
                } else if flags.contains(BufferFlags::WS_TEXT) {
                    ws::Opcode::Text
                } else {
                    ws::Opcode::Binary
                };

                let mask = client.then(ws::random_mask);
                let (header, hlen) = ws::encode_header(opcode, true, len, mask);

                let body = if let Some(key) = mask {
                    let mut masked = buf.as_slice().to_vec();
                    ws::mask_in_place(&mut masked, key);
                    Body::Owned(masked)
                } else {
                    Body::Shared(Arc::clone(buf), 0..len)
                };

                let mut entry = SendEntry {
                    header: SmallVec::new(),
                    hpos: 0,
                    body,
                    bpos: 0,
                    end_of_write: false,
                    close_after: false,
                };
                entry.header.extend_from_slice(&header[..hlen]);
                Ok(vec![entry])
            }
        }
    }

    /// Push queued bytes into the socket. Returns `true` while the queue
    /// still wants writable events.
    pub fn flush(&mut self, stats: &mut NetStats) -> Result<bool, Gone> {
        while let Some(entry) = self.send_queue.front_mut() {
            while entry.hpos < entry.header.len() {
                match self.stream.write(&entry.header[entry.hpos..]) {
                    Ok(n) => {
                        entry.hpos += n;
                        stats.bytes_sent += n as u64;
                    }
                    Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => return Ok(true),
                    Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                    Err(e) => return Err(Gone::Error(e.to_string())),
                }
            }

            loop {
                let slice = entry.body.as_slice();
                if entry.bpos >= slice.len() {
                    break;
                }
                match self.stream.write(&slice[entry.bpos..]) {
                    Ok(n) => {
                        entry.bpos += n;
                        stats.bytes_sent += n as u64;
                    }
                    Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => return Ok(true),
                    Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                    Err(e) => return Err(Gone::Error(e.to_string())),
                }
            }

            let finished = self.send_queue.pop_front().unwrap();
            if finished.end_of_write {
                self.queued_writes -= 1;
                if self.queued_writes < self.warn_limit {
                    self.warned = false;
                }
            }
            if finished.close_after {
                self.close_after_send = true;
                self.send_queue.clear();
                self.queued_writes = 0;
                break;
            }
        }

        if self.send_queue.is_empty() && self.close_after_send {
            return Err(Gone::Clean);
        }
        Ok(!self.send_queue.is_empty())
    }

    /// Issue a read. Satisfied immediately when the receive buffer already
    /// holds enough; otherwise parked until data arrives. A second read
    /// while one is outstanding is a usage error.
    pub fn start_read(
        &mut self,
        req: ReadRequest,
        owner: u32,
        session: i32,
        out: &mut Vec<Message>,
    ) -> Result<(), Error> {
        if self.pending_read.is_some() {
            return Err(Error::ReadPending(self.fd));
        }
        self.pending_read = Some(PendingRead { req, owner, session });
        self.process_text(out);
        Ok(())
    }

    pub fn timed_out(&self, now: i64) -> bool {
        self.timeout_ms > 0 && now - self.last_recv_ms > self.timeout_ms
    }
}
