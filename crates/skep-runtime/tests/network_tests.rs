//! Socket layer tests driven over real TCP: length-prefixed and chunked
//! framing, send-queue backpressure, parked text reads, websocket handshake
//! and frames, outbound connections, and write-then-close.

use std::io::{Read, Write};
use std::net::TcpStream;
use std::time::Duration;

use crossbeam_channel::{Sender, unbounded};

use skep_runtime::protocol::framing::length::encode_headers;
use skep_runtime::protocol::framing::text::ReadRequest;
use skep_runtime::protocol::framing::ws;
use skep_runtime::protocol::{Buffer, BufferFlags, Message, SocketEvent, ptype};
use skep_runtime::{Actor, Context, Error, NodeConfig, Server, ServerBuilder, ServiceConfig};

const RECV_WAIT: Duration = Duration::from_secs(3);

fn node(services: Vec<ServiceConfig>) -> NodeConfig {
    let mut node = NodeConfig::new(1, "net-test", 2);
    node.services = services;
    node
}

fn start(builder: ServerBuilder) -> Server {
    let server = builder.build().expect("server build");
    server.bootstrap().expect("bootstrap");
    server
}

fn connect(port: u16) -> TcpStream {
    let stream = TcpStream::connect(("127.0.0.1", port)).expect("client connect");
    stream.set_read_timeout(Some(RECV_WAIT)).unwrap();
    stream
}

fn send_frame(stream: &mut TcpStream, payload: &[u8]) {
    stream.write_all(&(payload.len() as u16).to_be_bytes()).unwrap();
    stream.write_all(payload).unwrap();
}

fn read_frame(stream: &mut TcpStream) -> Vec<u8> {
    let mut header = [0u8; 2];
    stream.read_exact(&mut header).unwrap();
    let len = u16::from_be_bytes(header) as usize;
    let mut payload = vec![0u8; len];
    stream.read_exact(&mut payload).unwrap();
    payload
}

fn send_chunked(stream: &mut TcpStream, payload: &[u8]) {
    for (header, range) in encode_headers(payload.len(), true).unwrap() {
        stream.write_all(&header).unwrap();
        stream.write_all(&payload[range]).unwrap();
    }
}

fn read_chunked(stream: &mut TcpStream) -> Vec<u8> {
    let mut whole = Vec::new();
    loop {
        let mut header = [0u8; 2];
        stream.read_exact(&mut header).unwrap();
        let raw = u16::from_be_bytes(header);
        let more = raw & 0x8000 != 0;
        let len = (raw & 0x7FFF) as usize;
        let mut chunk = vec![0u8; len];
        stream.read_exact(&mut chunk).unwrap();
        whole.extend_from_slice(&chunk);
        if !more {
            return whole;
        }
    }
}

// --- E4: chunked large frame ------------------------------------------------

struct ChunkGate {
    listening: Sender<(u16, u32, u8)>,
}

impl Actor for ChunkGate {
    fn start(&mut self, ctx: &mut Context<'_>) -> Result<(), Error> {
        let fd = ctx.listen("127.0.0.1:0", ptype::SOCKET)?;
        let port = ctx.listener_addr(fd).expect("bound").port();
        self.listening.send((port, fd, ctx.worker_id())).unwrap();
        Ok(())
    }

    fn dispatch(&mut self, ctx: &mut Context<'_>, msg: &Message) -> Result<(), Error> {
        match SocketEvent::from_u8(msg.subtype) {
            Some(SocketEvent::Accept) => {
                ctx.set_enable_chunked(msg.sender, "rw")?;
            }
            Some(SocketEvent::Message) => {
                ctx.write(msg.sender, Buffer::from_slice(msg.body()));
            }
            _ => {}
        }
        Ok(())
    }
}

#[test]
fn chunked_megabyte_round_trips_as_one_message() {
    let (listen_tx, listen_rx) = unbounded();

    let services = vec![ServiceConfig::new("gate", "gate")];
    let server = start(ServerBuilder::new(node(services)).no_stats().register(
        "gate",
        move |_| Ok(Box::new(ChunkGate { listening: listen_tx.clone() })),
    ));

    let (port, fd, worker_id) = listen_rx.recv_timeout(RECV_WAIT).expect("gate listening");
    // Fd routing: the fd's high 16 bits name the owning worker.
    assert_eq!(fd >> 16, u32::from(worker_id));

    let payload: Vec<u8> = (0..1_000_000u32).map(|i| (i % 251) as u8).collect();

    let mut client = connect(port);
    send_chunked(&mut client, &payload);
    let echoed = read_chunked(&mut client);
    assert_eq!(echoed.len(), payload.len());
    assert_eq!(echoed, payload);

    server.stop();
    assert_eq!(server.join(), 0);
}

// --- E5: send queue overflow ------------------------------------------------

struct FloodGate {
    listening: Sender<u16>,
    events: Sender<(String, String)>,
}

impl Actor for FloodGate {
    fn start(&mut self, ctx: &mut Context<'_>) -> Result<(), Error> {
        let fd = ctx.listen("127.0.0.1:0", ptype::SOCKET)?;
        self.listening
            .send(ctx.listener_addr(fd).expect("bound").port())
            .unwrap();
        Ok(())
    }

    fn dispatch(&mut self, ctx: &mut Context<'_>, msg: &Message) -> Result<(), Error> {
        match SocketEvent::from_u8(msg.subtype) {
            Some(SocketEvent::Accept) => {
                ctx.set_send_queue_limits(msg.sender, 2, 4);
            }
            Some(SocketEvent::Message) => {
                // Five queued writes against a limit of four; the fifth
                // must close the connection.
                for _ in 0..5 {
                    ctx.write(msg.sender, Buffer::from_slice(&[0xAB; 1024]));
                }
            }
            Some(SocketEvent::Error) => {
                self.events
                    .send(("error".to_string(), msg.body_text().to_string()))
                    .unwrap();
            }
            Some(SocketEvent::Close) => {
                self.events.send(("close".to_string(), String::new())).unwrap();
            }
            _ => {}
        }
        Ok(())
    }
}

#[test]
fn send_queue_overflow_closes_with_error_then_close() {
    let (listen_tx, listen_rx) = unbounded();
    let (event_tx, event_rx) = unbounded();

    let services = vec![ServiceConfig::new("flood", "flood")];
    let server = start(ServerBuilder::new(node(services)).no_stats().register(
        "flood",
        move |_| {
            Ok(Box::new(FloodGate {
                listening: listen_tx.clone(),
                events: event_tx.clone(),
            }))
        },
    ));

    let port = listen_rx.recv_timeout(RECV_WAIT).expect("flood listening");
    let mut client = connect(port);
    send_frame(&mut client, b"go");

    let (kind, detail) = event_rx.recv_timeout(RECV_WAIT).expect("error event");
    assert_eq!(kind, "error");
    assert_eq!(detail, "send_queue_overflow");

    let (kind, _) = event_rx.recv_timeout(RECV_WAIT).expect("close event");
    assert_eq!(kind, "close");

    server.stop();
    assert_eq!(server.join(), 0);
}

// --- parked text reads ------------------------------------------------------

fn arm_line_read(ctx: &mut Context<'_>, fd: u32) {
    ctx.read::<LineGate, _>(fd, ReadRequest::Line, move |_this, ctx, reply| {
        if let Ok(reply) = reply {
            let mut out = Buffer::from_slice(reply.message.body());
            out.write(b"\r\n");
            ctx.write(fd, out);
            arm_line_read(ctx, fd);
        }
    });
}

struct LineGate {
    listening: Sender<u16>,
}

impl Actor for LineGate {
    fn start(&mut self, ctx: &mut Context<'_>) -> Result<(), Error> {
        let fd = ctx.listen("127.0.0.1:0", ptype::TEXT)?;
        self.listening
            .send(ctx.listener_addr(fd).expect("bound").port())
            .unwrap();
        Ok(())
    }

    fn dispatch(&mut self, ctx: &mut Context<'_>, msg: &Message) -> Result<(), Error> {
        if SocketEvent::from_u8(msg.subtype) == Some(SocketEvent::Accept) {
            arm_line_read(ctx, msg.sender);
        }
        Ok(())
    }
}

#[test]
fn parked_line_read_waits_for_the_delimiter() {
    let (listen_tx, listen_rx) = unbounded();

    let services = vec![ServiceConfig::new("lines", "lines")];
    let server = start(ServerBuilder::new(node(services)).no_stats().register(
        "lines",
        move |_| Ok(Box::new(LineGate { listening: listen_tx.clone() })),
    ));

    let port = listen_rx.recv_timeout(RECV_WAIT).expect("listening");
    let mut client = connect(port);

    // A whole line echoes back with its terminator.
    client.write_all(b"hello\r\n").unwrap();
    let mut line = [0u8; 7];
    client.read_exact(&mut line).unwrap();
    assert_eq!(&line, b"hello\r\n");

    // A split line is not answered until the delimiter arrives.
    client.write_all(b"wo").unwrap();
    std::thread::sleep(Duration::from_millis(100));
    client.write_all(b"rld\r\n").unwrap();
    let mut line = [0u8; 7];
    client.read_exact(&mut line).unwrap();
    assert_eq!(&line, b"world\r\n");

    server.stop();
    assert_eq!(server.join(), 0);
}

// --- websocket: handshake, echo, ping ---------------------------------------

struct WsGate {
    listening: Sender<u16>,
}

impl Actor for WsGate {
    fn start(&mut self, ctx: &mut Context<'_>) -> Result<(), Error> {
        let fd = ctx.listen("127.0.0.1:0", ptype::WS)?;
        self.listening
            .send(ctx.listener_addr(fd).expect("bound").port())
            .unwrap();
        Ok(())
    }

    fn dispatch(&mut self, ctx: &mut Context<'_>, msg: &Message) -> Result<(), Error> {
        if SocketEvent::from_u8(msg.subtype) == Some(SocketEvent::Message) {
            let mut out = Buffer::from_slice(msg.body());
            if msg.payload.has_flag(BufferFlags::WS_TEXT) {
                out.set_flags(BufferFlags::WS_TEXT);
            }
            ctx.write(msg.sender, out);
        }
        Ok(())
    }
}

fn ws_send(stream: &mut TcpStream, opcode: ws::Opcode, payload: &[u8]) {
    let mask = ws::random_mask();
    let (header, hlen) = ws::encode_header(opcode, true, payload.len(), Some(mask));
    let mut masked = payload.to_vec();
    ws::mask_in_place(&mut masked, mask);
    stream.write_all(&header[..hlen]).unwrap();
    stream.write_all(&masked).unwrap();
}

fn ws_recv(stream: &mut TcpStream, pending: &mut Vec<u8>) -> ws::WsFrame {
    loop {
        if let Some((frame, consumed)) = ws::decode_frame(pending, false).unwrap() {
            pending.drain(..consumed);
            return frame;
        }
        let mut chunk = [0u8; 4096];
        let n = stream.read(&mut chunk).unwrap();
        assert!(n > 0, "peer closed mid-frame");
        pending.extend_from_slice(&chunk[..n]);
    }
}

#[test]
fn websocket_handshake_echo_and_ping() {
    let (listen_tx, listen_rx) = unbounded();

    let services = vec![ServiceConfig::new("wsgate", "wsgate")];
    let server = start(ServerBuilder::new(node(services)).no_stats().register(
        "wsgate",
        move |_| Ok(Box::new(WsGate { listening: listen_tx.clone() })),
    ));

    let port = listen_rx.recv_timeout(RECV_WAIT).expect("listening");
    let mut client = connect(port);

    let (request, key) = ws::client_request("127.0.0.1", "/");
    client.write_all(request.as_bytes()).unwrap();

    let mut pending = Vec::new();
    let head_end = loop {
        if let Some(end) = ws::find_header_end(&pending) {
            break end;
        }
        let mut chunk = [0u8; 1024];
        let n = client.read(&mut chunk).unwrap();
        assert!(n > 0, "peer closed during handshake");
        pending.extend_from_slice(&chunk[..n]);
    };
    let head: Vec<u8> = pending.drain(..head_end).collect();
    ws::check_server_response(&head, &key).expect("valid 101");

    // Text echo preserves the text opcode.
    ws_send(&mut client, ws::Opcode::Text, b"hello ws");
    let frame = ws_recv(&mut client, &mut pending);
    assert_eq!(frame.opcode, ws::Opcode::Text);
    assert_eq!(frame.payload, b"hello ws");

    // Pings are answered with a pong carrying the same payload.
    ws_send(&mut client, ws::Opcode::Ping, b"p1");
    let frame = ws_recv(&mut client, &mut pending);
    assert_eq!(frame.opcode, ws::Opcode::Pong);
    assert_eq!(frame.payload, b"p1");

    // A close frame is answered in kind, then the connection drops.
    ws_send(&mut client, ws::Opcode::Close, &[]);
    let frame = ws_recv(&mut client, &mut pending);
    assert_eq!(frame.opcode, ws::Opcode::Close);

    server.stop();
    assert_eq!(server.join(), 0);
}

// --- outbound connect -------------------------------------------------------

struct Dialer {
    received: Sender<String>,
}

impl Actor for Dialer {
    fn dispatch(&mut self, ctx: &mut Context<'_>, msg: &Message) -> Result<(), Error> {
        if msg.ptype == ptype::TEXT && msg.subtype == 0 {
            if let Some(addr) = msg.body_text().strip_prefix("dial ") {
                ctx.connect(addr, ptype::SOCKET)?;
            }
            return Ok(());
        }

        match SocketEvent::from_u8(msg.subtype) {
            Some(SocketEvent::Connect) => {
                ctx.write(msg.sender, Buffer::from_slice(b"hello from dialer"));
            }
            Some(SocketEvent::Message) => {
                self.received.send(msg.body_text().to_string()).unwrap();
            }
            _ => {}
        }
        Ok(())
    }
}

#[test]
fn outbound_connection_echoes_through_the_gate() {
    let (listen_tx, listen_rx) = unbounded();
    let (recv_tx, recv_rx) = unbounded();

    let services = vec![ServiceConfig::new("gate", "gate").unique()];
    let server = start(
        ServerBuilder::new(node(services))
            .no_stats()
            .register("gate", move |_| {
                Ok(Box::new(ChunkGate { listening: listen_tx.clone() }))
            })
            .register("dialer", move |_| {
                Ok(Box::new(Dialer { received: recv_tx.clone() }))
            }),
    );
    let router = server.router();

    let (port, _, _) = listen_rx.recv_timeout(RECV_WAIT).expect("gate listening");
    let dialer = router
        .new_service_blocking(ServiceConfig::new("dialer", "dialer"), 2, RECV_WAIT)
        .unwrap();

    let dial = Message::new(
        0,
        dialer,
        ptype::TEXT,
        Buffer::from_slice(format!("dial 127.0.0.1:{port}").as_bytes()),
    );
    assert!(router.send(dial));

    let echoed = recv_rx.recv_timeout(RECV_WAIT).expect("echo received");
    assert_eq!(echoed, "hello from dialer");

    server.stop();
    assert_eq!(server.join(), 0);
}

// --- write_then_close -------------------------------------------------------

struct OneShot {
    listening: Sender<u16>,
}

impl Actor for OneShot {
    fn start(&mut self, ctx: &mut Context<'_>) -> Result<(), Error> {
        let fd = ctx.listen("127.0.0.1:0", ptype::SOCKET)?;
        self.listening
            .send(ctx.listener_addr(fd).expect("bound").port())
            .unwrap();
        Ok(())
    }

    fn dispatch(&mut self, ctx: &mut Context<'_>, msg: &Message) -> Result<(), Error> {
        if SocketEvent::from_u8(msg.subtype) == Some(SocketEvent::Message) {
            ctx.write_then_close(msg.sender, Buffer::from_slice(b"bye"));
        }
        Ok(())
    }
}

#[test]
fn write_then_close_drains_before_closing() {
    let (listen_tx, listen_rx) = unbounded();

    let services = vec![ServiceConfig::new("oneshot", "oneshot")];
    let server = start(ServerBuilder::new(node(services)).no_stats().register(
        "oneshot",
        move |_| Ok(Box::new(OneShot { listening: listen_tx.clone() })),
    ));

    let port = listen_rx.recv_timeout(RECV_WAIT).expect("listening");
    let mut client = connect(port);

    send_frame(&mut client, b"hi");
    assert_eq!(read_frame(&mut client), b"bye");

    // After the farewell drains the server closes its side.
    let mut rest = Vec::new();
    let n = client.read_to_end(&mut rest).unwrap();
    assert_eq!(n, 0);

    server.stop();
    assert_eq!(server.join(), 0);
}
