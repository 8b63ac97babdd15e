//! Built-in echo service: listens with the configured framing and returns
//! every message to its sender. Text-framed connections are driven by a
//! line read loop; socket and websocket framings echo delivered frames.

use skep_runtime::protocol::framing::text::ReadRequest;
use skep_runtime::protocol::{Buffer, BufferFlags, Message, SocketEvent, ptype};
use skep_runtime::{Actor, Context, Error, ServiceConfig};
use tracing::{debug, info};

pub struct Echo {
    host: String,
    port: u16,
    proto: u8,
}

impl Echo {
    pub fn from_config(conf: &ServiceConfig) -> Result<Box<dyn Actor>, Error> {
        let host = conf.extra_str("host").unwrap_or("0.0.0.0").to_string();
        let port = conf
            .extra_u64("port")
            .ok_or_else(|| Error::Config("echo: missing 'port'".to_string()))? as u16;
        let proto = match conf.extra_str("proto").unwrap_or("socket") {
            "socket" => ptype::SOCKET,
            "text" => ptype::TEXT,
            "ws" => ptype::WS,
            other => {
                return Err(Error::Config(format!("echo: unknown proto '{other}'")));
            }
        };
        Ok(Box::new(Echo { host, port, proto }))
    }
}

/// Keep one line read outstanding; each completion echoes and re-arms.
fn arm_line_read(ctx: &mut Context<'_>, fd: u32) {
    ctx.read::<Echo, _>(fd, ReadRequest::Line, move |_this, ctx, reply| {
        if let Ok(reply) = reply {
            let mut out = Buffer::from_slice(reply.message.body());
            out.write(b"\r\n");
            ctx.write(fd, out);
            arm_line_read(ctx, fd);
        }
    });
}

impl Actor for Echo {
    fn start(&mut self, ctx: &mut Context<'_>) -> Result<(), Error> {
        let addr = format!("{}:{}", self.host, self.port);
        let fd = ctx.listen(&addr, self.proto)?;
        info!("echo '{}' listening on {addr} (fd {fd:#010x})", ctx.name());
        Ok(())
    }

    fn dispatch(&mut self, ctx: &mut Context<'_>, msg: &Message) -> Result<(), Error> {
        let Some(event) = SocketEvent::from_u8(msg.subtype) else {
            return Ok(());
        };

        match event {
            SocketEvent::Accept | SocketEvent::Connect => {
                ctx.set_socket_timeout(msg.sender, 300);
                if self.proto == ptype::TEXT {
                    arm_line_read(ctx, msg.sender);
                }
            }
            SocketEvent::Message => {
                let mut out = Buffer::from_slice(msg.body());
                if msg.payload.has_flag(BufferFlags::WS_TEXT) {
                    out.set_flags(BufferFlags::WS_TEXT);
                }
                ctx.write(msg.sender, out);
            }
            SocketEvent::Close | SocketEvent::Error => {
                debug!("echo fd {:#010x}: {:?}", msg.sender, event);
            }
            SocketEvent::Ping | SocketEvent::Pong => {}
        }
        Ok(())
    }
}
