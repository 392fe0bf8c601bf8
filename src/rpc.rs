//! The push command listener: how the pusher hands the gateway work.
//!
//! Commands arrive over TCP as length-delimited JSON, one reply per
//! command on the same connection. Frame bodies travel base64-encoded.
//! Three commands exist, mirroring the delivery classes: `push` by
//! session keys, `broadcast_room`, and `broadcast` to every subscribed
//! connection.

use std::sync::Arc;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::codec::{Framed, LengthDelimitedCodec};

use log::{debug, error, info};

use crate::error::{Error, Result};
use crate::frame::Frame;
use crate::proto::Server;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "cmd", rename_all = "snake_case")]
pub enum Command {
    /// Targeted push to the named sessions.
    Push {
        op: i32,
        keys: Vec<String>,
        frame: WireFrame,
    },
    /// Fan a frame out to one room.
    BroadcastRoom { room_id: String, frame: WireFrame },
    /// Deliver to every connection subscribed to `op`. `speed` spreads
    /// the sweep over time; zero means all at once.
    Broadcast {
        op: i32,
        frame: WireFrame,
        #[serde(default)]
        speed: i32,
    },
}

/// A frame in transit inside a command; the body is base64.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WireFrame {
    #[serde(default)]
    pub ver: u16,
    pub op: i32,
    #[serde(default)]
    pub seq: i32,
    #[serde(default)]
    pub body: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Reply {
    pub code: i32,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub message: String,
}

// ===== impl WireFrame =====

impl WireFrame {
    pub fn from_frame(frame: &Frame) -> WireFrame {
        WireFrame {
            ver: frame.ver,
            op: frame.op,
            seq: frame.seq,
            body: BASE64.encode(&frame.body),
        }
    }

    pub fn into_frame(self) -> Result<Frame> {
        let body = BASE64
            .decode(self.body.as_bytes())
            .map_err(|_| Error::BroadcastArg)?;

        Ok(Frame {
            ver: self.ver,
            op: self.op,
            seq: self.seq,
            body: Bytes::from(body),
        })
    }
}

// ===== impl Reply =====

impl Reply {
    fn ok() -> Reply {
        Reply {
            code: 0,
            message: String::new(),
        }
    }

    fn err(message: String) -> Reply {
        Reply { code: 1, message }
    }
}

/// Binds the command listener and starts serving. Returns the bound
/// address.
pub async fn serve(server: Arc<Server>, addr: &str) -> Result<std::net::SocketAddr> {
    let listener = TcpListener::bind(addr).await?;
    let bound = listener.local_addr()?;
    info!("start rpc listen: {}", bound);

    tokio::spawn(accept(server, listener));
    Ok(bound)
}

async fn accept(server: Arc<Server>, listener: TcpListener) {
    loop {
        let (stream, addr) = tokio::select! {
            _ = server.shutdown_token().cancelled() => return,
            res = listener.accept() => match res {
                Ok(pair) => pair,
                Err(e) => {
                    error!("rpc accept failed; error={:?}", e);
                    continue;
                }
            },
        };

        debug!("rpc client connected; remote={}", addr);
        tokio::spawn(handle_conn(server.clone(), stream));
    }
}

async fn handle_conn(server: Arc<Server>, stream: TcpStream) {
    let mut framed = Framed::new(stream, LengthDelimitedCodec::new());

    while let Some(item) = framed.next().await {
        let raw = match item {
            Ok(raw) => raw,
            Err(e) => {
                debug!("rpc read failed; error={:?}", e);
                return;
            }
        };

        let reply = match serde_json::from_slice::<Command>(&raw) {
            Ok(command) => dispatch(&server, command).await,
            Err(e) => Reply::err(format!("bad command: {}", e)),
        };

        // Serializing a plain reply cannot fail.
        let encoded = serde_json::to_vec(&reply).unwrap_or_default();
        if let Err(e) = framed.send(Bytes::from(encoded)).await {
            debug!("rpc write failed; error={:?}", e);
            return;
        }
    }
}

async fn dispatch(server: &Arc<Server>, command: Command) -> Reply {
    match command {
        Command::Push { op, keys, frame } => {
            if keys.is_empty() {
                return Reply::err(Error::BroadcastArg.to_string());
            }
            match frame.into_frame() {
                Ok(frame) => {
                    server.push_keys(op, &keys, &frame);
                    Reply::ok()
                }
                Err(e) => Reply::err(e.to_string()),
            }
        }
        Command::BroadcastRoom { room_id, frame } => {
            if room_id.is_empty() {
                return Reply::err(Error::BroadcastArg.to_string());
            }
            match frame.into_frame() {
                Ok(frame) => {
                    server.broadcast_room(&room_id, &frame).await;
                    Reply::ok()
                }
                Err(e) => Reply::err(e.to_string()),
            }
        }
        Command::Broadcast { op, frame, speed } => match frame.into_frame() {
            Ok(frame) => {
                // A paced sweep can run for a while; never block the
                // command stream on it.
                let server = server.clone();
                tokio::spawn(async move {
                    server.broadcast(op, &frame, speed).await;
                });
                Reply::ok()
            }
            Err(e) => Reply::err(e.to_string()),
        },
    }
}
