//! Shared helpers for the integration suite: a gateway started on
//! ephemeral ports plus a minimal raw-TCP protocol client.

#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use courier::config::Config;
use courier::frame::{self, Frame, HEADER_LEN};
use courier::logic::LocalLogic;
use courier::proto::{init_tcp, init_ws, Server};

pub struct Gateway {
    pub server: Arc<Server>,
    pub tcp: SocketAddr,
    pub ws: SocketAddr,
    pub rpc: SocketAddr,
}

/// A config scaled down for tests: tiny pools, one room worker per
/// bucket (so per-client broadcast order is deterministic), short
/// handshake deadline.
pub fn test_config() -> Config {
    let mut config = Config::default();
    config.bucket.size = 4;
    config.bucket.channel = 16;
    config.bucket.room = 16;
    config.bucket.routine_amount = 1;
    config.bucket.routine_size = 64;
    config.tcp.reader = 2;
    config.tcp.read_buf = 2;
    config.tcp.read_buf_size = 8192;
    config.tcp.writer = 2;
    config.tcp.write_buf = 2;
    config.tcp.write_buf_size = 8192;
    config.protocol.timer = 2;
    config.protocol.timer_size = 64;
    config.protocol.handshake_timeout_ms = 60_000;
    config.protocol.heartbeat_ms = 60_000;
    config
}

pub async fn start(config: Config) -> Gateway {
    let logic = Arc::new(LocalLogic::new(config.protocol.heartbeat()));
    let server = Server::new(config, logic).expect("server init");

    let tcp = init_tcp(&server, &["127.0.0.1:0".to_owned()])
        .await
        .expect("tcp listen")[0];
    let ws = init_ws(&server, &["127.0.0.1:0".to_owned()])
        .await
        .expect("ws listen")[0];
    let rpc = courier::rpc::serve(server.clone(), "127.0.0.1:0")
        .await
        .expect("rpc listen");

    Gateway {
        server,
        tcp,
        ws,
        rpc,
    }
}

impl Gateway {
    /// Total registered channels across all buckets.
    pub fn channel_count(&self) -> usize {
        self.server
            .buckets()
            .iter()
            .map(|b| b.channel_count())
            .sum()
    }

    /// Finds a room by id in whichever buckets hold members.
    pub fn room_exists(&self, room_id: &str) -> bool {
        self.server
            .buckets()
            .iter()
            .any(|b| b.room(room_id).is_some())
    }

    /// Polls until `cond` holds or the deadline passes.
    pub async fn wait_until<F>(&self, mut cond: F, timeout: Duration) -> bool
    where
        F: FnMut(&Gateway) -> bool,
    {
        let deadline = tokio::time::Instant::now() + timeout;
        while tokio::time::Instant::now() < deadline {
            if cond(self) {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        cond(self)
    }
}

/// A raw protocol client speaking the TCP framing directly.
pub struct TestClient {
    stream: TcpStream,
}

impl TestClient {
    pub async fn connect(addr: SocketAddr) -> TestClient {
        let stream = TcpStream::connect(addr).await.expect("client connect");
        stream.set_nodelay(true).expect("nodelay");
        TestClient { stream }
    }

    /// Sends an Auth frame and returns the reply, which is expected to
    /// be AuthReply.
    pub async fn auth(&mut self, token_json: &str) -> Frame {
        self.send(frame::OP_AUTH, 1, token_json.as_bytes()).await;
        let reply = self.read_frame().await.expect("auth reply");
        assert_eq!(reply.op, frame::OP_AUTH_REPLY);
        reply
    }

    pub async fn send(&mut self, op: i32, seq: i32, body: &[u8]) {
        let mut f = Frame::new(op, Bytes::copy_from_slice(body));
        f.seq = seq;

        let mut buf = BytesMut::with_capacity(f.pack_len());
        f.encode(&mut buf);
        self.stream.write_all(&buf).await.expect("client write");
    }

    pub async fn heartbeat(&mut self) {
        self.send(frame::OP_HEARTBEAT, 0, b"").await;
    }

    /// Reads one frame; `None` once the server has closed the socket.
    /// The heart variant comes back as a frame whose body is the
    /// trailing online u32.
    pub async fn read_frame(&mut self) -> Option<Frame> {
        let mut head = [0u8; HEADER_LEN];
        if self.stream.read_exact(&mut head).await.is_err() {
            return None;
        }

        let pack_len = u32::from_be_bytes([head[0], head[1], head[2], head[3]]) as usize;
        assert!(pack_len >= HEADER_LEN, "bad pack len {}", pack_len);

        let mut body = vec![0u8; pack_len - HEADER_LEN];
        if !body.is_empty() && self.stream.read_exact(&mut body).await.is_err() {
            return None;
        }

        Some(Frame {
            ver: u16::from_be_bytes([head[6], head[7]]),
            op: i32::from_be_bytes([head[8], head[9], head[10], head[11]]),
            seq: i32::from_be_bytes([head[12], head[13], head[14], head[15]]),
            body: Bytes::from(body),
        })
    }

    /// Reads one frame with a deadline; `Ok(None)` means closed,
    /// `Err(())` means nothing arrived in time.
    pub async fn read_frame_timeout(
        &mut self,
        timeout: Duration,
    ) -> Result<Option<Frame>, ()> {
        match tokio::time::timeout(timeout, self.read_frame()).await {
            Ok(frame) => Ok(frame),
            Err(_) => Err(()),
        }
    }

    /// Waits for the server to close the connection.
    pub async fn expect_closed(&mut self, timeout: Duration) {
        match self.read_frame_timeout(timeout).await {
            Ok(None) => {}
            Ok(Some(f)) => panic!("expected close, got frame op={}", f.op),
            Err(()) => panic!("expected close, connection still open"),
        }
    }
}
