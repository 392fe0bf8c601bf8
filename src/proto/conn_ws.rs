//! The WebSocket connection pipeline.
//!
//! Same two-task shape as the TCP pipeline; the transport differs in
//! that each WebSocket message carries exactly one frame, so decoding
//! is a one-shot parse per message and the tungstenite stack owns the
//! low-level buffering. Pings, pongs and close frames never reach the
//! engine.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::BytesMut;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::WebSocketStream;
use tokio_util::sync::CancellationToken;

use log::{debug, error, info, warn};

use crate::error::{Error, Result};
use crate::frame::{
    Frame, MAX_PACK_SIZE, OP_AUTH, OP_AUTH_REPLY, OP_HEARTBEAT, OP_HEARTBEAT_REPLY,
};
use crate::logic::ConnectReply;
use crate::proto::bucket::Bucket;
use crate::proto::channel::{Channel, Signal};
use crate::proto::server::Server;
use crate::timer::{Timer, TimerHandle};

type WsSink = SplitSink<WebSocketStream<TcpStream>, Message>;
type WsSource = SplitStream<WebSocketStream<TcpStream>>;

/// Binds the configured WebSocket addresses and starts an accept loop
/// for each. Returns the bound addresses.
pub async fn init_ws(server: &Arc<Server>, addrs: &[String]) -> Result<Vec<SocketAddr>> {
    let mut bound = Vec::with_capacity(addrs.len());
    for bind in addrs {
        let listener = TcpListener::bind(bind.as_str()).await?;
        let addr = listener.local_addr()?;
        info!("start ws listen: {}", addr);
        tokio::spawn(accept_ws(server.clone(), listener));
        bound.push(addr);
    }
    Ok(bound)
}

async fn accept_ws(server: Arc<Server>, listener: TcpListener) {
    loop {
        let (stream, addr) = tokio::select! {
            _ = server.shutdown_token().cancelled() => return,
            res = listener.accept() => match res {
                Ok(pair) => pair,
                Err(e) => {
                    error!("ws accept failed; error={:?}", e);
                    continue;
                }
            },
        };

        let rn = server.next_rn();
        tokio::spawn(serve_ws(server.clone(), stream, addr, rn));
    }
}

async fn serve_ws(server: Arc<Server>, stream: TcpStream, addr: SocketAddr, rn: usize) {
    let timer = server.round().timer(rn);

    let protocol = &server.config().protocol;
    let mut ch = Channel::new(protocol.cli_proto, protocol.svr_proto);
    ch.ip = addr.ip().to_string();

    // The deadline covers the HTTP upgrade as well as the auth
    // exchange.
    let token = ch.close_token().clone();
    let remote = addr.to_string();
    let trd = timer.add(protocol.handshake_timeout(), move || {
        debug!("ws handshake timeout; remote={}", remote);
        token.cancel();
    });

    let upgraded = tokio::select! {
        _ = ch.close_token().cancelled() => {
            timer.del(trd);
            return;
        }
        res = tokio_tungstenite::accept_async(stream) => res,
    };
    let ws = match upgraded {
        Ok(ws) => ws,
        Err(e) => {
            timer.del(trd);
            warn!("ws upgrade failed; remote={} error={:?}", addr, e);
            return;
        }
    };

    let (sink, source) = ws.split();
    let mut rd = WsFramedRead { inner: source };
    let mut wr = WsFramedWrite {
        inner: sink,
        scratch: BytesMut::with_capacity(MAX_PACK_SIZE),
    };

    let (reply, mut auth_frame) = match auth_ws(&server, &mut rd, ch.close_token().clone()).await
    {
        Ok(authed) => authed,
        Err(e) => {
            timer.del(trd);
            if !e.is_expected_close() {
                error!("ws handshake failed; remote={} error={}", addr, e);
            }
            return;
        }
    };

    ch.mid = reply.mid;
    ch.key = reply.key.clone();
    ch.watch(&reply.accepts);
    let ch = Arc::new(ch);

    // Register first, then acknowledge: a client that sees AuthReply
    // is already reachable by pushes.
    let bucket = server.bucket(&ch.key);
    let registered = match bucket.put(&reply.room_id, ch.clone()).await {
        Ok(()) => {
            auth_frame.op = OP_AUTH_REPLY;
            auth_frame.clear_body();
            match wr.write_frame(&auth_frame).await {
                Ok(()) => wr.flush().await,
                Err(e) => Err(e),
            }
        }
        Err(e) => Err(e),
    };
    if let Err(e) = registered {
        bucket.del(&ch);
        timer.del(trd);
        error!("ws register failed; key={} error={}", ch.key, e);
        return;
    }

    timer.set_key(trd, &ch.key);
    timer.set(trd, reply.heartbeat);

    let white = server.whitelist().contains(ch.mid);
    if white {
        server
            .whitelist()
            .printf(format_args!("key: {}[{}] ws auth", ch.key, reply.room_id));
    }
    if server.config().debug {
        debug!(
            "ws connected; key={} mid={} room={}",
            ch.key, ch.mid, reply.room_id
        );
    }

    tokio::spawn(dispatch_ws(server.clone(), ch.clone(), wr));

    let err = read_loop(
        &server,
        &mut rd,
        &ch,
        &bucket,
        timer,
        trd,
        reply.heartbeat,
        white,
    )
    .await
    .err();

    bucket.del(&ch);
    timer.del(trd);
    ch.close().await;

    if let Err(e) = server.disconnect(ch.mid, &ch.key).await {
        error!(
            "disconnect failed; key={} mid={} error={}",
            ch.key, ch.mid, e
        );
    }

    if let Some(e) = err {
        if !e.is_expected_close() {
            error!("ws serve failed; key={} error={}", ch.key, e);
        }
    }
    if server.config().debug {
        debug!("ws disconnected; key={} mid={}", ch.key, ch.mid);
    }
}

async fn auth_ws(
    server: &Arc<Server>,
    rd: &mut WsFramedRead,
    token: CancellationToken,
) -> Result<(ConnectReply, Frame)> {
    let mut frame = Frame::default();

    loop {
        tokio::select! {
            _ = token.cancelled() => return Err(Error::Handshake),
            res = rd.read_frame_into(&mut frame) => res?,
        }

        if frame.op == OP_AUTH {
            break;
        }
        error!("ws request operation({}) not auth", frame.op);
    }

    let reply = server.connect(&frame.body, "").await?;
    Ok((reply, frame))
}

#[allow(clippy::too_many_arguments)]
async fn read_loop(
    server: &Arc<Server>,
    rd: &mut WsFramedRead,
    ch: &Arc<Channel>,
    bucket: &Arc<Bucket>,
    timer: &Timer,
    trd: TimerHandle,
    hb: Duration,
    white: bool,
) -> Result<()> {
    let server_heartbeat = server.rand_server_heartbeat();
    let mut last_hb = Instant::now();

    loop {
        let frame = loop {
            match ch.ring.reserve_write() {
                Ok(frame) => break frame,
                Err(_) => {
                    tokio::select! {
                        _ = ch.close_token().cancelled() => {
                            return Err(Error::Io(io::ErrorKind::ConnectionAborted.into()));
                        }
                        _ = tokio::time::sleep(Duration::from_millis(1)) => {}
                    }
                }
            }
        };

        tokio::select! {
            _ = ch.close_token().cancelled() => {
                return Err(Error::Io(io::ErrorKind::ConnectionAborted.into()));
            }
            res = rd.read_frame_into(&mut *frame) => res?,
        }

        if white {
            server
                .whitelist()
                .printf(format_args!("key: {} read frame op={}", ch.key, frame.op));
        }

        if frame.op == OP_HEARTBEAT {
            timer.set(trd, hb);
            frame.op = OP_HEARTBEAT_REPLY;
            frame.clear_body();

            if last_hb.elapsed() > server_heartbeat {
                if server.heartbeat(ch.mid, &ch.key).await.is_ok() {
                    last_hb = Instant::now();
                }
            }
            if server.config().debug {
                debug!("ws heartbeat; key={} mid={}", ch.key, ch.mid);
            }
        } else {
            server.operate(&mut *frame, ch, bucket).await;
        }

        ch.ring.advance_write();
        ch.signal().await?;
    }
}

async fn dispatch_ws(server: Arc<Server>, ch: Arc<Channel>, mut wr: WsFramedWrite) {
    let Some(mut rx) = ch.take_signal_rx() else {
        return;
    };

    let white = server.whitelist().contains(ch.mid);
    if server.config().debug {
        debug!("ws dispatch start; key={}", ch.key);
    }

    let mut finish = false;
    let mut failure: Option<Error> = None;

    'dispatch: loop {
        let signal = match rx.recv().await {
            Some(signal) => signal,
            None => {
                finish = true;
                break;
            }
        };

        match signal {
            Signal::Finish => {
                finish = true;
                break;
            }
            Signal::Ready => {
                while let Ok(frame) = ch.ring.reserve_read() {
                    let res = if frame.op == OP_HEARTBEAT_REPLY {
                        let online = ch.room().map(|room| room.online_num()).unwrap_or(0);
                        wr.write_heart(&*frame, online).await
                    } else {
                        wr.write_frame(&*frame).await
                    };
                    if let Err(e) = res {
                        failure = Some(e);
                        break 'dispatch;
                    }

                    if white {
                        server.whitelist().printf(format_args!(
                            "key: {} write client frame op={}",
                            ch.key, frame.op
                        ));
                    }

                    frame.clear_body();
                    ch.ring.advance_read();
                }
            }
            Signal::Frame(frame) => {
                if let Err(e) = wr.write_frame(&frame).await {
                    failure = Some(e);
                    break;
                }
            }
        }

        if let Err(e) = wr.flush().await {
            failure = Some(e);
            break;
        }
    }

    if let Some(e) = failure {
        if !e.is_expected_close() {
            error!("ws dispatch failed; key={} error={}", ch.key, e);
        }
    }

    wr.close().await;
    ch.close_token().cancel();

    while !finish {
        match rx.recv().await {
            Some(Signal::Finish) | None => finish = true,
            Some(_) => {}
        }
    }

    if server.config().debug {
        debug!("ws dispatch exit; key={}", ch.key);
    }
}

// ===== transport wrappers =====

struct WsFramedRead {
    inner: WsSource,
}

impl WsFramedRead {
    async fn read_frame_into(&mut self, dst: &mut Frame) -> Result<()> {
        loop {
            let msg = match self.inner.next().await {
                None => return Err(Error::Io(io::ErrorKind::UnexpectedEof.into())),
                Some(Err(e)) => return Err(ws_err(e)),
                Some(Ok(msg)) => msg,
            };

            match msg {
                Message::Binary(buf) => {
                    *dst = Frame::decode_message(&buf)?;
                    return Ok(());
                }
                Message::Text(text) => {
                    *dst = Frame::decode_message(text.as_bytes())?;
                    return Ok(());
                }
                Message::Close(_) => {
                    return Err(Error::Io(io::ErrorKind::UnexpectedEof.into()));
                }
                // Pings and pongs are answered by the protocol stack.
                _ => continue,
            }
        }
    }
}

struct WsFramedWrite {
    inner: WsSink,
    scratch: BytesMut,
}

impl WsFramedWrite {
    async fn write_frame(&mut self, frame: &Frame) -> Result<()> {
        self.scratch.clear();
        frame.encode(&mut self.scratch);
        self.inner
            .feed(Message::binary(self.scratch.split().freeze()))
            .await
            .map_err(ws_err)
    }

    async fn write_heart(&mut self, frame: &Frame, online: i32) -> Result<()> {
        self.scratch.clear();
        frame.encode_heart(online, &mut self.scratch);
        self.inner
            .feed(Message::binary(self.scratch.split().freeze()))
            .await
            .map_err(ws_err)
    }

    async fn flush(&mut self) -> Result<()> {
        self.inner.flush().await.map_err(ws_err)
    }

    async fn close(&mut self) {
        let _ = self.inner.close().await;
    }
}

fn ws_err(e: WsError) -> Error {
    match e {
        WsError::ConnectionClosed | WsError::AlreadyClosed => {
            Error::Io(io::ErrorKind::UnexpectedEof.into())
        }
        WsError::Io(e) => Error::Io(e),
        other => Error::Io(io::Error::new(io::ErrorKind::InvalidData, other)),
    }
}
