//! The TCP connection pipeline.
//!
//! Each accepted socket runs exactly two tasks. The reader owns the
//! read half: it decodes request frames into the ring, answers
//! heartbeats and hands everything else to `Server::operate`. The
//! dispatcher owns the write half: it blocks on the signal mailbox,
//! drains the ring on `Ready`, writes pushed frames directly and exits
//! on `Finish`.
//!
//! Teardown always runs the same way regardless of which side failed:
//! the reader returns its buffer, deregisters and sends `Finish`; the
//! dispatcher returns its buffer, shuts the socket down and drains the
//! mailbox so the reader can never wedge on a full one.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use log::{debug, error, info, warn};

use crate::codec::{FramedRead, FramedWrite};
use crate::error::{Error, Result};
use crate::frame::{Frame, OP_AUTH, OP_AUTH_REPLY, OP_HEARTBEAT, OP_HEARTBEAT_REPLY};
use crate::logic::ConnectReply;
use crate::proto::bucket::Bucket;
use crate::proto::channel::{Channel, Signal};
use crate::proto::server::Server;
use crate::timer::{Timer, TimerHandle};

/// Binds the configured TCP addresses and starts an accept loop for
/// each. Returns the bound addresses, resolved from the kernel so
/// ephemeral ports come back concrete.
pub async fn init_tcp(server: &Arc<Server>, addrs: &[String]) -> Result<Vec<SocketAddr>> {
    let mut bound = Vec::with_capacity(addrs.len());
    for bind in addrs {
        let listener = TcpListener::bind(bind.as_str()).await?;
        let addr = listener.local_addr()?;
        info!("start tcp listen: {}", addr);
        tokio::spawn(accept_tcp(server.clone(), listener));
        bound.push(addr);
    }
    Ok(bound)
}

async fn accept_tcp(server: Arc<Server>, listener: TcpListener) {
    loop {
        let (stream, addr) = tokio::select! {
            _ = server.shutdown_token().cancelled() => return,
            res = listener.accept() => match res {
                Ok(pair) => pair,
                Err(e) => {
                    error!("tcp accept failed; error={:?}", e);
                    continue;
                }
            },
        };

        if let Err(e) = configure_stream(&stream, &server) {
            warn!("socket options failed; remote={} error={:?}", addr, e);
        }

        let rn = server.next_rn();
        tokio::spawn(serve_tcp(server.clone(), stream, addr, rn));
    }
}

fn configure_stream(stream: &TcpStream, server: &Arc<Server>) -> std::io::Result<()> {
    let tcp = &server.config().tcp;
    let sock = socket2::SockRef::from(stream);

    if tcp.keepalive {
        sock.set_tcp_keepalive(&socket2::TcpKeepalive::new())?;
    }
    sock.set_recv_buffer_size(tcp.rcvbuf)?;
    sock.set_send_buffer_size(tcp.sndbuf)?;
    Ok(())
}

async fn serve_tcp(server: Arc<Server>, stream: TcpStream, addr: SocketAddr, rn: usize) {
    let timer = server.round().timer(rn);
    let read_pool = server.round().reader(rn);
    let write_pool = server.round().writer(rn);

    let (read_half, write_half) = stream.into_split();
    let mut rd = FramedRead::new(read_half, read_pool.get());
    let mut wr = FramedWrite::new(write_half, write_pool.get());

    let protocol = &server.config().protocol;
    let mut ch = Channel::new(protocol.cli_proto, protocol.svr_proto);
    ch.ip = addr.ip().to_string();

    // The handshake deadline: expiry forces the socket down and the
    // pending read wakes with an error.
    let token = ch.close_token().clone();
    let remote = addr.to_string();
    let trd = timer.add(protocol.handshake_timeout(), move || {
        debug!("handshake timeout; remote={}", remote);
        token.cancel();
    });

    let (reply, mut auth_frame) =
        match auth_tcp(&server, &mut rd, ch.close_token().clone()).await {
            Ok(authed) => authed,
            Err(e) => {
                timer.del(trd);
                read_pool.put(rd.into_buffer());
                let (_, wb) = wr.into_parts();
                write_pool.put(wb);
                if !e.is_expected_close() {
                    error!("tcp handshake failed; remote={} error={}", addr, e);
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
        read_pool.put(rd.into_buffer());
        let (_, wb) = wr.into_parts();
        write_pool.put(wb);
        error!("tcp register failed; key={} error={}", ch.key, e);
        return;
    }

    timer.set_key(trd, &ch.key);
    timer.set(trd, reply.heartbeat);

    let white = server.whitelist().contains(ch.mid);
    if white {
        server
            .whitelist()
            .printf(format_args!("key: {}[{}] auth", ch.key, reply.room_id));
    }
    if server.config().debug {
        debug!(
            "tcp connected; key={} mid={} room={}",
            ch.key, ch.mid, reply.room_id
        );
    }

    tokio::spawn(dispatch_tcp(server.clone(), ch.clone(), wr, rn));

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
    read_pool.put(rd.into_buffer());
    ch.close().await;

    if let Err(e) = server.disconnect(ch.mid, &ch.key).await {
        error!(
            "disconnect failed; key={} mid={} error={}",
            ch.key, ch.mid, e
        );
    }

    if let Some(e) = err {
        if white {
            server
                .whitelist()
                .printf(format_args!("key: {} server tcp error({})", ch.key, e));
        }
        if !e.is_expected_close() {
            error!("tcp serve failed; key={} error={}", ch.key, e);
        }
    }
    if server.config().debug {
        debug!("tcp disconnected; key={} mid={}", ch.key, ch.mid);
    }
}

// Reads frames until one carries OpAuth (anything else is logged and
// discarded) and authenticates upstream. The caller answers with the
// returned frame once the channel is registered.
async fn auth_tcp(
    server: &Arc<Server>,
    rd: &mut FramedRead<OwnedReadHalf>,
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
        error!("tcp request operation({}) not auth", frame.op);
    }

    let reply = server.connect(&frame.body, "").await?;
    Ok((reply, frame))
}

#[allow(clippy::too_many_arguments)]
async fn read_loop(
    server: &Arc<Server>,
    rd: &mut FramedRead<OwnedReadHalf>,
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
        // A full ring means the dispatcher is behind; stall the socket
        // read instead of dropping the request.
        let frame = loop {
            match ch.ring.reserve_write() {
                Ok(frame) => break frame,
                Err(_) => {
                    tokio::select! {
                        _ = ch.close_token().cancelled() => {
                            return Err(Error::Io(std::io::ErrorKind::ConnectionAborted.into()));
                        }
                        _ = tokio::time::sleep(Duration::from_millis(1)) => {}
                    }
                }
            }
        };

        tokio::select! {
            _ = ch.close_token().cancelled() => {
                return Err(Error::Io(std::io::ErrorKind::ConnectionAborted.into()));
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

            // The logic tier only needs a liveness note once per
            // server-heartbeat window.
            if last_hb.elapsed() > server_heartbeat {
                if server.heartbeat(ch.mid, &ch.key).await.is_ok() {
                    last_hb = Instant::now();
                }
            }
            if server.config().debug {
                debug!("tcp heartbeat; key={} mid={}", ch.key, ch.mid);
            }
        } else {
            server.operate(&mut *frame, ch, bucket).await;
        }

        ch.ring.advance_write();
        ch.signal().await?;
    }
}

async fn dispatch_tcp(
    server: Arc<Server>,
    ch: Arc<Channel>,
    mut wr: FramedWrite<OwnedWriteHalf>,
    rn: usize,
) {
    let Some(mut rx) = ch.take_signal_rx() else {
        return;
    };

    let white = server.whitelist().contains(ch.mid);
    if server.config().debug {
        debug!("dispatch start; key={}", ch.key);
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
                // Client replies: everything committed to the ring so
                // far goes out in one batch.
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

                    // The slot outlives the frame; release the payload.
                    frame.clear_body();
                    ch.ring.advance_read();
                }
            }
            Signal::Frame(frame) => {
                // Server push arriving through the mailbox.
                if let Err(e) = wr.write_frame(&frame).await {
                    failure = Some(e);
                    break;
                }
                if white {
                    server.whitelist().printf(format_args!(
                        "key: {} write server frame op={}",
                        ch.key, frame.op
                    ));
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
            error!("dispatch tcp failed; key={} error={}", ch.key, e);
        }
    }

    let (mut write_half, wb) = wr.into_parts();
    server.round().writer(rn).put(wb);
    let _ = write_half.shutdown().await;
    ch.close_token().cancel();

    // Keep consuming until the finish sentinel so the reader can never
    // wedge on a full mailbox.
    while !finish {
        match rx.recv().await {
            Some(Signal::Finish) | None => finish = true,
            Some(_) => {}
        }
    }

    if server.config().debug {
        debug!("dispatch exit; key={}", ch.key);
    }
}
