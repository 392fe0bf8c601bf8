//! End-to-end scenarios against a gateway on real sockets.

mod support;

use std::time::Duration;

use bytes::{Bytes, BytesMut};
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::codec::{Framed, LengthDelimitedCodec};

use courier::frame::{
    Frame, HEART_SIZE, OP_AUTH, OP_AUTH_REPLY, OP_CHANGE_ROOM, OP_CHANGE_ROOM_REPLY,
    OP_HEARTBEAT, OP_HEARTBEAT_REPLY, OP_SEND_MSG, OP_SEND_MSG_REPLY, OP_SUB, OP_SUB_REPLY,
};
use courier::rpc::{Command, Reply, WireFrame};

use support::{start, test_config, TestClient};

#[tokio::test(flavor = "multi_thread")]
async fn handshake_timeout_closes_silent_connection() {
    let mut config = test_config();
    config.protocol.handshake_timeout_ms = 300;
    let gw = start(config).await;

    let mut client = TestClient::connect(gw.tcp).await;

    // Say nothing; the deadline should kill the socket.
    client.expect_closed(Duration::from_secs(5)).await;
    assert_eq!(gw.channel_count(), 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn auth_subscribe_and_filtered_broadcast() {
    let gw = start(test_config()).await;

    let mut client = TestClient::connect(gw.tcp).await;
    client
        .auth(r#"{"mid":42,"key":"K","room_id":"live://7","accepts":[4,5]}"#)
        .await;

    let bucket = gw.server.bucket("K");
    let ch = bucket.channel("K").expect("channel registered");
    assert_eq!(ch.mid, 42);
    assert_eq!(bucket.room("live://7").expect("room").online(), 1);

    // Add op 6 to the subscription set.
    client.send(OP_SUB, 2, b"6").await;
    let reply = client.read_frame().await.expect("sub reply");
    assert_eq!(reply.op, OP_SUB_REPLY);
    assert_eq!(reply.seq, 2);

    // Subscribed ops are delivered.
    let mut push = Frame::new(6, Bytes::from_static(b"X"));
    push.seq = 100;
    gw.server.broadcast(6, &push, 0).await;
    let got = client.read_frame().await.expect("op 6 delivery");
    assert_eq!(got.op, 6);
    assert_eq!(&got.body[..], b"X");

    // Ops from the original accepts list still work.
    let push = Frame::new(4, Bytes::from_static(b"Y"));
    gw.server.broadcast(4, &push, 0).await;
    assert_eq!(client.read_frame().await.expect("op 4 delivery").op, 4);

    // Unsubscribed ops are filtered out.
    let push = Frame::new(9, Bytes::from_static(b"Z"));
    gw.server.broadcast(9, &push, 0).await;
    assert!(client
        .read_frame_timeout(Duration::from_millis(300))
        .await
        .is_err());
}

#[tokio::test(flavor = "multi_thread")]
async fn heartbeat_replies_then_expiry_closes() {
    let mut config = test_config();
    config.protocol.heartbeat_ms = 1_000;
    let gw = start(config).await;

    let mut client = TestClient::connect(gw.tcp).await;
    client
        .auth(r#"{"mid":1,"key":"HB","room_id":"live://7","accepts":[]}"#)
        .await;

    // Beat faster than the interval; the connection must stay up and
    // every reply must carry the room online count.
    for _ in 0..4 {
        client.heartbeat().await;
        let reply = client.read_frame().await.expect("heartbeat reply");
        assert_eq!(reply.op, OP_HEARTBEAT_REPLY);
        assert_eq!(reply.body.len(), HEART_SIZE);
        let online = i32::from_be_bytes([
            reply.body[0],
            reply.body[1],
            reply.body[2],
            reply.body[3],
        ]);
        assert_eq!(online, 1);
        tokio::time::sleep(Duration::from_millis(200)).await;
    }

    // Stop beating; the heartbeat deadline closes the socket.
    client.expect_closed(Duration::from_secs(10)).await;

    assert!(
        gw.wait_until(|gw| gw.channel_count() == 0, Duration::from_secs(5))
            .await
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn reconnect_with_same_key_evicts_old_session() {
    let gw = start(test_config()).await;

    let mut first = TestClient::connect(gw.tcp).await;
    first
        .auth(r#"{"mid":7,"key":"K","room_id":"","accepts":[]}"#)
        .await;

    let mut second = TestClient::connect(gw.tcp).await;
    second
        .auth(r#"{"mid":7,"key":"K","room_id":"","accepts":[]}"#)
        .await;

    // The stale session gets closed, not the new one.
    first.expect_closed(Duration::from_secs(5)).await;

    let bucket = gw.server.bucket("K");
    assert!(bucket.channel("K").is_some());
    assert!(
        gw.wait_until(|gw| gw.channel_count() == 1, Duration::from_secs(5))
            .await
    );

    // The survivor still works.
    second.heartbeat().await;
    assert_eq!(
        second.read_frame().await.expect("reply").op,
        OP_HEARTBEAT_REPLY
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn room_fanout_in_order_and_cleanup() {
    let gw = start(test_config()).await;

    let mut members = Vec::new();
    for i in 0..3 {
        let mut client = TestClient::connect(gw.tcp).await;
        let token = format!(r#"{{"mid":{},"key":"member-{}","room_id":"R","accepts":[]}}"#, i, i);
        client.auth(&token).await;
        members.push(client);
    }

    let mut one = Frame::new(OP_SEND_MSG_REPLY, Bytes::from_static(b"first"));
    one.seq = 1;
    let mut two = Frame::new(OP_SEND_MSG_REPLY, Bytes::from_static(b"second"));
    two.seq = 2;
    gw.server.broadcast_room("R", &one).await;
    gw.server.broadcast_room("R", &two).await;

    for client in &mut members {
        let got = client.read_frame().await.expect("first fanout");
        assert_eq!(got.seq, 1);
        let got = client.read_frame().await.expect("second fanout");
        assert_eq!(got.seq, 2);
    }

    // All members leave; the room must disappear from its buckets.
    drop(members);
    assert!(
        gw.wait_until(
            |gw| !gw.room_exists("R") && gw.channel_count() == 0,
            Duration::from_secs(5)
        )
        .await
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn change_room_moves_and_cleans_up() {
    let gw = start(test_config()).await;

    let mut client = TestClient::connect(gw.tcp).await;
    client
        .auth(r#"{"mid":1,"key":"mover","room_id":"old","accepts":[]}"#)
        .await;
    assert!(gw.room_exists("old"));

    client.send(OP_CHANGE_ROOM, 3, b"new").await;
    let reply = client.read_frame().await.expect("change room reply");
    assert_eq!(reply.op, OP_CHANGE_ROOM_REPLY);

    assert!(
        gw.wait_until(
            |gw| gw.room_exists("new") && !gw.room_exists("old"),
            Duration::from_secs(2)
        )
        .await
    );

    // Room broadcasts follow the move.
    let push = Frame::new(OP_SEND_MSG_REPLY, Bytes::from_static(b"hi"));
    gw.server.broadcast_room("new", &push).await;
    assert_eq!(&client.read_frame().await.expect("delivery").body[..], b"hi");
}

#[tokio::test(flavor = "multi_thread")]
async fn overflow_drops_without_killing_the_gateway() {
    let mut config = test_config();
    config.protocol.svr_proto = 10;
    config.protocol.heartbeat_ms = 800;
    let gw = start(config).await;

    let mut client = TestClient::connect(gw.tcp).await;
    client
        .auth(r#"{"mid":5,"key":"slow","room_id":"","accepts":[5]}"#)
        .await;

    let ch = gw.server.bucket("slow").channel("slow").expect("channel");

    // The client never reads; the socket and mailbox fill up and the
    // rest must be dropped, not queued without bound.
    let push = Frame::new(5, Bytes::from(vec![0u8; 1024]));
    let keys = vec!["slow".to_owned()];
    for _ in 0..1_000 {
        gw.server.push_keys(5, &keys, &push);
    }

    assert!(ch.dropped_count() > 0);

    // No heartbeats either; the deadline reaps the connection.
    assert!(
        gw.wait_until(|gw| gw.channel_count() == 0, Duration::from_secs(10))
            .await
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn push_rpc_reaches_target_session() {
    let gw = start(test_config()).await;

    let mut client = TestClient::connect(gw.tcp).await;
    client
        .auth(r#"{"mid":9,"key":"RPC","room_id":"lobby","accepts":[5]}"#)
        .await;

    let stream = TcpStream::connect(gw.rpc).await.expect("rpc connect");
    let mut framed = Framed::new(stream, LengthDelimitedCodec::new());

    // Targeted push by session key.
    let push = Frame::new(OP_SEND_MSG_REPLY, Bytes::from_static(b"direct"));
    let command = Command::Push {
        op: OP_SEND_MSG_REPLY,
        keys: vec!["RPC".to_owned()],
        frame: WireFrame::from_frame(&push),
    };
    framed
        .send(Bytes::from(serde_json::to_vec(&command).unwrap()))
        .await
        .expect("rpc send");
    let raw = framed.next().await.expect("rpc reply").expect("rpc frame");
    let reply: Reply = serde_json::from_slice(&raw).expect("reply json");
    assert_eq!(reply.code, 0);

    let got = client.read_frame().await.expect("pushed frame");
    assert_eq!(&got.body[..], b"direct");

    // Room broadcast through the same command stream.
    let command = Command::BroadcastRoom {
        room_id: "lobby".to_owned(),
        frame: WireFrame::from_frame(&Frame::new(OP_SEND_MSG_REPLY, Bytes::from_static(b"room"))),
    };
    framed
        .send(Bytes::from(serde_json::to_vec(&command).unwrap()))
        .await
        .expect("rpc send");
    let raw = framed.next().await.expect("rpc reply").expect("rpc frame");
    let reply: Reply = serde_json::from_slice(&raw).expect("reply json");
    assert_eq!(reply.code, 0);

    let got = client.read_frame().await.expect("room frame");
    assert_eq!(&got.body[..], b"room");

    // Malformed commands get an error reply, not a dropped connection.
    framed
        .send(Bytes::from_static(b"{\"cmd\":\"nope\"}"))
        .await
        .expect("rpc send");
    let raw = framed.next().await.expect("rpc reply").expect("rpc frame");
    let reply: Reply = serde_json::from_slice(&raw).expect("reply json");
    assert_eq!(reply.code, 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn websocket_transport_speaks_the_same_protocol() {
    let gw = start(test_config()).await;

    let (mut ws, _) = tokio_tungstenite::connect_async(format!("ws://{}/sub", gw.ws))
        .await
        .expect("ws connect");

    // Auth: one binary message, one frame.
    let mut auth = Frame::new(
        OP_AUTH,
        Bytes::from_static(br#"{"mid":3,"key":"WS","room_id":"wsroom","accepts":[5]}"#),
    );
    auth.seq = 1;
    let mut buf = BytesMut::with_capacity(auth.pack_len());
    auth.encode(&mut buf);
    ws.send(Message::binary(buf.freeze())).await.expect("send auth");

    let reply = read_ws_frame(&mut ws).await;
    assert_eq!(reply.op, OP_AUTH_REPLY);
    assert_eq!(reply.seq, 1);

    // Heartbeat reply carries the room online count after the header.
    let beat = Frame::new(OP_HEARTBEAT, Bytes::new());
    let mut buf = BytesMut::with_capacity(beat.pack_len());
    beat.encode(&mut buf);
    ws.send(Message::binary(buf.freeze())).await.expect("send beat");

    let reply = read_ws_frame(&mut ws).await;
    assert_eq!(reply.op, OP_HEARTBEAT_REPLY);
    assert_eq!(reply.body.len(), HEART_SIZE);

    // Room broadcasts reach WebSocket members like anyone else.
    let push = Frame::new(OP_SEND_MSG_REPLY, Bytes::from_static(b"to-ws"));
    gw.server.broadcast_room("wsroom", &push).await;
    let got = read_ws_frame(&mut ws).await;
    assert_eq!(&got.body[..], b"to-ws");
}

async fn read_ws_frame<S>(ws: &mut S) -> Frame
where
    S: futures::Stream<Item = Result<Message, tokio_tungstenite::tungstenite::Error>> + Unpin,
{
    loop {
        match ws.next().await {
            Some(Ok(Message::Binary(raw))) => {
                return Frame::decode_message(&raw).expect("frame decode")
            }
            Some(Ok(_)) => continue,
            other => panic!("websocket ended early: {:?}", other),
        }
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn non_auth_frames_before_auth_are_discarded() {
    let gw = start(test_config()).await;

    let mut client = TestClient::connect(gw.tcp).await;

    // Send a message before authenticating; the server must ignore it
    // and still accept a following auth.
    client.send(OP_SEND_MSG, 1, b"too early").await;
    client
        .auth(r#"{"mid":1,"key":"late","room_id":"","accepts":[]}"#)
        .await;

    assert_eq!(gw.channel_count(), 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn graceful_close_finishes_every_connection() {
    let gw = start(test_config()).await;

    let mut clients = Vec::new();
    for i in 0..4 {
        let mut client = TestClient::connect(gw.tcp).await;
        let token = format!(r#"{{"mid":{},"key":"down-{}","room_id":"R","accepts":[]}}"#, i, i);
        client.auth(&token).await;
        clients.push(client);
    }
    assert_eq!(gw.channel_count(), 4);

    gw.server.close().await;

    for client in &mut clients {
        client.expect_closed(Duration::from_secs(5)).await;
    }
}
