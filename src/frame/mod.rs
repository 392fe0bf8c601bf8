//! The wire frame shared by the TCP and WebSocket transports.
//!
//! Every exchange is one frame: a fixed 16-byte header followed by an
//! optional body of at most [`MAX_BODY_SIZE`] bytes. All header integers
//! are big-endian.
//!
//! ```text
//! +-----------+-------------+-------+--------+--------+----------+
//! | pack len  | header len  |  ver  |   op   |  seq   |  body    |
//! |   u32     |    u16      |  u16  |  i32   |  i32   |  ...     |
//! +-----------+-------------+-------+--------+--------+----------+
//! ```

use bytes::{BufMut, Bytes};

use crate::error::{Error, Result};

mod head;

pub use self::head::Head;

// Client-to-server operations and their replies. The `op` header field
// identifies the exchange; replies use the request op plus one.
pub const OP_HANDSHAKE: i32 = 0;
pub const OP_HANDSHAKE_REPLY: i32 = 1;
pub const OP_HEARTBEAT: i32 = 2;
pub const OP_HEARTBEAT_REPLY: i32 = 3;
pub const OP_SEND_MSG: i32 = 4;
pub const OP_SEND_MSG_REPLY: i32 = 5;
pub const OP_DISCONNECT_REPLY: i32 = 6;
pub const OP_AUTH: i32 = 7;
pub const OP_AUTH_REPLY: i32 = 8;

/// Pre-framed payload; the write path emits the body verbatim.
pub const OP_RAW: i32 = 9;

pub const OP_PROTO_READY: i32 = 10;
pub const OP_PROTO_FINISH: i32 = 11;

pub const OP_CHANGE_ROOM: i32 = 12;
pub const OP_CHANGE_ROOM_REPLY: i32 = 13;
pub const OP_SUB: i32 = 14;
pub const OP_SUB_REPLY: i32 = 15;
pub const OP_UNSUB: i32 = 16;
pub const OP_UNSUB_REPLY: i32 = 17;

/// Size of the fixed frame header.
pub const HEADER_LEN: usize = 16;

/// Upper bound on the frame body.
pub const MAX_BODY_SIZE: usize = 4096;

/// Upper bound on a whole frame.
pub const MAX_PACK_SIZE: usize = HEADER_LEN + MAX_BODY_SIZE;

/// Extra length carried by a server heartbeat reply: one u32 with the
/// room online count, appended right after the header. Heart frames
/// have no body.
pub const HEART_SIZE: usize = 4;

pub(crate) const PACK_OFFSET: usize = 0;
pub(crate) const HEADER_OFFSET: usize = 4;
pub(crate) const VER_OFFSET: usize = 6;
pub(crate) const OP_OFFSET: usize = 8;
pub(crate) const SEQ_OFFSET: usize = 12;

/// One protocol message.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Frame {
    /// Protocol version, echoed back to the client.
    pub ver: u16,

    /// Operation code.
    pub op: i32,

    /// Client-assigned sequence, echoed back in replies.
    pub seq: i32,

    /// Optional body; empty means absent on the wire.
    pub body: Bytes,
}

// ===== impl Frame =====

impl Frame {
    pub fn new(op: i32, body: Bytes) -> Frame {
        Frame {
            ver: 0,
            op,
            seq: 0,
            body,
        }
    }

    /// Total length of the frame on the wire.
    pub fn pack_len(&self) -> usize {
        if self.op == OP_RAW {
            self.body.len()
        } else {
            HEADER_LEN + self.body.len()
        }
    }

    /// Encodes the frame into `dst`, which must have room for
    /// [`pack_len`](Frame::pack_len) bytes.
    pub fn encode<B: BufMut>(&self, dst: &mut B) {
        if self.op == OP_RAW {
            // Already framed by the producer.
            dst.put_slice(&self.body);
            return;
        }

        let head = Head::new(self.ver, self.op, self.seq, self.body.len());
        head.encode(dst);

        if !self.body.is_empty() {
            dst.put_slice(&self.body);
        }
    }

    /// Encodes the heartbeat-reply variant: the normal header with one
    /// extra u32 carrying the room online count, and no body.
    pub fn encode_heart<B: BufMut>(&self, online: i32, dst: &mut B) {
        let head = Head::new(self.ver, self.op, self.seq, HEART_SIZE);
        head.encode(dst);
        dst.put_i32(online);
    }

    /// Parses one whole frame out of a transport message, as received
    /// over WebSocket where a message carries exactly one frame.
    pub fn decode_message(buf: &[u8]) -> Result<Frame> {
        if buf.len() < HEADER_LEN {
            return Err(Error::PackLen);
        }

        let head = Head::parse(buf);
        head.validate()?;

        let pack_len = head.pack_len as usize;
        if pack_len > buf.len() {
            return Err(Error::PackLen);
        }

        let body = if pack_len > HEADER_LEN {
            Bytes::copy_from_slice(&buf[HEADER_LEN..pack_len])
        } else {
            Bytes::new()
        };

        Ok(Frame {
            ver: head.ver,
            op: head.op,
            seq: head.seq,
            body,
        })
    }

    /// Drops the body, keeping the header fields. Ring slots are
    /// long-lived; clearing the body after use releases the payload.
    pub fn clear_body(&mut self) {
        self.body = Bytes::new();
    }
}
