use bytes::BufMut;

use crate::error::{Error, Result};
use crate::frame::{
    HEADER_LEN, HEADER_OFFSET, MAX_PACK_SIZE, OP_OFFSET, PACK_OFFSET, SEQ_OFFSET, VER_OFFSET,
};

/// The parsed fixed header of a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Head {
    pub pack_len: u32,
    pub header_len: u16,
    pub ver: u16,
    pub op: i32,
    pub seq: i32,
}

// ===== impl Head =====

impl Head {
    pub fn new(ver: u16, op: i32, seq: i32, body_len: usize) -> Head {
        Head {
            pack_len: (HEADER_LEN + body_len) as u32,
            header_len: HEADER_LEN as u16,
            ver,
            op,
            seq,
        }
    }

    /// Parses the header out of `buf`, which must hold at least
    /// [`HEADER_LEN`] bytes.
    pub fn parse(buf: &[u8]) -> Head {
        debug_assert!(buf.len() >= HEADER_LEN);

        Head {
            pack_len: unpack_u32(buf, PACK_OFFSET),
            header_len: unpack_u16(buf, HEADER_OFFSET),
            ver: unpack_u16(buf, VER_OFFSET),
            op: unpack_u32(buf, OP_OFFSET) as i32,
            seq: unpack_u32(buf, SEQ_OFFSET) as i32,
        }
    }

    /// Checks the length fields against the protocol bounds.
    pub fn validate(&self) -> Result<()> {
        if self.pack_len as usize > MAX_PACK_SIZE {
            return Err(Error::PackLen);
        }
        if self.header_len as usize != HEADER_LEN {
            return Err(Error::HeaderLen);
        }
        if (self.pack_len as usize) < HEADER_LEN {
            return Err(Error::PackLen);
        }
        Ok(())
    }

    /// Length of the body following this header.
    pub fn body_len(&self) -> usize {
        self.pack_len as usize - self.header_len as usize
    }

    pub fn encode<B: BufMut>(&self, dst: &mut B) {
        dst.put_u32(self.pack_len);
        dst.put_u16(self.header_len);
        dst.put_u16(self.ver);
        dst.put_i32(self.op);
        dst.put_i32(self.seq);
    }
}

fn unpack_u32(buf: &[u8], offset: usize) -> u32 {
    u32::from_be_bytes([
        buf[offset],
        buf[offset + 1],
        buf[offset + 2],
        buf[offset + 3],
    ])
}

fn unpack_u16(buf: &[u8], offset: usize) -> u16 {
    u16::from_be_bytes([buf[offset], buf[offset + 1]])
}
