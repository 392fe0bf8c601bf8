use std::io;

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::error::{Error, Result};
use crate::frame::{Frame, Head, HEADER_LEN};

/// Reads frames off a byte stream.
///
/// One frame is decoded per call: the 16-byte header is popped and
/// validated first, then the body. The staging slab is borrowed from a
/// buffer pool and handed back at teardown via
/// [`into_buffer`](FramedRead::into_buffer).
#[derive(Debug)]
pub struct FramedRead<T> {
    io: T,

    // Fixed slab; `pos..filled` holds buffered-but-unconsumed bytes.
    buf: BytesMut,
    pos: usize,
    filled: usize,
}

// ===== impl FramedRead =====

impl<T> FramedRead<T>
where
    T: AsyncRead + Unpin,
{
    /// Wraps `io` with `buf` as the staging slab. The slab must be at
    /// least one full frame long.
    pub fn new(io: T, buf: BytesMut) -> FramedRead<T> {
        FramedRead {
            io,
            buf,
            pos: 0,
            filled: 0,
        }
    }

    /// Reads the next frame.
    pub async fn read_frame(&mut self) -> Result<Frame> {
        let mut frame = Frame::default();
        self.read_frame_into(&mut frame).await?;
        Ok(frame)
    }

    /// Reads the next frame into an existing slot, e.g. a ring entry.
    pub async fn read_frame_into(&mut self, dst: &mut Frame) -> Result<()> {
        let head = {
            let raw = self.pop(HEADER_LEN).await?;
            Head::parse(raw)
        };
        head.validate()?;

        let body_len = head.body_len();
        let body = if body_len > 0 {
            Bytes::copy_from_slice(self.pop(body_len).await?)
        } else {
            Bytes::new()
        };

        dst.ver = head.ver;
        dst.op = head.op;
        dst.seq = head.seq;
        dst.body = body;
        Ok(())
    }

    // Returns `n` contiguous buffered bytes, filling from the
    // underlying stream as needed.
    async fn pop(&mut self, n: usize) -> Result<&[u8]> {
        if n > self.buf.len() {
            // A frame this large cannot be staged.
            return Err(Error::PackLen);
        }

        while self.filled - self.pos < n {
            if self.buf.len() - self.pos < n {
                // Make room at the tail for a contiguous run.
                self.buf.copy_within(self.pos..self.filled, 0);
                self.filled -= self.pos;
                self.pos = 0;
            }

            let read = self.io.read(&mut self.buf[self.filled..]).await?;
            if read == 0 {
                return Err(Error::Io(io::ErrorKind::UnexpectedEof.into()));
            }
            self.filled += read;
        }

        let start = self.pos;
        self.pos += n;
        if self.pos == self.filled {
            self.pos = 0;
            self.filled = 0;
        }
        Ok(&self.buf[start..start + n])
    }

    pub fn get_ref(&self) -> &T {
        &self.io
    }

    /// Tears down the reader, releasing the staging slab back to its
    /// pool.
    pub fn into_buffer(self) -> BytesMut {
        self.buf
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::frame::{MAX_PACK_SIZE, OP_AUTH, OP_HEARTBEAT, OP_SEND_MSG};

    fn encode_all(frames: &[Frame]) -> Vec<u8> {
        let mut raw = BytesMut::new();
        for frame in frames {
            frame.encode(&mut raw);
        }
        raw.to_vec()
    }

    #[tokio::test]
    async fn reads_back_to_back_frames() {
        let frames = vec![
            Frame::new(OP_AUTH, Bytes::from_static(b"{\"mid\":1}")),
            Frame::new(OP_HEARTBEAT, Bytes::new()),
            Frame::new(OP_SEND_MSG, Bytes::from_static(b"payload")),
        ];
        let raw = encode_all(&frames);

        let mut rd = FramedRead::new(&raw[..], BytesMut::zeroed(MAX_PACK_SIZE));
        for want in &frames {
            let got = rd.read_frame().await.unwrap();
            assert_eq!(&got, want);
        }

        // Stream exhausted.
        match rd.read_frame().await {
            Err(Error::Io(e)) => assert_eq!(e.kind(), io::ErrorKind::UnexpectedEof),
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[tokio::test]
    async fn wraps_within_small_slab() {
        // Slab barely larger than one frame forces compaction between
        // reads.
        let body = Bytes::from(vec![7u8; 100]);
        let frames: Vec<_> = (0..16)
            .map(|seq| {
                let mut f = Frame::new(OP_SEND_MSG, body.clone());
                f.seq = seq;
                f
            })
            .collect();
        let raw = encode_all(&frames);

        let mut rd = FramedRead::new(&raw[..], BytesMut::zeroed(150));
        for want in &frames {
            assert_eq!(&rd.read_frame().await.unwrap(), want);
        }
    }

    #[tokio::test]
    async fn surfaces_header_errors() {
        let mut raw = encode_all(&[Frame::new(OP_HEARTBEAT, Bytes::new())]);
        raw[4] = 0;
        raw[5] = 8;

        let mut rd = FramedRead::new(&raw[..], BytesMut::zeroed(MAX_PACK_SIZE));
        match rd.read_frame().await {
            Err(Error::HeaderLen) => {}
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[tokio::test]
    async fn rejects_frame_larger_than_slab() {
        let frame = Frame::new(OP_SEND_MSG, Bytes::from(vec![0u8; 64]));
        let raw = encode_all(&[frame]);

        let mut rd = FramedRead::new(&raw[..], BytesMut::zeroed(32));
        match rd.read_frame().await {
            Err(Error::PackLen) => {}
            other => panic!("unexpected result: {:?}", other),
        }
    }
}
