use bytes::BytesMut;
use tokio::io::{AsyncWrite, AsyncWriteExt};

use crate::error::Result;
use crate::frame::{Frame, HEADER_LEN, HEART_SIZE};

/// Writes frames into a staging slab, flushing to the stream when the
/// slab fills or the caller asks for it.
///
/// Responses are batched: the dispatcher encodes everything it has and
/// flushes once, so a drain of the request ring costs one syscall.
#[derive(Debug)]
pub struct FramedWrite<T> {
    io: T,
    buf: BytesMut,
    cap: usize,
}

// ===== impl FramedWrite =====

impl<T> FramedWrite<T>
where
    T: AsyncWrite + Unpin,
{
    /// Wraps `io` with `buf` as the staging slab.
    pub fn new(io: T, mut buf: BytesMut) -> FramedWrite<T> {
        let cap = buf.len();
        buf.clear();
        FramedWrite { io, buf, cap }
    }

    /// Encodes one frame, flushing the slab first if it lacks room.
    pub async fn write_frame(&mut self, frame: &Frame) -> Result<()> {
        let len = frame.pack_len();

        if len > self.cap {
            // Too large to stage (a raw pre-framed batch can be); write
            // through.
            self.flush_buf().await?;
            let mut tmp = BytesMut::with_capacity(len);
            frame.encode(&mut tmp);
            self.io.write_all(&tmp).await?;
            return Ok(());
        }

        if self.buf.len() + len > self.cap {
            self.flush_buf().await?;
        }
        frame.encode(&mut self.buf);
        Ok(())
    }

    /// Encodes the heartbeat-reply variant carrying the room online
    /// count.
    pub async fn write_heart(&mut self, frame: &Frame, online: i32) -> Result<()> {
        if self.buf.len() + HEADER_LEN + HEART_SIZE > self.cap {
            self.flush_buf().await?;
        }
        frame.encode_heart(online, &mut self.buf);
        Ok(())
    }

    /// Drains the slab and flushes the stream.
    pub async fn flush(&mut self) -> Result<()> {
        self.flush_buf().await?;
        self.io.flush().await?;
        Ok(())
    }

    async fn flush_buf(&mut self) -> Result<()> {
        if !self.buf.is_empty() {
            self.io.write_all(&self.buf).await?;
            self.buf.clear();
        }
        Ok(())
    }

    /// Tears down the writer: the stream (for shutdown) and the slab
    /// (for its pool). Unflushed bytes are discarded.
    pub fn into_parts(self) -> (T, BytesMut) {
        (self.io, self.buf)
    }
}
