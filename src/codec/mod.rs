//! Transport framing: buffered frame reader and writer over any
//! `AsyncRead`/`AsyncWrite`.
//!
//! Both sides stage bytes in a fixed slab taken from a
//! [`Pool`](crate::pool::Pool), so steady-state reads and writes do not
//! allocate.

mod framed_read;
mod framed_write;

pub use self::framed_read::FramedRead;
pub use self::framed_write::FramedWrite;
