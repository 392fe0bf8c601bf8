//! Fixed-size buffer pools for connection read/write staging.
//!
//! A pool pre-allocates `num` slabs of `size` bytes carved out of one
//! contiguous backing allocation and hands them out from a free list.
//! `get`/`put` are O(1); an exhausted pool grows by another backing
//! allocation rather than failing.

use std::sync::Mutex;

use bytes::BytesMut;

/// A pool of fixed-size byte slabs.
#[derive(Debug)]
pub struct Pool {
    num: usize,
    size: usize,
    free: Mutex<Vec<BytesMut>>,
}

// ===== impl Pool =====

impl Pool {
    /// Creates a pool of `num` buffers of `size` bytes each.
    pub fn new(num: usize, size: usize) -> Pool {
        let num = num.max(1);
        let size = size.max(1);

        Pool {
            num,
            size,
            free: Mutex::new(Pool::carve(num, size)),
        }
    }

    // One contiguous allocation sliced into `num` slabs; the slices
    // share the backing storage until they are dropped.
    fn carve(num: usize, size: usize) -> Vec<BytesMut> {
        let mut backing = BytesMut::zeroed(num * size);
        let mut slabs = Vec::with_capacity(num);

        for _ in 0..num - 1 {
            slabs.push(backing.split_to(size));
        }
        slabs.push(backing);
        slabs
    }

    /// Takes a slab from the free list, growing the pool if empty.
    pub fn get(&self) -> BytesMut {
        let mut free = self.free.lock().unwrap();

        if let Some(buf) = free.pop() {
            return buf;
        }

        let mut slabs = Pool::carve(self.num, self.size);
        let buf = slabs.pop().unwrap();
        free.extend(slabs);
        buf
    }

    /// Returns a slab to the free list.
    pub fn put(&self, mut buf: BytesMut) {
        buf.resize(self.size, 0);
        self.free.lock().unwrap().push(buf);
    }

    /// The configured slab size in bytes.
    pub fn buf_size(&self) -> usize {
        self.size
    }
}
