//! Bounded single-producer/single-consumer queue of in-flight request
//! frames.
//!
//! One ring sits between the two tasks of a connection: the reader task
//! decodes client frames into reserved slots, the dispatcher task writes
//! them back out. Capacity is rounded up to the next power of two and
//! the read/write pointers are free-running counters, so `empty` is
//! `r == w`, `full` is `w - r == capacity` and a slot index is
//! `pointer & (capacity - 1)`.
//!
//! There are no locks. Slot handoff is ordered by the release/acquire
//! pairs on the pointers; the connection's signal mailbox provides the
//! producer-to-consumer wakeup.

use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::error::{Error, Result};
use crate::frame::Frame;

pub struct Ring {
    mask: u64,
    data: Box<[UnsafeCell<Frame>]>,

    // Free-running pointers; wrap-around is harmless with power-of-two
    // capacities.
    rp: AtomicU64,
    wp: AtomicU64,
}

// The SPSC contract: exactly one task calls the write-side methods and
// exactly one task calls the read-side methods. Under that contract the
// producer and consumer never alias the same slot, because a slot is
// only handed to the consumer by `advance_write` and only handed back
// by `advance_read`.
unsafe impl Send for Ring {}
unsafe impl Sync for Ring {}

// ===== impl Ring =====

impl Ring {
    /// Creates a ring with capacity `num` rounded up to a power of two.
    pub fn new(num: usize) -> Ring {
        let cap = num.max(1).next_power_of_two();

        let data = (0..cap)
            .map(|_| UnsafeCell::new(Frame::default()))
            .collect::<Vec<_>>()
            .into_boxed_slice();

        Ring {
            mask: (cap - 1) as u64,
            data,
            rp: AtomicU64::new(0),
            wp: AtomicU64::new(0),
        }
    }

    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    /// Producer: a reference to the next free slot, or `RingFull`.
    ///
    /// The caller fills the slot and then commits it with
    /// [`advance_write`](Ring::advance_write).
    pub fn reserve_write(&self) -> Result<&mut Frame> {
        let rp = self.rp.load(Ordering::Acquire);
        let wp = self.wp.load(Ordering::Relaxed);

        if wp.wrapping_sub(rp) >= self.data.len() as u64 {
            return Err(Error::RingFull);
        }

        let idx = (wp & self.mask) as usize;
        unsafe { Ok(&mut *self.data[idx].get()) }
    }

    /// Producer: publishes the slot reserved by `reserve_write`.
    pub fn advance_write(&self) {
        let wp = self.wp.load(Ordering::Relaxed);
        self.wp.store(wp.wrapping_add(1), Ordering::Release);
    }

    /// Consumer: a reference to the oldest pending slot, or `RingEmpty`.
    ///
    /// The caller consumes the slot and then releases it with
    /// [`advance_read`](Ring::advance_read).
    pub fn reserve_read(&self) -> Result<&mut Frame> {
        let wp = self.wp.load(Ordering::Acquire);
        let rp = self.rp.load(Ordering::Relaxed);

        if rp == wp {
            return Err(Error::RingEmpty);
        }

        let idx = (rp & self.mask) as usize;
        unsafe { Ok(&mut *self.data[idx].get()) }
    }

    /// Consumer: releases the slot returned by `reserve_read`.
    pub fn advance_read(&self) {
        let rp = self.rp.load(Ordering::Relaxed);
        self.rp.store(rp.wrapping_add(1), Ordering::Release);
    }

    /// Resets both pointers. Only valid while no task is using the
    /// ring.
    pub fn reset(&mut self) {
        self.rp.store(0, Ordering::Relaxed);
        self.wp.store(0, Ordering::Relaxed);
    }
}

impl std::fmt::Debug for Ring {
    fn fmt(&self, fmt: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        fmt.debug_struct("Ring")
            .field("capacity", &self.data.len())
            .field("rp", &self.rp.load(Ordering::Relaxed))
            .field("wp", &self.wp.load(Ordering::Relaxed))
            .finish()
    }
}
