//! Round-robin allocation of read/write buffer pools and timers.
//!
//! Sibling reader and writer tasks of consecutive connections are
//! striped across disjoint pools so they contend on different locks.

use crate::config::Config;
use crate::pool::Pool;
use crate::timer::Timer;

#[derive(Debug)]
pub struct Round {
    readers: Vec<Pool>,
    writers: Vec<Pool>,
    timers: Vec<Timer>,
}

// ===== impl Round =====

impl Round {
    /// Builds the striped pools. Must be called inside a tokio runtime
    /// (each timer starts its run task).
    pub fn new(config: &Config) -> Round {
        let tcp = &config.tcp;
        let protocol = &config.protocol;

        Round {
            readers: (0..tcp.reader.max(1))
                .map(|_| Pool::new(tcp.read_buf, tcp.read_buf_size))
                .collect(),
            writers: (0..tcp.writer.max(1))
                .map(|_| Pool::new(tcp.write_buf, tcp.write_buf_size))
                .collect(),
            timers: (0..protocol.timer.max(1))
                .map(|_| Timer::new(protocol.timer_size))
                .collect(),
        }
    }

    pub fn reader(&self, rn: usize) -> &Pool {
        &self.readers[rn % self.readers.len()]
    }

    pub fn writer(&self, rn: usize) -> &Pool {
        &self.writers[rn % self.writers.len()]
    }

    pub fn timer(&self, rn: usize) -> &Timer {
        &self.timers[rn % self.timers.len()]
    }
}
