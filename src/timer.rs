//! Binary-heap timer for handshake and heartbeat deadlines.
//!
//! Entries live in a slab arena and the heap orders slab keys by
//! absolute expiry, so `add`/`del`/`set` are O(log n) with no per-entry
//! allocation beyond the arena slot. A background task sleeps until the
//! heap root's deadline and runs expired callbacks outside the lock;
//! any mutation that may move the root nudges it awake.
//!
//! Firing removes an entry from the heap but keeps its arena slot, so
//! the owner can still re-arm the same handle with [`Timer::set`]; the
//! slot is released by [`Timer::del`], which is idempotent.

use std::sync::{Arc, Mutex};

use slab::Slab;
use tokio::sync::Notify;
use tokio::time::{sleep_until, Duration, Instant};

use log::debug;

const NOT_QUEUED: usize = usize::MAX;

type Callback = Arc<dyn Fn() + Send + Sync>;

/// A handle to one scheduled entry.
///
/// Handles are generation-tagged: operations on a handle whose entry
/// has already been deleted are no-ops, even if the arena slot was
/// reused.
#[derive(Debug, Clone, Copy)]
pub struct TimerHandle {
    slot: usize,
    generation: u64,
}

pub struct Timer {
    inner: Arc<Inner>,
}

struct Inner {
    state: Mutex<State>,
    notify: Notify,
}

struct State {
    entries: Slab<Entry>,
    // Heap of arena keys ordered by `Entry::expire`.
    heap: Vec<usize>,
    next_gen: u64,
    shutdown: bool,
}

struct Entry {
    expire: Instant,
    callback: Callback,
    // Diagnostic label, set to the session key once known.
    key: String,
    // Position in `heap`, or NOT_QUEUED once popped or fired.
    index: usize,
    generation: u64,
}

// ===== impl Timer =====

impl Timer {
    /// Creates a timer sized for roughly `num` concurrent entries and
    /// starts its run task. Must be called inside a tokio runtime.
    pub fn new(num: usize) -> Timer {
        let inner = Arc::new(Inner {
            state: Mutex::new(State {
                entries: Slab::with_capacity(num),
                heap: Vec::with_capacity(num),
                next_gen: 0,
                shutdown: false,
            }),
            notify: Notify::new(),
        });

        tokio::spawn(Inner::run(inner.clone()));

        Timer { inner }
    }

    /// Schedules `callback` to run after `delay`.
    pub fn add<F>(&self, delay: Duration, callback: F) -> TimerHandle
    where
        F: Fn() + Send + Sync + 'static,
    {
        let handle = {
            let mut state = self.inner.state.lock().unwrap();

            let generation = state.next_gen;
            state.next_gen += 1;

            let slot = state.entries.insert(Entry {
                expire: Instant::now() + delay,
                callback: Arc::new(callback),
                key: String::new(),
                index: NOT_QUEUED,
                generation,
            });
            state.push_heap(slot);

            TimerHandle { slot, generation }
        };

        self.inner.notify.notify_one();
        handle
    }

    /// Removes an entry. Unknown or already-deleted handles are
    /// ignored.
    pub fn del(&self, handle: TimerHandle) {
        let mut state = self.inner.state.lock().unwrap();

        if !state.owns(handle) {
            debug!("timer del: stale handle slot={}", handle.slot);
            return;
        }

        state.remove_heap(handle.slot);
        state.entries.remove(handle.slot);
    }

    /// Reschedules an entry to fire after `delay`, re-arming it if it
    /// has already fired. Stale handles are ignored.
    pub fn set(&self, handle: TimerHandle, delay: Duration) {
        {
            let mut state = self.inner.state.lock().unwrap();

            if !state.owns(handle) {
                debug!("timer set: stale handle slot={}", handle.slot);
                return;
            }

            state.remove_heap(handle.slot);
            state.entries[handle.slot].expire = Instant::now() + delay;
            state.push_heap(handle.slot);
        }

        self.inner.notify.notify_one();
    }

    /// Attaches a diagnostic label to an entry.
    pub fn set_key(&self, handle: TimerHandle, key: &str) {
        let mut state = self.inner.state.lock().unwrap();

        if state.owns(handle) {
            state.entries[handle.slot].key = key.to_owned();
        }
    }

    /// Number of live entries, fired but undeleted ones included.
    pub fn len(&self) -> usize {
        self.inner.state.lock().unwrap().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Drop for Timer {
    fn drop(&mut self) {
        self.inner.state.lock().unwrap().shutdown = true;
        self.inner.notify.notify_one();
    }
}

impl std::fmt::Debug for Timer {
    fn fmt(&self, fmt: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        fmt.debug_struct("Timer").field("len", &self.len()).finish()
    }
}

// ===== impl Inner =====

impl Inner {
    async fn run(inner: Arc<Inner>) {
        loop {
            let deadline = {
                let state = inner.state.lock().unwrap();
                if state.shutdown {
                    return;
                }
                state.peek_expire()
            };

            match deadline {
                Some(at) => {
                    tokio::select! {
                        _ = sleep_until(at) => inner.fire(),
                        _ = inner.notify.notified() => {}
                    }
                }
                None => inner.notify.notified().await,
            }
        }
    }

    // Pops and runs every expired entry. Callbacks run outside the
    // lock.
    fn fire(&self) {
        loop {
            let callback = {
                let mut state = self.state.lock().unwrap();

                let slot = match state.heap.first() {
                    Some(&slot) if state.entries[slot].expire <= Instant::now() => slot,
                    _ => break,
                };

                state.remove_heap(slot);

                let entry = &state.entries[slot];
                if !entry.key.is_empty() {
                    debug!("timer expired; key={}", entry.key);
                }
                entry.callback.clone()
            };

            callback();
        }
    }
}

// ===== impl State =====

impl State {
    fn owns(&self, handle: TimerHandle) -> bool {
        self.entries
            .get(handle.slot)
            .map_or(false, |e| e.generation == handle.generation)
    }

    fn peek_expire(&self) -> Option<Instant> {
        self.heap.first().map(|&slot| self.entries[slot].expire)
    }

    fn less(&self, i: usize, j: usize) -> bool {
        self.entries[self.heap[i]].expire < self.entries[self.heap[j]].expire
    }

    fn swap_at(&mut self, i: usize, j: usize) {
        self.heap.swap(i, j);
        let (a, b) = (self.heap[i], self.heap[j]);
        self.entries[a].index = i;
        self.entries[b].index = j;
    }

    fn up(&mut self, mut j: usize) {
        while j > 0 {
            let i = (j - 1) / 2;
            if !self.less(j, i) {
                break;
            }
            self.swap_at(i, j);
            j = i;
        }
    }

    fn down(&mut self, mut i: usize) {
        let n = self.heap.len();
        loop {
            let left = 2 * i + 1;
            if left >= n {
                break;
            }

            let mut j = left;
            let right = left + 1;
            if right < n && self.less(right, left) {
                j = right;
            }

            if !self.less(j, i) {
                break;
            }
            self.swap_at(i, j);
            i = j;
        }
    }

    fn push_heap(&mut self, slot: usize) {
        let index = self.heap.len();
        self.entries[slot].index = index;
        self.heap.push(slot);
        self.up(index);
    }

    fn remove_heap(&mut self, slot: usize) {
        let index = self.entries[slot].index;
        if index == NOT_QUEUED {
            return;
        }

        let last = self.heap.len() - 1;
        if index != last {
            self.swap_at(index, last);
        }
        self.heap.pop();
        self.entries[slot].index = NOT_QUEUED;

        if index < self.heap.len() {
            self.down(index);
            self.up(index);
        }
    }
}
