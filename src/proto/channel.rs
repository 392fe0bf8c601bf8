use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};

use fnv::FnvHashSet;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};
use crate::frame::Frame;
use crate::proto::room::{Room, NO_SLOT};
use crate::ring::Ring;

/// One item in the signal mailbox.
///
/// `Ready` wakes the dispatcher to drain the request ring, `Finish`
/// tells it to exit, and `Frame` is a server-originated push. These are
/// distinct variants on purpose; sentinels never appear on the wire.
#[derive(Debug)]
pub enum Signal {
    Ready,
    Finish,
    Frame(Frame),
}

/// Gateway-side state of one client connection.
///
/// A channel is owned jointly by its reader task and its dispatcher
/// task. The reader fills the ring and mutates the watched-ops set; the
/// dispatcher drains the mailbox and the ring. Everyone else only
/// pushes frames.
#[derive(Debug)]
pub struct Channel {
    /// Authenticated user id; 0 is anonymous.
    pub mid: i64,

    /// Session key, unique within a bucket.
    pub key: String,

    /// Client address for per-IP accounting.
    pub ip: String,

    /// Client-originated frames pending dispatch.
    pub ring: Ring,

    room: RwLock<Weak<Room>>,
    room_slot: AtomicUsize,

    watch_ops: RwLock<FnvHashSet<i32>>,

    signal_tx: mpsc::Sender<Signal>,
    signal_rx: Mutex<Option<mpsc::Receiver<Signal>>>,

    // Cancelled to force the connection down: heartbeat expiry,
    // stale-session eviction, dispatcher exit.
    token: CancellationToken,

    dropped: AtomicU64,
}

// ===== impl Channel =====

impl Channel {
    /// Creates a channel with a ring of `cli_proto` slots and a signal
    /// mailbox of `svr_proto` entries. Identity fields are filled in
    /// by the handshake before the channel is shared.
    pub fn new(cli_proto: usize, svr_proto: usize) -> Channel {
        let (signal_tx, signal_rx) = mpsc::channel(svr_proto.max(1));

        Channel {
            mid: 0,
            key: String::new(),
            ip: String::new(),
            ring: Ring::new(cli_proto),
            room: RwLock::new(Weak::new()),
            room_slot: AtomicUsize::new(NO_SLOT),
            watch_ops: RwLock::new(FnvHashSet::default()),
            signal_tx,
            signal_rx: Mutex::new(Some(signal_rx)),
            token: CancellationToken::new(),
            dropped: AtomicU64::new(0),
        }
    }

    /// Subscribes the connection to the given op codes.
    pub fn watch(&self, ops: &[i32]) {
        let mut watch_ops = self.watch_ops.write().unwrap();
        for &op in ops {
            watch_ops.insert(op);
        }
    }

    pub fn unwatch(&self, ops: &[i32]) {
        let mut watch_ops = self.watch_ops.write().unwrap();
        for &op in ops {
            watch_ops.remove(&op);
        }
    }

    /// The broadcast filter: whether a frame with `op` should be
    /// delivered here.
    pub fn need_push(&self, op: i32) -> bool {
        self.watch_ops.read().unwrap().contains(&op)
    }

    /// Queues a server-originated frame without blocking. On a full
    /// mailbox the frame is dropped; that is the overload policy.
    pub fn push(&self, frame: Frame) -> Result<()> {
        match self.signal_tx.try_send(Signal::Frame(frame)) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(_)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                Err(Error::SignalFullMsgDropped)
            }
            Err(mpsc::error::TrySendError::Closed(_)) => Err(Error::SignalClosed),
        }
    }

    /// Reader side: wakes the dispatcher after committing a ring slot.
    /// Waits when the mailbox is full, which is the backpressure the
    /// ring relies on.
    pub async fn signal(&self) -> Result<()> {
        self.signal_tx
            .send(Signal::Ready)
            .await
            .map_err(|_| Error::SignalClosed)
    }

    /// Sends the finish sentinel and forces the socket down. Safe to
    /// call more than once.
    pub async fn close(&self) {
        let _ = self.signal_tx.send(Signal::Finish).await;
        self.token.cancel();
    }

    /// Dispatcher side: claims the mailbox receiver. Returns `None` on
    /// the second call.
    pub fn take_signal_rx(&self) -> Option<mpsc::Receiver<Signal>> {
        self.signal_rx.lock().unwrap().take()
    }

    pub fn close_token(&self) -> &CancellationToken {
        &self.token
    }

    /// Frames dropped on mailbox overflow since the connection opened.
    pub fn dropped_count(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    // Room backlink, kept weak so a dropped room cannot be kept alive
    // by its members.

    pub fn room(&self) -> Option<Arc<Room>> {
        self.room.read().unwrap().upgrade()
    }

    pub(crate) fn set_room(&self, room: &Arc<Room>) {
        *self.room.write().unwrap() = Arc::downgrade(room);
    }

    pub(crate) fn clear_room(&self) {
        *self.room.write().unwrap() = Weak::new();
    }

    pub(crate) fn room_slot(&self) -> usize {
        self.room_slot.load(Ordering::Relaxed)
    }

    pub(crate) fn set_room_slot(&self, slot: usize) {
        self.room_slot.store(slot, Ordering::Relaxed);
    }
}
