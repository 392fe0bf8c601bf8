//! A bucket: one shard of the connection registry.
//!
//! Each bucket owns a key-to-channel map, the rooms those channels
//! occupy, per-IP connection counts and a fixed pool of room-broadcast
//! workers. Read-heavy accessors take the read lock; mutations take the
//! write lock; broadcast fan-out never allocates under the lock beyond
//! cloning frame handles.

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use fnv::FnvHashMap;
use futures::FutureExt;
use tokio::sync::mpsc;

use log::error;

use crate::config::BucketConfig;
use crate::error::Result;
use crate::frame::Frame;
use crate::proto::channel::Channel;
use crate::proto::room::Room;

pub struct Bucket {
    shared: Arc<Shared>,

    // Room-broadcast worker queues, selected round-robin.
    routines: Vec<mpsc::Sender<(String, Frame)>>,
    routine_counter: AtomicU64,
}

#[derive(Debug)]
struct Shared {
    inner: RwLock<Inner>,
}

#[derive(Debug)]
struct Inner {
    chs: FnvHashMap<String, Arc<Channel>>,
    rooms: FnvHashMap<String, Arc<Room>>,
    ip_cnts: FnvHashMap<String, i32>,
}

// ===== impl Bucket =====

impl Bucket {
    /// Creates the bucket and spawns its room-broadcast workers. Must
    /// be called inside a tokio runtime.
    pub fn new(config: &BucketConfig) -> Bucket {
        let shared = Arc::new(Shared {
            inner: RwLock::new(Inner {
                chs: FnvHashMap::with_capacity_and_hasher(config.channel, Default::default()),
                rooms: FnvHashMap::with_capacity_and_hasher(config.room, Default::default()),
                ip_cnts: FnvHashMap::default(),
            }),
        });

        let amount = config.routine_amount.max(1);
        let mut routines = Vec::with_capacity(amount);
        for _ in 0..amount {
            let (tx, rx) = mpsc::channel(config.routine_size.max(1));
            routines.push(tx);
            tokio::spawn(Shared::room_worker(shared.clone(), rx));
        }

        Bucket {
            shared,
            routines,
            routine_counter: AtomicU64::new(0),
        }
    }

    /// Registers a channel under its key, evicting any stale session
    /// that still holds the key, and joins `room_id` unless it is
    /// empty.
    pub async fn put(&self, room_id: &str, ch: Arc<Channel>) -> Result<()> {
        let (evicted, room) = {
            let mut inner = self.shared.inner.write().unwrap();

            let evicted = inner.chs.insert(ch.key.clone(), ch.clone());
            *inner.ip_cnts.entry(ch.ip.clone()).or_insert(0) += 1;

            let room = if room_id.is_empty() {
                None
            } else {
                let room = inner
                    .rooms
                    .entry(room_id.to_owned())
                    .or_insert_with(|| Arc::new(Room::new(room_id)))
                    .clone();
                ch.set_room(&room);
                Some(room)
            };

            (evicted, room)
        };

        if let Some(old) = evicted {
            if !Arc::ptr_eq(&old, &ch) {
                old.close().await;
            }
        }

        if let Some(room) = room {
            room.put(&ch)?;
        }
        Ok(())
    }

    /// Removes a channel. The mapping is only cleared when it still
    /// points at this very channel, so an evicted session tearing down
    /// late cannot remove its successor.
    pub fn del(&self, ch: &Arc<Channel>) {
        let room = ch.room();

        {
            let mut inner = self.shared.inner.write().unwrap();

            let mapped = inner.chs.get(&ch.key).map(|cur| Arc::ptr_eq(cur, ch));
            if let Some(same) = mapped {
                if same {
                    inner.chs.remove(&ch.key);
                }

                // The key was counted at put time, whether or not the
                // mapping has since been taken over by a reconnect.
                match inner.ip_cnts.get_mut(&ch.ip) {
                    Some(n) if *n > 1 => *n -= 1,
                    Some(_) => {
                        inner.ip_cnts.remove(&ch.ip);
                    }
                    None => {}
                }
            }
        }

        if let Some(room) = room {
            if room.del(ch) {
                self.del_room(&room);
            }
        }
    }

    fn del_room(&self, room: &Arc<Room>) {
        let mut inner = self.shared.inner.write().unwrap();

        let matches = inner
            .rooms
            .get(&room.id)
            .map_or(false, |cur| Arc::ptr_eq(cur, room));
        if matches {
            inner.rooms.remove(&room.id);
        }
    }

    /// Moves a channel between rooms; an empty `new_room_id` just
    /// leaves the current room.
    pub fn change_room(&self, new_room_id: &str, ch: &Arc<Channel>) -> Result<()> {
        let old = ch.room();

        if new_room_id.is_empty() {
            if let Some(old) = old {
                if old.del(ch) {
                    self.del_room(&old);
                }
            }
            ch.clear_room();
            return Ok(());
        }

        let new_room = {
            let mut inner = self.shared.inner.write().unwrap();
            inner
                .rooms
                .entry(new_room_id.to_owned())
                .or_insert_with(|| Arc::new(Room::new(new_room_id)))
                .clone()
        };

        if let Some(old) = old {
            if old.del(ch) {
                self.del_room(&old);
            }
        }

        new_room.put(ch)?;
        ch.set_room(&new_room);
        Ok(())
    }

    pub fn channel(&self, key: &str) -> Option<Arc<Channel>> {
        self.shared.inner.read().unwrap().chs.get(key).cloned()
    }

    pub fn room(&self, room_id: &str) -> Option<Arc<Room>> {
        self.shared.room(room_id)
    }

    /// Pushes `frame` to every channel subscribed to `op`. This is the
    /// global-broadcast hot path; it holds the read lock for the whole
    /// iteration.
    pub fn broadcast(&self, frame: &Frame, op: i32) {
        let inner = self.shared.inner.read().unwrap();

        for ch in inner.chs.values() {
            if ch.need_push(op) {
                let _ = ch.push(frame.clone());
            }
        }
    }

    /// Hands a room broadcast to the next worker queue. Waits when the
    /// queue is full; queue capacity is the fan-out backpressure.
    pub async fn broadcast_room(&self, room_id: String, frame: Frame) {
        let idx = self.routine_counter.fetch_add(1, Ordering::Relaxed) as usize;
        let tx = &self.routines[idx % self.routines.len()];

        if tx.send((room_id, frame)).await.is_err() {
            error!("room broadcast worker gone; bucket queue closed");
        }
    }

    /// Snapshot of room occupancy: room id to local online count, for
    /// rooms that have members.
    pub fn rooms_count(&self) -> HashMap<String, i32> {
        let inner = self.shared.inner.read().unwrap();

        inner
            .rooms
            .iter()
            .filter_map(|(id, room)| {
                let online = room.online();
                (online > 0).then(|| (id.clone(), online))
            })
            .collect()
    }

    /// Writes the cluster-wide online counts back into the rooms.
    pub fn up_rooms_count(&self, counts: &HashMap<String, i32>) {
        let inner = self.shared.inner.read().unwrap();

        for (id, room) in inner.rooms.iter() {
            room.set_all_online(counts.get(id).copied().unwrap_or(0));
        }
    }

    pub fn channel_count(&self) -> usize {
        self.shared.inner.read().unwrap().chs.len()
    }

    pub fn rooms_len(&self) -> usize {
        self.shared.inner.read().unwrap().rooms.len()
    }

    /// Distinct client addresses connected through this bucket.
    pub fn ip_count(&self) -> usize {
        self.shared.inner.read().unwrap().ip_cnts.len()
    }

    pub fn ips(&self) -> Vec<String> {
        let inner = self.shared.inner.read().unwrap();
        inner.ip_cnts.keys().cloned().collect()
    }

    /// Sends the finish sentinel to every channel in the bucket.
    pub async fn close(&self) {
        let channels: Vec<Arc<Channel>> = {
            let inner = self.shared.inner.read().unwrap();
            inner.chs.values().cloned().collect()
        };

        for ch in channels {
            ch.close().await;
        }
    }
}

impl std::fmt::Debug for Bucket {
    fn fmt(&self, fmt: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        fmt.debug_struct("Bucket")
            .field("channels", &self.channel_count())
            .field("rooms", &self.rooms_len())
            .field("routines", &self.routines.len())
            .finish()
    }
}

// ===== impl Shared =====

impl Shared {
    fn room(&self, room_id: &str) -> Option<Arc<Room>> {
        self.inner.read().unwrap().rooms.get(room_id).cloned()
    }

    // One room-broadcast worker: drains its queue and fans each frame
    // out to the room members. A panic restarts the drain loop rather
    // than wedging the queue.
    async fn room_worker(shared: Arc<Shared>, mut rx: mpsc::Receiver<(String, Frame)>) {
        loop {
            let drained = AssertUnwindSafe(async {
                while let Some((room_id, frame)) = rx.recv().await {
                    if let Some(room) = shared.room(&room_id) {
                        room.push(&frame);
                    }
                }
            })
            .catch_unwind()
            .await;

            match drained {
                Ok(()) => return,
                Err(_) => error!("room broadcast worker crashed, restarting"),
            }
        }
    }
}
