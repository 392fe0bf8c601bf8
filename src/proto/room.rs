//! A room: the set of channels that receive a room broadcast.
//!
//! Membership lives in a slab arena with intrusive prev/next indices
//! and a head index, so joining allocates at most an arena slot and
//! leaving is O(1). Each channel remembers its own slot; a tagged
//! `NO_SLOT` value stands in for the null sentinel.

use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::{Arc, RwLock};

use slab::Slab;

use crate::error::{Error, Result};
use crate::frame::Frame;
use crate::proto::channel::Channel;

pub(crate) const NO_SLOT: usize = usize::MAX;

#[derive(Debug)]
pub struct Room {
    pub id: String,

    inner: RwLock<List>,

    // Cluster-wide online count, written only by the online-accounting
    // loop; readers tolerate staleness.
    all_online: AtomicI32,
}

#[derive(Debug)]
struct List {
    members: Slab<Member>,
    head: usize,
    online: i32,
    drop: bool,
}

#[derive(Debug)]
struct Member {
    ch: Arc<Channel>,
    prev: usize,
    next: usize,
}

// ===== impl Room =====

impl Room {
    pub fn new(id: &str) -> Room {
        Room {
            id: id.to_owned(),
            inner: RwLock::new(List {
                members: Slab::new(),
                head: NO_SLOT,
                online: 0,
                drop: false,
            }),
            all_online: AtomicI32::new(0),
        }
    }

    /// Inserts the channel at the head of the member list.
    ///
    /// Fails with `RoomDropped` once the room has emptied; the caller
    /// must fetch or create a fresh room from its bucket.
    pub fn put(&self, ch: &Arc<Channel>) -> Result<()> {
        let mut list = self.inner.write().unwrap();

        if list.drop {
            return Err(Error::RoomDropped);
        }

        let head = list.head;
        let slot = list.members.insert(Member {
            ch: ch.clone(),
            prev: NO_SLOT,
            next: head,
        });
        if head != NO_SLOT {
            list.members[head].prev = slot;
        }
        list.head = slot;
        list.online += 1;

        ch.set_room_slot(slot);
        Ok(())
    }

    /// Unlinks the channel. Returns true when the room emptied and
    /// should be removed from its bucket.
    pub fn del(&self, ch: &Arc<Channel>) -> bool {
        let mut list = self.inner.write().unwrap();

        let slot = ch.room_slot();
        let is_member = matches!(
            list.members.get(slot),
            Some(m) if Arc::ptr_eq(&m.ch, ch)
        );
        if !is_member {
            // Stale slot: the channel moved on, e.g. a room change in
            // flight.
            return list.drop;
        }

        let member = list.members.remove(slot);
        ch.set_room_slot(NO_SLOT);

        if member.next != NO_SLOT {
            list.members[member.next].prev = member.prev;
        }
        if member.prev != NO_SLOT {
            list.members[member.prev].next = member.next;
        } else {
            list.head = member.next;
        }

        list.online -= 1;
        list.drop = list.online == 0;
        list.drop
    }

    /// Fans a frame out to every member. Drops on full mailboxes are
    /// silent; overload must not stall the broadcast path.
    pub fn push(&self, frame: &Frame) {
        let list = self.inner.read().unwrap();

        let mut slot = list.head;
        while slot != NO_SLOT {
            let member = &list.members[slot];
            let _ = member.ch.push(frame.clone());
            slot = member.next;
        }
    }

    /// Sends the finish sentinel to every member.
    pub async fn close(&self) {
        let members: Vec<Arc<Channel>> = {
            let list = self.inner.read().unwrap();
            let mut out = Vec::with_capacity(list.online.max(0) as usize);
            let mut slot = list.head;
            while slot != NO_SLOT {
                let member = &list.members[slot];
                out.push(member.ch.clone());
                slot = member.next;
            }
            out
        };

        for ch in members {
            ch.close().await;
        }
    }

    /// Live members of this room on this gateway.
    pub fn online(&self) -> i32 {
        self.inner.read().unwrap().online
    }

    /// The count reported to clients: the cluster-wide number when the
    /// online loop has published one, the local number otherwise.
    pub fn online_num(&self) -> i32 {
        let all = self.all_online.load(Ordering::Relaxed);
        if all > 0 {
            all
        } else {
            self.online()
        }
    }

    pub fn set_all_online(&self, online: i32) {
        self.all_online.store(online, Ordering::Relaxed);
    }

    pub fn is_dropped(&self) -> bool {
        self.inner.read().unwrap().drop
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::frame::{Frame, OP_SEND_MSG};
    use crate::proto::channel::Signal;
    use bytes::Bytes;

    fn member() -> Arc<Channel> {
        Arc::new(Channel::new(1, 16))
    }

    #[tokio::test]
    async fn put_del_counts_online() {
        let room = Room::new("live://1");
        let (a, b, c) = (member(), member(), member());

        room.put(&a).unwrap();
        room.put(&b).unwrap();
        room.put(&c).unwrap();
        assert_eq!(room.online(), 3);

        assert!(!room.del(&b));
        assert!(!room.del(&a));
        assert_eq!(room.online(), 1);

        // Last one out drops the room.
        assert!(room.del(&c));
        assert!(room.is_dropped());
        assert_eq!(room.online(), 0);
    }

    #[tokio::test]
    async fn dropped_room_rejects_put() {
        let room = Room::new("live://1");
        let a = member();

        room.put(&a).unwrap();
        assert!(room.del(&a));

        match room.put(&member()) {
            Err(Error::RoomDropped) => {}
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[tokio::test]
    async fn del_ignores_non_member() {
        let room = Room::new("live://1");
        let (a, b) = (member(), member());

        room.put(&a).unwrap();
        // b never joined; del must not disturb the list.
        assert!(!room.del(&b));
        assert_eq!(room.online(), 1);
    }

    #[tokio::test]
    async fn push_reaches_every_member() {
        let room = Room::new("live://1");
        let members: Vec<_> = (0..3).map(|_| member()).collect();
        let mut receivers: Vec<_> = members
            .iter()
            .map(|ch| ch.take_signal_rx().unwrap())
            .collect();

        for ch in &members {
            room.put(ch).unwrap();
        }

        room.push(&Frame::new(OP_SEND_MSG, Bytes::from_static(b"hi")));

        for rx in &mut receivers {
            match rx.recv().await {
                Some(Signal::Frame(f)) => assert_eq!(&f.body[..], b"hi"),
                other => panic!("unexpected signal: {:?}", other),
            }
        }
    }

    #[tokio::test]
    async fn online_num_prefers_aggregate() {
        let room = Room::new("live://1");
        let a = member();
        room.put(&a).unwrap();

        assert_eq!(room.online_num(), 1);
        room.set_all_online(70);
        assert_eq!(room.online_num(), 70);
        room.set_all_online(0);
        assert_eq!(room.online_num(), 1);
    }
}
