use std::collections::HashMap;
use std::hash::Hasher;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use fnv::FnvHasher;
use rand::Rng;
use tokio_util::sync::CancellationToken;

use log::{debug, error, info};

use crate::config::Config;
use crate::error::Result;
use crate::frame::{
    Frame, OP_CHANGE_ROOM, OP_CHANGE_ROOM_REPLY, OP_SUB, OP_SUB_REPLY, OP_UNSUB, OP_UNSUB_REPLY,
};
use crate::logic::{ConnectReply, Logic};
use crate::proto::bucket::Bucket;
use crate::proto::channel::Channel;
use crate::round::Round;
use crate::whitelist::Whitelist;

// The user heartbeat timer is the liveness ground truth; reporting to
// the logic tier only needs to happen once in a long while, jittered so
// a reconnect storm cannot align the reports.
pub(crate) const MIN_SERVER_HEARTBEAT: Duration = Duration::from_secs(10 * 60);
pub(crate) const MAX_SERVER_HEARTBEAT: Duration = Duration::from_secs(30 * 60);

const ONLINE_INTERVAL: Duration = Duration::from_secs(10);
const ONLINE_RETRY: Duration = Duration::from_secs(1);

/// The gateway: a bucket array addressed by a stable hash of the
/// session key, plus the striped resource pools shared by all
/// connections.
pub struct Server {
    config: Config,
    round: Round,
    buckets: Vec<Arc<Bucket>>,
    bucket_idx: u32,
    server_id: String,
    logic: Arc<dyn Logic>,
    whitelist: Arc<Whitelist>,
    conn_seq: AtomicUsize,
    shutdown: CancellationToken,
}

// ===== impl Server =====

impl Server {
    /// Builds the server and starts the online-accounting loop. Must
    /// be called inside a tokio runtime.
    pub fn new(config: Config, logic: Arc<dyn Logic>) -> Result<Arc<Server>> {
        let whitelist = Arc::new(match config.whitelist {
            Some(ref wl) => Whitelist::open(wl)?,
            None => Whitelist::disabled(),
        });

        let size = config.bucket.size.max(1);
        let buckets = (0..size)
            .map(|_| Arc::new(Bucket::new(&config.bucket)))
            .collect::<Vec<_>>();

        let server_id = if config.env.host.is_empty() {
            hostname::get()
                .map(|h| h.to_string_lossy().into_owned())
                .unwrap_or_else(|_| "courier".to_owned())
        } else {
            config.env.host.clone()
        };

        info!(
            "server init; id={} buckets={} cli_proto={} svr_proto={}",
            server_id, size, config.protocol.cli_proto, config.protocol.svr_proto
        );

        let server = Arc::new(Server {
            round: Round::new(&config),
            config,
            buckets,
            bucket_idx: size as u32,
            server_id,
            logic,
            whitelist,
            conn_seq: AtomicUsize::new(0),
            shutdown: CancellationToken::new(),
        });

        tokio::spawn(online_proc(server.clone()));
        Ok(server)
    }

    /// The bucket holding `key`. Deterministic: depends only on the
    /// key bytes and the bucket count.
    pub fn bucket(&self, key: &str) -> Arc<Bucket> {
        let idx = hash32(key) % self.bucket_idx;
        if self.config.debug {
            debug!("hit channel bucket; key={} index={}", key, idx);
        }
        self.buckets[idx as usize].clone()
    }

    pub fn buckets(&self) -> &[Arc<Bucket>] {
        &self.buckets
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub(crate) fn round(&self) -> &Round {
        &self.round
    }

    pub fn server_id(&self) -> &str {
        &self.server_id
    }

    pub fn whitelist(&self) -> &Whitelist {
        &self.whitelist
    }

    pub fn shutdown_token(&self) -> &CancellationToken {
        &self.shutdown
    }

    /// Round-robin index used to stripe a new connection over the
    /// pools.
    pub(crate) fn next_rn(&self) -> usize {
        self.conn_seq.fetch_add(1, Ordering::Relaxed)
    }

    pub(crate) fn rand_server_heartbeat(&self) -> Duration {
        let span = (MAX_SERVER_HEARTBEAT - MIN_SERVER_HEARTBEAT).as_secs();
        MIN_SERVER_HEARTBEAT + Duration::from_secs(rand::thread_rng().gen_range(0..span))
    }

    /// Closes every connection and stops the background loops.
    pub async fn close(&self) {
        self.shutdown.cancel();
        for bucket in &self.buckets {
            bucket.close().await;
        }
    }

    // Upstream calls, each stamped with this instance's id and bounded
    // by the configured per-call deadline.

    pub async fn connect(&self, token: &[u8], cookie: &str) -> Result<ConnectReply> {
        self.with_deadline(self.logic.connect(&self.server_id, cookie, token))
            .await
    }

    pub async fn disconnect(&self, mid: i64, key: &str) -> Result<()> {
        self.with_deadline(self.logic.disconnect(&self.server_id, mid, key))
            .await
    }

    pub async fn heartbeat(&self, mid: i64, key: &str) -> Result<()> {
        self.with_deadline(self.logic.heartbeat(&self.server_id, mid, key))
            .await
    }

    pub async fn renew_online(
        &self,
        room_count: HashMap<String, i32>,
    ) -> Result<HashMap<String, i32>> {
        self.with_deadline(self.logic.renew_online(&self.server_id, room_count))
            .await
    }

    pub async fn receive(&self, mid: i64, frame: &Frame) -> Result<()> {
        self.with_deadline(self.logic.receive(mid, frame)).await
    }

    async fn with_deadline<T>(
        &self,
        call: impl std::future::Future<Output = Result<T>>,
    ) -> Result<T> {
        match tokio::time::timeout(self.config.rpc_client.timeout(), call).await {
            Ok(result) => result,
            Err(_) => Err(crate::error::Error::Logic("deadline exceeded".to_owned())),
        }
    }

    /// Handles one client request frame in place: room changes and
    /// subscription updates are served locally, everything else goes
    /// upstream. The frame is rewritten into its reply.
    pub async fn operate(&self, frame: &mut Frame, ch: &Arc<Channel>, bucket: &Arc<Bucket>) {
        match frame.op {
            OP_CHANGE_ROOM => {
                let room_id = String::from_utf8_lossy(&frame.body).into_owned();
                if let Err(e) = bucket.change_room(&room_id, ch) {
                    error!(
                        "change room failed; key={} room={} error={}",
                        ch.key, room_id, e
                    );
                }
                frame.op = OP_CHANGE_ROOM_REPLY;
            }
            OP_SUB => {
                if let Some(ops) = split_i32s(&frame.body) {
                    ch.watch(&ops);
                }
                frame.op = OP_SUB_REPLY;
            }
            OP_UNSUB => {
                if let Some(ops) = split_i32s(&frame.body) {
                    ch.unwatch(&ops);
                }
                frame.op = OP_UNSUB_REPLY;
            }
            _ => {
                if let Err(e) = self.receive(ch.mid, frame).await {
                    error!(
                        "report operation failed; mid={} op={} error={}",
                        ch.mid, frame.op, e
                    );
                }
                frame.clear_body();
            }
        }
    }

    // Downstream command surface, called by the push RPC listener.

    /// Targeted push: deliver `frame` to each named session that is
    /// subscribed to `op`.
    pub fn push_keys(&self, op: i32, keys: &[String], frame: &Frame) {
        for key in keys {
            let bucket = self.bucket(key);
            if let Some(ch) = bucket.channel(key) {
                if ch.need_push(op) {
                    if let Err(e) = ch.push(frame.clone()) {
                        debug!("push dropped; key={} error={}", key, e);
                    }
                }
            }
        }
    }

    /// Room broadcast: every bucket holds its shard of the room's
    /// members.
    pub async fn broadcast_room(&self, room_id: &str, frame: &Frame) {
        for bucket in &self.buckets {
            bucket
                .broadcast_room(room_id.to_owned(), frame.clone())
                .await;
        }
    }

    /// Global broadcast, spread over time when `speed` is positive so
    /// one command cannot flood every socket at once.
    pub async fn broadcast(&self, op: i32, frame: &Frame, speed: i32) {
        for bucket in &self.buckets {
            bucket.broadcast(frame, op);
            if speed > 0 {
                let pace = bucket.channel_count() as u64 / speed as u64;
                if pace > 0 {
                    tokio::time::sleep(Duration::from_secs(pace)).await;
                }
            }
        }
    }
}

impl std::fmt::Debug for Server {
    fn fmt(&self, fmt: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        fmt.debug_struct("Server")
            .field("id", &self.server_id)
            .field("buckets", &self.bucket_idx)
            .finish()
    }
}

/// Stable 32-bit hash of a session key.
fn hash32(key: &str) -> u32 {
    let mut hasher = FnvHasher::default();
    hasher.write(key.as_bytes());
    hasher.finish() as u32
}

/// Parses a comma-separated op list, e.g. a Sub request body. Returns
/// `None` when any element is malformed.
fn split_i32s(body: &[u8]) -> Option<Vec<i32>> {
    let raw = std::str::from_utf8(body).ok()?;
    if raw.is_empty() {
        return Some(Vec::new());
    }

    raw.split(',')
        .map(|part| part.trim().parse::<i32>().ok())
        .collect()
}

// Aggregates per-room online counts, reports them upstream and writes
// the cluster-wide merge back. Failures retry on a short fuse; the loop
// itself never gives up.
async fn online_proc(server: Arc<Server>) {
    loop {
        let mut room_count: HashMap<String, i32> = HashMap::new();
        for bucket in server.buckets() {
            for (room_id, count) in bucket.rooms_count() {
                *room_count.entry(room_id).or_insert(0) += count;
            }
        }

        let wait = match server.renew_online(room_count).await {
            Ok(all_rooms) => {
                for bucket in server.buckets() {
                    bucket.up_rooms_count(&all_rooms);
                }
                ONLINE_INTERVAL
            }
            Err(e) => {
                error!("renew online failed; error={}", e);
                ONLINE_RETRY
            }
        };

        tokio::select! {
            _ = tokio::time::sleep(wait) => {}
            _ = server.shutdown.cancelled() => return,
        }
    }
}
