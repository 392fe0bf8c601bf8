//! An instant-messaging fan-out gateway.
//!
//! The gateway owns very many long-lived client sockets (TCP and
//! WebSocket), dispatches authenticated clients into logical rooms and
//! delivers three classes of server-originated traffic: targeted push
//! by session key, room broadcast and global broadcast, each filtered
//! by per-connection subscriptions.
//!
//! The engine is built from small parts, leaves first:
//!
//! - [`frame`]: the 16-byte-header binary protocol.
//! - [`codec`]: buffered frame transport over any byte stream.
//! - [`ring`]: the per-connection SPSC request queue.
//! - [`timer`]: heap timer for handshake/heartbeat deadlines.
//! - [`pool`] / [`round`]: striped buffer slabs and timers.
//! - [`proto`]: channels, rooms, buckets, the server and the
//!   per-connection reader/dispatcher pipeline.
//! - [`logic`] / [`rpc`] / [`registry`]: the seams to the session
//!   tier, the pusher and the service registry.
//!
//! A connection costs exactly two tasks and two pooled buffers;
//! overload drops pushes per connection instead of spreading, and a
//! misbehaving socket only ever takes itself down.

pub mod codec;
pub mod config;
pub mod error;
pub mod frame;
pub mod logic;
pub mod pool;
pub mod proto;
pub mod registry;
pub mod ring;
pub mod round;
pub mod rpc;
pub mod timer;
pub mod whitelist;

pub use crate::config::Config;
pub use crate::error::{Error, Result};
pub use crate::frame::Frame;
pub use crate::proto::{Bucket, Channel, Room, Server};
