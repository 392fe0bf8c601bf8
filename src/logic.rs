//! The upstream session/state interface.
//!
//! The gateway consumes the logic tier through this trait only:
//! `connect` at handshake, `disconnect` at teardown, `heartbeat` on a
//! throttled schedule, `renew_online` from the accounting loop and
//! `receive` for client messages the gateway does not handle itself.
//!
//! [`LocalLogic`] is the stand-alone mode: authentication happens
//! directly from the token JSON and everything else is a no-op, so a
//! gateway keeps serving when no logic tier is reachable.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};

use log::debug;

use crate::error::{Error, Result};
use crate::frame::Frame;

/// Reply to a successful `connect`.
#[derive(Debug, Clone)]
pub struct ConnectReply {
    pub mid: i64,
    pub key: String,
    pub room_id: String,
    pub accepts: Vec<i32>,
    pub heartbeat: Duration,
}

/// The auth token a client sends in the body of its Auth frame.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthToken {
    #[serde(default)]
    pub mid: i64,
    #[serde(default)]
    pub key: String,
    #[serde(default)]
    pub room_id: String,
    #[serde(default)]
    pub platform: String,
    #[serde(default)]
    pub accepts: Vec<i32>,
}

#[async_trait]
pub trait Logic: Send + Sync {
    /// Authenticates a client; the reply carries its identity, initial
    /// room and heartbeat interval.
    async fn connect(&self, server: &str, cookie: &str, token: &[u8]) -> Result<ConnectReply>;

    async fn disconnect(&self, server: &str, mid: i64, key: &str) -> Result<()>;

    async fn heartbeat(&self, server: &str, mid: i64, key: &str) -> Result<()>;

    /// Reports `{room id -> online}` for this instance and receives the
    /// cluster-wide merge back.
    async fn renew_online(
        &self,
        server: &str,
        room_count: HashMap<String, i32>,
    ) -> Result<HashMap<String, i32>>;

    /// Forwards a client-originated frame.
    async fn receive(&self, mid: i64, frame: &Frame) -> Result<()>;
}

/// Local mode: no logic tier.
#[derive(Debug, Clone)]
pub struct LocalLogic {
    heartbeat: Duration,
}

// ===== impl LocalLogic =====

impl LocalLogic {
    pub fn new(heartbeat: Duration) -> LocalLogic {
        LocalLogic { heartbeat }
    }
}

#[async_trait]
impl Logic for LocalLogic {
    async fn connect(&self, _server: &str, _cookie: &str, token: &[u8]) -> Result<ConnectReply> {
        let token: AuthToken =
            serde_json::from_slice(token).map_err(|e| Error::Logic(e.to_string()))?;

        let key = if token.key.is_empty() {
            uuid::Uuid::new_v4().to_string()
        } else {
            token.key
        };

        Ok(ConnectReply {
            mid: token.mid,
            key,
            room_id: token.room_id,
            accepts: token.accepts,
            heartbeat: self.heartbeat,
        })
    }

    async fn disconnect(&self, _server: &str, mid: i64, key: &str) -> Result<()> {
        debug!("local disconnect; mid={} key={}", mid, key);
        Ok(())
    }

    async fn heartbeat(&self, _server: &str, _mid: i64, _key: &str) -> Result<()> {
        Ok(())
    }

    async fn renew_online(
        &self,
        _server: &str,
        room_count: HashMap<String, i32>,
    ) -> Result<HashMap<String, i32>> {
        // Nothing to merge with; the local view is the global view.
        Ok(room_count)
    }

    async fn receive(&self, mid: i64, frame: &Frame) -> Result<()> {
        debug!("local receive; mid={} op={}", mid, frame.op);
        Ok(())
    }
}

/// Builds the body of an Auth frame for the given token.
pub fn auth_body(token: &AuthToken) -> Bytes {
    // Serializing a plain struct cannot fail.
    Bytes::from(serde_json::to_vec(token).unwrap_or_default())
}
