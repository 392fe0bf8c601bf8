//! Service-registry interface and the metadata refresh loop.
//!
//! The gateway publishes one instance record under
//! `/services/<appid>/<host>` and refreshes its dynamic fields
//! (connection count, distinct IPs) every 10 seconds. The lease-backed
//! store itself lives behind the [`Registry`] trait; the crate ships a
//! log-only implementation for stand-alone runs.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;

use log::{error, info};

use crate::config::Config;
use crate::error::Result;
use crate::proto::Server;

pub const APP_ID: &str = "courier.gateway";

const REFRESH_INTERVAL: Duration = Duration::from_secs(10);

/// One instance record as it appears in the registry.
#[derive(Debug, Clone, Serialize)]
pub struct Instance {
    pub region: String,
    pub zone: String,
    pub env: String,
    pub appid: String,
    pub hostname: String,
    pub addrs: Vec<String>,
    pub weight: i64,
    pub offline: bool,
    pub conn_count: usize,
    pub ip_count: usize,
}

#[async_trait]
pub trait Registry: Send + Sync {
    /// Creates or refreshes the instance record under `key`.
    async fn register(&self, key: &str, instance: &Instance) -> Result<()>;

    async fn deregister(&self, key: &str) -> Result<()>;
}

/// Log-only registry for local mode.
#[derive(Debug, Default)]
pub struct LogRegistry;

#[async_trait]
impl Registry for LogRegistry {
    async fn register(&self, key: &str, instance: &Instance) -> Result<()> {
        info!(
            "register; key={} conns={} ips={}",
            key, instance.conn_count, instance.ip_count
        );
        Ok(())
    }

    async fn deregister(&self, key: &str) -> Result<()> {
        info!("deregister; key={}", key);
        Ok(())
    }
}

// ===== impl Instance =====

impl Instance {
    pub fn from_config(config: &Config, host: &str) -> Instance {
        Instance {
            region: config.env.region.clone(),
            zone: config.env.zone.clone(),
            env: config.env.deploy_env.clone(),
            appid: APP_ID.to_owned(),
            hostname: host.to_owned(),
            addrs: config.env.addrs.clone(),
            weight: config.env.weight,
            offline: config.env.offline,
            conn_count: 0,
            ip_count: 0,
        }
    }
}

pub fn instance_key(host: &str) -> String {
    format!("/services/{}/{}", APP_ID, host)
}

/// Registers the instance and keeps its dynamic metadata fresh until
/// shutdown, then deregisters.
pub async fn updater(server: Arc<Server>, registry: Arc<dyn Registry>, mut instance: Instance) {
    let key = instance_key(&instance.hostname);

    loop {
        let mut conns = 0;
        let mut ips: HashSet<String> = HashSet::new();
        for bucket in server.buckets() {
            conns += bucket.channel_count();
            ips.extend(bucket.ips());
        }
        instance.conn_count = conns;
        instance.ip_count = ips.len();

        if let Err(e) = registry.register(&key, &instance).await {
            error!("register failed; key={} error={}", key, e);
        }

        tokio::select! {
            _ = tokio::time::sleep(REFRESH_INTERVAL) => {}
            _ = server.shutdown_token().cancelled() => break,
        }
    }

    if let Err(e) = registry.deregister(&key).await {
        error!("deregister failed; key={} error={}", key, e);
    }
}
