//! Gateway configuration.
//!
//! Every field has a production default; a TOML file overrides the
//! defaults section by section and the binary's command-line flags
//! override the `[env]` section on top of that. Durations are integer
//! milliseconds (`*_ms`).

use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use crate::error::{Error, Result};

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub debug: bool,
    pub env: EnvConfig,
    pub tcp: TcpConfig,
    pub websocket: WebsocketConfig,
    pub protocol: ProtocolConfig,
    pub bucket: BucketConfig,
    pub rpc_server: RpcServerConfig,
    pub rpc_client: RpcClientConfig,
    pub whitelist: Option<WhitelistConfig>,
}

/// Deployment identity, published to the service registry.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EnvConfig {
    pub region: String,
    pub zone: String,
    pub deploy_env: String,
    /// Instance id; defaults to the machine hostname when empty.
    pub host: String,
    /// Public addresses advertised to the load balancer.
    pub addrs: Vec<String>,
    pub weight: i64,
    pub offline: bool,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TcpConfig {
    pub bind: Vec<String>,
    pub sndbuf: usize,
    pub rcvbuf: usize,
    pub keepalive: bool,
    /// Number of striped read-buffer pools.
    pub reader: usize,
    /// Buffers per read pool.
    pub read_buf: usize,
    /// Size of one read buffer.
    pub read_buf_size: usize,
    pub writer: usize,
    pub write_buf: usize,
    pub write_buf_size: usize,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WebsocketConfig {
    pub bind: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ProtocolConfig {
    /// Number of striped timers.
    pub timer: usize,
    /// Entries per timer.
    pub timer_size: usize,
    /// Per-connection request ring capacity.
    pub cli_proto: usize,
    /// Per-connection signal mailbox capacity.
    pub svr_proto: usize,
    pub handshake_timeout_ms: u64,
    /// Heartbeat interval granted by the local auth mode.
    pub heartbeat_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BucketConfig {
    /// Number of buckets; a power of two keeps the key hash spread
    /// even.
    pub size: usize,
    /// Initial channel-map capacity per bucket.
    pub channel: usize,
    /// Initial room-map capacity per bucket.
    pub room: usize,
    /// Room-broadcast workers per bucket.
    pub routine_amount: usize,
    /// Queue capacity per room-broadcast worker.
    pub routine_size: usize,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RpcServerConfig {
    pub addr: String,
}

/// Deadlines for calls into the logic tier.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RpcClientConfig {
    pub timeout_ms: u64,
}

impl RpcClientConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

impl Default for RpcClientConfig {
    fn default() -> RpcClientConfig {
        RpcClientConfig { timeout_ms: 1_000 }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct WhitelistConfig {
    pub whitelist: Vec<i64>,
    pub white_log: String,
}

// ===== impl Config =====

impl Config {
    /// Loads a TOML file over the defaults.
    pub fn load(path: &Path) -> Result<Config> {
        let raw = std::fs::read_to_string(path)?;
        toml::from_str(&raw).map_err(|e| Error::Config(e.to_string()))
    }
}

impl ProtocolConfig {
    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    pub fn heartbeat(&self) -> Duration {
        Duration::from_millis(self.heartbeat_ms)
    }
}

impl Default for EnvConfig {
    fn default() -> EnvConfig {
        EnvConfig {
            region: String::new(),
            zone: String::new(),
            deploy_env: "dev".to_owned(),
            host: String::new(),
            addrs: Vec::new(),
            weight: 10,
            offline: false,
        }
    }
}

impl Default for TcpConfig {
    fn default() -> TcpConfig {
        TcpConfig {
            bind: vec!["0.0.0.0:3101".to_owned()],
            sndbuf: 4096,
            rcvbuf: 4096,
            keepalive: false,
            reader: 32,
            read_buf: 128,
            read_buf_size: 8192,
            writer: 32,
            write_buf: 128,
            write_buf_size: 8192,
        }
    }
}

impl Default for WebsocketConfig {
    fn default() -> WebsocketConfig {
        WebsocketConfig {
            bind: vec!["0.0.0.0:3102".to_owned()],
        }
    }
}

impl Default for ProtocolConfig {
    fn default() -> ProtocolConfig {
        ProtocolConfig {
            timer: 32,
            timer_size: 2048,
            cli_proto: 5,
            svr_proto: 10,
            handshake_timeout_ms: 5_000,
            heartbeat_ms: 60_000,
        }
    }
}

impl Default for BucketConfig {
    fn default() -> BucketConfig {
        BucketConfig {
            size: 32,
            channel: 1024,
            room: 1024,
            routine_amount: 32,
            routine_size: 1024,
        }
    }
}

impl Default for RpcServerConfig {
    fn default() -> RpcServerConfig {
        RpcServerConfig {
            addr: "0.0.0.0:3109".to_owned(),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let config = Config::default();
        assert_eq!(config.bucket.size, 32);
        assert_eq!(config.protocol.cli_proto, 5);
        assert_eq!(config.protocol.svr_proto, 10);
        assert_eq!(config.protocol.handshake_timeout(), Duration::from_secs(5));
        assert!(config.whitelist.is_none());
    }

    #[test]
    fn partial_toml_overrides() {
        let raw = r#"
            debug = true

            [bucket]
            size = 4

            [protocol]
            handshake_timeout_ms = 100

            [whitelist]
            whitelist = [42]
            white_log = "/tmp/white.log"
        "#;

        let config: Config = toml::from_str(raw).unwrap();
        assert!(config.debug);
        assert_eq!(config.bucket.size, 4);
        // Unset fields keep their defaults.
        assert_eq!(config.bucket.routine_amount, 32);
        assert_eq!(config.protocol.handshake_timeout_ms, 100);
        assert_eq!(config.whitelist.unwrap().whitelist, vec![42]);
    }
}
