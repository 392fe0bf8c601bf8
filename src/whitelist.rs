//! Debug audit trail for a configured set of user ids.
//!
//! Connections owned by whitelisted users get every protocol step
//! appended to a dedicated log file, independent of the normal log
//! level. The check is a read-only set lookup, cheap enough to sit on
//! the hot path.

use std::fmt;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

use fnv::FnvHashSet;

use log::warn;

use crate::config::WhitelistConfig;
use crate::error::Result;

#[derive(Debug)]
pub struct Whitelist {
    list: FnvHashSet<i64>,
    file: Option<Mutex<File>>,
}

// ===== impl Whitelist =====

impl Whitelist {
    /// Opens (creating and appending) the audit log and loads the user
    /// set.
    pub fn open(config: &WhitelistConfig) -> Result<Whitelist> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&config.white_log)?;

        Ok(Whitelist {
            list: config.whitelist.iter().copied().collect(),
            file: Some(Mutex::new(file)),
        })
    }

    /// An empty whitelist; `contains` is always false.
    pub fn disabled() -> Whitelist {
        Whitelist {
            list: FnvHashSet::default(),
            file: None,
        }
    }

    pub fn contains(&self, mid: i64) -> bool {
        mid > 0 && self.list.contains(&mid)
    }

    /// Appends one audit line. Write failures are warned about, never
    /// propagated; audit must not break the connection.
    pub fn printf(&self, args: fmt::Arguments<'_>) {
        let Some(ref file) = self.file else { return };

        let ts = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis())
            .unwrap_or(0);

        let mut file = file.lock().unwrap();
        if let Err(e) = writeln!(file, "[{}] {}", ts, args) {
            warn!("whitelist log write failed; error={:?}", e);
        }
    }
}
