//! Controller configuration.
//!
//! Settings come from a JSON file (by default
//! `<config dir>/rbridge/config.json`), optionally overridden from the
//! environment:
//!
//! | Variable | Setting |
//! |---|---|
//! | `RBRIDGE_HOME` | engine home |
//! | `R_HOME` | engine home, when not set otherwise |
//! | `RBRIDGE_BRIDGE_DIR` | directory of the native bridge library |

use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::codec::{StringEncoding, ValueCodec};
use crate::console::DEFAULT_CONSOLE_CAPACITY;
use crate::error::{Error, Result};
use crate::eval::CancelPolicy;

const CONFIG_DIR: &str = "rbridge";
const CONFIG_FILE: &str = "config.json";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ControllerConfig {
    /// Engine home; detected from the environment when unset.
    pub home: Option<PathBuf>,
    /// Directory of the native bridge library; defaults below the home.
    pub bridge_dir: Option<PathBuf>,
    /// Engine memory limit in megabytes.
    pub memory_limit: Option<u64>,
    pub string_encoding: StringEncoding,
    pub send_row_names: bool,
    pub cancel_poll_interval_ms: u64,
    pub confirm_poll_interval_ms: u64,
    pub workspace_poll_interval_ms: u64,
    pub console_capacity: usize,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            home: None,
            bridge_dir: None,
            memory_limit: None,
            string_encoding: StringEncoding::Factor,
            send_row_names: true,
            cancel_poll_interval_ms: 300,
            confirm_poll_interval_ms: 10,
            workspace_poll_interval_ms: 500,
            console_capacity: DEFAULT_CONSOLE_CAPACITY,
        }
    }
}

impl ControllerConfig {
    /// Configuration with `home` set and everything else defaulted.
    pub fn with_home(home: impl Into<PathBuf>) -> Self {
        Self {
            home: Some(home.into()),
            ..Self::default()
        }
    }

    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(|e| Error::Config(e.to_string()))
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("cannot read {}: {}", path.display(), e)))?;
        serde_json::from_str(&content)
            .map_err(|e| Error::Config(format!("invalid {}: {}", path.display(), e)))
    }

    /// `<config dir>/rbridge/config.json`, if the platform has a config dir.
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join(CONFIG_DIR).join(CONFIG_FILE))
    }

    /// Load the default configuration file, or defaults if there is none.
    pub fn load_default() -> Result<Self> {
        match Self::default_path() {
            Some(path) if path.is_file() => {
                debug!(path = %path.display(), "loading controller configuration");
                Self::from_file(&path)
            }
            _ => Ok(Self::default()),
        }
    }

    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self).map_err(|e| Error::Serialization(e.to_string()))
    }

    /// Apply the environment overrides.
    pub fn with_env_overrides(self) -> Self {
        self.with_overrides(|key| env::var(key).ok())
    }

    fn with_overrides(mut self, lookup: impl Fn(&str) -> Option<String>) -> Self {
        let non_empty = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        if let Some(home) = non_empty("RBRIDGE_HOME") {
            self.home = Some(PathBuf::from(home));
        } else if self.home.is_none()
            && let Some(home) = non_empty("R_HOME")
        {
            self.home = Some(PathBuf::from(home));
        }
        if let Some(dir) = non_empty("RBRIDGE_BRIDGE_DIR") {
            self.bridge_dir = Some(PathBuf::from(dir));
        }
        self
    }

    pub fn codec(&self) -> ValueCodec {
        ValueCodec::new(self.string_encoding, self.send_row_names)
    }

    /// Silent cancellation at the configured interval.
    pub fn cancel_policy(&self) -> CancelPolicy {
        CancelPolicy::silent().with_interval(Duration::from_millis(self.cancel_poll_interval_ms))
    }

    /// Confirmed cancellation at the configured interval.
    pub fn confirm_policy<F>(&self, confirm: F) -> CancelPolicy
    where
        F: Fn() -> bool + Send + Sync + 'static,
    {
        CancelPolicy::confirm(confirm)
            .with_interval(Duration::from_millis(self.confirm_poll_interval_ms))
    }

    pub fn workspace_poll_interval(&self) -> Duration {
        Duration::from_millis(self.workspace_poll_interval_ms.max(1))
    }
}

/// Live engine-home setting shared with the host's preferences.
///
/// The controller compares it with the home of its last successful
/// initialization on every access.
#[derive(Debug, Clone, Default)]
pub struct SharedHome {
    inner: Arc<RwLock<Option<PathBuf>>>,
}

impl SharedHome {
    pub fn new(home: Option<PathBuf>) -> Self {
        Self {
            inner: Arc::new(RwLock::new(home)),
        }
    }

    pub fn get(&self) -> Option<PathBuf> {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn set(&self, home: impl Into<PathBuf>) {
        *self.inner.write().unwrap_or_else(PoisonError::into_inner) = Some(home.into());
    }

    pub fn clear(&self) {
        *self.inner.write().unwrap_or_else(PoisonError::into_inner) = None;
    }
}
