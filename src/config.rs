use crate::errors::{StoreError, StoreResult};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_FILE_NAME: &str = "monitor.db";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JournalMode {
    #[default]
    Wal,
    Delete,
}

impl JournalMode {
    pub fn pragma_value(self) -> &'static str {
        match self {
            Self::Wal => "wal",
            Self::Delete => "delete",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncMode {
    Full,
    #[default]
    Normal,
}

impl SyncMode {
    pub fn pragma_value(self) -> &'static str {
        match self {
            Self::Full => "full",
            Self::Normal => "normal",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct StoreConfig {
    pub path: PathBuf,
    /// SQLite busy handler timeout.
    pub busy_timeout_ms: u64,
    /// Upper bound on waiting for the shared connection before failing with `Busy`.
    pub lock_timeout_ms: u64,
    pub journal_mode: JournalMode,
    pub sync_mode: SyncMode,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from(DEFAULT_FILE_NAME),
            busy_timeout_ms: 5_000,
            lock_timeout_ms: 10_000,
            journal_mode: JournalMode::Wal,
            sync_mode: SyncMode::Normal,
        }
    }
}

impl StoreConfig {
    pub fn in_dir(dir: &Path) -> Self {
        Self {
            path: dir.join(DEFAULT_FILE_NAME),
            ..Self::default()
        }
    }

    pub fn from_json_str(raw: &str) -> StoreResult<Self> {
        serde_json::from_str(raw).map_err(|error| StoreError::Config(error.to_string()))
    }

    pub fn load(path: &Path) -> StoreResult<Self> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_json_str(&raw)
    }

    pub fn validate(&self) -> StoreResult<()> {
        if self.path.as_os_str().is_empty() || self.path.is_dir() {
            return Err(StoreError::Config(format!(
                "database path '{}' must name a file",
                self.path.display()
            )));
        }
        if self.busy_timeout_ms == 0 || self.lock_timeout_ms == 0 {
            return Err(StoreError::Config("timeouts must be greater than zero".to_string()));
        }
        Ok(())
    }

    pub fn busy_timeout(&self) -> Duration {
        Duration::from_millis(self.busy_timeout_ms)
    }

    pub fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_timeout_ms)
    }
}
