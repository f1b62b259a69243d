//! Store configuration.
//!
//! # Responsibility
//! - Describe where the store files live and how connections are tuned.
//! - Provide defaults matching desktop single-user usage.

use crate::db::migrations::BackupFailurePolicy;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Environment variable consulted by [`StoreConfig::from_env`].
pub const DATA_DIR_ENV: &str = "EDSTORE_DATA_DIR";

const DEFAULT_BUSY_TIMEOUT: Duration = Duration::from_secs(5);
const DEFAULT_POOL_SIZE: u32 = 8;
const DEFAULT_POOL_CONNECTION_TIMEOUT: Duration = Duration::from_secs(30);

/// Connection factory settings.
#[derive(Debug, Clone, PartialEq)]
pub struct StoreConfig {
    /// Directory holding `EDDiscovery.sqlite`, `EDDUser.sqlite`, `EDDSystem.sqlite`
    /// and upgrade backups.
    pub data_dir: PathBuf,
    /// SQLite busy handler timeout applied to every connection.
    pub busy_timeout: Duration,
    /// Maximum pooled connections per physical file.
    pub pool_size: u32,
    /// How long `open` waits for a pooled connection.
    pub pool_connection_timeout: Duration,
    /// What to do when the pre-upgrade backup copy fails.
    pub backup_failure: BackupFailurePolicy,
}

impl StoreConfig {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            busy_timeout: DEFAULT_BUSY_TIMEOUT,
            pool_size: DEFAULT_POOL_SIZE,
            pool_connection_timeout: DEFAULT_POOL_CONNECTION_TIMEOUT,
            backup_failure: BackupFailurePolicy::default(),
        }
    }

    /// Builds a config from `EDSTORE_DATA_DIR`.
    ///
    /// Returns `None` when the variable is unset or blank.
    pub fn from_env() -> Option<Self> {
        let value = std::env::var_os(DATA_DIR_ENV)?;
        if value.to_string_lossy().trim().is_empty() {
            return None;
        }
        Some(Self::new(value))
    }

    pub fn with_busy_timeout(mut self, busy_timeout: Duration) -> Self {
        self.busy_timeout = busy_timeout;
        self
    }

    pub fn with_pool_size(mut self, pool_size: u32) -> Self {
        self.pool_size = pool_size.max(1);
        self
    }

    pub fn with_pool_connection_timeout(mut self, timeout: Duration) -> Self {
        self.pool_connection_timeout = timeout;
        self
    }

    pub fn with_backup_failure(mut self, policy: BackupFailurePolicy) -> Self {
        self.backup_failure = policy;
        self
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }
}

#[cfg(test)]
mod tests {
    use super::{StoreConfig, DATA_DIR_ENV};
    use crate::db::migrations::BackupFailurePolicy;
    use std::path::Path;
    use std::time::Duration;

    #[test]
    fn new_applies_defaults() {
        let config = StoreConfig::new("/var/lib/edstore");
        assert_eq!(config.data_dir(), Path::new("/var/lib/edstore"));
        assert_eq!(config.busy_timeout, Duration::from_secs(5));
        assert_eq!(config.pool_size, 8);
        assert_eq!(config.backup_failure, BackupFailurePolicy::Continue);
    }

    #[test]
    fn builders_override_defaults() {
        let config = StoreConfig::new("/tmp/x")
            .with_busy_timeout(Duration::from_millis(50))
            .with_pool_size(0)
            .with_pool_connection_timeout(Duration::from_secs(2))
            .with_backup_failure(BackupFailurePolicy::Abort);
        assert_eq!(config.busy_timeout, Duration::from_millis(50));
        assert_eq!(config.pool_connection_timeout, Duration::from_secs(2));
        assert_eq!(config.pool_size, 1, "pool size is clamped to at least one");
        assert_eq!(config.backup_failure, BackupFailurePolicy::Abort);
    }

    #[test]
    fn from_env_reads_data_dir_and_ignores_blank_values() {
        std::env::set_var(DATA_DIR_ENV, "/srv/edstore");
        let config = StoreConfig::from_env().unwrap();
        assert_eq!(config.data_dir(), Path::new("/srv/edstore"));

        std::env::set_var(DATA_DIR_ENV, "   ");
        assert!(StoreConfig::from_env().is_none());

        std::env::remove_var(DATA_DIR_ENV);
        assert!(StoreConfig::from_env().is_none());
    }
}
