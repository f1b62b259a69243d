//! Serialized access to the embedded SQLite stores.
//! Owns write locking, connection setup, settings and schema migration.

pub mod config;
pub mod db;
pub mod logging;
pub mod repo;

pub use config::{StoreConfig, DATA_DIR_ENV};
pub use db::migrations::{
    apply_migrations, latest_version, BackupFailurePolicy, FailurePolicy, Migration,
    MigrationOptions, MigrationReport,
};
pub use db::{
    ConnectionFactory, DbError, DbResult, DbSelection, Executor, LockBroker, StoreConnection,
    TransactionGuard,
};
pub use logging::{default_log_level, init_logging, logging_status, LoggingConfig, LoggingError};
pub use repo::settings_repo::{SettingsStore, SqliteSettingsStore};

/// Returns the core crate version.
pub fn core_version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}

/// Version of the linked SQLite engine.
pub fn engine_version() -> &'static str {
    rusqlite::version()
}

#[cfg(test)]
mod tests {
    use super::{core_version, engine_version};

    #[test]
    fn version_is_not_empty() {
        assert!(!core_version().is_empty());
    }

    #[test]
    fn engine_version_is_sqlite3() {
        assert!(engine_version().starts_with('3'));
    }
}
