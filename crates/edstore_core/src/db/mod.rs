//! SQLite access serialization and schema migration entry points.
//!
//! # Responsibility
//! - Open pooled or in-memory SQLite connections for the three logical stores.
//! - Serialize every write through the process-wide [`LockBroker`].
//! - Apply schema migrations exactly once per process, before first use.
//!
//! # Invariants
//! - At most one write (statement or transaction) is inside the lock at a time.
//! - Schema version is tracked via the `DBVer` key of the `Register` table.
//! - Application data is not touched before migrations succeed.

use std::error::Error;
use std::fmt::{Display, Formatter};
use std::path::PathBuf;

mod command;
mod connection;
mod lock;
pub mod migrations;
mod selection;
mod transaction;

pub use command::{Command, Executor, QueryTable};
pub use connection::{global, init_global, ConnectionFactory, StoreConnection};
pub use lock::{LockBroker, WriteLock, DEFAULT_LEAK_POLL};
pub use selection::DbSelection;
pub use transaction::TransactionGuard;

pub type DbResult<T> = Result<T, DbError>;

#[derive(Debug)]
pub enum DbError {
    Sqlite(rusqlite::Error),
    Pool(r2d2::Error),
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    /// The embedded engine could not open even an in-memory database.
    EngineUnavailable(String),
    UnsupportedSchemaVersion {
        db_version: i64,
        latest_supported: i64,
    },
    /// A fatal migration step failed; the version marker was not advanced.
    Migration {
        version: i64,
        source: Box<DbError>,
    },
    Backup {
        version: i64,
        path: PathBuf,
        source: Box<DbError>,
    },
    /// A write met a transaction that no `TransactionGuard` on its own
    /// connection owns.
    ForeignTransaction,
    /// The engine ended a guarded transaction on its own (for example after
    /// an I/O or out-of-memory error); nothing is left to commit.
    TransactionAborted,
    GlobalAlreadyInitialized,
    GlobalNotInitialized,
}

impl Display for DbError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Sqlite(err) => write!(f, "{err}"),
            Self::Pool(err) => write!(f, "connection pool error: {err}"),
            Self::Io { path, source } => write!(f, "{}: {source}", path.display()),
            Self::EngineUnavailable(message) => {
                write!(f, "unable to get a working sqlite engine: {message}")
            }
            Self::UnsupportedSchemaVersion {
                db_version,
                latest_supported,
            } => write!(
                f,
                "database schema version {db_version} is newer than supported {latest_supported}"
            ),
            Self::Migration { version, source } => {
                write!(f, "schema upgrade to version {version} failed: {source}")
            }
            Self::Backup {
                version,
                path,
                source,
            } => write!(
                f,
                "backup before schema upgrade to version {version} failed ({}): {source}",
                path.display()
            ),
            Self::ForeignTransaction => write!(
                f,
                "transaction is not owned by this connection's guard; refusing to run unlocked"
            ),
            Self::TransactionAborted => {
                write!(f, "transaction was rolled back by the database engine")
            }
            Self::GlobalAlreadyInitialized => {
                write!(f, "global connection factory is already initialized")
            }
            Self::GlobalNotInitialized => {
                write!(f, "global connection factory has not been initialized")
            }
        }
    }
}

impl Error for DbError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Sqlite(err) => Some(err),
            Self::Pool(err) => Some(err),
            Self::Io { source, .. } => Some(source),
            Self::Migration { source, .. } | Self::Backup { source, .. } => Some(source.as_ref()),
            Self::EngineUnavailable(_)
            | Self::UnsupportedSchemaVersion { .. }
            | Self::ForeignTransaction
            | Self::TransactionAborted
            | Self::GlobalAlreadyInitialized
            | Self::GlobalNotInitialized => None,
        }
    }
}

impl From<rusqlite::Error> for DbError {
    fn from(value: rusqlite::Error) -> Self {
        Self::Sqlite(value)
    }
}

impl From<r2d2::Error> for DbError {
    fn from(value: r2d2::Error) -> Self {
        Self::Pool(value)
    }
}
