//! Connection factory for the primary, user and system stores.
//!
//! # Responsibility
//! - Run one-time store initialization (engine probe, schema migration) before
//!   the first connection is handed out.
//! - Open pooled file connections or fresh in-memory connections.
//! - Attach additional logical stores onto a connection, idempotently.
//!
//! # Invariants
//! - Initialization runs at most once per factory and is serialized by its own
//!   mutex, separate from the write lock.
//! - Every returned connection has `foreign_keys=ON` and the configured busy timeout.
//! - Schemas attached by a [`StoreConnection`] are detached before its
//!   connection goes back to the pool.

use super::command::{Command, Executor};
use super::lock::LockBroker;
use super::migrations::{self, MigrationOptions, MigrationReport};
use super::selection::DbSelection;
use super::transaction::TransactionGuard;
use super::{DbError, DbResult};
use crate::config::StoreConfig;
use crate::repo::settings_repo::SqliteSettingsStore;
use log::{debug, error, info, warn};
use once_cell::sync::OnceCell;
use r2d2::{Pool, PooledConnection};
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{params, Connection};
use std::collections::HashMap;
use std::ops::{Deref, DerefMut};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

static GLOBAL_FACTORY: OnceCell<ConnectionFactory> = OnceCell::new();

/// Installs the process-wide factory.
///
/// # Errors
/// - [`DbError::GlobalAlreadyInitialized`] when called more than once.
pub fn init_global(config: StoreConfig) -> DbResult<&'static ConnectionFactory> {
    GLOBAL_FACTORY
        .set(ConnectionFactory::new(config))
        .map_err(|_| DbError::GlobalAlreadyInitialized)?;
    global()
}

/// Returns the process-wide factory installed by [`init_global`].
pub fn global() -> DbResult<&'static ConnectionFactory> {
    GLOBAL_FACTORY.get().ok_or(DbError::GlobalNotInitialized)
}

#[derive(Debug)]
struct ConnectionCustomizer {
    busy_timeout: Duration,
}

impl r2d2::CustomizeConnection<Connection, rusqlite::Error> for ConnectionCustomizer {
    fn on_acquire(&self, conn: &mut Connection) -> Result<(), rusqlite::Error> {
        configure_connection(conn, self.busy_timeout)
    }
}

fn configure_connection(conn: &Connection, busy_timeout: Duration) -> rusqlite::Result<()> {
    conn.busy_timeout(busy_timeout)?;
    conn.execute_batch("PRAGMA foreign_keys = ON;")
}

struct FactoryInner {
    config: StoreConfig,
    broker: Arc<LockBroker>,
    // Separate from `broker`: only guards first-time initialization.
    init: Mutex<Option<MigrationReport>>,
    pools: Mutex<HashMap<PathBuf, Pool<SqliteConnectionManager>>>,
}

/// Hands out connections to the logical stores. Cheap to clone.
#[derive(Clone)]
pub struct ConnectionFactory {
    inner: Arc<FactoryInner>,
}

impl ConnectionFactory {
    /// Creates a factory that serializes writes on the process-wide broker.
    pub fn new(config: StoreConfig) -> Self {
        Self::with_lock_broker(config, LockBroker::global())
    }

    pub fn with_lock_broker(config: StoreConfig, broker: Arc<LockBroker>) -> Self {
        Self {
            inner: Arc::new(FactoryInner {
                config,
                broker,
                init: Mutex::new(None),
                pools: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn config(&self) -> &StoreConfig {
        &self.inner.config
    }

    pub fn lock_broker(&self) -> &Arc<LockBroker> {
        &self.inner.broker
    }

    /// Opens a connection whose main schema is `main`, with every flag of
    /// `attach` attached under its schema name.
    ///
    /// # Side effects
    /// - Initializes and migrates the primary store on first call.
    /// - Emits `db_open` logging events with duration and status.
    pub fn open(&self, main: DbSelection, attach: DbSelection) -> DbResult<StoreConnection> {
        self.ensure_initialized()?;

        let started_at = Instant::now();
        let mut conn = match self.connect(main) {
            Ok(conn) => conn,
            Err(err) => {
                error!(
                    "event=db_open module=db status=error main={} duration_ms={} error_code=db_open_failed error={}",
                    main,
                    started_at.elapsed().as_millis(),
                    err
                );
                return Err(err);
            }
        };

        if let Err(err) = conn.attach(attach) {
            error!(
                "event=db_open module=db status=error main={} attach={} duration_ms={} error_code=db_attach_failed error={}",
                main,
                attach,
                started_at.elapsed().as_millis(),
                err
            );
            return Err(err);
        }

        debug!(
            "event=db_open module=db status=ok main={} attach={} target={} pooled={} duration_ms={}",
            main,
            attach,
            main.connection_string(&self.inner.config.data_dir),
            conn.is_pooled(),
            started_at.elapsed().as_millis()
        );
        Ok(conn)
    }

    /// Opens the primary store with nothing attached.
    pub fn open_primary(&self) -> DbResult<StoreConnection> {
        self.open(DbSelection::PRIMARY, DbSelection::NONE)
    }

    /// Runs first-time initialization if it has not completed yet.
    ///
    /// A failed initialization is logged and retried by the next call.
    pub fn ensure_initialized(&self) -> DbResult<()> {
        let mut state = self
            .inner
            .init
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if state.is_some() {
            return Ok(());
        }

        let started_at = Instant::now();
        info!(
            "event=db_init module=db status=start data_dir={}",
            self.inner.config.data_dir.display()
        );

        match self.initialize() {
            Ok(report) => {
                info!(
                    "event=db_init module=db status=ok from_version={} to_version={} applied={} tolerated={} duration_ms={}",
                    report.from,
                    report.to,
                    report.applied.len(),
                    report.tolerated.len(),
                    started_at.elapsed().as_millis()
                );
                *state = Some(report);
                Ok(())
            }
            Err(err) => {
                error!(
                    "event=db_init module=db status=error duration_ms={} error_code=db_init_failed error={}",
                    started_at.elapsed().as_millis(),
                    err
                );
                Err(err)
            }
        }
    }

    /// Outcome of first-time initialization, once it has succeeded.
    pub fn migration_report(&self) -> Option<MigrationReport> {
        self.inner
            .init
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn initialize(&self) -> DbResult<MigrationReport> {
        let data_dir = &self.inner.config.data_dir;
        std::fs::create_dir_all(data_dir).map_err(|source| DbError::Io {
            path: data_dir.clone(),
            source,
        })?;

        let engine_version = probe_engine()?;
        debug!("event=db_engine module=db status=ok sqlite_version={engine_version}");

        let mut conn = self.connect(DbSelection::PRIMARY)?;
        let options = MigrationOptions {
            backup_dir: Some(data_dir.clone()),
            backup_failure: self.inner.config.backup_failure,
        };
        migrations::apply_migrations(&mut conn, &options)
    }

    fn connect(&self, main: DbSelection) -> DbResult<StoreConnection> {
        let config = &self.inner.config;
        let handle = if main.is_empty() {
            let conn = Connection::open_in_memory()?;
            configure_connection(&conn, config.busy_timeout)?;
            Handle::Memory(conn)
        } else {
            let path = main.file_path(&config.data_dir);
            Handle::Pooled(self.pool_for(&path)?.get()?)
        };

        Ok(StoreConnection {
            handle,
            main,
            broker: Arc::clone(&self.inner.broker),
            data_dir: config.data_dir.clone(),
            attached: Vec::new(),
        })
    }

    fn pool_for(&self, path: &Path) -> DbResult<Pool<SqliteConnectionManager>> {
        let mut pools = self
            .inner
            .pools
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if let Some(pool) = pools.get(path) {
            return Ok(pool.clone());
        }

        let config = &self.inner.config;
        let pool = Pool::builder()
            .max_size(config.pool_size)
            .min_idle(Some(0))
            .connection_timeout(config.pool_connection_timeout)
            .connection_customizer(Box::new(ConnectionCustomizer {
                busy_timeout: config.busy_timeout,
            }))
            .build(SqliteConnectionManager::file(path))?;
        info!(
            "event=db_pool module=db status=created path={} max_size={}",
            path.display(),
            config.pool_size
        );
        pools.insert(path.to_path_buf(), pool.clone());
        Ok(pool)
    }
}

/// Opens a throwaway in-memory database to prove the engine is usable.
fn probe_engine() -> DbResult<String> {
    let conn = Connection::open_in_memory()
        .map_err(|err| DbError::EngineUnavailable(err.to_string()))?;
    conn.query_row("SELECT sqlite_version();", [], |row| row.get::<_, String>(0))
        .map_err(|err| DbError::EngineUnavailable(err.to_string()))
}

enum Handle {
    Pooled(PooledConnection<SqliteConnectionManager>),
    Memory(Connection),
}

impl Deref for Handle {
    type Target = Connection;

    fn deref(&self) -> &Self::Target {
        match self {
            Self::Pooled(conn) => &**conn,
            Self::Memory(conn) => conn,
        }
    }
}

impl DerefMut for Handle {
    fn deref_mut(&mut self) -> &mut Self::Target {
        match self {
            Self::Pooled(conn) => &mut **conn,
            Self::Memory(conn) => conn,
        }
    }
}

/// A connection scoped to one caller. Not shared across threads.
pub struct StoreConnection {
    handle: Handle,
    main: DbSelection,
    broker: Arc<LockBroker>,
    data_dir: PathBuf,
    attached: Vec<&'static str>,
}

impl StoreConnection {
    /// Selection opened as the `main` schema.
    pub fn main(&self) -> DbSelection {
        self.main
    }

    pub fn is_pooled(&self) -> bool {
        matches!(self.handle, Handle::Pooled(_))
    }

    /// Raw connection for in-crate reads and backups.
    ///
    /// Writes go through [`Executor::command`] or [`StoreConnection::begin`].
    pub(crate) fn connection(&self) -> &Connection {
        &self.handle
    }

    pub fn lock_broker(&self) -> &LockBroker {
        &self.broker
    }

    /// Typed settings accessor bound to this connection.
    pub fn settings(&self) -> SqliteSettingsStore<'_> {
        SqliteSettingsStore::new(self)
    }

    /// Begins a write transaction; blocks until the write lock is free.
    pub fn begin(&mut self) -> DbResult<TransactionGuard<'_>> {
        TransactionGuard::begin(&mut self.handle, &self.broker)
    }

    /// Attaches every flag of `selection` that is not attached yet.
    ///
    /// Returns the number of schemas newly attached.
    pub fn attach(&mut self, selection: DbSelection) -> DbResult<usize> {
        let mut newly_attached = 0;
        for flag in selection.flags() {
            let name = flag.schema_name();
            if self.schema_names()?.iter().any(|existing| existing == name) {
                debug!("event=db_attach module=db status=skipped schema={name} reason=already_attached");
                continue;
            }

            let path = flag.file_path(&self.data_dir).to_string_lossy().into_owned();
            self.handle
                .execute("ATTACH DATABASE ?1 AS ?2;", params![path, name])?;
            self.attached.push(name);
            newly_attached += 1;
            debug!("event=db_attach module=db status=ok schema={name}");
        }
        Ok(newly_attached)
    }

    /// Names of the live schemas on this connection (`main`, `temp`, attached).
    pub fn schema_names(&self) -> DbResult<Vec<String>> {
        let mut stmt = self.handle.prepare("PRAGMA database_list;")?;
        let rows = stmt.query_map([], |row| row.get::<_, String>("name"))?;
        let names = rows.collect::<Result<Vec<_>, _>>()?;
        Ok(names)
    }
}

impl Executor for StoreConnection {
    fn command(&self, sql: &str) -> Command<'_> {
        Command::new(&self.handle, &self.broker, sql)
    }
}

impl Drop for StoreConnection {
    fn drop(&mut self) {
        if !self.is_pooled() {
            return;
        }
        for name in self.attached.drain(..) {
            if let Err(err) = self.handle.execute("DETACH DATABASE ?1;", [name]) {
                warn!("event=db_detach module=db status=error schema={name} error={err}");
            }
        }
    }
}
