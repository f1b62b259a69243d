//! Schema migration table and driver for the primary store.
//!
//! # Responsibility
//! - Describe every schema step from version 2 to the terminal version.
//! - Apply pending steps in order, each inside its own write transaction.
//!
//! # Invariants
//! - Versions are contiguous and strictly increasing; the marker moves one
//!   step at a time and never backwards.
//! - The `DBVer` marker is written in the same transaction as the step it
//!   records.
//! - A fatal step failure rolls back that step and leaves the marker on the
//!   previous version.
//! - A tolerated step failure keeps the statements that already ran, skips
//!   the rest and still advances the marker, unless the engine has already
//!   ended the step's transaction; that case is fatal.

use super::command::Executor;
use super::connection::StoreConnection;
use super::transaction::TransactionGuard;
use super::{DbError, DbResult};
use crate::repo::settings_repo::{SettingsStore, SqliteSettingsStore};
use log::{error, info, warn};
use rusqlite::DatabaseName;
use std::fmt::{Debug, Formatter};
use std::path::PathBuf;
use std::time::Instant;

/// Settings key holding the schema version.
pub const VERSION_KEY: &str = "DBVer";
/// Version assumed when the marker has never been written.
pub const BASE_VERSION: i64 = 1;

const BACKUP_FILE_PREFIX: &str = "EDDiscovery";

/// What happens when a step's statements or post-step hook fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailurePolicy {
    /// Roll back the step and return the error; the version is not advanced.
    Fatal,
    /// Log the error, keep earlier statements of the step, advance the version.
    Tolerated,
}

/// What happens when the pre-step backup copy fails.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum BackupFailurePolicy {
    /// Log and apply the step anyway.
    #[default]
    Continue,
    /// Stop before the step; the version is not advanced.
    Abort,
}

/// Callback run inside a step's transaction after its statements succeed.
pub type PostStepHook = fn(&dyn SettingsStore) -> DbResult<()>;

/// One schema step.
#[derive(Clone, Copy)]
pub struct Migration {
    pub version: i64,
    pub statements: &'static [&'static str],
    /// Copy the store file aside as `EDDiscovery{version - 1}.sqlite` first.
    pub backup: bool,
    pub on_failure: FailurePolicy,
    pub after: Option<PostStepHook>,
}

impl Debug for Migration {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Migration")
            .field("version", &self.version)
            .field("statements", &self.statements.len())
            .field("backup", &self.backup)
            .field("on_failure", &self.on_failure)
            .field("after", &self.after.is_some())
            .finish()
    }
}

const fn fatal(version: i64, statements: &'static [&'static str]) -> Migration {
    Migration {
        version,
        statements,
        backup: false,
        on_failure: FailurePolicy::Fatal,
        after: None,
    }
}

const fn tolerated(version: i64, statements: &'static [&'static str]) -> Migration {
    Migration {
        version,
        statements,
        backup: true,
        on_failure: FailurePolicy::Tolerated,
        after: None,
    }
}

const MIGRATIONS: &[Migration] = &[
    fatal(
        2,
        &[
            "CREATE TABLE Systems (id INTEGER PRIMARY KEY AUTOINCREMENT NOT NULL UNIQUE, name TEXT NOT NULL COLLATE NOCASE, x FLOAT, y FLOAT, z FLOAT, cr INTEGER, commandercreate TEXT, createdate DATETIME, commanderupdate TEXT, updatedate DATETIME, status INTEGER, population INTEGER)",
            "CREATE INDEX main.SystemsIndex ON Systems (name ASC)",
            "CREATE TABLE Distances (id INTEGER PRIMARY KEY AUTOINCREMENT NOT NULL UNIQUE, NameA TEXT NOT NULL, NameB TEXT NOT NULL, Dist FLOAT NOT NULL, CommanderCreate TEXT NOT NULL, CreateTime DATETIME NOT NULL, Status INTEGER NOT NULL)",
            "CREATE TABLE SystemNote (id INTEGER PRIMARY KEY AUTOINCREMENT NOT NULL UNIQUE, Name TEXT NOT NULL, Time DATETIME NOT NULL)",
            "CREATE INDEX DistanceName ON Distances (NameA ASC, NameB ASC)",
            "CREATE TABLE VisitedSystems (id INTEGER PRIMARY KEY AUTOINCREMENT NOT NULL UNIQUE, Name TEXT NOT NULL, Time DATETIME NOT NULL, SystemID INTEGER, Dist FLOAT)",
            "CREATE TABLE Stations (station_id INTEGER PRIMARY KEY NOT NULL, system_id INTEGER REFERENCES Systems(id), name TEXT NOT NULL, blackmarket BOOL DEFAULT (null), max_landing_pad_size INTEGER, distance_to_star INTEGER, type TEXT, faction TEXT, shipyard BOOL, outfitting BOOL, commodities_market BOOL)",
            "CREATE INDEX stationIndex ON Stations (system_id ASC)",
        ],
    ),
    fatal(3, &["ALTER TABLE Systems ADD COLUMN Note TEXT"]),
    tolerated(4, &["ALTER TABLE SystemNote ADD COLUMN Note TEXT"]),
    tolerated(
        5,
        &[
            "ALTER TABLE VisitedSystems ADD COLUMN Unit TEXT",
            "ALTER TABLE VisitedSystems ADD COLUMN Commander Integer",
            "CREATE INDEX VisitedSystemIndex ON VisitedSystems (Name ASC, Time ASC)",
        ],
    ),
    tolerated(
        6,
        &[
            "ALTER TABLE Systems ADD COLUMN id_eddb Integer",
            "ALTER TABLE Systems ADD COLUMN faction TEXT",
            "ALTER TABLE Systems ADD COLUMN government_id Integer",
            "ALTER TABLE Systems ADD COLUMN allegiance_id Integer",
            "ALTER TABLE Systems ADD COLUMN primary_economy_id Integer",
            "ALTER TABLE Systems ADD COLUMN security Integer",
            "ALTER TABLE Systems ADD COLUMN eddb_updated_at Integer",
            "ALTER TABLE Systems ADD COLUMN state Integer",
            "ALTER TABLE Systems ADD COLUMN needs_permit Integer",
            "DROP TABLE Stations",
            "CREATE TABLE Stations (id INTEGER PRIMARY KEY NOT NULL, system_id INTEGER, name TEXT NOT NULL, max_landing_pad_size INTEGER, distance_to_star INTEGER, faction Text, government_id INTEGER, allegiance_id Integer, state_id INTEGER, type_id Integer, has_commodities BOOL DEFAULT (null), has_refuel BOOL DEFAULT (null), has_repair BOOL DEFAULT (null), has_rearm BOOL DEFAULT (null), has_outfitting BOOL DEFAULT (null), has_shipyard BOOL DEFAULT (null), has_blackmarket BOOL DEFAULT (null), eddb_updated_at Integer)",
            "CREATE TABLE station_commodities (station_id INTEGER PRIMARY KEY NOT NULL, commodity_id INTEGER, type INTEGER)",
            "CREATE INDEX station_commodities_index ON station_commodities (station_id ASC, commodity_id ASC, type ASC)",
            "CREATE INDEX StationsIndex_ID ON Stations (id ASC)",
            "CREATE INDEX StationsIndex_system_ID ON Stations (system_id ASC)",
            "CREATE INDEX StationsIndex_system_Name ON Stations (Name ASC)",
        ],
    ),
    tolerated(
        7,
        &[
            "DROP TABLE VisitedSystems",
            "CREATE TABLE VisitedSystems (id INTEGER PRIMARY KEY NOT NULL, Name TEXT NOT NULL, Time DATETIME NOT NULL, Unit Text, Commander Integer, Source Integer, edsm_sync BOOL DEFAULT (null))",
            "CREATE TABLE TravelLogUnit (id INTEGER PRIMARY KEY NOT NULL, type INTEGER NOT NULL, name TEXT NOT NULL, size INTEGER, path TEXT)",
        ],
    ),
    tolerated(
        8,
        &["ALTER TABLE VisitedSystems ADD COLUMN Map_colour INTEGER DEFAULT (-65536)"],
    ),
    tolerated(
        9,
        &["CREATE TABLE Objects (id INTEGER PRIMARY KEY AUTOINCREMENT NOT NULL UNIQUE, SystemName TEXT NOT NULL, ObjectName TEXT NOT NULL, ObjectType INTEGER NOT NULL, ArrivalPoint Float, Gravity FLOAT, Atmosphere Integer, Vulcanism Integer, Terrain INTEGER, Carbon BOOL, Iron BOOL, Nickel BOOL, Phosphorus BOOL, Sulphur BOOL, Arsenic BOOL, Chromium BOOL, Germanium BOOL, Manganese BOOL, Selenium BOOL NOT NULL, Vanadium BOOL, Zinc BOOL, Zirconium BOOL, Cadmium BOOL, Mercury BOOL, Molybdenum BOOL, Niobium BOOL, Tin BOOL, Tungsten BOOL, Antimony BOOL, Polonium BOOL, Ruthenium BOOL, Technetium BOOL, Tellurium BOOL, Yttrium BOOL, Commander Text, UpdateTime DATETIME, Status INTEGER)"],
    ),
    tolerated(
        10,
        &["CREATE TABLE wanted_systems (id INTEGER PRIMARY KEY AUTOINCREMENT NOT NULL, systemname TEXT UNIQUE NOT NULL)"],
    ),
    tolerated(
        11,
        &[
            "ALTER TABLE Systems ADD COLUMN FirstDiscovery BOOL",
            "ALTER TABLE Objects ADD COLUMN Landed BOOL",
            "ALTER TABLE Objects ADD COLUMN terraform Integer",
            "ALTER TABLE VisitedSystems ADD COLUMN Status BOOL",
        ],
    ),
    tolerated(
        12,
        &[
            "CREATE TABLE routes_expeditions (id INTEGER PRIMARY KEY AUTOINCREMENT NOT NULL, name TEXT UNIQUE NOT NULL, start DATETIME, end DATETIME)",
            "CREATE TABLE route_systems (id INTEGER PRIMARY KEY AUTOINCREMENT NOT NULL, routeid INTEGER NOT NULL, systemname TEXT NOT NULL)",
        ],
    ),
    // Version 13 was retired after two branches both claimed it; kept as a
    // no-op so the marker still moves one step at a time.
    Migration {
        version: 13,
        statements: &[],
        backup: false,
        on_failure: FailurePolicy::Tolerated,
        after: None,
    },
    tolerated(
        14,
        &[
            "ALTER TABLE VisitedSystems ADD COLUMN X double",
            "ALTER TABLE VisitedSystems ADD COLUMN Y double",
            "ALTER TABLE VisitedSystems ADD COLUMN Z double",
        ],
    ),
    tolerated(
        15,
        &[
            "ALTER TABLE Systems ADD COLUMN versiondate DATETIME",
            "UPDATE Systems SET versiondate = datetime('now')",
            "CREATE INDEX IDX_Systems_versiondate ON Systems (versiondate ASC)",
        ],
    ),
    tolerated(
        16,
        &["CREATE TABLE Bookmarks (id INTEGER PRIMARY KEY AUTOINCREMENT NOT NULL UNIQUE, StarName TEXT, x double NOT NULL, y double NOT NULL, z double NOT NULL, Time DATETIME NOT NULL, Heading TEXT, Note TEXT NOT Null)"],
    ),
    Migration {
        after: Some(reset_sync_timestamps),
        ..tolerated(
            17,
            &[
                "ALTER TABLE Systems ADD COLUMN id_edsm Integer",
                "CREATE INDEX Systems_EDSM_ID_Index ON Systems (id_edsm ASC)",
                "CREATE INDEX Systems_EDDB_ID_Index ON Systems (id_eddb ASC)",
                "ALTER TABLE Distances ADD COLUMN id_edsm Integer",
                "CREATE INDEX Distances_EDSM_ID_Index ON Distances (id_edsm ASC)",
                "UPDATE VisitedSystems SET x = null, y = null, z = null WHERE x = 0 AND y = 0 AND z = 0 AND name != 'Sol'",
            ],
        )
    },
    tolerated(
        18,
        &[
            "ALTER TABLE VisitedSystems ADD COLUMN id_edsm_assigned Integer",
            "CREATE INDEX VisitedSystems_id_edsm_assigned ON VisitedSystems (id_edsm_assigned)",
            "CREATE INDEX VisitedSystems_position ON VisitedSystems (X, Y, Z)",
            "CREATE INDEX Systems_position ON Systems (X, Y, Z)",
        ],
    ),
    tolerated(
        19,
        &[
            "CREATE TABLE SystemAliases (id INTEGER PRIMARY KEY AUTOINCREMENT NOT NULL, name TEXT, id_edsm INTEGER, id_edsm_mergedto INTEGER)",
            "CREATE INDEX SystemAliases_name ON SystemAliases (name)",
            "CREATE UNIQUE INDEX SystemAliases_id_edsm ON SystemAliases (id_edsm)",
            "CREATE INDEX SystemAliases_id_edsm_mergedto ON SystemAliases (id_edsm_mergedto)",
        ],
    ),
];

/// Forces the star-system, reference-data and distance syncs to start over.
fn reset_sync_timestamps(settings: &dyn SettingsStore) -> DbResult<()> {
    settings.put_string("EDSMLastSystems", "2010 - 01 - 01 00:00:00")?;
    settings.put_string("EDDBSystemsTime", "0")?;
    settings.put_string("EDSCLastDist", "2010-01-01 00:00:00")?;
    Ok(())
}

/// Every known step, in ascending version order.
pub fn migrations() -> &'static [Migration] {
    MIGRATIONS
}

/// Returns the latest migration version known by this binary.
pub fn latest_version() -> i64 {
    MIGRATIONS
        .last()
        .map_or(BASE_VERSION, |migration| migration.version)
}

/// Where backups go and how backup failures are handled.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MigrationOptions {
    /// Directory for `EDDiscovery{n}.sqlite` copies; `None` disables backups.
    pub backup_dir: Option<PathBuf>,
    pub backup_failure: BackupFailurePolicy,
}

/// A tolerated step that failed but still advanced the version.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToleratedFailure {
    pub version: i64,
    pub error: String,
}

/// Outcome of one migration run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MigrationReport {
    pub from: i64,
    pub to: i64,
    pub applied: Vec<i64>,
    pub tolerated: Vec<ToleratedFailure>,
    pub backups: Vec<PathBuf>,
}

impl MigrationReport {
    pub fn is_noop(&self) -> bool {
        self.applied.is_empty()
    }
}

/// Reads the persisted schema version, defaulting to [`BASE_VERSION`].
pub fn current_version(conn: &StoreConnection) -> i64 {
    conn.settings().get_int(VERSION_KEY, BASE_VERSION)
}

/// Brings the store on `conn` up to [`latest_version`].
///
/// # Errors
/// - [`DbError::UnsupportedSchemaVersion`] when the store is newer than this binary.
/// - [`DbError::Migration`] when a fatal step fails.
/// - [`DbError::Backup`] when a backup fails under [`BackupFailurePolicy::Abort`].
pub fn apply_migrations(
    conn: &mut StoreConnection,
    options: &MigrationOptions,
) -> DbResult<MigrationReport> {
    migrate_to(conn, latest_version(), options)
}

/// Applies pending steps up to and including `target`.
pub fn migrate_to(
    conn: &mut StoreConnection,
    target: i64,
    options: &MigrationOptions,
) -> DbResult<MigrationReport> {
    let steps = MIGRATIONS
        .iter()
        .take_while(|migration| migration.version <= target)
        .copied()
        .collect::<Vec<_>>();
    apply_steps(conn, &steps, options)
}

/// Generic driver: applies every step in `steps` newer than the stored version.
///
/// `steps` must be in ascending version order.
pub fn apply_steps(
    conn: &mut StoreConnection,
    steps: &[Migration],
    options: &MigrationOptions,
) -> DbResult<MigrationReport> {
    conn.settings().ensure_table()?;

    let from = current_version(conn);
    let latest_supported = steps
        .last()
        .map_or(BASE_VERSION, |step| step.version)
        .max(latest_version());
    if from > latest_supported {
        error!(
            "event=db_migrate module=db status=error error_code=unsupported_schema_version db_version={from} latest_supported={latest_supported}"
        );
        return Err(DbError::UnsupportedSchemaVersion {
            db_version: from,
            latest_supported,
        });
    }

    let mut report = MigrationReport {
        from,
        to: from,
        ..MigrationReport::default()
    };

    for step in steps.iter().filter(|step| step.version > from) {
        let started_at = Instant::now();
        if step.backup {
            if let Some(path) = backup_before(conn, step, options)? {
                report.backups.push(path);
            }
        }

        if let Some(err) = apply_step(conn, step)? {
            report.tolerated.push(ToleratedFailure {
                version: step.version,
                error: err.to_string(),
            });
        }
        report.applied.push(step.version);
        report.to = step.version;
        info!(
            "event=db_migrate module=db status=ok version={} statements={} duration_ms={}",
            step.version,
            step.statements.len(),
            started_at.elapsed().as_millis()
        );
    }

    Ok(report)
}

/// Runs one step in its own transaction.
///
/// Returns the swallowed error for a tolerated failure.
fn apply_step(conn: &mut StoreConnection, step: &Migration) -> DbResult<Option<DbError>> {
    let txn = conn.begin().map_err(|source| DbError::Migration {
        version: step.version,
        source: Box::new(source),
    })?;

    let outcome = run_step_body(&txn, step);
    if txn.is_autocommit() {
        // The engine already rolled the step back; the marker must not move alone.
        let source = outcome.err().unwrap_or(DbError::TransactionAborted);
        error!(
            "event=db_migrate module=db status=error version={} error_code=transaction_aborted error={}",
            step.version, source
        );
        return Err(DbError::Migration {
            version: step.version,
            source: Box::new(source),
        });
    }

    let tolerated = match outcome {
        Ok(()) => None,
        Err(err) if step.on_failure == FailurePolicy::Tolerated => {
            warn!(
                "event=db_migrate module=db status=tolerated version={} error={}",
                step.version, err
            );
            Some(err)
        }
        Err(err) => {
            error!(
                "event=db_migrate module=db status=error version={} error_code=migration_step_failed error={}",
                step.version, err
            );
            if let Err(rollback_err) = txn.rollback() {
                warn!(
                    "event=db_migrate module=db status=error version={} error_code=rollback_failed error={}",
                    step.version, rollback_err
                );
            }
            return Err(DbError::Migration {
                version: step.version,
                source: Box::new(err),
            });
        }
    };

    let marked = SqliteSettingsStore::new(&txn).put_int(VERSION_KEY, step.version);
    marked
        .and_then(|()| txn.commit())
        .map_err(|source| DbError::Migration {
            version: step.version,
            source: Box::new(source),
        })?;
    Ok(tolerated)
}

fn run_step_body(txn: &TransactionGuard<'_>, step: &Migration) -> DbResult<()> {
    for sql in step.statements {
        txn.command(sql).execute_batch()?;
        if txn.is_autocommit() {
            return Err(DbError::TransactionAborted);
        }
    }
    if let Some(hook) = step.after {
        hook(&SqliteSettingsStore::new(txn))?;
    }
    Ok(())
}

/// Copies the main store file aside before `step` runs.
///
/// Existing backups are left untouched.
fn backup_before(
    conn: &StoreConnection,
    step: &Migration,
    options: &MigrationOptions,
) -> DbResult<Option<PathBuf>> {
    let Some(dir) = options.backup_dir.as_ref() else {
        return Ok(None);
    };
    let path = dir.join(format!("{BACKUP_FILE_PREFIX}{}.sqlite", step.version - 1));
    if path.exists() {
        return Ok(None);
    }

    match conn
        .connection()
        .backup(DatabaseName::Main, &path, None)
    {
        Ok(()) => {
            info!(
                "event=db_backup module=db status=ok version={} path={}",
                step.version,
                path.display()
            );
            Ok(Some(path))
        }
        Err(err) => match options.backup_failure {
            BackupFailurePolicy::Continue => {
                warn!(
                    "event=db_backup module=db status=error version={} path={} error={}",
                    step.version,
                    path.display(),
                    err
                );
                Ok(None)
            }
            BackupFailurePolicy::Abort => {
                error!(
                    "event=db_backup module=db status=error version={} path={} error_code=backup_failed error={}",
                    step.version,
                    path.display(),
                    err
                );
                Err(DbError::Backup {
                    version: step.version,
                    path,
                    source: Box::new(DbError::Sqlite(err)),
                })
            }
        },
    }
}
