//! Typed key/value settings over the `Register` table.
//!
//! # Responsibility
//! - Read and write string-keyed settings of integer, real, boolean, text and
//!   binary type.
//! - Persist the schema version marker for the migration engine.
//!
//! # Invariants
//! - Reads never fail: absent keys, `NULL` values and read errors all yield the
//!   caller's default.
//! - A write populates exactly one value column and clears the others.
//! - Writes are a single atomic upsert issued through the write lock.

use crate::db::{DbResult, Executor};
use log::debug;
use rusqlite::types::Value;

/// DDL for the settings table; safe to run on every startup.
pub const REGISTER_TABLE_SQL: &str = "CREATE TABLE IF NOT EXISTS Register (
    ID TEXT PRIMARY KEY NOT NULL UNIQUE,
    \"ValueInt\" INTEGER,
    \"ValueDouble\" DOUBLE,
    \"ValueString\" TEXT,
    \"ValueBlob\" BLOB
);";

const VALUE_COLUMNS: [&str; 4] = ["ValueInt", "ValueDouble", "ValueString", "ValueBlob"];

/// Settings accessor contract used by application code and migrations.
pub trait SettingsStore {
    fn key_exists(&self, key: &str) -> bool;
    fn get_int(&self, key: &str, default: i64) -> i64;
    fn get_double(&self, key: &str, default: f64) -> f64;
    fn get_bool(&self, key: &str, default: bool) -> bool;
    fn get_string(&self, key: &str, default: &str) -> String;
    fn get_blob(&self, key: &str) -> Option<Vec<u8>>;
    fn put_int(&self, key: &str, value: i64) -> DbResult<()>;
    fn put_double(&self, key: &str, value: f64) -> DbResult<()>;
    fn put_bool(&self, key: &str, value: bool) -> DbResult<()>;
    fn put_string(&self, key: &str, value: &str) -> DbResult<()>;
    fn put_blob(&self, key: &str, value: &[u8]) -> DbResult<()>;
}

/// SQLite-backed settings store over a connection or a transaction.
pub struct SqliteSettingsStore<'e> {
    exec: &'e dyn Executor,
}

impl<'e> SqliteSettingsStore<'e> {
    pub fn new(exec: &'e dyn Executor) -> Self {
        Self { exec }
    }

    /// Creates the `Register` table when it does not exist yet.
    pub fn ensure_table(&self) -> DbResult<()> {
        self.exec.command(REGISTER_TABLE_SQL).execute_batch()
    }

    fn read(&self, key: &str, column: &str) -> Option<Value> {
        let sql = format!("SELECT {column} FROM Register WHERE ID = ?1;");
        match self.exec.command(&sql).query_scalar([key]) {
            Ok(value) => value,
            Err(err) => {
                debug!("event=settings_get module=settings status=fallback key={key} error={err}");
                None
            }
        }
    }

    fn upsert(&self, key: &str, column: &str, value: Value) -> DbResult<()> {
        let sql = upsert_sql(column);
        self.exec
            .command(&sql)
            .execute(rusqlite::params![key, value])?;
        Ok(())
    }
}

fn upsert_sql(column: &str) -> String {
    let cleared = VALUE_COLUMNS
        .iter()
        .filter(|other| **other != column)
        .map(|other| format!("{other} = NULL"))
        .collect::<Vec<_>>()
        .join(", ");
    format!(
        "INSERT INTO Register (ID, {column}) VALUES (?1, ?2)
         ON CONFLICT(ID) DO UPDATE SET {column} = excluded.{column}, {cleared};"
    )
}

impl SettingsStore for SqliteSettingsStore<'_> {
    fn key_exists(&self, key: &str) -> bool {
        match self
            .exec
            .command("SELECT EXISTS(SELECT 1 FROM Register WHERE ID = ?1);")
            .query_scalar([key])
        {
            Ok(Some(Value::Integer(found))) => found != 0,
            Ok(_) => false,
            Err(err) => {
                debug!("event=settings_exists module=settings status=fallback key={key} error={err}");
                false
            }
        }
    }

    fn get_int(&self, key: &str, default: i64) -> i64 {
        match self.read(key, "ValueInt") {
            Some(Value::Integer(value)) => value,
            _ => default,
        }
    }

    fn get_double(&self, key: &str, default: f64) -> f64 {
        match self.read(key, "ValueDouble") {
            Some(Value::Real(value)) => value,
            Some(Value::Integer(value)) => value as f64,
            _ => default,
        }
    }

    fn get_bool(&self, key: &str, default: bool) -> bool {
        match self.read(key, "ValueInt") {
            Some(Value::Integer(value)) => value != 0,
            _ => default,
        }
    }

    fn get_string(&self, key: &str, default: &str) -> String {
        match self.read(key, "ValueString") {
            Some(Value::Text(value)) => value,
            _ => default.to_string(),
        }
    }

    fn get_blob(&self, key: &str) -> Option<Vec<u8>> {
        match self.read(key, "ValueBlob") {
            Some(Value::Blob(value)) => Some(value),
            _ => None,
        }
    }

    fn put_int(&self, key: &str, value: i64) -> DbResult<()> {
        self.upsert(key, "ValueInt", Value::Integer(value))
    }

    fn put_double(&self, key: &str, value: f64) -> DbResult<()> {
        self.upsert(key, "ValueDouble", Value::Real(value))
    }

    fn put_bool(&self, key: &str, value: bool) -> DbResult<()> {
        self.upsert(key, "ValueInt", Value::Integer(i64::from(value)))
    }

    fn put_string(&self, key: &str, value: &str) -> DbResult<()> {
        self.upsert(key, "ValueString", Value::Text(value.to_string()))
    }

    fn put_blob(&self, key: &str, value: &[u8]) -> DbResult<()> {
        self.upsert(key, "ValueBlob", Value::Blob(value.to_vec()))
    }
}

#[cfg(test)]
mod tests {
    use super::{upsert_sql, SettingsStore, SqliteSettingsStore};
    use crate::db::{Command, Executor, LockBroker};
    use rusqlite::Connection;

    struct Scratch {
        conn: Connection,
        broker: LockBroker,
    }

    impl Executor for Scratch {
        fn command(&self, sql: &str) -> Command<'_> {
            Command::new(&self.conn, &self.broker, sql)
        }
    }

    fn scratch() -> Scratch {
        let scratch = Scratch {
            conn: Connection::open_in_memory().unwrap(),
            broker: LockBroker::new(),
        };
        SqliteSettingsStore::new(&scratch).ensure_table().unwrap();
        scratch
    }

    #[test]
    fn upsert_sql_clears_every_other_slot() {
        let sql = upsert_sql("ValueDouble");
        assert!(sql.contains("ValueDouble = excluded.ValueDouble"));
        assert!(sql.contains("ValueInt = NULL"));
        assert!(sql.contains("ValueString = NULL"));
        assert!(sql.contains("ValueBlob = NULL"));
        assert!(!sql.contains("ValueDouble = NULL"));
    }

    #[test]
    fn last_writer_decides_the_populated_slot() {
        let scratch = scratch();
        let settings = SqliteSettingsStore::new(&scratch);

        settings.put_int("mixed", 7).unwrap();
        settings.put_string("mixed", "seven").unwrap();

        assert_eq!(settings.get_string("mixed", "none"), "seven");
        assert_eq!(settings.get_int("mixed", -1), -1);

        let populated: i64 = scratch
            .conn
            .query_row(
                "SELECT (ValueInt IS NOT NULL) + (ValueDouble IS NOT NULL)
                      + (ValueString IS NOT NULL) + (ValueBlob IS NOT NULL)
                 FROM Register WHERE ID = 'mixed';",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(populated, 1);
    }

    #[test]
    fn blob_round_trip_and_missing_blob() {
        let scratch = scratch();
        let settings = SqliteSettingsStore::new(&scratch);

        settings.put_blob("layout", &[1, 2, 3]).unwrap();
        assert_eq!(settings.get_blob("layout"), Some(vec![1, 2, 3]));
        assert_eq!(settings.get_blob("absent"), None);
    }

    #[test]
    fn reads_degrade_to_default_without_table() {
        let bare = Scratch {
            conn: Connection::open_in_memory().unwrap(),
            broker: LockBroker::new(),
        };
        let settings = SqliteSettingsStore::new(&bare);

        assert_eq!(settings.get_int("DBVer", 1), 1);
        assert!(!settings.key_exists("DBVer"));
        assert!(settings.put_int("DBVer", 2).is_err());
    }
}
