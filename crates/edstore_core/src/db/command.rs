//! Single-statement execution behind the write lock.
//!
//! # Responsibility
//! - Run one SQL statement either inside a [`TransactionGuard`] or behind a
//!   lock taken for just that statement.
//! - Return tabular or scalar results for read queries.
//!
//! # Invariants
//! - A write never runs without the write lock held by the calling thread.
//! - A command only joins a transaction opened on its own connection.
//! - A per-statement write refuses to run inside, or leave open, a transaction
//!   that no [`TransactionGuard`] owns.

use super::lock::{LockBroker, WriteLock};
use super::transaction::TransactionGuard;
use super::{DbError, DbResult};
use log::{error, warn};
use rusqlite::types::Value;
use rusqlite::{Connection, Params, Row};

/// Source of commands: a plain connection (locks per statement) or a
/// transaction (lock already held).
pub trait Executor {
    fn command(&self, sql: &str) -> Command<'_>;
}

#[derive(Clone, Copy)]
enum LockScope<'a> {
    /// Take the broker for the duration of each write.
    PerStatement(&'a LockBroker),
    /// The enclosing transaction already owns the lock.
    Transaction,
}

/// One statement bound to a connection and a locking scope.
pub struct Command<'a> {
    conn: &'a Connection,
    sql: String,
    scope: LockScope<'a>,
}

impl<'a> Command<'a> {
    /// Creates a command that takes `broker` for each write it performs.
    pub fn new(conn: &'a Connection, broker: &'a LockBroker, sql: impl Into<String>) -> Self {
        Self {
            conn,
            sql: sql.into(),
            scope: LockScope::PerStatement(broker),
        }
    }

    pub(crate) fn attached(conn: &'a Connection, sql: impl Into<String>) -> Self {
        Self {
            conn,
            sql: sql.into(),
            scope: LockScope::Transaction,
        }
    }

    /// Moves this command into `txn`.
    ///
    /// # Errors
    /// - [`DbError::ForeignTransaction`] when `txn` was opened on a different
    ///   connection; running there would write without the lock.
    pub fn in_transaction<'t>(self, txn: &'t TransactionGuard<'_>) -> DbResult<Command<'t>>
    where
        'a: 't,
    {
        if !std::ptr::eq(self.conn, txn.connection()) {
            error!("event=db_command module=db status=error error_code=foreign_transaction");
            return Err(DbError::ForeignTransaction);
        }
        Ok(Command {
            conn: txn.connection(),
            sql: self.sql,
            scope: LockScope::Transaction,
        })
    }

    pub fn sql(&self) -> &str {
        &self.sql
    }

    pub fn is_transactional(&self) -> bool {
        matches!(self.scope, LockScope::Transaction)
    }

    /// Runs a write statement and returns the number of changed rows.
    ///
    /// # Errors
    /// - [`DbError::ForeignTransaction`] when the connection is inside a
    ///   transaction not opened through [`TransactionGuard`], or the statement
    ///   itself opens one.
    pub fn execute<P: Params>(&self, params: P) -> DbResult<usize> {
        let lock = self.write_lock()?;
        let result = self
            .conn
            .execute(&self.sql, params)
            .map_err(|err| log_failure("execute", err));
        self.finish_write(lock)?;
        result
    }

    /// Runs one or more parameterless statements (DDL, pragmas).
    pub fn execute_batch(&self) -> DbResult<()> {
        let lock = self.write_lock()?;
        let result = self
            .conn
            .execute_batch(&self.sql)
            .map_err(|err| log_failure("execute_batch", err));
        self.finish_write(lock)?;
        result
    }

    /// Runs a read query and returns every row as dynamically typed values.
    pub fn query_table<P: Params>(&self, params: P) -> DbResult<QueryTable> {
        self.read_table(params)
            .map_err(|err| log_failure("query_table", err))
    }

    /// Returns the first column of the first row.
    ///
    /// `None` when the query yields no row or the value is SQL `NULL`.
    pub fn query_scalar<P: Params>(&self, params: P) -> DbResult<Option<Value>> {
        self.read_scalar(params)
            .map_err(|err| log_failure("query_scalar", err))
    }

    /// Runs a read query and maps each row with `map`.
    pub fn query_map<T, P, F>(&self, params: P, mut map: F) -> DbResult<Vec<T>>
    where
        P: Params,
        F: FnMut(&Row<'_>) -> rusqlite::Result<T>,
    {
        self.read_map(params, &mut map)
            .map_err(|err| log_failure("query_map", err))
    }

    /// Takes the lock for one write statement.
    ///
    /// `None` when the calling thread already owns the lock, either through a
    /// joined transaction or an outer guard.
    fn write_lock(&self) -> DbResult<Option<WriteLock<'a>>> {
        let LockScope::PerStatement(broker) = self.scope else {
            return Ok(None);
        };
        if broker.is_held_by_current_thread() {
            return Ok(None);
        }
        if !self.conn.is_autocommit() {
            error!("event=db_command module=db status=error error_code=foreign_transaction reason=open_transaction");
            return Err(DbError::ForeignTransaction);
        }
        Ok(Some(broker.acquire()))
    }

    /// Rolls back a transaction the statement left open, then releases `lock`.
    fn finish_write(&self, lock: Option<WriteLock<'a>>) -> DbResult<()> {
        let Some(lock) = lock else {
            return Ok(());
        };
        if self.conn.is_autocommit() {
            return Ok(());
        }
        if let Err(err) = self.conn.execute_batch("ROLLBACK;") {
            warn!("event=db_command module=db status=error error_code=rollback_failed error={err}");
        }
        lock.release();
        error!("event=db_command module=db status=error error_code=foreign_transaction reason=statement_opened_transaction");
        Err(DbError::ForeignTransaction)
    }

    fn read_table<P: Params>(&self, params: P) -> rusqlite::Result<QueryTable> {
        let mut stmt = self.conn.prepare(&self.sql)?;
        let columns = stmt
            .column_names()
            .into_iter()
            .map(str::to_string)
            .collect::<Vec<_>>();
        let width = columns.len();

        let mut rows = stmt.query(params)?;
        let mut table = QueryTable {
            columns,
            rows: Vec::new(),
        };
        while let Some(row) = rows.next()? {
            let mut values = Vec::with_capacity(width);
            for index in 0..width {
                values.push(row.get::<_, Value>(index)?);
            }
            table.rows.push(values);
        }
        Ok(table)
    }

    fn read_map<T, P, F>(&self, params: P, map: &mut F) -> rusqlite::Result<Vec<T>>
    where
        P: Params,
        F: FnMut(&Row<'_>) -> rusqlite::Result<T>,
    {
        let mut stmt = self.conn.prepare(&self.sql)?;
        let mut rows = stmt.query(params)?;
        let mut mapped = Vec::new();
        while let Some(row) = rows.next()? {
            mapped.push(map(row)?);
        }
        Ok(mapped)
    }

    fn read_scalar<P: Params>(&self, params: P) -> rusqlite::Result<Option<Value>> {
        let mut stmt = self.conn.prepare(&self.sql)?;
        let mut rows = stmt.query(params)?;
        match rows.next()? {
            Some(row) => match row.get::<_, Value>(0)? {
                Value::Null => Ok(None),
                value => Ok(Some(value)),
            },
            None => Ok(None),
        }
    }
}

fn log_failure(op: &str, err: rusqlite::Error) -> DbError {
    error!("event=db_query module=db status=error op={op} error={err}");
    DbError::Sqlite(err)
}

/// Rows returned by [`Command::query_table`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueryTable {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<Value>>,
}

impl QueryTable {
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Position of `name` among the result columns (case-insensitive).
    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns
            .iter()
            .position(|column| column.eq_ignore_ascii_case(name))
    }

    /// Value of column `name` in row `row`.
    pub fn value(&self, row: usize, name: &str) -> Option<&Value> {
        let index = self.column_index(name)?;
        self.rows.get(row)?.get(index)
    }
}
