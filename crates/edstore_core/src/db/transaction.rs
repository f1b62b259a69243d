//! Write transactions bound to the process-wide lock.
//!
//! # Invariants
//! - The lock is acquired before `BEGIN` and released after the transaction
//!   handle is finished (committed or rolled back).
//! - Dropping an uncommitted guard rolls back, then releases the lock.

use super::command::{Command, Executor};
use super::lock::{LockBroker, WriteLock};
use super::{DbError, DbResult};
use rusqlite::{Connection, Transaction, TransactionBehavior};
use std::ops::Deref;

/// One logical write transaction holding the write lock for its whole lifetime.
pub struct TransactionGuard<'c> {
    // Field order matters: `tx` drops (rolls back) before `lock` releases.
    tx: Transaction<'c>,
    lock: WriteLock<'c>,
}

impl<'c> TransactionGuard<'c> {
    pub(crate) fn begin(conn: &'c mut Connection, broker: &'c LockBroker) -> DbResult<Self> {
        let lock = broker.acquire();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        Ok(Self { tx, lock })
    }

    /// Commits the transaction, then releases the write lock.
    pub fn commit(self) -> DbResult<()> {
        let Self { tx, lock } = self;
        let result = tx.commit();
        lock.release();
        result.map_err(DbError::from)
    }

    /// Rolls the transaction back, then releases the write lock.
    pub fn rollback(self) -> DbResult<()> {
        let Self { tx, lock } = self;
        let result = tx.rollback();
        lock.release();
        result.map_err(DbError::from)
    }

    pub fn connection(&self) -> &Connection {
        &self.tx
    }
}

impl Deref for TransactionGuard<'_> {
    type Target = Connection;

    fn deref(&self) -> &Self::Target {
        &self.tx
    }
}

impl Executor for TransactionGuard<'_> {
    fn command(&self, sql: &str) -> Command<'_> {
        Command::attached(self.connection(), sql)
    }
}
