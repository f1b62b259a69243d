use edstore_core::db::{global, init_global, Command};
use edstore_core::{
    ConnectionFactory, DbError, DbSelection, Executor, LockBroker, StoreConfig,
};
use rusqlite::types::Value;
use std::sync::Arc;
use std::time::Duration;

fn factory(dir: &tempfile::TempDir, pool_size: u32) -> ConnectionFactory {
    ConnectionFactory::with_lock_broker(
        StoreConfig::new(dir.path()).with_pool_size(pool_size),
        Arc::new(LockBroker::new()),
    )
}

fn count(conn: &edstore_core::StoreConnection, sql: &str) -> i64 {
    match conn.command(sql).query_scalar([]).unwrap() {
        Some(Value::Integer(value)) => value,
        other => panic!("unexpected scalar: {other:?}"),
    }
}

#[test]
fn attach_is_idempotent() {
    let dir = tempfile::tempdir().unwrap();
    let factory = factory(&dir, 2);
    let mut conn = factory
        .open(DbSelection::PRIMARY, DbSelection::USER | DbSelection::SYSTEM)
        .unwrap();

    assert_eq!(conn.attach(DbSelection::USER).unwrap(), 0);
    assert_eq!(conn.attach(DbSelection::USER | DbSelection::SYSTEM).unwrap(), 0);

    let names = conn.schema_names().unwrap();
    assert_eq!(names.iter().filter(|name| *name == "EDDUser").count(), 1);
    assert_eq!(names.iter().filter(|name| *name == "EDDSystem").count(), 1);
    assert!(dir.path().join("EDDUser.sqlite").exists());
    assert!(dir.path().join("EDDSystem.sqlite").exists());
}

#[test]
fn attached_schema_is_writable_under_its_name() {
    let dir = tempfile::tempdir().unwrap();
    let factory = factory(&dir, 2);
    let conn = factory
        .open(DbSelection::PRIMARY, DbSelection::USER)
        .unwrap();

    conn.command("CREATE TABLE IF NOT EXISTS EDDUser.notes (body TEXT)")
        .execute_batch()
        .unwrap();
    conn.command("INSERT INTO EDDUser.notes (body) VALUES (?1)")
        .execute(["hello"])
        .unwrap();

    assert_eq!(count(&conn, "SELECT COUNT(*) FROM EDDUser.notes"), 1);
}

#[test]
fn pooled_connection_is_detached_before_reuse() {
    let dir = tempfile::tempdir().unwrap();
    let factory = factory(&dir, 1);

    let first = factory
        .open(DbSelection::PRIMARY, DbSelection::USER)
        .unwrap();
    assert!(first.is_pooled());
    assert!(first.schema_names().unwrap().contains(&"EDDUser".to_string()));
    drop(first);

    let second = factory.open_primary().unwrap();
    assert!(!second.schema_names().unwrap().contains(&"EDDUser".to_string()));
}

#[test]
fn empty_selection_opens_private_memory_database() {
    let dir = tempfile::tempdir().unwrap();
    let factory = factory(&dir, 2);

    let first = factory.open(DbSelection::NONE, DbSelection::NONE).unwrap();
    let second = factory.open(DbSelection::NONE, DbSelection::NONE).unwrap();
    assert!(!first.is_pooled());
    assert_eq!(first.main(), DbSelection::NONE);

    first
        .command("CREATE TABLE scratch (id INTEGER)")
        .execute_batch()
        .unwrap();
    assert_eq!(
        count(&second, "SELECT COUNT(*) FROM sqlite_master WHERE name = 'scratch'"),
        0
    );
}

#[test]
fn open_initializes_primary_store_once() {
    let dir = tempfile::tempdir().unwrap();
    let factory = factory(&dir, 2);
    assert!(factory.migration_report().is_none());

    let conn = factory.open(DbSelection::USER, DbSelection::NONE).unwrap();
    assert_eq!(conn.main(), DbSelection::USER);
    assert!(dir.path().join("EDDiscovery.sqlite").exists());
    let first = factory.migration_report().unwrap();
    assert_eq!(first.to, 19);

    drop(conn);
    factory.open_primary().unwrap();
    assert_eq!(factory.migration_report().unwrap(), first);
}

#[test]
fn concurrent_first_opens_migrate_once() {
    let dir = tempfile::tempdir().unwrap();
    let factory = factory(&dir, 4);

    std::thread::scope(|scope| {
        for _ in 0..4 {
            let factory = factory.clone();
            scope.spawn(move || {
                let conn = factory.open_primary().unwrap();
                assert_eq!(edstore_core::db::migrations::current_version(&conn), 19);
            });
        }
    });

    let report = factory.migration_report().unwrap();
    assert_eq!(report.applied.len(), 18);
}

#[test]
fn transaction_commit_and_rollback() {
    let dir = tempfile::tempdir().unwrap();
    let factory = factory(&dir, 2);
    let mut conn = factory.open_primary().unwrap();

    let txn = conn.begin().unwrap();
    assert!(factory.lock_broker().is_held());
    txn.command("INSERT INTO Bookmarks (x, y, z, Time, Note) VALUES (1, 2, 3, datetime('now'), 'kept')")
        .execute([])
        .unwrap();
    txn.commit().unwrap();
    assert!(!factory.lock_broker().is_held());

    {
        let txn = conn.begin().unwrap();
        txn.command("INSERT INTO Bookmarks (x, y, z, Time, Note) VALUES (4, 5, 6, datetime('now'), 'dropped')")
            .execute([])
            .unwrap();
    }
    assert!(!factory.lock_broker().is_held());

    let txn = conn.begin().unwrap();
    txn.command("DELETE FROM Bookmarks").execute([]).unwrap();
    txn.rollback().unwrap();

    assert_eq!(count(&conn, "SELECT COUNT(*) FROM Bookmarks"), 1);
}

#[test]
fn failed_transaction_still_releases_the_lock() {
    let dir = tempfile::tempdir().unwrap();
    let factory = factory(&dir, 2);
    let mut conn = factory.open_primary().unwrap();

    let result = (|| -> edstore_core::DbResult<()> {
        let txn = conn.begin()?;
        txn.command("INSERT INTO Systems (name) VALUES ('Achenar')")
            .execute([])?;
        txn.command("INSERT INTO Systems (no_such_column) VALUES (1)")
            .execute([])?;
        txn.commit()
    })();

    assert!(result.is_err());
    assert!(!factory.lock_broker().is_held());
    assert_eq!(count(&conn, "SELECT COUNT(*) FROM Systems"), 0);
}

#[test]
fn command_rejects_transaction_of_another_connection() {
    let dir = tempfile::tempdir().unwrap();
    let factory = factory(&dir, 2);
    let mut owner = factory.open(DbSelection::NONE, DbSelection::NONE).unwrap();
    let other = factory.open(DbSelection::NONE, DbSelection::NONE).unwrap();

    let txn = owner.begin().unwrap();
    let err = other
        .command("CREATE TABLE sneaky (id INTEGER)")
        .in_transaction(&txn)
        .err()
        .unwrap();
    assert!(matches!(err, DbError::ForeignTransaction));

    let joined = Command::new(txn.connection(), factory.lock_broker(), "CREATE TABLE joined (id INTEGER)")
        .in_transaction(&txn)
        .unwrap();
    assert!(joined.is_transactional());
    joined.execute_batch().unwrap();
    txn.commit().unwrap();

    assert_eq!(
        count(&owner, "SELECT COUNT(*) FROM sqlite_master WHERE name = 'joined'"),
        1
    );
}

#[test]
fn command_cannot_leave_an_unguarded_transaction_open() {
    let dir = tempfile::tempdir().unwrap();
    let factory = factory(&dir, 2);
    let conn = factory.open_primary().unwrap();

    let err = conn
        .command("BEGIN; INSERT INTO Bookmarks (x, y, z, Time, Note) VALUES (1, 2, 3, datetime('now'), 'unguarded');")
        .execute_batch()
        .unwrap_err();
    assert!(matches!(err, DbError::ForeignTransaction));
    assert!(!factory.lock_broker().is_held());
    assert_eq!(count(&conn, "SELECT COUNT(*) FROM Bookmarks"), 0);

    conn.command("INSERT INTO Bookmarks (x, y, z, Time, Note) VALUES (1, 2, 3, datetime('now'), 'guarded')")
        .execute([])
        .unwrap();
    assert_eq!(count(&conn, "SELECT COUNT(*) FROM Bookmarks"), 1);
}

#[test]
fn exhausted_pool_times_out() {
    let dir = tempfile::tempdir().unwrap();
    let factory = ConnectionFactory::with_lock_broker(
        StoreConfig::new(dir.path())
            .with_pool_size(1)
            .with_pool_connection_timeout(Duration::from_millis(100)),
        Arc::new(LockBroker::new()),
    );

    let held = factory.open_primary().unwrap();
    let err = factory.open_primary().err().unwrap();
    assert!(matches!(err, DbError::Pool(_)));

    drop(held);
    assert!(factory.open_primary().is_ok());
}

#[test]
fn global_factory_is_installed_once() {
    let dir = tempfile::tempdir().unwrap();

    assert!(matches!(global(), Err(DbError::GlobalNotInitialized)));
    let installed = init_global(StoreConfig::new(dir.path())).unwrap();
    assert_eq!(installed.config().data_dir(), dir.path());
    assert!(matches!(
        init_global(StoreConfig::new(dir.path())),
        Err(DbError::GlobalAlreadyInitialized)
    ));
    assert!(global().is_ok());
}
