mod common;

use common::{committed_ids, create_users, ids, insert_committed, open, user};
use granite::failpoint;
use granite::IsolationLevel;
use serial_test::serial;
use tempfile::tempdir;

#[test]
#[serial]
fn committed_insert_survives_a_crash() {
    let dir = tempdir().expect("tempdir");
    let db = open(dir.path());
    create_users(&db);

    let tx = db.begin(IsolationLevel::ReadCommitted).expect("begin");
    db.insert(&tx, "users", user(1, "ada")).expect("insert");
    db.commit(&tx).expect("commit");
    db.crash();

    let db = open(dir.path());
    assert!(db.recovery_stats().redone > 0);
    assert_eq!(db.recovery_stats().undone, 0);
    assert_eq!(committed_ids(&db), vec![1]);
}

#[test]
#[serial]
fn committed_rows_survive_multiple_restarts() {
    let dir = tempdir().expect("tempdir");
    {
        let db = open(dir.path());
        create_users(&db);
        db.crash();
    }
    for round in 0..3 {
        let db = open(dir.path());
        insert_committed(&db, [user(round, &format!("user{round}"))]);
        db.crash();
    }
    let db = open(dir.path());
    assert_eq!(committed_ids(&db), vec![0, 1, 2]);
}

#[test]
#[serial]
fn unfinished_transaction_is_undone_even_after_its_pages_were_written() {
    let dir = tempdir().expect("tempdir");
    let db = open(dir.path());
    create_users(&db);
    insert_committed(&db, [user(1, "ada")]);
    let rid = {
        let tx = db.begin(IsolationLevel::ReadCommitted).expect("begin");
        let records = db.scan(&tx, "users").expect("scan");
        db.commit(&tx).expect("commit");
        records[0].rid.expect("scanned rid")
    };

    let loser = db.begin(IsolationLevel::ReadCommitted).expect("begin");
    db.insert(&loser, "users", user(2, "grace")).expect("insert");
    db.delete(&loser, "users", rid).expect("delete");
    db.flush().expect("write back dirty pages");
    db.crash();

    let db = open(dir.path());
    assert_eq!(db.recovery_stats().undone, 1);
    assert_eq!(committed_ids(&db), vec![1]);
}

#[test]
#[serial]
fn uncommitted_transaction_leaves_nothing_behind() {
    let dir = tempdir().expect("tempdir");
    let db = open(dir.path());
    create_users(&db);
    let tx = db.begin(IsolationLevel::ReadCommitted).expect("begin");
    db.insert(&tx, "users", user(7, "lost")).expect("insert");
    db.crash();

    let db = open(dir.path());
    assert!(committed_ids(&db).is_empty());
}

#[test]
#[serial]
fn rolled_back_transaction_stays_rolled_back_after_crash() {
    let dir = tempdir().expect("tempdir");
    let db = open(dir.path());
    create_users(&db);

    let tx = db.begin(IsolationLevel::ReadCommitted).expect("begin");
    db.insert(&tx, "users", user(1, "undone")).expect("insert");
    db.rollback(&tx).expect("rollback");
    insert_committed(&db, [user(2, "kept")]);
    db.flush().expect("write back dirty pages");
    db.crash();

    let db = open(dir.path());
    assert_eq!(committed_ids(&db), vec![2]);
}

#[test]
#[serial]
fn crash_during_undo_is_recovered_by_the_next_restart() {
    let dir = tempdir().expect("tempdir");
    let db = open(dir.path());
    create_users(&db);
    insert_committed(&db, [user(1, "ada")]);
    let loser = db.begin(IsolationLevel::ReadCommitted).expect("begin");
    db.insert(&loser, "users", user(2, "grace")).expect("insert");
    db.flush().expect("write back dirty pages");
    db.crash();

    failpoint::enable(failpoint::RECOVERY_UNDO);
    let failed = granite::Database::open(common::config(dir.path()));
    failpoint::clear();
    assert!(failed.is_err());
    drop(failed);

    let db = open(dir.path());
    assert_eq!(db.recovery_stats().undone, 1);
    assert_eq!(committed_ids(&db), vec![1]);
}

#[test]
#[serial]
fn recovered_state_is_checkpointed_on_open() {
    let dir = tempdir().expect("tempdir");
    let db = open(dir.path());
    create_users(&db);
    insert_committed(&db, (0..10).map(|i| user(i, "row")));
    db.crash();

    let db = open(dir.path());
    assert!(db.recovery_stats().redone > 0);
    db.crash();

    let db = open(dir.path());
    assert_eq!(db.recovery_stats().redone, 0);
    assert_eq!(db.recovery_stats().undone, 0);
    assert_eq!(committed_ids(&db), (0..10).collect::<Vec<_>>());
}

#[test]
#[serial]
fn table_spanning_many_pages_is_rebuilt() {
    let dir = tempdir().expect("tempdir");
    let db = open(dir.path());
    create_users(&db);
    let name = "x".repeat(400);
    insert_committed(&db, (0..200).map(|i| user(i, &name)));
    db.crash();

    let db = open(dir.path());
    assert_eq!(committed_ids(&db), (0..200).collect::<Vec<_>>());
    insert_committed(&db, [user(200, "after")]);
    assert_eq!(committed_ids(&db).len(), 201);
}

#[test]
#[serial]
fn transaction_ids_keep_increasing_across_restarts() {
    let dir = tempdir().expect("tempdir");
    let db = open(dir.path());
    create_users(&db);
    let tx = db.begin(IsolationLevel::ReadCommitted).expect("begin");
    db.insert(&tx, "users", user(1, "ada")).expect("insert");
    db.commit(&tx).expect("commit");
    let before = tx.xid();
    db.crash();

    let db = open(dir.path());
    let tx = db.begin(IsolationLevel::ReadCommitted).expect("begin");
    assert!(tx.xid() > before);
    db.insert(&tx, "users", user(2, "bob")).expect("insert");
    db.commit(&tx).expect("commit");
    let before = tx.xid();
    drop(db);

    // Two clean opens in a row leave only checkpoint records in the log tail.
    drop(open(dir.path()));
    let db = open(dir.path());
    let tx = db.begin(IsolationLevel::ReadCommitted).expect("begin");
    assert!(tx.xid() > before);
    assert_eq!(ids(&db.scan(&tx, "users").expect("scan")), vec![1, 2]);
    db.commit(&tx).expect("commit");

    let tx = db.begin(IsolationLevel::RepeatableRead).expect("begin");
    assert_eq!(ids(&db.scan(&tx, "users").expect("scan")), vec![1, 2]);
    db.commit(&tx).expect("commit");
}
