#![allow(dead_code)]

use std::path::Path;

use granite::{Column, ColumnType, Database, EngineConfig, IsolationLevel, Record, Value};

pub fn config(dir: &Path) -> EngineConfig {
    let mut config = EngineConfig::new(dir);
    config.sync_writes = false;
    config
}

pub fn open(dir: &Path) -> Database {
    Database::open(config(dir)).expect("open database")
}

pub fn open_with_frames(dir: &Path, frames: usize) -> Database {
    let mut config = config(dir);
    config.buffer_pool_frames = frames;
    Database::open(config).expect("open database")
}

pub fn create_users(db: &Database) {
    db.create_table(
        "users",
        vec![
            Column::new("id", ColumnType::Int),
            Column::new("name", ColumnType::Text),
        ],
    )
    .expect("create users");
}

pub fn user(id: i32, name: &str) -> Vec<Value> {
    vec![Value::Int(id), Value::Text(name.to_string())]
}

pub fn ids(records: &[Record]) -> Vec<i32> {
    let mut ids: Vec<i32> = records
        .iter()
        .map(|r| match r.values[0] {
            Value::Int(id) => id,
            ref other => panic!("unexpected id value {other:?}"),
        })
        .collect();
    ids.sort_unstable();
    ids
}

/// Ids of the users visible to a fresh READ COMMITTED transaction.
pub fn committed_ids(db: &Database) -> Vec<i32> {
    let tx = db.begin(IsolationLevel::ReadCommitted).expect("begin");
    let records = db.scan(&tx, "users").expect("scan");
    db.commit(&tx).expect("commit");
    ids(&records)
}

pub fn insert_committed(db: &Database, rows: impl IntoIterator<Item = Vec<Value>>) {
    let tx = db.begin(IsolationLevel::ReadCommitted).expect("begin");
    for row in rows {
        db.insert(&tx, "users", row).expect("insert");
    }
    db.commit(&tx).expect("commit");
}
