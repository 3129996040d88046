use criterion::{black_box, criterion_group, criterion_main, Criterion};
use granite::{
    Column, ColumnType, Database, EngineConfig, IsolationLevel, LockManager, LockType, Rid, Value,
};
use tempfile::TempDir;

fn setup_test_db() -> (TempDir, Database) {
    let temp_dir = TempDir::new().unwrap();
    let mut config = EngineConfig::new(temp_dir.path());
    config.sync_writes = false;
    let db = Database::open(config).unwrap();
    db.create_table(
        "test_table",
        vec![
            Column::new("id", ColumnType::Int),
            Column::new("name", ColumnType::Text),
        ],
    )
    .unwrap();

    let tx = db.begin(IsolationLevel::ReadCommitted).unwrap();
    for i in 0..100 {
        db.insert(
            &tx,
            "test_table",
            vec![Value::Int(i), Value::Text(format!("name{i}"))],
        )
        .unwrap();
    }
    db.commit(&tx).unwrap();
    (temp_dir, db)
}

fn benchmark_insert_commit(c: &mut Criterion) {
    let (_dir, db) = setup_test_db();
    let mut id = 1000;
    c.bench_function("insert_commit", |b| {
        b.iter(|| {
            let tx = db.begin(IsolationLevel::ReadCommitted).unwrap();
            db.insert(
                &tx,
                "test_table",
                vec![Value::Int(id), Value::Text("bench".to_string())],
            )
            .unwrap();
            black_box(db.commit(&tx).unwrap());
            id += 1;
        })
    });
}

fn benchmark_scan(c: &mut Criterion) {
    let (_dir, db) = setup_test_db();
    c.bench_function("scan_100_rows", |b| {
        b.iter(|| {
            let tx = db.begin(IsolationLevel::RepeatableRead).unwrap();
            let rows = db.scan(&tx, black_box("test_table")).unwrap();
            db.commit(&tx).unwrap();
            black_box(rows)
        })
    });
}

fn benchmark_lock_acquisition(c: &mut Criterion) {
    c.bench_function("lock_row_and_release", |b| {
        let locks = LockManager::new();
        b.iter(|| {
            assert!(locks.lock_table(1, LockType::IX, 100));
            for slot in 0..16 {
                assert!(locks.lock_row(1, LockType::X, 100, Rid::new(0, slot)));
            }
            locks.release_locks(black_box(1));
        })
    });
}

criterion_group!(
    benches,
    benchmark_insert_commit,
    benchmark_scan,
    benchmark_lock_acquisition
);
criterion_main!(benches);
