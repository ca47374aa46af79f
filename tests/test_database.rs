use std::collections::{HashMap, HashSet};
use std::thread;

use lumotxn::{DbFlags, EnvFlags, Environment, Error};
use rand::Rng;
use tempfile::TempDir;

const DB_1: &str = "test-db-1";
const WRITES_PER_THREAD: usize = 15_000;

// One named database, one reader slot
fn setup_test_env() -> (TempDir, Environment) {
    let temp_dir = TempDir::new().unwrap();
    let mut env = Environment::new();
    env.set_map_size(64 * 1024 * 1024).unwrap();
    env.set_max_dbs(1).unwrap();
    env.set_max_readers(1).unwrap();
    env.open(temp_dir.path().join("db.mdb"), 0o664, EnvFlags::NOSUBDIR)
        .unwrap();
    (temp_dir, env)
}

fn int_bytes(value: u32) -> [u8; 4] {
    value.to_be_bytes()
}

#[test]
fn db_open_max_databases() {
    let (_dir, env) = setup_test_env();
    let txn = env.begin_txn().unwrap();
    txn.open_database(Some(DB_1), DbFlags::CREATE).unwrap();

    let result = txn.open_database(Some("another"), DbFlags::CREATE);
    assert!(matches!(result, Err(Error::DbsFull)));

    // Already registered names are not limited
    txn.open_database(Some(DB_1), DbFlags::empty()).unwrap();
}

#[test]
fn put_abort_get() {
    let (_dir, env) = setup_test_env();

    let mut txn = env.begin_txn().unwrap();
    let db = txn.open_database(Some(DB_1), DbFlags::CREATE).unwrap();
    db.put(&mut txn, &int_bytes(5), &int_bytes(5)).unwrap();
    txn.abort().unwrap();

    // The handle went away with the transaction that created it
    let txn = env.begin_txn().unwrap();
    assert!(matches!(db.get(&txn, &int_bytes(5)), Err(Error::BadDbi)));
    assert!(matches!(
        txn.open_database(Some(DB_1), DbFlags::empty()),
        Err(Error::NotFound)
    ));
    drop(txn);

    let db = env
        .write(|txn| txn.open_database(Some(DB_1), DbFlags::CREATE))
        .unwrap();

    let mut txn = env.begin_txn().unwrap();
    db.put(&mut txn, &int_bytes(5), &int_bytes(5)).unwrap();
    txn.abort().unwrap();

    let txn = env.begin_txn().unwrap();
    assert!(matches!(db.get(&txn, &int_bytes(5)), Err(Error::NotFound)));
}

#[test]
fn put_and_get_and_delete_with_internal_tx() {
    let (_dir, env) = setup_test_env();
    let db = env
        .write(|txn| txn.open_database(Some(DB_1), DbFlags::CREATE))
        .unwrap();

    db.put_implicit(&int_bytes(5), &int_bytes(5)).unwrap();
    assert_eq!(db.get_implicit(&int_bytes(5)).unwrap(), int_bytes(5));

    db.delete_implicit(&int_bytes(5)).unwrap();
    assert!(matches!(db.get_implicit(&int_bytes(5)), Err(Error::NotFound)));
    assert!(matches!(db.delete_implicit(&int_bytes(5)), Err(Error::NotFound)));

    // Every implicit transaction released its reader slot
    assert_eq!(env.info().unwrap().num_readers, 0);
}

#[test]
fn put_commit_get() {
    let (_dir, env) = setup_test_env();

    let mut txn = env.begin_txn().unwrap();
    let db = txn.open_database(Some(DB_1), DbFlags::CREATE).unwrap();
    db.put(&mut txn, &int_bytes(5), &int_bytes(5)).unwrap();
    txn.commit().unwrap();

    let txn = env.begin_txn().unwrap();
    let value = db.get(&txn, &int_bytes(5)).unwrap();
    assert_eq!(value, int_bytes(5));
}

#[test]
fn put_delete() {
    let (_dir, env) = setup_test_env();

    let mut txn = env.begin_txn().unwrap();
    let db = txn.open_database(Some(DB_1), DbFlags::CREATE).unwrap();
    db.put(&mut txn, &int_bytes(5), &int_bytes(5)).unwrap();
    db.delete(&mut txn, &int_bytes(5)).unwrap();
    assert!(matches!(db.get(&txn, &int_bytes(5)), Err(Error::NotFound)));
    txn.commit().unwrap();

    let txn = env.begin_ro_txn().unwrap();
    assert!(matches!(db.get(&txn, &int_bytes(5)), Err(Error::NotFound)));
}

#[test]
fn parallel_writes_stress() {
    let (_dir, env) = setup_test_env();
    env.set_flags(EnvFlags::NOSYNC, true).unwrap();
    let db = env
        .write(|txn| txn.open_database(Some(DB_1), DbFlags::CREATE))
        .unwrap();

    // Each worker runs one transaction per write
    let logs: Vec<Vec<(u32, u32)>> = thread::scope(|scope| {
        let workers: Vec<_> = (0..2)
            .map(|_| {
                scope.spawn(move || {
                    let mut rng = rand::thread_rng();
                    let mut log = Vec::with_capacity(WRITES_PER_THREAD);
                    for _ in 0..WRITES_PER_THREAD {
                        let (key, value): (u32, u32) = (rng.gen(), rng.gen());
                        db.put_implicit(&int_bytes(key), &int_bytes(value)).unwrap();
                        log.push((key, value));
                    }
                    log
                })
            })
            .collect();

        workers
            .into_iter()
            .map(|worker| worker.join().unwrap())
            .collect()
    });

    // Within a worker later writes win; across workers either last write may
    let last_writes: Vec<HashMap<u32, u32>> = logs
        .iter()
        .map(|log| log.iter().copied().collect())
        .collect();
    let keys: HashSet<u32> = last_writes
        .iter()
        .flat_map(|writes| writes.keys().copied())
        .collect();

    let txn = env.begin_ro_txn().unwrap();
    assert_eq!(db.stat(&txn).unwrap().entries, keys.len());

    for key in keys {
        let stored = db.get(&txn, &int_bytes(key)).unwrap();
        let candidates: Vec<[u8; 4]> = last_writes
            .iter()
            .filter_map(|writes| writes.get(&key).map(|value| int_bytes(*value)))
            .collect();
        assert!(
            candidates.iter().any(|candidate| stored == *candidate),
            "unexpected value for key {key}"
        );
    }
}
