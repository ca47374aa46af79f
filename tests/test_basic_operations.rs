use lumotxn::{DbFlags, EnvFlags, Environment, Error, WriteFlags, PAGE_SIZE};
use tempfile::TempDir;

// Common test setup
fn setup_test_env() -> (TempDir, Environment) {
    let temp_dir = TempDir::new().unwrap();
    let mut env = Environment::new();
    env.set_max_dbs(4).unwrap();
    env.open(temp_dir.path(), 0o644, EnvFlags::empty()).unwrap();
    (temp_dir, env)
}

#[test]
fn test_database_open() {
    let (_dir, env) = setup_test_env();
    let txn = env.begin_txn().unwrap();

    // Test opening default database
    let db = txn.open_database(None, DbFlags::empty()).unwrap();
    assert_eq!(db.name().unwrap(), None);
    assert_eq!(db.flags().unwrap(), DbFlags::empty());

    // Test opening named database
    let named = txn.open_database(Some("testdb"), DbFlags::CREATE).unwrap();
    assert_eq!(named.name().unwrap().as_deref(), Some("testdb"));
    assert_ne!(db, named);

    // Opening it again returns the same handle
    let again = txn.open_database(Some("testdb"), DbFlags::empty()).unwrap();
    assert_eq!(named, again);
}

#[test]
fn test_basic_put_get() {
    let (_dir, env) = setup_test_env();
    let mut txn = env.begin_txn().unwrap();
    let db = txn.open_database(None, DbFlags::empty()).unwrap();

    // Test putting and getting data
    let key = b"test_key";
    let value = b"test_value";

    db.put(&mut txn, key, value).unwrap();
    let result = db.get(&txn, key).unwrap();
    assert_eq!(&*result, value);
    assert_eq!(result.len(), value.len());
}

#[test]
fn test_delete_operations() {
    let (_dir, env) = setup_test_env();
    let mut txn = env.begin_txn().unwrap();
    let db = txn.open_database(None, DbFlags::empty()).unwrap();

    // Insert and then delete data
    let key = b"delete_key";
    let value = b"delete_value";

    db.put(&mut txn, key, value).unwrap();
    assert!(db.get(&txn, key).is_ok());

    db.delete(&mut txn, key).unwrap();
    assert!(matches!(db.get(&txn, key), Err(Error::NotFound)));
    assert!(matches!(db.delete(&mut txn, key), Err(Error::NotFound)));
}

#[test]
fn test_database_stats() {
    let (_dir, env) = setup_test_env();
    let mut txn = env.begin_txn().unwrap();
    let db = txn.open_database(None, DbFlags::empty()).unwrap();

    // Get initial stats
    let stats = db.stat(&txn).unwrap();
    assert_eq!(stats.entries, 0);
    assert_eq!(stats.psize as usize, PAGE_SIZE);

    // Add some entries and check stats
    for i in 0..5 {
        let key = format!("key_{}", i);
        let value = format!("value_{}", i);
        db.put(&mut txn, key.as_bytes(), value.as_bytes()).unwrap();
    }

    // Overwriting doesn't add an entry
    db.put(&mut txn, b"key_0", b"other").unwrap();
    let stats = db.stat(&txn).unwrap();
    assert_eq!(stats.entries, 5);

    txn.commit().unwrap();

    let txn = env.begin_ro_txn().unwrap();
    assert_eq!(db.stat(&txn).unwrap().entries, 5);
}

#[test]
fn test_error_handling() {
    let (_dir, env) = setup_test_env();
    let mut txn = env.begin_txn().unwrap();
    let db = txn.open_database(None, DbFlags::empty()).unwrap();

    // Test key not found
    let result = db.get(&txn, b"nonexistent_key");
    assert!(matches!(result, Err(Error::NotFound)));

    // Test duplicate key with NOOVERWRITE flag
    let key = b"unique_key";
    let value1 = b"value1";
    let value2 = b"value2";

    db.put(&mut txn, key, value1).unwrap();
    let result = db.put_with_flags(&mut txn, key, value2, WriteFlags::NOOVERWRITE);
    assert!(matches!(result, Err(Error::KeyExist)));
    assert_eq!(&*db.get(&txn, key).unwrap(), value1);

    // Keys must not be empty
    let result = db.put(&mut txn, b"", b"value");
    assert_eq!(result.unwrap_err().code(), Some(lumotxn::error::MDB_BAD_VALSIZE));
}

#[test]
fn test_transaction_isolation() {
    let (_dir, env) = setup_test_env();

    // Write transaction
    let mut write_txn = env.begin_txn().unwrap();
    let db = write_txn.open_database(None, DbFlags::empty()).unwrap();
    db.put(&mut write_txn, b"key", b"value").unwrap();

    // Read transaction shouldn't see uncommitted changes
    let read_txn = env.begin_ro_txn().unwrap();
    assert!(matches!(db.get(&read_txn, b"key"), Err(Error::NotFound)));

    // Nor committed ones made after it began
    write_txn.commit().unwrap();
    assert!(matches!(db.get(&read_txn, b"key"), Err(Error::NotFound)));

    // A new read transaction sees them
    let read_txn = env.begin_ro_txn().unwrap();
    let result = db.get(&read_txn, b"key").unwrap();
    assert_eq!(&*result, b"value");
}

#[test]
fn test_dropped_transaction_is_aborted() {
    let (_dir, env) = setup_test_env();
    let db = env
        .write(|txn| txn.open_database(None, DbFlags::empty()))
        .unwrap();

    {
        let mut txn = env.begin_txn().unwrap();
        db.put(&mut txn, b"key", b"value").unwrap();
    }

    assert!(matches!(db.get_implicit(b"key"), Err(Error::NotFound)));

    // The writer was released by the drop
    let mut txn = env.begin_txn().unwrap();
    db.put(&mut txn, b"key", b"value").unwrap();
    txn.commit().unwrap();
    assert_eq!(db.get_implicit(b"key").unwrap(), b"value");
}
