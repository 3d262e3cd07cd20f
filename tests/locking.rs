use std::thread;
use std::time::{Duration, Instant};

use gridvault::client::Client;
use gridvault::config::Config;
use gridvault::dtype::{Buffer, DType};
use gridvault::error::Error;
use gridvault::lock::LockKind;
use gridvault::metadata::AttributeValue;
use gridvault::schema::{ArraySchema, AttributeSchema, DimensionSchema};

fn fast_timeout_config() -> Config {
    Config::builder()
        .write_lock_timeout(Duration::from_millis(300))
        .write_lock_check_interval(Duration::from_millis(20))
        .build()
        .unwrap()
}

fn tiny_schema() -> ArraySchema {
    ArraySchema::new(
        DType::F64,
        None,
        vec![DimensionSchema::generic("x", 4, None, None).unwrap()],
        vec![AttributeSchema::new("key", DType::I64, true).unwrap()],
    )
    .unwrap()
}

#[test]
fn concurrent_write_denies_a_second_writer_until_released() {
    let dir = tempfile::tempdir().unwrap();
    let uri = format!("file://{}", dir.path().display());
    let client = Client::open_with(
        &uri,
        gridvault::storage_adapter::StorageAdapterRegistry::with_builtins(),
        fast_timeout_config(),
    )
    .unwrap();
    let collection = client.create_collection("grid", tiny_schema(), None).unwrap();
    let array = collection
        .create(vec![("key".into(), AttributeValue::Int(1))], vec![])
        .unwrap();
    let subset = array.index(&[]).unwrap();

    let path = array.id().to_string();
    let data = Buffer::F64(vec![1.0, 2.0, 3.0, 4.0]);

    // Hold a write lock on a background thread for slightly longer than the
    // configured timeout, then release it.
    let data_for_writer = data.clone();
    let array_dir = dir.path().to_path_buf();
    let writer = thread::spawn(move || {
        let client = Client::open_with(
            &format!("file://{}", array_dir.display()),
            gridvault::storage_adapter::StorageAdapterRegistry::with_builtins(),
            fast_timeout_config(),
        )
        .unwrap();
        let collection = client.get_collection("grid").unwrap();
        let array = collection
            .filter(vec![("id".into(), AttributeValue::Str(path))])
            .first()
            .unwrap()
            .unwrap();
        let subset = array.index(&[]).unwrap();
        subset.update(&data_for_writer).unwrap();
        thread::sleep(Duration::from_millis(500));
    });

    // Give the background writer a moment to take the lock first.
    thread::sleep(Duration::from_millis(100));
    let started = Instant::now();
    let err = subset.update(&data).unwrap_err();
    assert!(matches!(err, Error::Locked(_)));
    assert!(started.elapsed() >= Duration::from_millis(250));

    writer.join().unwrap();
    // Now that the writer released its lock, the same update succeeds.
    subset.update(&data).unwrap();
}

#[test]
fn get_locks_and_clear_locks_round_trip_the_collection_sentinel() {
    let dir = tempfile::tempdir().unwrap();
    let client = Client::open(&format!("file://{}", dir.path().display())).unwrap();
    client.create_collection("grid", tiny_schema(), None).unwrap();

    let locks = client.get_locks(Some("grid"), Some(LockKind::CollectionCreate)).unwrap();
    assert_eq!(locks.len(), 1);
    assert!(locks[0].path.ends_with("grid.lock"));

    // The collection sentinel is permanent (not released on drop), so
    // clear_locks must not remove it -- only genuinely stale locks.
    let removed = client.clear_locks(Some("grid")).unwrap();
    assert_eq!(removed, 0);
    let locks_after = client.get_locks(Some("grid"), Some(LockKind::CollectionCreate)).unwrap();
    assert_eq!(locks_after.len(), 1);
}
