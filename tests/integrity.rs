use gridvault::client::Client;
use gridvault::dtype::DType;
use gridvault::error::Error;
use gridvault::integrity::IntegrityLevel;
use gridvault::metadata::AttributeValue;
use gridvault::schema::{ArraySchema, AttributeSchema, DimensionSchema};

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
fn clean_store_reports_no_issues_at_the_deepest_level() {
    let dir = tempfile::tempdir().unwrap();
    let client = Client::open(&format!("file://{}", dir.path().display())).unwrap();
    let collection = client.create_collection("grid", tiny_schema(), None).unwrap();
    collection
        .create(vec![("key".into(), AttributeValue::Int(1))], vec![])
        .unwrap();

    let report = client
        .check_integrity(IntegrityLevel::Data, false, None, None)
        .unwrap();
    assert!(report.is_clean(), "unexpected issues: {report}");
}

#[test]
fn missing_symlink_is_reported_at_the_paths_level() {
    let dir = tempfile::tempdir().unwrap();
    let client = Client::open(&format!("file://{}", dir.path().display())).unwrap();
    let collection = client.create_collection("grid", tiny_schema(), None).unwrap();
    let array = collection
        .create(vec![("key".into(), AttributeValue::Int(3))], vec![])
        .unwrap();

    let symlink_root = dir.path().join("collections/grid/array_symlinks/3");
    std::fs::remove_dir_all(&symlink_root).unwrap();

    let report = client
        .check_integrity(IntegrityLevel::Paths, false, None, None)
        .unwrap();
    assert!(!report.is_clean());
    let text = report.to_string();
    assert!(text.contains(array.id()) || text.contains("symlink") || text.contains("Symlink"));
}

#[test]
fn stop_on_error_raises_immediately_instead_of_collecting() {
    let dir = tempfile::tempdir().unwrap();
    let client = Client::open(&format!("file://{}", dir.path().display())).unwrap();
    let collection = client.create_collection("grid", tiny_schema(), None).unwrap();
    collection
        .create(vec![("key".into(), AttributeValue::Int(7))], vec![])
        .unwrap();
    std::fs::remove_dir_all(dir.path().join("collections/grid/array_symlinks/7")).unwrap();

    let err = client
        .check_integrity(IntegrityLevel::Paths, true, None, None)
        .unwrap_err();
    assert!(matches!(err, Error::Integrity(_)));
}

#[test]
fn report_can_be_written_to_a_file() {
    let dir = tempfile::tempdir().unwrap();
    let client = Client::open(&format!("file://{}", dir.path().display())).unwrap();
    client.create_collection("grid", tiny_schema(), None).unwrap();

    let report_path = dir.path().join("report.txt");
    let report = client
        .check_integrity(IntegrityLevel::Collections, false, Some(&report_path), None)
        .unwrap();
    let written = std::fs::read_to_string(&report_path).unwrap();
    assert_eq!(written, report.to_string());
}
