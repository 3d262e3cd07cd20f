use gridvault::client::Client;
use gridvault::dtype::{Buffer, DType};
use gridvault::error::Error;
use gridvault::indexing::IndexLike;
use gridvault::metadata::AttributeValue;
use gridvault::schema::{ArraySchema, AttributeSchema, DimensionSchema};

fn weather_schema() -> ArraySchema {
    ArraySchema::new(
        DType::F64,
        None,
        vec![
            DimensionSchema::generic("y", 4, None, None).unwrap(),
            DimensionSchema::generic("x", 4, None, None).unwrap(),
        ],
        vec![
            AttributeSchema::new("station", DType::Str, true).unwrap(),
            AttributeSchema::new("elevation", DType::F64, false).unwrap(),
        ],
    )
    .unwrap()
}

#[test]
fn create_populate_and_reopen_collection() {
    let dir = tempfile::tempdir().unwrap();
    let uri = format!("file://{}", dir.path().display());
    let client = Client::open(&uri).unwrap();

    let collection = client
        .create_collection("weather", weather_schema(), None)
        .unwrap();
    let array = collection
        .create(
            vec![("station".into(), AttributeValue::Str("abq".into()))],
            vec![("elevation".into(), AttributeValue::Float(1619.0))],
        )
        .unwrap();
    let subset = array.index(&[]).unwrap();
    subset
        .update(&Buffer::F64((0..16).map(f64::from).collect()))
        .unwrap();

    // Reopen the client entirely; the collection and its array must survive
    // a round trip through persisted metadata.
    drop(client);
    let client = Client::open(&uri).unwrap();
    let collection = client.get_collection("weather").unwrap();
    let found = collection
        .filter(vec![("station".into(), AttributeValue::Str("abq".into()))])
        .first()
        .unwrap()
        .expect("array should be found by its primary key");
    assert_eq!(
        found.index(&[]).unwrap().read().unwrap(),
        Buffer::F64((0..16).map(f64::from).collect())
    );
}

#[test]
fn filter_by_id_is_a_fast_path() {
    let dir = tempfile::tempdir().unwrap();
    let client = Client::open(&format!("file://{}", dir.path().display())).unwrap();
    let collection = client
        .create_collection("weather", weather_schema(), None)
        .unwrap();
    let array = collection
        .create(
            vec![("station".into(), AttributeValue::Str("den".into()))],
            vec![],
        )
        .unwrap();
    let found = collection
        .filter(vec![("id".into(), AttributeValue::Str(array.id().to_string()))])
        .first()
        .unwrap()
        .unwrap();
    assert_eq!(found.id(), array.id());
}

#[test]
fn partial_primary_key_filter_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let client = Client::open(&format!("file://{}", dir.path().display())).unwrap();
    let collection = client
        .create_collection("weather", weather_schema(), None)
        .unwrap();
    collection
        .create(
            vec![("station".into(), AttributeValue::Str("den".into()))],
            vec![],
        )
        .unwrap();
    // "station" is the only primary attribute, so this is a complete key...
    let complete = collection.filter(vec![("station".into(), AttributeValue::Str("den".into()))]);
    assert!(complete.first().unwrap().is_some());
    // ...but filtering by a custom attribute alone is not implemented.
    let custom_only = collection.filter(vec![]);
    let err = custom_only.first().unwrap_err();
    assert!(matches!(err, Error::Filter(_)));
}

#[test]
fn clear_resets_to_fill_value_but_delete_removes_the_array() {
    let dir = tempfile::tempdir().unwrap();
    let client = Client::open(&format!("file://{}", dir.path().display())).unwrap();
    let collection = client
        .create_collection("weather", weather_schema(), None)
        .unwrap();
    let array = collection
        .create(
            vec![("station".into(), AttributeValue::Str("phx".into()))],
            vec![],
        )
        .unwrap();
    let subset = array.index(&[IndexLike::Full, IndexLike::Full]).unwrap();
    subset
        .update(&Buffer::F64((0..16).map(f64::from).collect()))
        .unwrap();
    collection.clear().unwrap();
    let Buffer::F64(values) = array.index(&[]).unwrap().read().unwrap() else {
        panic!("wrong buffer variant");
    };
    assert!(values.iter().all(|v| v.is_nan()));

    array.delete().unwrap();
    assert!(matches!(
        array.index(&[]).unwrap_err(),
        Error::InstanceNotExists(_)
    ));
}

#[test]
fn invalid_manager_call_on_mismatched_collection_type() {
    let dir = tempfile::tempdir().unwrap();
    let client = Client::open(&format!("file://{}", dir.path().display())).unwrap();
    let collection = client
        .create_collection("weather", weather_schema(), None)
        .unwrap();
    let err = collection.varrays().unwrap_err();
    assert!(matches!(err, Error::InvalidManagerCall(_)));
}
