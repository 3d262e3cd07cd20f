use gridvault::client::Client;
use gridvault::dtype::{Buffer, DType};
use gridvault::error::Error;
use gridvault::indexing::IndexLike;
use gridvault::metadata::AttributeValue;
use gridvault::schema::{AttributeSchema, DimensionSchema, VArraySchema};

fn grid_schema() -> VArraySchema {
    VArraySchema::new(
        DType::I64,
        None,
        vec![
            DimensionSchema::generic("y", 6, None, None).unwrap(),
            DimensionSchema::generic("x", 6, None, None).unwrap(),
        ],
        vec![AttributeSchema::new("key", DType::I64, true).unwrap()],
        vec![3, 3],
    )
    .unwrap()
}

#[test]
fn write_spanning_nine_tiles_then_read_back_exactly() {
    let dir = tempfile::tempdir().unwrap();
    let client = Client::open(&format!("file://{}", dir.path().display())).unwrap();
    let collection = client
        .create_varray_collection("grid", grid_schema(), None)
        .unwrap();
    let varray = collection
        .create_varray(vec![("key".into(), AttributeValue::Int(1))], vec![])
        .unwrap();

    // A 4x4 region straddling all nine 2x2 tiles of the 3x3 vgrid.
    let subset = varray
        .index(&[
            IndexLike::Range {
                start: Some(Box::new(IndexLike::Int(1))),
                stop: Some(Box::new(IndexLike::Int(5))),
                step: 1,
            },
            IndexLike::Range {
                start: Some(Box::new(IndexLike::Int(1))),
                stop: Some(Box::new(IndexLike::Int(5))),
                step: 1,
            },
        ])
        .unwrap();
    assert_eq!(subset.shape(), &[4, 4]);

    let data = Buffer::I64((0..16).collect());
    subset.update(&data).unwrap();
    assert_eq!(subset.read().unwrap(), data);

    // Cells outside the written window remain at fill value.
    let corner = varray.index(&[IndexLike::Int(0), IndexLike::Int(0)]).unwrap();
    let Buffer::I64(values) = corner.read().unwrap() else {
        panic!("wrong buffer variant");
    };
    assert_eq!(values, vec![i64::MIN]);
}

#[test]
fn clear_is_idempotent_and_varrays_manager_lists_only_headers() {
    let dir = tempfile::tempdir().unwrap();
    let client = Client::open(&format!("file://{}", dir.path().display())).unwrap();
    let collection = client
        .create_varray_collection("grid", grid_schema(), None)
        .unwrap();
    let varray = collection
        .create_varray(vec![("key".into(), AttributeValue::Int(2))], vec![])
        .unwrap();

    let full = varray.index(&[]).unwrap();
    full.update(&Buffer::I64((0..36).collect())).unwrap();

    // A clear spanning every tile succeeds and leaves the whole grid at fill
    // value; clearing again is a no-op rather than an error.
    full.clear().unwrap();
    full.clear().unwrap();
    let Buffer::I64(values) = full.read().unwrap() else {
        panic!("wrong buffer variant");
    };
    assert!(values.iter().all(|v| *v == i64::MIN));

    // The VArray manager only ever surfaces headers, never the tiles that
    // back them -- even after tiles were materialized above and then cleared.
    let headers = collection.varrays().unwrap();
    assert_eq!(headers.len(), 1);
    assert_eq!(headers[0].id(), varray.id());
}

#[test]
fn deleting_a_varray_removes_every_materialized_tile() {
    let dir = tempfile::tempdir().unwrap();
    let client = Client::open(&format!("file://{}", dir.path().display())).unwrap();
    let collection = client
        .create_varray_collection("grid", grid_schema(), None)
        .unwrap();
    let varray = collection
        .create_varray(vec![("key".into(), AttributeValue::Int(3))], vec![])
        .unwrap();
    varray
        .index(&[])
        .unwrap()
        .update(&Buffer::I64((0..36).collect()))
        .unwrap();

    varray.delete().unwrap();
    assert!(matches!(
        varray.index(&[]).unwrap_err(),
        Error::InstanceNotExists(_)
    ));

    let sizes = client.calculate_storage_size(Some("grid")).unwrap();
    assert_eq!(*sizes.get("grid").unwrap(), 0);
}
