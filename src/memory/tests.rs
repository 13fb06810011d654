//! Flat buffer behaviour tests: append/read, rollback, serde round-trips
//! and keyed aggregation.

use crate::data::{DataType, Field, FieldExpr, Row, Schema, Value};
use crate::memory::column::MergeOp;
use crate::memory::flat::FlatBuffer;
use crate::memory::hash_flat::HashFlat;
use crate::NebulaError;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

const EVENTS: &[&str] = &["view", "click", "scroll", "purchase", "refund"];

fn event_schema() -> Schema {
    Schema::new(vec![
        Field::new("_time_", DataType::Int64),
        Field::new("id", DataType::Int32),
        Field::new("event", DataType::String),
        Field::new("items", DataType::List(Box::new(DataType::String))),
        Field::new("flag", DataType::Bool),
        Field::new("value", DataType::Int8),
        Field::new("i128", DataType::Int128),
        Field::new("weight", DataType::Float64),
    ])
}

fn random_event_row(rng: &mut StdRng) -> Row {
    let mut row = Row::new()
        .set("_time_", Value::Int64(rng.gen_range(1_500_000_000..1_700_000_000)))
        .set("id", Value::Int32(rng.gen_range(0..1_000_000)))
        .set("flag", Value::Bool(rng.gen_bool(0.5)))
        .set("value", Value::Int8(rng.gen()))
        .set("i128", Value::Int128(rng.gen::<i64>() as i128 * rng.gen::<i32>() as i128))
        .set("weight", Value::Float64(rng.gen::<f64>() * 1e6));
    // sprinkle nulls over the nullable-looking fields
    if rng.gen_bool(0.9) {
        row.insert(
            "event",
            Value::String(EVENTS[rng.gen_range(0..EVENTS.len())].to_string()),
        );
    }
    if rng.gen_bool(0.8) {
        let n = rng.gen_range(0..4);
        let items = (0..n)
            .map(|_| {
                if rng.gen_bool(0.15) {
                    Value::Null
                } else {
                    Value::String(EVENTS[rng.gen_range(0..EVENTS.len())].to_string())
                }
            })
            .collect();
        row.insert("items", Value::List(items));
    }
    row
}

fn all_fields(schema: &Schema) -> Vec<&str> {
    schema.fields().iter().map(|f| f.name.as_str()).collect()
}

#[test]
fn test_flat_write_and_read_back() {
    let schema = event_schema();
    let fields = all_fields(&schema);
    let mut fb = FlatBuffer::new(schema.clone(), &fields).unwrap();

    let seed = 0x5eed_0001;
    let mut rng = StdRng::seed_from_u64(seed);
    let rows: Vec<Row> = (0..1024).map(|_| random_event_row(&mut rng)).collect();
    for row in &rows {
        fb.add(row).unwrap();
    }

    assert_eq!(fb.rows(), 1024);
    for (i, expected) in rows.iter().enumerate() {
        let view = fb.row(i);
        for field in schema.fields() {
            assert_eq!(
                view.value(&field.name),
                expected.get(&field.name).clone(),
                "row {} field {}",
                i,
                field.name
            );
        }
    }
}

#[test]
fn test_add_type_mismatch_leaves_buffer_unchanged() {
    let schema = event_schema();
    let fields = all_fields(&schema);
    let mut fb = FlatBuffer::new(schema.clone(), &fields).unwrap();

    let mut rng = StdRng::seed_from_u64(7);
    fb.add(&random_event_row(&mut rng)).unwrap();

    let bad = Row::new().set("id", Value::String("not an i32".into()));
    let err = fb.add(&bad).unwrap_err();
    assert!(matches!(err, NebulaError::Schema { .. }));
    assert_eq!(fb.rows(), 1);
    // the buffer still accepts good rows afterwards
    fb.add(&random_event_row(&mut rng)).unwrap();
    assert_eq!(fb.rows(), 2);
}

#[test]
fn test_rollback_semantics() {
    let schema = event_schema();
    let fields = all_fields(&schema);
    let mut fb = FlatBuffer::new(schema.clone(), &fields).unwrap();

    let mut rng = StdRng::seed_from_u64(0xb011_babe);
    let rows: Vec<Row> = (0..5).map(|_| random_event_row(&mut rng)).collect();
    for row in &rows {
        fb.add(row).unwrap();
    }
    assert_eq!(fb.rows(), 5);

    // drop the last row
    fb.rollback();
    assert_eq!(fb.rows(), 4);

    // rollback only ever undoes the most recent add
    fb.rollback();
    assert_eq!(fb.rows(), 4);

    // add/rollback pairs cancel out
    for _ in 0..5 {
        fb.add(&random_event_row(&mut rng)).unwrap();
        fb.rollback();
    }
    assert_eq!(fb.rows(), 4);

    // one more add sticks, earlier rows untouched
    fb.add(&random_event_row(&mut rng)).unwrap();
    assert_eq!(fb.rows(), 5);
    for (i, expected) in rows.iter().take(4).enumerate() {
        let view = fb.row(i);
        for field in schema.fields() {
            assert_eq!(view.value(&field.name), expected.get(&field.name).clone());
        }
    }
}

#[test]
fn test_serde_round_trip() {
    let schema = event_schema();
    let fields = all_fields(&schema);
    let mut fb = FlatBuffer::new(schema.clone(), &fields).unwrap();

    let seed = 0x5eed_0002;
    let mut rng = StdRng::seed_from_u64(seed);
    const ROWS: usize = 21_053;
    for _ in 0..ROWS {
        fb.add(&random_event_row(&mut rng)).unwrap();
    }
    assert_eq!(fb.rows(), ROWS as u64);

    let size = fb.prepare_serde();
    let mut buf = vec![0u8; size as usize];
    let written = fb.serialize(&mut buf).unwrap();
    assert_eq!(written, size);

    let fb2 = FlatBuffer::from_bytes(schema.clone(), &fields, buf).unwrap();
    assert_eq!(fb2.rows(), ROWS as u64);
    for i in 0..ROWS {
        let a = fb.row(i);
        let b = fb2.row(i);
        for (c, _) in schema.fields().iter().enumerate() {
            assert_eq!(a.value_at(c), b.value_at(c), "row {} col {}", i, c);
        }
    }
}

#[test]
fn test_add_rejected_after_prepare() {
    let schema = event_schema();
    let fields = all_fields(&schema);
    let mut fb = FlatBuffer::new(schema.clone(), &fields).unwrap();
    let mut rng = StdRng::seed_from_u64(3);
    fb.add(&random_event_row(&mut rng)).unwrap();
    fb.prepare_serde();
    let err = fb.add(&random_event_row(&mut rng)).unwrap_err();
    assert!(matches!(err, NebulaError::Frozen));
}

#[test]
fn test_corrupt_bytes_rejected() {
    let schema = event_schema();
    let fields = all_fields(&schema);
    let mut fb = FlatBuffer::new(schema.clone(), &fields).unwrap();
    let mut rng = StdRng::seed_from_u64(11);
    for _ in 0..100 {
        fb.add(&random_event_row(&mut rng)).unwrap();
    }
    let mut bytes = fb.to_bytes().unwrap();
    let mid = bytes.len() / 2;
    bytes[mid] ^= 0xFF;
    let err = FlatBuffer::from_bytes(schema.clone(), &fields, bytes).unwrap_err();
    assert!(matches!(err, NebulaError::CorruptBlock(_)));
}

#[test]
fn test_hash_flat_constant_key_folds_to_one_row() {
    let schema = Schema::new(vec![
        Field::new("id", DataType::Int32),
        Field::new("count", DataType::Int32),
    ]);
    let keys = vec![
        FieldExpr::constant(Value::Int64(1)),
        FieldExpr::constant(Value::Int64(2)),
    ];
    let mut hf = HashFlat::new(schema.clone(), &["id", "count"], keys, &[("count", MergeOp::Sum)])
        .unwrap();

    let seed = 0x5eed_0003;
    let mut rng = StdRng::seed_from_u64(seed);
    const ROWS: usize = 101_053;
    let mut expected: i32 = 0;
    for _ in 0..ROWS {
        let count = rng.gen_range(0..100);
        expected = expected.wrapping_add(count);
        let row = Row::new()
            .set("id", Value::Int32(rng.gen_range(0..1000)))
            .set("count", Value::Int32(count));
        hf.add(&row).unwrap();
    }

    // a constant key tuple means a single distinct key
    assert_eq!(hf.rows(), 1);
    assert_eq!(hf.row(0).value("count"), Value::Int32(expected));
}

#[test]
fn test_hash_flat_rows_equal_distinct_keys() {
    let schema = Schema::new(vec![
        Field::new("id", DataType::Int32),
        Field::new("count", DataType::Int32),
    ]);
    let keys = vec![FieldExpr::column("id")];
    let mut hf =
        HashFlat::new(schema, &["id", "count"], keys, &[("count", MergeOp::Sum)]).unwrap();

    let mut rng = StdRng::seed_from_u64(17);
    let mut sums = [0i32; 10];
    for _ in 0..5000 {
        let id = rng.gen_range(0..10usize);
        let count = rng.gen_range(0..50);
        sums[id] += count;
        let row = Row::new()
            .set("id", Value::Int32(id as i32))
            .set("count", Value::Int32(count));
        hf.add(&row).unwrap();
    }

    assert_eq!(hf.rows(), 10);
    for i in 0..10 {
        let view = hf.row(i);
        if let Value::Int32(id) = view.value("id") {
            assert_eq!(view.value("count"), Value::Int32(sums[id as usize]));
        } else {
            panic!("id column lost its type");
        }
    }
}

#[test]
fn test_hash_flat_serde_through_plain_flat() {
    let schema = Schema::new(vec![
        Field::new("id", DataType::Int32),
        Field::new("count", DataType::Int32),
    ]);
    let keys = vec![FieldExpr::column("id")];
    let mut hf =
        HashFlat::new(schema.clone(), &["id", "count"], keys, &[("count", MergeOp::Sum)])
            .unwrap();

    let mut rng = StdRng::seed_from_u64(23);
    for _ in 0..2000 {
        let row = Row::new()
            .set("id", Value::Int32(rng.gen_range(0..25)))
            .set("count", Value::Int32(rng.gen_range(0..10)));
        hf.add(&row).unwrap();
    }

    let rows = hf.rows();
    let bytes = hf.to_bytes().unwrap();
    let fb = FlatBuffer::from_bytes(schema, &["id", "count"], bytes).unwrap();
    assert_eq!(fb.rows(), rows);
    for i in 0..rows as usize {
        assert_eq!(fb.row(i).value("id"), hf.row(i).value("id"));
        assert_eq!(fb.row(i).value("count"), hf.row(i).value("count"));
    }
}

#[test]
fn test_hash_flat_min_max_merges() {
    let schema = Schema::new(vec![
        Field::new("key", DataType::String),
        Field::new("lo", DataType::Int64),
        Field::new("hi", DataType::Int64),
    ]);
    let keys = vec![FieldExpr::column("key")];
    let mut hf = HashFlat::new(
        schema,
        &["key", "lo", "hi"],
        keys,
        &[("lo", MergeOp::Min), ("hi", MergeOp::Max)],
    )
    .unwrap();

    for v in [5i64, -3, 12, 0] {
        let row = Row::new()
            .set("key", Value::String("k".into()))
            .set("lo", Value::Int64(v))
            .set("hi", Value::Int64(v));
        hf.add(&row).unwrap();
    }

    assert_eq!(hf.rows(), 1);
    assert_eq!(hf.row(0).value("lo"), Value::Int64(-3));
    assert_eq!(hf.row(0).value("hi"), Value::Int64(12));
}
