//! Shared fixtures for unit tests.

use std::sync::Arc;

use arrow::{
    array::{Float64Array, Int32Array, RecordBatch, UInt8Array},
    datatypes::{DataType, Field, Schema},
};

pub(crate) type TestResult = Result<(), Box<dyn std::error::Error>>;

/// A small synthetic line list: `wav` spans 2000..3000 evenly, `iso`
/// cycles through 1, 2, 3, and `int`/`Elow`/`jl` are derived from the row.
pub(crate) fn line_table(rows: usize) -> RecordBatch {
    let step = 1000.0 / rows.max(1) as f64;
    let wav: Vec<f64> = (0..rows).map(|i| 2000.0 + step * i as f64).collect();
    let int: Vec<f64> = (0..rows).map(|i| 1e-20 * (1.0 + i as f64)).collect();
    let iso: Vec<u8> = (0..rows).map(|i| (i % 3) as u8 + 1).collect();
    let elow: Vec<f64> = (0..rows).map(|i| 100.0 + 0.5 * i as f64).collect();
    let jl: Vec<i32> = (0..rows).map(|i| (i % 40) as i32).collect();

    let schema = Arc::new(Schema::new(vec![
        Field::new("wav", DataType::Float64, false),
        Field::new("int", DataType::Float64, false),
        Field::new("iso", DataType::UInt8, false),
        Field::new("Elow", DataType::Float64, false),
        Field::new("jl", DataType::Int32, false),
    ]));

    RecordBatch::try_new(
        schema,
        vec![
            Arc::new(Float64Array::from(wav)),
            Arc::new(Float64Array::from(int)),
            Arc::new(UInt8Array::from(iso)),
            Arc::new(Float64Array::from(elow)),
            Arc::new(Int32Array::from(jl)),
        ],
    )
    .expect("valid line table")
}

/// Column names of a batch, in order.
pub(crate) fn column_names(batch: &RecordBatch) -> Vec<String> {
    batch
        .schema()
        .fields()
        .iter()
        .map(|f| f.name().clone())
        .collect()
}
