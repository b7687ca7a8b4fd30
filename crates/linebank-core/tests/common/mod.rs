#![allow(dead_code)]

use std::sync::Arc;

use arrow::array::{Float64Array, Int32Array, RecordBatch, UInt8Array};
use arrow::datatypes::{DataType, Field, Schema};

pub type TestResult = Result<(), Box<dyn std::error::Error>>;

/// `rows` transitions with `wav` rising from `start` in steps of 0.5 and
/// `iso` cycling through 1..=3.
pub fn lines(start: f64, rows: usize) -> Result<RecordBatch, arrow::error::ArrowError> {
    let wav: Vec<f64> = (0..rows).map(|i| start + 0.5 * i as f64).collect();
    let int: Vec<f64> = (0..rows).map(|i| 1e-21 * (i + 1) as f64).collect();
    let iso: Vec<u8> = (0..rows).map(|i| (i % 3) as u8 + 1).collect();
    let jl: Vec<i32> = (0..rows).map(|i| (i % 25) as i32).collect();

    let schema = Arc::new(Schema::new(vec![
        Field::new("wav", DataType::Float64, false),
        Field::new("int", DataType::Float64, false),
        Field::new("iso", DataType::UInt8, false),
        Field::new("jl", DataType::Int32, false),
    ]));
    RecordBatch::try_new(
        schema,
        vec![
            Arc::new(Float64Array::from(wav)),
            Arc::new(Float64Array::from(int)),
            Arc::new(UInt8Array::from(iso)),
            Arc::new(Int32Array::from(jl)),
        ],
    )
}

pub fn names(batch: &RecordBatch) -> Vec<String> {
    batch
        .schema()
        .fields()
        .iter()
        .map(|f| f.name().clone())
        .collect()
}
