#![allow(missing_docs)]

//! Every engine must return the same rows for the same query, whatever the
//! physical type of the range and category columns.

mod common;

use std::sync::Arc;

use arrow::array::{
    Array, ArrayRef, AsArray, Float32Array, Float64Array, Int32Array, Int64Array, RecordBatch,
    UInt8Array, UInt16Array, UInt32Array,
};
use arrow::compute::cast;
use arrow::datatypes::{DataType, Field, Float64Type, Schema, UInt32Type};
use common::TestResult;
use linebank_core::{
    ColumnarEngine, Engine, EngineAdapter, EngineChoice, LoadOptions, StorageManager,
    table_from_file,
};
use tempfile::TempDir;

const ROWS: usize = 60;
const ROW_GROUP: usize = 7;

struct Case {
    name: &'static str,
    wav: ArrayRef,
    iso: ArrayRef,
}

struct Query {
    min: Option<f64>,
    max: Option<f64>,
    iso: Option<Vec<i64>>,
}

impl Query {
    fn options(&self) -> LoadOptions {
        let mut options = LoadOptions::new().columns(["id"]);
        if let Some(min) = self.min {
            options = options.load_value_min(min);
        }
        if let Some(max) = self.max {
            options = options.load_value_max(max);
        }
        if let Some(iso) = &self.iso {
            options = options.isotope(iso.clone());
        }
        options
    }

    fn keeps(&self, wav: f64, iso: f64) -> bool {
        self.min.is_none_or(|min| wav >= min)
            && self.max.is_none_or(|max| wav <= max)
            && self.iso.as_ref().is_none_or(|set| {
                iso.fract() == 0.0 && set.contains(&(iso as i64))
            })
    }
}

fn cycle<T: Copy>(pattern: &[T]) -> Vec<T> {
    (0..ROWS).map(|i| pattern[i % pattern.len()]).collect()
}

fn cases() -> Vec<Case> {
    let u8_iso: ArrayRef = Arc::new(UInt8Array::from(cycle(&[1u8, 2, 3])));
    let float_iso: ArrayRef = Arc::new(Float64Array::from(cycle(&[1.0, 2.0, 2.5, 2.7, 3.0])));
    let i64_iso: ArrayRef = Arc::new(Int64Array::from(cycle(&[3i64, 1, 2, 2])));

    vec![
        Case {
            name: "i32-signed",
            wav: Arc::new(Int32Array::from_iter_values((0..ROWS as i32).map(|i| -300 + 10 * i))),
            iso: Arc::clone(&u8_iso),
        },
        Case {
            name: "i64-large",
            wav: Arc::new(Int64Array::from_iter_values(
                (0..ROWS as i64).map(|i| 1_000_000_000_000 + 1_000 * i),
            )),
            iso: Arc::clone(&i64_iso),
        },
        Case {
            name: "u32-above-i32-max",
            wav: Arc::new(UInt32Array::from_iter_values(
                (0..ROWS as u32).map(|i| 2_000_000_000 + 30_000_000 * i),
            )),
            iso: Arc::clone(&u8_iso),
        },
        Case {
            name: "u16",
            wav: Arc::new(UInt16Array::from_iter_values((0..ROWS as u16).map(|i| 100 * i))),
            iso: Arc::clone(&float_iso),
        },
        Case {
            name: "f32-float-codes",
            wav: Arc::new(Float32Array::from_iter_values(
                (0..ROWS).map(|i| 2000.0 + 0.25 * i as f32),
            )),
            iso: float_iso,
        },
    ]
}

fn table(case: &Case) -> Result<RecordBatch, arrow::error::ArrowError> {
    let schema = Arc::new(Schema::new(vec![
        Field::new("id", DataType::UInt32, false),
        Field::new("wav", case.wav.data_type().clone(), false),
        Field::new("iso", case.iso.data_type().clone(), false),
    ]));
    RecordBatch::try_new(
        schema,
        vec![
            Arc::new(UInt32Array::from_iter_values(0..ROWS as u32)),
            Arc::clone(&case.wav),
            Arc::clone(&case.iso),
        ],
    )
}

fn as_f64(array: &ArrayRef) -> Result<Vec<f64>, arrow::error::ArrowError> {
    Ok(cast(array, &DataType::Float64)?
        .as_primitive::<Float64Type>()
        .values()
        .to_vec())
}

/// Queries whose bounds fall inside the data, so both pruning and row-level
/// filtering have work to do.
fn queries(wav: &[f64]) -> Vec<Query> {
    let (lo, mid, hi) = (wav[12], wav[30], wav[47]);
    vec![
        Query { min: Some(mid), max: None, iso: None },
        Query { min: None, max: Some(lo), iso: None },
        Query { min: Some(lo), max: Some(hi), iso: None },
        Query { min: None, max: None, iso: Some(vec![2]) },
        Query { min: Some(lo), max: Some(mid), iso: Some(vec![1, 3]) },
        Query { min: Some(hi), max: Some(lo), iso: None },
    ]
}

fn write(engine: Engine, path: &std::path::Path, table: &RecordBatch) -> TestResult {
    match engine {
        Engine::LazyColumnar => ColumnarEngine::new()
            .with_row_group_size(ROW_GROUP)
            .write_table(path, None, table)?,
        other => StorageManager::new(other).write_table(path, None, table)?,
    }
    Ok(())
}

#[test]
fn engines_agree_across_column_types() -> TestResult {
    let tmp = TempDir::new()?;

    for case in cases() {
        let table = table(&case)?;
        let wav = as_f64(&case.wav)?;
        let iso = as_f64(&case.iso)?;

        let mut paths = Vec::new();
        for engine in Engine::ALL {
            let path = tmp.path().join(format!("{}.{}", case.name, engine.as_str()));
            write(engine, &path, &table)?;
            paths.push((engine, path));
        }

        for (q, query) in queries(&wav).iter().enumerate() {
            let expected: Vec<u32> = (0..ROWS)
                .filter(|&i| query.keeps(wav[i], iso[i]))
                .map(|i| i as u32)
                .collect();

            for (engine, path) in &paths {
                let out = table_from_file(path, EngineChoice::Guess, &query.options())?;
                let ids = out.column(0).as_primitive::<UInt32Type>().values().to_vec();
                assert_eq!(ids, expected, "{} query {q} on {engine}", case.name);
            }
        }
    }
    Ok(())
}

#[test]
fn fractional_float_codes_match_no_isotope() -> TestResult {
    let tmp = TempDir::new()?;
    let schema = Arc::new(Schema::new(vec![Field::new("iso", DataType::Float64, false)]));
    let table = RecordBatch::try_new(schema, vec![Arc::new(Float64Array::from(vec![2.5, 2.7]))])?;
    let options = LoadOptions::new().isotope(2);

    for engine in Engine::ALL {
        let path = tmp.path().join(format!("frac.{}", engine.as_str()));
        write(engine, &path, &table)?;
        let out = table_from_file(&path, EngineChoice::Guess, &options)?;
        assert_eq!(out.num_rows(), 0, "{engine}");
        assert_eq!(out.column(0).len(), 0);
    }
    Ok(())
}
