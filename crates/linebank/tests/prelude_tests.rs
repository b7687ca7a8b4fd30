#![allow(missing_docs)]

use std::sync::Arc;

use arrow::array::{ArrayRef, Float64Array, RecordBatch, UInt8Array};
use linebank::prelude::*;
use tempfile::TempDir;

type TestResult = Result<(), Box<dyn std::error::Error>>;

#[derive(serde::Serialize)]
struct Download {
    source: &'static str,
    wavenum_min: f64,
}

#[test]
fn prelude_covers_write_register_and_load() -> TestResult {
    let tmp = TempDir::new()?;
    let path = tmp.path().join("co.lbf");
    let table = RecordBatch::try_from_iter([
        (
            "wav",
            Arc::new(Float64Array::from(vec![2100.0, 2150.0, 2200.0])) as ArrayRef,
        ),
        ("iso", Arc::new(UInt8Array::from(vec![1, 2, 1])) as ArrayRef),
    ])?;

    let manager = StorageManager::new(Engine::Flat);
    manager.write_table(&path, None, &table)?;
    let download = linebank::metadata::to_metadata(&Download {
        source: "HITEMP",
        wavenum_min: 2100.0,
    })?;
    manager.add_metadata(&path, &download, None)?;

    let mut registry = DatabaseRegistry::open(tmp.path().join("registry.json"))?;
    registry.register("CO", &path, detect_engine(&path)?, download.clone())?;

    let loaded = load_database(&registry, "CO", &LoadOptions::new().isotope(1))?;
    assert_eq!(loaded.num_rows(), 2);
    assert_eq!(
        registry.resolve("CO")?.metadata.get("source"),
        Some(&MetaValue::from("HITEMP"))
    );
    Ok(())
}
