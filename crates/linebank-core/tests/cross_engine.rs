#![allow(missing_docs)]

mod common;

use arrow::array::AsArray;
use arrow::datatypes::{Float64Type, UInt8Type};
use common::{TestResult, lines, names};
use linebank_core::{
    DatabankError, DatabaseRegistry, Engine, EngineChoice, LoadOptions, StorageManager,
    load_database, metadata_from, table_from_file,
};
use tempfile::TempDir;

#[test]
fn same_query_same_answer_on_every_engine() -> TestResult {
    let tmp = TempDir::new()?;
    let table = lines(2000.0, 300)?;
    let options = LoadOptions::new()
        .columns(["iso", "wav"])
        .isotope(2)
        .load_value_min(2050.0)
        .load_value_max(2100.0);

    for engine in Engine::ALL {
        let path = tmp.path().join(format!("CO2.{}", engine.as_str()));
        StorageManager::new(engine).write_table(&path, None, &table)?;

        let out = table_from_file(&path, EngineChoice::Guess, &options)?;
        assert_eq!(names(&out), ["iso", "wav"], "{engine}");
        assert_eq!(out.num_rows(), 34, "{engine}");

        let iso = out.column(0).as_primitive::<UInt8Type>();
        let wav = out.column(1).as_primitive::<Float64Type>();
        assert!(iso.values().iter().all(|&i| i == 2));
        assert_eq!(wav.value(0), 2050.0);
        assert_eq!(wav.value(out.num_rows() - 1), 2099.5);
    }
    Ok(())
}

#[test]
fn multi_key_engines_keep_tables_apart() -> TestResult {
    let tmp = TempDir::new()?;
    for engine in [Engine::Table, Engine::Flat] {
        let manager = StorageManager::new(engine);
        let path = tmp.path().join(format!("multi.{}", engine.as_str()));
        manager.write_table(&path, Some("CO"), &lines(2000.0, 40)?)?;
        manager.write_table(&path, Some("H2O"), &lines(1000.0, 25)?)?;
        manager.add_metadata(&path, &metadata_from([("molecule", "H2O")]), Some("H2O"))?;

        let mut keys = manager.keys(&path)?;
        keys.sort();
        assert_eq!(keys, ["CO", "H2O"], "{engine}");

        let water = manager.load(&path, Some("H2O"), &LoadOptions::new())?;
        assert_eq!(water.num_rows(), 25);
        assert!(manager.read_metadata(&path, Some("CO"))?.is_empty());
        assert_eq!(
            manager.read_metadata(&path, Some("H2O"))?,
            metadata_from([("molecule", "H2O")])
        );

        let missing = manager.load(&path, Some("CH4"), &LoadOptions::new());
        assert!(matches!(missing, Err(DatabankError::MissingKey { .. })), "{engine}");
    }
    Ok(())
}

#[test]
fn overwriting_a_table_resets_its_metadata() -> TestResult {
    let tmp = TempDir::new()?;
    for engine in Engine::ALL {
        let manager = StorageManager::new(engine);
        let path = tmp.path().join(format!("reset.{}", engine.as_str()));
        manager.write_table(&path, None, &lines(2000.0, 10)?)?;
        manager.add_metadata(&path, &metadata_from([("wmin", 2000.0)]), None)?;
        manager.write_table(&path, None, &lines(3000.0, 5)?)?;

        assert!(manager.read_metadata(&path, None)?.is_empty(), "{engine}");
        assert_eq!(manager.load(&path, None, &LoadOptions::new())?.num_rows(), 5);
    }
    Ok(())
}

#[test]
fn database_files_are_concatenated_in_registration_order() -> TestResult {
    let tmp = TempDir::new()?;
    let mut registry = DatabaseRegistry::open(tmp.path().join("registry.json"))?;
    let manager = StorageManager::new(Engine::LazyColumnar);

    let low = tmp.path().join("CO2_2000.parquet");
    let high = tmp.path().join("CO2_2500.parquet");
    manager.write_table(&high, None, &lines(2500.0, 20)?)?;
    manager.write_table(&low, None, &lines(2000.0, 30)?)?;
    registry.register("CO2", &low, Engine::LazyColumnar, metadata_from([("part", 1i64)]))?;
    registry.register("CO2", &high, Engine::LazyColumnar, metadata_from([("part", 2i64)]))?;

    let all = load_database(&registry, "CO2", &LoadOptions::new().columns(["wav"]))?;
    assert_eq!(all.num_rows(), 50);
    let wav = all.column(0).as_primitive::<Float64Type>();
    assert_eq!(wav.value(0), 2000.0);
    assert_eq!(wav.value(30), 2500.0);

    let unknown = load_database(&registry, "N2O", &LoadOptions::new());
    assert!(matches!(unknown, Err(DatabankError::Registry { .. })));
    Ok(())
}

#[test]
fn differing_schemas_across_files_are_rejected() -> TestResult {
    let tmp = TempDir::new()?;
    let mut registry = DatabaseRegistry::open(tmp.path().join("registry.json"))?;
    let manager = StorageManager::new(Engine::Table);

    let full = tmp.path().join("a.lbt");
    let narrow = tmp.path().join("b.lbt");
    manager.write_table(&full, None, &lines(2000.0, 10)?)?;
    manager.write_table(&narrow, None, &lines(2100.0, 10)?.project(&[0, 2])?)?;
    registry.register("CH4", &full, Engine::Table, Default::default())?;
    registry.register("CH4", &narrow, Engine::Table, Default::default())?;

    let err = load_database(&registry, "CH4", &LoadOptions::new()).expect_err("schemas differ");
    assert!(matches!(err, DatabankError::SchemaMismatch { .. }));

    let shared = load_database(&registry, "CH4", &LoadOptions::new().columns(["wav", "iso"]))?;
    assert_eq!(shared.num_rows(), 20);
    Ok(())
}

#[test]
fn lazy_handle_defers_reading_until_collect() -> TestResult {
    let tmp = TempDir::new()?;
    let path = tmp.path().join("lazy.parquet");
    let manager = StorageManager::new(Engine::LazyColumnar);
    manager.write_table(&path, None, &lines(2000.0, 120)?)?;

    let frame = manager
        .scan(&path, None)?
        .select(["wav", "jl"])?
        .filter(
            LoadOptions::new()
                .load_value_max(2009.5)
                .to_row_filter()?,
        )?;
    assert_eq!(frame.total_rows(), 120);
    assert_eq!(frame.schema().fields().len(), 2);

    let out = frame.collect()?;
    assert_eq!(names(&out), ["wav", "jl"]);
    assert_eq!(out.num_rows(), 20);
    Ok(())
}
