//! # linebank
//!
//! Storage layer for large spectroscopic line databases, with interchangeable
//! table, flat-array and lazy columnar engines.
//!
//! This crate is the supported public entry point and provides a small, stable surface.
//!
//! ## Example
//!
//! ```rust
//! use linebank::prelude::*;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! # let dir = tempfile::tempdir()?;
//! # let path = dir.path().join("lines.parquet");
//! # let table = arrow::array::RecordBatch::try_from_iter([(
//! #     "wav",
//! #     std::sync::Arc::new(arrow::array::Float64Array::from(vec![2000.0, 2400.0]))
//! #         as arrow::array::ArrayRef,
//! # )])?;
//! StorageManager::new(Engine::LazyColumnar).write_table(&path, None, &table)?;
//!
//! let options = LoadOptions::new().load_value_min(2300.0);
//! let lines = table_from_file(&path, EngineChoice::Guess, &options)?;
//! assert_eq!(lines.num_rows(), 1);
//! # Ok(())
//! # }
//! ```

/// Convenience prelude with the stable, supported surface.
pub mod prelude;

/// Row filter namespace (wrapper-only).
pub mod filter {
    pub use linebank_core::filter::{CategorySet, ParseCategorySetError, Predicate, RowFilter};
}

/// Metadata namespace (wrapper-only).
pub mod metadata {
    pub use linebank_core::metadata::{MetaValue, Metadata, MetadataError, metadata_from, to_metadata};
}

pub use linebank_core::config::{ConfigError, LinebankConfig};
pub use linebank_core::engine::{Engine, EngineChoice, LazyFrame, ParseEngineError};
pub use linebank_core::error::{DatabankError, DatabankResult};
pub use linebank_core::fetch::{DatasetSource, FetchError, FetchOrchestrator, Selection};
pub use linebank_core::loader::{LoadOptions, detect_engine, load_database, table_from_file};
pub use linebank_core::manager::StorageManager;
pub use linebank_core::registry::{
    DatabaseRegistry, RegistryEntry, RegistryError, init_global, register_database,
    resolve_database, with_global,
};
