//! Core storage layer for large spectroscopic line databases.
//!
//! Line lists (one row per transition, columns such as wavenumber, line
//! intensity, and isotopologue id) are stored on disk through one of three
//! interchangeable engines and read back with column projection and row
//! filters:
//!
//! - Pluggable storage engines behind a single capability interface
//!   (`engine` module): a multi-key table container, a flat-array
//!   container with per-column reads, and a lazy columnar (Parquet) engine
//!   with predicate pushdown and row-group pruning.
//! - An engine-agnostic facade that owns projection, filter, and metadata
//!   semantics so every engine behaves the same (`manager` module).
//! - Signature-based engine detection and partial loading helpers
//!   (`loader` module).
//! - A persistent, lock-protected registry mapping database names to local
//!   files (`registry` module) and an orchestrator that makes sure
//!   registered files exist and are valid before use (`fetch` module).
//! - Filesystem utilities for atomic replacement and bounded reads
//!   (`storage` module).
//!
//! Higher-level front ends (download clients, spectrum calculators) are
//! expected to depend on this crate rather than touch the file formats
//! directly.
#![deny(missing_docs)]
pub mod config;
pub mod engine;
pub mod error;
pub mod fetch;
pub mod filter;
pub mod loader;
pub mod manager;
pub mod metadata;
pub mod registry;
pub mod storage;

#[cfg(test)]
mod test_util;

pub use config::{ConfigError, LinebankConfig};
pub use engine::{
    ColumnarEngine, DEFAULT_KEY, Engine, EngineAdapter, EngineChoice, FlatEngine, LazyFrame,
    ParseEngineError, TableEngine,
};
pub use error::{DatabankError, DatabankResult};
pub use fetch::{DatasetSource, FetchError, FetchOrchestrator, Selection};
pub use filter::{CategorySet, Predicate, RowFilter};
pub use loader::{LoadOptions, detect_engine, load_database, table_from_file};
pub use manager::StorageManager;
pub use metadata::{MetaValue, Metadata, metadata_from};
pub use registry::{
    DatabaseRegistry, RegistryEntry, RegistryError, RegistryResult, init_global,
    register_database, resolve_database, with_global,
};
