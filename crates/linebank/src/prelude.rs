//! Wrapper prelude.
//!
//! The `linebank` crate is the supported public entry point. Downstream code
//! should prefer importing from this prelude instead of depending on internal
//! core module paths.

pub use crate::filter::{CategorySet, Predicate, RowFilter};
pub use crate::metadata::{MetaValue, Metadata, metadata_from};
pub use crate::{
    DatabankError, DatabaseRegistry, Engine, EngineChoice, LazyFrame, LinebankConfig, LoadOptions,
    StorageManager, detect_engine, load_database, register_database, resolve_database,
    table_from_file,
};
