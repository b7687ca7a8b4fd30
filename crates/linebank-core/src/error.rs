//! Error types and SNAFU context selectors for table storage and loading.
//!
//! `DatabankError` is returned by every engine adapter, the storage manager
//! facade, and the partial loader. Variants carry the path, key, or engine
//! involved so callers (typically a fetch orchestrator deciding whether to
//! re-download) can act on them without re-deriving context. Nothing in this
//! crate retries on any of these errors.

use arrow::{datatypes::DataType, error::ArrowError};
use parquet::errors::ParquetError;
use snafu::prelude::*;

use crate::{
    engine::Engine, metadata::MetadataError, registry::RegistryError, storage::StorageError,
};

/// Convenience alias for results in this crate.
pub type DatabankResult<T> = Result<T, DatabankError>;

/// Errors from engine adapters, the storage manager, and the partial loader.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum DatabankError {
    /// `engine = guess` and no engine recognized the file layout.
    #[snafu(display("Cannot detect storage engine for {path}: no known container signature"))]
    EngineDetection {
        /// File that could not be classified.
        path: String,
    },

    /// The file was written by a different engine than the one requested.
    #[snafu(display(
        "Engine mismatch for {path}: expected {expected}, file looks like {}",
        found.map(|e| e.to_string()).unwrap_or_else(|| "no known engine".to_string())
    ))]
    EngineMismatch {
        /// File whose structure disagrees with the declared engine.
        path: String,
        /// Engine the caller asked for.
        expected: Engine,
        /// Engine whose signature the file actually carries, if any.
        found: Option<Engine>,
    },

    /// The requested storage key does not exist in the file.
    #[snafu(display("Key {key:?} not found in {path} (available: {available:?})"))]
    MissingKey {
        /// File that was searched.
        path: String,
        /// Key that was requested.
        key: String,
        /// Keys that the file does contain.
        available: Vec<String>,
    },

    /// A requested projection or filter column does not exist.
    #[snafu(display("Unknown column {column:?} in {path} (available: {available:?})"))]
    UnknownColumn {
        /// File that was loaded.
        path: String,
        /// Column that was requested.
        column: String,
        /// Columns that the table does contain.
        available: Vec<String>,
    },

    /// An explicit, empty column list was requested.
    #[snafu(display("Empty column projection requested for {path}"))]
    EmptyProjection {
        /// File that was loaded.
        path: String,
    },

    /// A range bound is NaN.
    #[snafu(display("Invalid range filter on {column:?}: min={min:?}, max={max:?}"))]
    InvalidRange {
        /// Range column.
        column: String,
        /// Lower bound supplied by the caller.
        min: Option<f64>,
        /// Upper bound supplied by the caller.
        max: Option<f64>,
    },

    /// The container matched an engine signature but could not be opened.
    #[snafu(display("Corrupt {engine} file {path}: {reason}"))]
    FileCorrupt {
        /// File that failed to open.
        path: String,
        /// Engine that attempted to open the file.
        engine: Engine,
        /// What was wrong.
        reason: String,
    },

    /// The engine cannot store a column of this type.
    #[snafu(display("{engine} cannot store column {column:?} of type {data_type} in {path}: {reason}"))]
    UnsupportedColumnType {
        /// Target file.
        path: String,
        /// Engine that rejected the column.
        engine: Engine,
        /// Offending column.
        column: String,
        /// Arrow type of the column.
        data_type: DataType,
        /// Why the column was rejected.
        reason: String,
    },

    /// Column names starting with `.` or containing `/` are reserved for
    /// engine bookkeeping.
    #[snafu(display("Column name {column:?} is reserved (names may not start with '.' or contain '/')"))]
    ReservedColumnName {
        /// Offending column.
        column: String,
    },

    /// The bound engine does not offer this operation.
    #[snafu(display("{engine} does not support {operation}"))]
    UnsupportedOperation {
        /// Engine bound to the manager.
        engine: Engine,
        /// Name of the requested operation.
        operation: &'static str,
    },

    /// A lazy handle was used after `close`.
    #[snafu(display("Lazy handle for {path} is closed"))]
    HandleClosed {
        /// File the handle pointed at.
        path: String,
    },

    /// Tables registered under one name do not share a schema.
    #[snafu(display("Schema of {path} does not match the first file of database {name:?}"))]
    SchemaMismatch {
        /// Logical database name.
        name: String,
        /// File whose schema differs.
        path: String,
    },

    /// Metadata could not be encoded or decoded.
    #[snafu(display("Metadata error for {path} (key {key:?}): {source}"))]
    Metadata {
        /// File holding the metadata.
        path: String,
        /// Key the metadata belongs to.
        key: String,
        /// Underlying codec error.
        source: MetadataError,
    },

    /// Filesystem access failed.
    #[snafu(display("Storage error: {source}"))]
    Storage {
        /// Underlying storage error.
        #[snafu(backtrace)]
        source: StorageError,
    },

    /// Arrow encoding, decoding, or compute failed.
    #[snafu(display("Arrow error for {path}: {source}"))]
    Arrow {
        /// File being processed.
        path: String,
        /// Underlying Arrow error.
        source: ArrowError,
    },

    /// Parquet read or write failed.
    #[snafu(display("Parquet error for {path}: {source}"))]
    Parquet {
        /// File being processed.
        path: String,
        /// Underlying Parquet error.
        source: ParquetError,
    },

    /// Resolving a logical database name failed.
    #[snafu(display("Registry error: {source}"))]
    Registry {
        /// Underlying registry error.
        source: RegistryError,
    },
}

impl From<StorageError> for DatabankError {
    fn from(source: StorageError) -> Self {
        DatabankError::Storage { source }
    }
}

impl From<RegistryError> for DatabankError {
    fn from(source: RegistryError) -> Self {
        DatabankError::Registry { source }
    }
}
