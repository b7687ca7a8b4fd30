//! Storage engines and the capability interface they share.
//!
//! The set of engines is closed: [`Engine`] names every concrete on-disk
//! format and [`Engine::adapter`] maps each variant to its
//! [`EngineAdapter`]. Call sites never branch on file extensions or type
//! names; adding an engine means adding a variant and an adapter.
//!
//! | Engine                 | Container                         | Keys per file | Filter pushdown |
//! |------------------------|-----------------------------------|---------------|-----------------|
//! | `table-engine`         | catalog + Arrow IPC blocks        | many          | no              |
//! | `flat-engine`          | raw little-endian arrays          | many (prefix) | yes             |
//! | `lazy-columnar-engine` | Apache Parquet                    | one           | yes (lazy)      |
//!
//! Every file carries an engine signature in its first and last bytes, so
//! [`detect`] can classify a file without parsing it.

pub mod columnar;
pub(crate) mod container;
pub mod flat;
pub mod table;

use std::{fmt, path::Path, str::FromStr};

use arrow::{array::RecordBatch, datatypes::SchemaRef, error::ArrowError};
use log::debug;
use serde::{Deserialize, Serialize};
use snafu::prelude::*;

use crate::{
    error::{DatabankError, DatabankResult},
    filter::RowFilter,
    metadata::Metadata,
    storage::{self, FileHeadTail},
};

pub use columnar::{ColumnarEngine, LazyFrame};
pub use flat::FlatEngine;
pub use table::TableEngine;

/// Key under which a table is stored when the caller gives none.
pub const DEFAULT_KEY: &str = "df";

/// A concrete storage engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Engine {
    /// Catalog container holding one Arrow IPC table per key.
    #[serde(rename = "table-engine")]
    Table,
    /// Container of raw named arrays, one per column.
    #[serde(rename = "flat-engine")]
    Flat,
    /// Apache Parquet, read lazily.
    #[serde(rename = "lazy-columnar-engine")]
    LazyColumnar,
}

impl Engine {
    /// Every engine, in detection order.
    pub const ALL: [Engine; 3] = [Engine::Table, Engine::Flat, Engine::LazyColumnar];

    /// Canonical identifier, as stored in the registry.
    pub fn as_str(self) -> &'static str {
        match self {
            Engine::Table => "table-engine",
            Engine::Flat => "flat-engine",
            Engine::LazyColumnar => "lazy-columnar-engine",
        }
    }

    /// The adapter implementing this engine.
    pub fn adapter(self) -> &'static dyn EngineAdapter {
        static TABLE: TableEngine = TableEngine;
        static FLAT: FlatEngine = FlatEngine;
        static COLUMNAR: ColumnarEngine = ColumnarEngine::new();
        match self {
            Engine::Table => &TABLE,
            Engine::Flat => &FLAT,
            Engine::LazyColumnar => &COLUMNAR,
        }
    }
}

impl fmt::Display for Engine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors from parsing an engine identifier.
#[derive(Debug, Snafu, PartialEq, Eq)]
pub enum ParseEngineError {
    /// The identifier names no engine.
    #[snafu(display(
        "unknown engine {input:?}; expected one of table-engine, flat-engine, lazy-columnar-engine, guess"
    ))]
    UnknownEngine {
        /// The string that failed to parse.
        input: String,
    },
}

impl FromStr for Engine {
    type Err = ParseEngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "table-engine" | "table" => Ok(Engine::Table),
            "flat-engine" | "flat" => Ok(Engine::Flat),
            "lazy-columnar-engine" | "lazy-columnar" | "columnar" | "lazy" => {
                Ok(Engine::LazyColumnar)
            }
            _ => UnknownEngineSnafu { input: s }.fail(),
        }
    }
}

/// Engine requested by a caller: a concrete engine, or detection from the
/// file's structure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EngineChoice {
    /// Detect the engine from the file signature.
    #[default]
    Guess,
    /// Use this engine.
    Explicit(Engine),
}

impl From<Engine> for EngineChoice {
    fn from(engine: Engine) -> Self {
        EngineChoice::Explicit(engine)
    }
}

impl FromStr for EngineChoice {
    type Err = ParseEngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.trim().eq_ignore_ascii_case("guess") {
            Ok(EngineChoice::Guess)
        } else {
            s.parse().map(EngineChoice::Explicit)
        }
    }
}

impl fmt::Display for EngineChoice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EngineChoice::Guess => f.write_str("guess"),
            EngineChoice::Explicit(e) => e.fmt(f),
        }
    }
}

/// What every engine can do with a file.
///
/// `key` is an optional sub-address inside the file; `None` means the
/// engine's default location. Adapters never retry and never return a
/// partially projected or partially filtered table.
pub trait EngineAdapter: Send + Sync {
    /// The engine this adapter implements.
    fn engine(&self) -> Engine;

    /// Structural test on the file signature; must not parse the file.
    fn matches(&self, probe: &FileHeadTail) -> bool;

    /// Whether [`EngineAdapter::read`] evaluates row filters itself.
    fn supports_filter_pushdown(&self) -> bool;

    /// Create or overwrite the table stored at `(path, key)`.
    ///
    /// Overwriting resets that table's metadata.
    fn write_table(&self, path: &Path, key: Option<&str>, table: &RecordBatch)
    -> DatabankResult<()>;

    /// Replace the metadata attached to the table at `(path, key)`.
    fn write_metadata(&self, path: &Path, key: Option<&str>, metadata: &Metadata)
    -> DatabankResult<()>;

    /// Read the metadata attached to the table at `(path, key)`; a table
    /// without metadata yields an empty map.
    fn read_metadata(&self, path: &Path, key: Option<&str>) -> DatabankResult<Metadata>;

    /// Schema of the table at `(path, key)`, read without loading rows.
    fn schema(&self, path: &Path, key: Option<&str>) -> DatabankResult<SchemaRef>;

    /// Keys stored in the file.
    fn keys(&self, path: &Path) -> DatabankResult<Vec<String>>;

    /// Read `columns` (all when `None`) of the rows matching `filter`.
    ///
    /// Column names are already validated by the caller. Adapters that do
    /// not support pushdown are only ever called with an empty filter.
    /// Output columns follow the order of `columns`.
    fn read(
        &self,
        path: &Path,
        key: Option<&str>,
        columns: Option<&[String]>,
        filter: &RowFilter,
    ) -> DatabankResult<RecordBatch>;
}

/// Reorder/select the columns of `batch` by name; `None` keeps all columns.
pub(crate) fn project_columns(
    batch: &RecordBatch,
    columns: Option<&[String]>,
) -> Result<RecordBatch, ArrowError> {
    let Some(columns) = columns else {
        return Ok(batch.clone());
    };
    let schema = batch.schema();
    let indices = columns
        .iter()
        .map(|name| schema.index_of(name))
        .collect::<Result<Vec<_>, _>>()?;
    batch.project(&indices)
}

/// Normalize a caller key: surrounding `/` are dropped and an empty key
/// means "no key".
pub(crate) fn normalize_key(key: Option<&str>) -> Option<&str> {
    key.map(|k| k.trim_matches('/')).filter(|k| !k.is_empty())
}

/// Classify a probed file, first match wins.
pub(crate) fn classify(probe: &FileHeadTail) -> Option<Engine> {
    Engine::ALL
        .into_iter()
        .find(|engine| engine.adapter().matches(probe))
}

/// Detect which engine wrote the file at `path`.
///
/// Reads only the file's first and last bytes. Fails with
/// `EngineDetection` when no engine recognizes the signature.
pub fn detect(path: &Path) -> DatabankResult<Engine> {
    let probe = storage::read_head_tail(path)?;
    let engine = classify(&probe).ok_or_else(|| DatabankError::EngineDetection {
        path: path.display().to_string(),
    })?;
    debug!("detected {engine} for {}", path.display());
    Ok(engine)
}

/// Ensure the existing file at `path` was written by `expected`.
pub(crate) fn ensure_engine(path: &Path, expected: Engine) -> DatabankResult<()> {
    let probe = storage::read_head_tail(path)?;
    if expected.adapter().matches(&probe) {
        return Ok(());
    }
    Err(DatabankError::EngineMismatch {
        path: path.display().to_string(),
        expected,
        found: classify(&probe),
    })
}

/// Like [`ensure_engine`], but a missing file is fine (it will be created).
pub(crate) fn ensure_engine_if_exists(path: &Path, expected: Engine) -> DatabankResult<bool> {
    match ensure_engine(path, expected) {
        Ok(()) => Ok(true),
        Err(DatabankError::Storage { source }) if source.is_not_found() => Ok(false),
        Err(e) => Err(e),
    }
}
