//! Engine-agnostic storage facade.
//!
//! A [`StorageManager`] is bound to one [`Engine`] at construction and
//! forwards every call to that engine's adapter. It owns the parts of a
//! load that must behave the same on every engine:
//!
//! 1. the range bounds and category selector are turned into a [`RowFilter`]
//!    (NaN bounds fail with `InvalidRange`),
//! 2. the projection and every filter column are checked against the
//!    stored schema before any column data is read,
//! 3. the filter is pushed into the adapter when it supports pushdown, and
//!    otherwise applied in memory to the columns the filter and projection
//!    need,
//! 4. the projection is applied last, in the requested order.

use std::path::Path;

use arrow::{array::RecordBatch, datatypes::SchemaRef};
use log::debug;
use snafu::prelude::*;

use crate::{
    engine::{Engine, EngineAdapter, LazyFrame, columnar, project_columns},
    error::{ArrowSnafu, DatabankError, DatabankResult},
    filter::RowFilter,
    loader::LoadOptions,
    metadata::Metadata,
};

/// Facade over one storage engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StorageManager {
    engine: Engine,
}

impl StorageManager {
    /// Bind a manager to `engine`.
    pub fn new(engine: Engine) -> Self {
        Self { engine }
    }

    /// The bound engine.
    pub fn engine(&self) -> Engine {
        self.engine
    }

    fn adapter(&self) -> &'static dyn EngineAdapter {
        self.engine.adapter()
    }

    /// Create or overwrite the table at `(path, key)`.
    pub fn write_table(
        &self,
        path: impl AsRef<Path>,
        key: Option<&str>,
        table: &RecordBatch,
    ) -> DatabankResult<()> {
        self.adapter().write_table(path.as_ref(), key, table)
    }

    /// Attach `metadata` to the table at `(path, key)`, replacing any
    /// metadata it already carries.
    pub fn add_metadata(
        &self,
        path: impl AsRef<Path>,
        metadata: &Metadata,
        key: Option<&str>,
    ) -> DatabankResult<()> {
        self.adapter().write_metadata(path.as_ref(), key, metadata)
    }

    /// Metadata attached to the table at `(path, key)`.
    pub fn read_metadata(&self, path: impl AsRef<Path>, key: Option<&str>) -> DatabankResult<Metadata> {
        self.adapter().read_metadata(path.as_ref(), key)
    }

    /// Keys stored in the file.
    pub fn keys(&self, path: impl AsRef<Path>) -> DatabankResult<Vec<String>> {
        self.adapter().keys(path.as_ref())
    }

    /// Schema of the table at `(path, key)`.
    pub fn schema(&self, path: impl AsRef<Path>, key: Option<&str>) -> DatabankResult<SchemaRef> {
        self.adapter().schema(path.as_ref(), key)
    }

    /// Open a lazy handle on `(path, key)`.
    ///
    /// Only the lazy columnar engine hands out lazy handles; other engines
    /// fail with `UnsupportedOperation`.
    pub fn scan(&self, path: impl AsRef<Path>, key: Option<&str>) -> DatabankResult<LazyFrame> {
        match self.engine {
            Engine::LazyColumnar => columnar::LazyFrame::open(path.as_ref(), key),
            engine => Err(DatabankError::UnsupportedOperation {
                engine,
                operation: "scan",
            }),
        }
    }

    /// Load the table at `(path, key)`, projected and filtered per `options`.
    ///
    /// Either the whole result is returned or an error; a failed load never
    /// yields a partially filtered or partially projected table.
    pub fn load(
        &self,
        path: impl AsRef<Path>,
        key: Option<&str>,
        options: &LoadOptions,
    ) -> DatabankResult<RecordBatch> {
        let path = path.as_ref();
        let path_str = path.display().to_string();
        let adapter = self.adapter();

        let filter = options.to_row_filter()?;
        let schema = adapter.schema(path, key)?;
        let columns = options.projection(&path_str)?;

        let available = || -> Vec<String> {
            schema.fields().iter().map(|f| f.name().clone()).collect()
        };
        let requested = columns.iter().flatten().map(String::as_str);
        for column in requested.chain(filter.columns()) {
            if schema.field_with_name(column).is_err() {
                return Err(DatabankError::UnknownColumn {
                    path: path_str,
                    column: column.to_string(),
                    available: available(),
                });
            }
        }

        let table = if filter.is_empty() || adapter.supports_filter_pushdown() {
            adapter.read(path, key, columns.as_deref(), &filter)?
        } else {
            let needed = columns.as_ref().map(|cols| with_filter_columns(cols, &filter));
            let table = adapter.read(path, key, needed.as_deref(), &RowFilter::none())?;
            filter
                .apply(&table)
                .and_then(|t| project_columns(&t, columns.as_deref()))
                .context(ArrowSnafu { path: &path_str })?
        };

        debug!(
            "{} loaded {} rows x {} columns from {path_str}",
            self.engine,
            table.num_rows(),
            table.num_columns()
        );
        Ok(table)
    }
}

/// `columns` followed by any filter column not already listed.
fn with_filter_columns(columns: &[String], filter: &RowFilter) -> Vec<String> {
    let mut needed = columns.to_vec();
    for column in filter.columns() {
        if !needed.iter().any(|c| c == column) {
            needed.push(column.to_string());
        }
    }
    needed
}
