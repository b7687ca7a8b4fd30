//! Partial loading: engine detection, projection, and row filters.
//!
//! [`table_from_file`] is the high-level read path. With
//! [`EngineChoice::Guess`] it classifies the file by its signature before
//! delegating to a [`StorageManager`] bound to the detected engine.
//! [`load_database`] does the same for every file a registry entry lists.

use std::{path::Path, sync::Arc};

use arrow::{array::RecordBatch, compute::concat_batches, datatypes::Schema};
use log::{debug, info};
use snafu::prelude::*;

use crate::{
    config::LinebankConfig,
    engine::{self, Engine, EngineChoice},
    error::{ArrowSnafu, DatabankError, DatabankResult, EmptyProjectionSnafu},
    filter::{CategorySet, DEFAULT_CATEGORY_COLUMN, DEFAULT_RANGE_COLUMN, Predicate, RowFilter},
    manager::StorageManager,
    registry::DatabaseRegistry,
};

/// What to load: projection, category selector, and range bounds.
///
/// ```
/// use linebank_core::LoadOptions;
///
/// let opts = LoadOptions::new()
///     .columns(["wav", "int"])
///     .isotope([1, 2])
///     .load_value_min(2300.0)
///     .load_value_max(2500.0);
/// assert_eq!(opts.range_column, "wav");
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct LoadOptions {
    /// Columns to return, in order; `None` returns every column.
    pub columns: Option<Vec<String>>,
    /// Keep only rows whose category column is in this set.
    pub isotope: Option<CategorySet>,
    /// Inclusive lower bound on the range column.
    pub load_value_min: Option<f64>,
    /// Inclusive upper bound on the range column.
    pub load_value_max: Option<f64>,
    /// Column the range bounds apply to.
    pub range_column: String,
    /// Column the category selector applies to.
    pub category_column: String,
}

impl Default for LoadOptions {
    fn default() -> Self {
        Self {
            columns: None,
            isotope: None,
            load_value_min: None,
            load_value_max: None,
            range_column: DEFAULT_RANGE_COLUMN.to_string(),
            category_column: DEFAULT_CATEGORY_COLUMN.to_string(),
        }
    }
}

impl LoadOptions {
    /// Load everything.
    pub fn new() -> Self {
        Self::default()
    }

    /// Use the filter column names from `config`.
    pub fn with_config(mut self, config: &LinebankConfig) -> Self {
        self.range_column = config.range_column.clone();
        self.category_column = config.category_column.clone();
        self
    }

    /// Return only `columns`, in that order.
    pub fn columns<I, S>(mut self, columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.columns = Some(columns.into_iter().map(Into::into).collect());
        self
    }

    /// Keep only rows whose category is in `isotope`.
    pub fn isotope(mut self, isotope: impl Into<CategorySet>) -> Self {
        self.isotope = Some(isotope.into());
        self
    }

    /// Keep only rows with range value `>= min`.
    pub fn load_value_min(mut self, min: f64) -> Self {
        self.load_value_min = Some(min);
        self
    }

    /// Keep only rows with range value `<= max`.
    pub fn load_value_max(mut self, max: f64) -> Self {
        self.load_value_max = Some(max);
        self
    }

    /// Apply the range bounds to `column` instead of `wav`.
    pub fn range_column(mut self, column: impl Into<String>) -> Self {
        self.range_column = column.into();
        self
    }

    /// Apply the category selector to `column` instead of `iso`.
    pub fn category_column(mut self, column: impl Into<String>) -> Self {
        self.category_column = column.into();
        self
    }

    /// The conjunction of the range and category predicates.
    ///
    /// Fails with `InvalidRange` if a bound is NaN. `min > max` is valid and
    /// matches nothing.
    pub fn to_row_filter(&self) -> DatabankResult<RowFilter> {
        let (min, max) = (self.load_value_min, self.load_value_max);
        if min.is_some_and(f64::is_nan) || max.is_some_and(f64::is_nan) {
            return Err(DatabankError::InvalidRange {
                column: self.range_column.clone(),
                min,
                max,
            });
        }

        let mut filter = RowFilter::none();
        if min.is_some() || max.is_some() {
            filter = filter.and(Predicate::Range {
                column: self.range_column.clone(),
                min,
                max,
            });
        }
        if let Some(values) = &self.isotope {
            filter = filter.and(Predicate::InSet {
                column: self.category_column.clone(),
                values: values.clone(),
            });
        }
        Ok(filter)
    }

    /// The requested projection with duplicates collapsed.
    pub(crate) fn projection(&self, path: &str) -> DatabankResult<Option<Vec<String>>> {
        let Some(columns) = &self.columns else {
            return Ok(None);
        };
        ensure!(!columns.is_empty(), EmptyProjectionSnafu { path });
        let mut unique: Vec<String> = Vec::with_capacity(columns.len());
        for column in columns {
            if !unique.contains(column) {
                unique.push(column.clone());
            }
        }
        Ok(Some(unique))
    }
}

/// Detect which engine wrote `path` from its signature.
pub fn detect_engine(path: impl AsRef<Path>) -> DatabankResult<Engine> {
    engine::detect(path.as_ref())
}

/// Load the default table stored in `path`.
///
/// `engine` may be a concrete [`Engine`] or [`EngineChoice::Guess`].
pub fn table_from_file(
    path: impl AsRef<Path>,
    engine: impl Into<EngineChoice>,
    options: &LoadOptions,
) -> DatabankResult<RecordBatch> {
    let path = path.as_ref();
    let engine = match engine.into() {
        EngineChoice::Explicit(engine) => engine,
        EngineChoice::Guess => {
            let engine = detect_engine(path)?;
            info!("guessed {engine} for {}", path.display());
            engine
        }
    };
    StorageManager::new(engine).load(path, None, options)
}

/// Load every file registered under `name` and concatenate them in
/// registration order.
///
/// All files are read with the engine recorded in the registry. Files whose
/// loaded schema differs from the first file's fail with `SchemaMismatch`.
pub fn load_database(
    registry: &DatabaseRegistry,
    name: &str,
    options: &LoadOptions,
) -> DatabankResult<RecordBatch> {
    let entry = registry.resolve(name)?;
    let manager = StorageManager::new(entry.engine);

    let mut tables: Vec<RecordBatch> = Vec::with_capacity(entry.paths.len());
    for path in &entry.paths {
        let table = manager.load(path, None, options)?;
        if let Some(first) = tables.first() {
            if first.schema().fields() != table.schema().fields() {
                return Err(DatabankError::SchemaMismatch {
                    name: name.to_string(),
                    path: path.display().to_string(),
                });
            }
        }
        tables.push(table);
    }

    let schema = tables
        .first()
        .map(|t| t.schema())
        .unwrap_or_else(|| Arc::new(Schema::empty()));
    let merged = concat_batches(&schema, &tables).context(ArrowSnafu { path: name })?;
    debug!(
        "loaded database {name:?}: {} files, {} rows",
        tables.len(),
        merged.num_rows()
    );
    Ok(merged)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::{TestResult, line_table};
    use tempfile::TempDir;

    #[test]
    fn options_build_filters_in_order() -> DatabankResult<()> {
        let filter = LoadOptions::new()
            .isotope([1, 2])
            .load_value_max(2500.0)
            .to_row_filter()?;
        assert_eq!(filter.columns(), vec!["wav", "iso"]);

        assert!(LoadOptions::new().to_row_filter()?.is_empty());
        Ok(())
    }

    #[test]
    fn projection_collapses_duplicates() -> DatabankResult<()> {
        let opts = LoadOptions::new().columns(["iso", "wav", "iso"]);
        assert_eq!(
            opts.projection("x")?,
            Some(vec!["iso".to_string(), "wav".to_string()])
        );
        assert_eq!(LoadOptions::new().projection("x")?, None);
        Ok(())
    }

    #[test]
    fn config_overrides_filter_columns() {
        let config = LinebankConfig {
            range_column: "nu".into(),
            category_column: "isotope".into(),
            ..LinebankConfig::default()
        };
        let opts = LoadOptions::new().with_config(&config);
        assert_eq!(opts.range_column, "nu");
        assert_eq!(opts.category_column, "isotope");
    }

    #[test]
    fn guess_matches_explicit_engine() -> TestResult {
        let tmp = TempDir::new()?;
        let options = LoadOptions::new().load_value_min(2600.0);
        for engine in Engine::ALL {
            let path = tmp.path().join(format!("f-{engine}"));
            StorageManager::new(engine).write_table(&path, None, &line_table(90))?;

            assert_eq!(detect_engine(&path)?, engine);
            let guessed = table_from_file(&path, EngineChoice::Guess, &options)?;
            let explicit = table_from_file(&path, engine, &options)?;
            assert_eq!(guessed, explicit);
        }
        Ok(())
    }

    #[test]
    fn unknown_layout_fails_detection() -> TestResult {
        let tmp = TempDir::new()?;
        let path = tmp.path().join("notes.txt");
        std::fs::write(&path, "just some text, not a table container")?;

        let err = table_from_file(&path, EngineChoice::Guess, &LoadOptions::new())
            .expect_err("no engine signature");
        assert!(matches!(err, DatabankError::EngineDetection { .. }));
        Ok(())
    }
}
