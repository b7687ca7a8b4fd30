//! Lazy columnar engine backed by Apache Parquet.
//!
//! One table per file. The storage key and the metadata map live in the
//! Parquet key-value footer under [`KEY_META`] and [`METADATA_META`].
//!
//! Reads go through [`LazyFrame`], a handle that has parsed only the footer.
//! `select` and `filter` record a projection and a row filter without
//! touching column data; [`LazyFrame::collect`] then pushes both into the
//! Parquet reader:
//!
//! - projection becomes a [`ProjectionMask`] so unrequested column chunks
//!   are never decoded,
//! - row groups whose statistics prove the filter false are skipped,
//! - the remaining rows are filtered by an `ArrowPredicateFn` evaluated on
//!   the filter columns before the projected columns are decoded.

use std::{
    fs::File,
    path::{Path, PathBuf},
    sync::Arc,
};

use arrow::{
    array::{RecordBatch, RecordBatchOptions},
    compute::concat_batches,
    datatypes::{DataType, Schema, SchemaRef},
    record_batch::RecordBatchReader,
};
use log::{debug, trace};
use parquet::{
    arrow::{
        ArrowWriter, ProjectionMask,
        arrow_reader::{
            ArrowPredicateFn, ArrowReaderMetadata, ArrowReaderOptions,
            ParquetRecordBatchReaderBuilder, RowFilter as ParquetRowFilter,
        },
    },
    file::{
        metadata::{KeyValue, RowGroupMetaData},
        properties::WriterProperties,
        statistics::Statistics,
    },
};
use snafu::prelude::*;

use crate::{
    engine::{
        DEFAULT_KEY, Engine, EngineAdapter, ensure_engine, ensure_engine_if_exists,
        normalize_key, project_columns,
    },
    error::{ArrowSnafu, DatabankError, DatabankResult, MetadataSnafu, ParquetSnafu},
    filter::{IntervalTruth, RowFilter},
    metadata::{self, Metadata},
    storage::{self, FileHeadTail, classify_io},
};

/// Footer entry holding the storage key.
pub const KEY_META: &str = "linebank.key";
/// Footer entry holding the encoded metadata map.
pub const METADATA_META: &str = "linebank.metadata";

const PARQUET_MAGIC: &[u8; 4] = b"PAR1";

/// Adapter for the lazy columnar engine.
#[derive(Debug, Clone, Copy)]
pub struct ColumnarEngine {
    row_group_size: usize,
}

impl ColumnarEngine {
    /// Rows per Parquet row group unless configured otherwise.
    pub const DEFAULT_ROW_GROUP_SIZE: usize = 64 * 1024;

    /// Engine with the default row group size.
    pub const fn new() -> Self {
        Self {
            row_group_size: Self::DEFAULT_ROW_GROUP_SIZE,
        }
    }

    /// Use `rows` rows per row group (at least one).
    ///
    /// Smaller groups make statistics-based pruning finer grained at the
    /// cost of a larger footer.
    pub const fn with_row_group_size(mut self, rows: usize) -> Self {
        self.row_group_size = if rows == 0 { 1 } else { rows };
        self
    }

    /// Open a lazy handle on the table at `(path, key)`.
    pub fn scan(&self, path: &Path, key: Option<&str>) -> DatabankResult<LazyFrame> {
        LazyFrame::open(path, key)
    }

    fn writer_properties(&self, key: &str, metadata: Option<String>) -> WriterProperties {
        let mut kv = vec![KeyValue::new(KEY_META.to_string(), key.to_string())];
        if let Some(encoded) = metadata {
            kv.push(KeyValue::new(METADATA_META.to_string(), encoded));
        }
        WriterProperties::builder()
            .set_max_row_group_size(self.row_group_size)
            .set_key_value_metadata(Some(kv))
            .build()
    }
}

impl Default for ColumnarEngine {
    fn default() -> Self {
        Self::new()
    }
}

fn corrupt(path: &Path, reason: impl Into<String>) -> DatabankError {
    DatabankError::FileCorrupt {
        path: path.display().to_string(),
        engine: Engine::LazyColumnar,
        reason: reason.into(),
    }
}

fn footer_value<'m>(meta: &'m ArrowReaderMetadata, name: &str) -> Option<&'m str> {
    meta.metadata()
        .file_metadata()
        .key_value_metadata()?
        .iter()
        .find(|kv| kv.key == name)
        .and_then(|kv| kv.value.as_deref())
}

/// Open `path` and parse its footer, checking the stored key.
fn open_footer(path: &Path, key: Option<&str>) -> DatabankResult<(File, ArrowReaderMetadata, String)> {
    ensure_engine(path, Engine::LazyColumnar)?;
    let file = storage::open_read(path)?;
    let meta = ArrowReaderMetadata::load(&file, ArrowReaderOptions::new())
        .map_err(|e| corrupt(path, format!("cannot read Parquet footer: {e}")))?;

    let stored = footer_value(&meta, KEY_META).unwrap_or(DEFAULT_KEY).to_string();
    let requested = normalize_key(key).unwrap_or(DEFAULT_KEY);
    if requested != stored {
        return Err(DatabankError::MissingKey {
            path: path.display().to_string(),
            key: requested.to_string(),
            available: vec![stored],
        });
    }
    Ok((file, meta, stored))
}

/// Rebuild `batch` under a schema without the footer entries the Parquet
/// reader copies into schema metadata.
fn without_schema_metadata(batch: RecordBatch) -> Result<RecordBatch, arrow::error::ArrowError> {
    if batch.schema().metadata().is_empty() {
        return Ok(batch);
    }
    let schema = Arc::new(Schema::new(batch.schema().fields().clone()));
    RecordBatch::try_new_with_options(
        schema,
        batch.columns().to_vec(),
        &RecordBatchOptions::new().with_row_count(Some(batch.num_rows())),
    )
}

/// Min/max of `column` in one row group, when statistics allow pruning.
fn column_bounds(schema: &Schema, rg: &RowGroupMetaData, column: &str) -> Option<(f64, f64)> {
    let field = schema.field_with_name(column).ok()?;
    // u64 statistics use unsigned ordering on a signed physical type.
    let prunable = matches!(
        field.data_type(),
        DataType::Float32
            | DataType::Float64
            | DataType::Int8
            | DataType::Int16
            | DataType::Int32
            | DataType::Int64
            | DataType::UInt8
            | DataType::UInt16
            | DataType::UInt32
    );
    if !prunable {
        return None;
    }

    let chunk = rg
        .columns()
        .iter()
        .find(|c| c.column_path().string() == column)?;
    let (lo, hi) = match chunk.statistics()? {
        // u32 values are stored as i32 bit patterns.
        Statistics::Int32(s) if field.data_type() == &DataType::UInt32 => (
            f64::from(*s.min_opt()? as u32),
            f64::from(*s.max_opt()? as u32),
        ),
        Statistics::Int32(s) => (f64::from(*s.min_opt()?), f64::from(*s.max_opt()?)),
        Statistics::Int64(s) => (*s.min_opt()? as f64, *s.max_opt()? as f64),
        Statistics::Float(s) => (f64::from(*s.min_opt()?), f64::from(*s.max_opt()?)),
        Statistics::Double(s) => (*s.min_opt()?, *s.max_opt()?),
        _ => return None,
    };
    (!lo.is_nan() && !hi.is_nan()).then_some((lo, hi))
}

/// Indices of the row groups that may hold rows matching `filter`.
fn surviving_row_groups(meta: &ArrowReaderMetadata, filter: &RowFilter) -> Vec<usize> {
    let schema = meta.schema();
    meta.metadata()
        .row_groups()
        .iter()
        .enumerate()
        .filter(|(_, rg)| {
            filter.on_intervals(|column| column_bounds(schema, rg, column))
                != IntervalTruth::AlwaysFalse
        })
        .map(|(i, _)| i)
        .collect()
}

/// A lazily evaluated table backed by an open Parquet file.
///
/// Only the footer has been read when the frame is created. The frame owns
/// the file descriptor until [`LazyFrame::close`] is called or the frame is
/// dropped. [`LazyFrame::collect`] materializes without closing, so a frame
/// can be collected several times.
///
/// ```no_run
/// # use linebank_core::{ColumnarEngine, filter::{RowFilter, Predicate}};
/// # fn demo() -> Result<(), linebank_core::DatabankError> {
/// let mut frame = ColumnarEngine::new()
///     .scan("lines.parquet".as_ref(), None)?
///     .select(["wav", "int"])?
///     .filter(RowFilter::none().and(Predicate::Range {
///         column: "wav".into(),
///         min: Some(2300.0),
///         max: Some(2500.0),
///     }))?;
/// let table = frame.collect()?;
/// frame.close();
/// # let _ = table;
/// # Ok(())
/// # }
/// ```
#[derive(Debug)]
pub struct LazyFrame {
    path: PathBuf,
    key: String,
    file: Option<File>,
    meta: ArrowReaderMetadata,
    columns: Option<Vec<String>>,
    filter: RowFilter,
}

impl LazyFrame {
    /// Open the table at `(path, key)`, reading only the footer.
    pub fn open(path: &Path, key: Option<&str>) -> DatabankResult<Self> {
        let (file, meta, key) = open_footer(path, key)?;
        trace!(
            "opened lazy frame on {} ({} row groups)",
            path.display(),
            meta.metadata().num_row_groups()
        );
        Ok(Self {
            path: path.to_path_buf(),
            key,
            file: Some(file),
            meta,
            columns: None,
            filter: RowFilter::none(),
        })
    }

    /// File the frame reads from.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Storage key recorded in the file.
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Rows in the file, before any filter.
    pub fn total_rows(&self) -> u64 {
        u64::try_from(self.meta.metadata().file_metadata().num_rows()).unwrap_or(0)
    }

    /// Number of row groups in the file.
    pub fn num_row_groups(&self) -> usize {
        self.meta.metadata().num_row_groups()
    }

    /// Schema of the frame's output, after any `select`.
    pub fn schema(&self) -> SchemaRef {
        let full = self.meta.schema();
        let fields: Vec<_> = match &self.columns {
            Some(cols) => cols
                .iter()
                .filter_map(|c| full.field_with_name(c).ok().cloned())
                .collect(),
            None => full.fields().iter().map(|f| f.as_ref().clone()).collect(),
        };
        Arc::new(Schema::new(fields))
    }

    /// The row filter collected so far.
    pub fn row_filter(&self) -> &RowFilter {
        &self.filter
    }

    /// Returns true once the file descriptor has been released.
    pub fn is_closed(&self) -> bool {
        self.file.is_none()
    }

    fn ensure_open(&self) -> DatabankResult<&File> {
        self.file.as_ref().ok_or_else(|| DatabankError::HandleClosed {
            path: self.path.display().to_string(),
        })
    }

    fn unknown_column(&self, column: &str, available: &Schema) -> DatabankError {
        DatabankError::UnknownColumn {
            path: self.path.display().to_string(),
            column: column.to_string(),
            available: available.fields().iter().map(|f| f.name().clone()).collect(),
        }
    }

    /// Narrow the output to `columns`, in that order.
    ///
    /// Names must exist in the current output schema. Duplicates are
    /// collapsed; an empty list fails with `EmptyProjection`.
    pub fn select<I, S>(mut self, columns: I) -> DatabankResult<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.ensure_open()?;
        let visible = self.schema();
        let mut selected: Vec<String> = Vec::new();
        for column in columns {
            let column = column.into();
            if visible.field_with_name(&column).is_err() {
                return Err(self.unknown_column(&column, &visible));
            }
            if !selected.contains(&column) {
                selected.push(column);
            }
        }
        if selected.is_empty() {
            return Err(DatabankError::EmptyProjection {
                path: self.path.display().to_string(),
            });
        }
        self.columns = Some(selected);
        Ok(self)
    }

    /// AND `filter` into the frame's row filter.
    ///
    /// Filter columns may be any column of the file, selected or not.
    pub fn filter(mut self, filter: RowFilter) -> DatabankResult<Self> {
        self.ensure_open()?;
        let full = Arc::clone(self.meta.schema());
        if let Some(missing) = filter
            .columns()
            .into_iter()
            .find(|c| full.field_with_name(c).is_err())
        {
            return Err(self.unknown_column(missing, &full));
        }
        self.filter = std::mem::take(&mut self.filter).and_all(filter);
        Ok(self)
    }

    /// Materialize the frame: read the selected columns of matching rows.
    pub fn collect(&self) -> DatabankResult<RecordBatch> {
        let path_str = self.path.display().to_string();
        let file = self
            .ensure_open()?
            .try_clone()
            .map_err(|e| classify_io(&path_str, e))?;

        let parquet_schema = self.meta.parquet_schema();
        let mut builder = ParquetRecordBatchReaderBuilder::new_with_metadata(file, self.meta.clone());

        if let Some(cols) = &self.columns {
            builder = builder.with_projection(ProjectionMask::columns(
                parquet_schema,
                cols.iter().map(String::as_str),
            ));
        }

        if !self.filter.is_empty() {
            let groups = surviving_row_groups(&self.meta, &self.filter);
            debug!(
                "lazy read of {}: {}/{} row groups survive statistics pruning",
                self.path.display(),
                groups.len(),
                self.num_row_groups()
            );
            let mask = ProjectionMask::columns(parquet_schema, self.filter.columns());
            let filter = self.filter.clone();
            let predicate = ArrowPredicateFn::new(mask, move |batch| filter.evaluate(&batch));
            builder = builder
                .with_row_groups(groups)
                .with_row_filter(ParquetRowFilter::new(vec![Box::new(predicate)]));
        }

        let reader = builder.build().context(ParquetSnafu { path: &path_str })?;
        let schema = reader.schema();
        let batches = reader
            .collect::<Result<Vec<_>, _>>()
            .context(ArrowSnafu { path: &path_str })?;
        let table = concat_batches(&schema, &batches).context(ArrowSnafu { path: &path_str })?;
        let table = project_columns(&table, self.columns.as_deref())
            .and_then(without_schema_metadata)
            .context(ArrowSnafu { path: path_str })?;
        Ok(table)
    }

    /// Release the file descriptor. Closing twice is a no-op.
    pub fn close(&mut self) {
        if self.file.take().is_some() {
            trace!("closed lazy frame on {}", self.path.display());
        }
    }
}

impl Drop for LazyFrame {
    fn drop(&mut self) {
        self.close();
    }
}

impl EngineAdapter for ColumnarEngine {
    fn engine(&self) -> Engine {
        Engine::LazyColumnar
    }

    fn matches(&self, probe: &FileHeadTail) -> bool {
        probe.len >= 12 && probe.head[..4] == *PARQUET_MAGIC && probe.tail[4..] == *PARQUET_MAGIC
    }

    fn supports_filter_pushdown(&self) -> bool {
        true
    }

    fn write_table(&self, path: &Path, key: Option<&str>, table: &RecordBatch) -> DatabankResult<()> {
        ensure_engine_if_exists(path, Engine::LazyColumnar)?;
        let key = normalize_key(key).unwrap_or(DEFAULT_KEY);
        let props = self.writer_properties(key, None);
        let path_str = path.display().to_string();

        storage::write_atomic_with(path, |file: File| {
            let mut writer = ArrowWriter::try_new(file, table.schema(), Some(props))
                .context(ParquetSnafu { path: &path_str })?;
            writer.write(table).context(ParquetSnafu { path: &path_str })?;
            writer.into_inner().context(ParquetSnafu { path: &path_str })
        })?;
        debug!(
            "lazy-columnar-engine wrote {} rows to {}:{key}",
            table.num_rows(),
            path.display()
        );
        Ok(())
    }

    fn write_metadata(&self, path: &Path, key: Option<&str>, meta: &Metadata) -> DatabankResult<()> {
        let (file, reader_meta, key) = open_footer(path, key)?;
        let path_str = path.display().to_string();
        let encoded = metadata::encode(meta).context(MetadataSnafu {
            path: &path_str,
            key: &key,
        })?;
        let props = self.writer_properties(&key, Some(encoded));

        // Parquet footers cannot be patched in place; stream the row groups
        // into a fresh file carrying the new footer.
        let schema = Arc::new(Schema::new(reader_meta.schema().fields().clone()));
        let reader = ParquetRecordBatchReaderBuilder::new_with_metadata(file, reader_meta)
            .build()
            .context(ParquetSnafu { path: &path_str })?;

        storage::write_atomic_with(path, |out: File| {
            let mut writer = ArrowWriter::try_new(out, Arc::clone(&schema), Some(props))
                .context(ParquetSnafu { path: &path_str })?;
            for batch in reader {
                let batch = batch
                    .and_then(without_schema_metadata)
                    .context(ArrowSnafu { path: &path_str })?;
                writer.write(&batch).context(ParquetSnafu { path: &path_str })?;
            }
            writer.into_inner().context(ParquetSnafu { path: &path_str })
        })
    }

    fn read_metadata(&self, path: &Path, key: Option<&str>) -> DatabankResult<Metadata> {
        let (_, meta, key) = open_footer(path, key)?;
        match footer_value(&meta, METADATA_META) {
            Some(raw) => metadata::decode(raw).context(MetadataSnafu {
                path: path.display().to_string(),
                key,
            }),
            None => Ok(Metadata::new()),
        }
    }

    fn schema(&self, path: &Path, key: Option<&str>) -> DatabankResult<SchemaRef> {
        Ok(LazyFrame::open(path, key)?.schema())
    }

    fn keys(&self, path: &Path) -> DatabankResult<Vec<String>> {
        ensure_engine(path, Engine::LazyColumnar)?;
        let file = storage::open_read(path)?;
        let meta = ArrowReaderMetadata::load(&file, ArrowReaderOptions::new())
            .map_err(|e| corrupt(path, format!("cannot read Parquet footer: {e}")))?;
        Ok(vec![footer_value(&meta, KEY_META).unwrap_or(DEFAULT_KEY).to_string()])
    }

    fn read(
        &self,
        path: &Path,
        key: Option<&str>,
        columns: Option<&[String]>,
        filter: &RowFilter,
    ) -> DatabankResult<RecordBatch> {
        let mut frame = self.scan(path, key)?;
        if let Some(cols) = columns {
            frame = frame.select(cols.iter().cloned())?;
        }
        if !filter.is_empty() {
            frame = frame.filter(filter.clone())?;
        }
        let table = frame.collect();
        frame.close();
        table
    }
}
