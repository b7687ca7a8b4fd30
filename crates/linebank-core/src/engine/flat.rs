//! Flat engine: one raw little-endian array per column.
//!
//! Arrays live in a footer-catalog container (see `container`) whose JSON
//! directory records each array's name, element type, length, and byte
//! range. A storage key `k` is a name prefix `k/`; without a key the table
//! sits at the root. Each stored table also owns a one-element `u8` marker
//! array named `<prefix>.metadata` whose attributes carry the column order,
//! the row count, and the serialized metadata map.
//!
//! Because every column is a separate contiguous byte range, projection
//! reads only the requested arrays. Row filters read the filter columns
//! first, build a mask, then read and subset the remaining columns.

use std::{
    collections::{BTreeMap, HashMap},
    fs::File,
    path::Path,
    sync::Arc,
};

use arrow::{
    array::{Array, ArrayRef, AsArray, BooleanArray, PrimitiveArray, RecordBatch, RecordBatchOptions},
    compute::filter as filter_array,
    datatypes::{
        ArrowPrimitiveType, DataType, Field, Float32Type, Float64Type, Int8Type, Int16Type,
        Int32Type, Int64Type, Schema, SchemaRef, UInt8Type, UInt16Type, UInt32Type, UInt64Type,
    },
};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use log::debug;
use serde::{Deserialize, Serialize};
use snafu::prelude::*;

use crate::{
    engine::{
        Engine, EngineAdapter,
        container::{self, Block, Span},
        ensure_engine, ensure_engine_if_exists, normalize_key,
    },
    error::{ArrowSnafu, DatabankError, DatabankResult, MetadataSnafu},
    filter::RowFilter,
    metadata::{self, Metadata},
    storage::{self, FileHeadTail, classify_io},
};

const MAGIC: &[u8; 8] = b"LBFLAT01";
const FORMAT_VERSION: u32 = 1;

const MARKER_SUFFIX: &str = ".metadata";
const ATTR_COLUMNS: &str = "columns";
const ATTR_ROWS: &str = "rows";
const ATTR_METADATA: &str = "metadata";

/// Key reported by [`EngineAdapter::keys`] for a table stored at the root.
pub const ROOT_KEY: &str = "/";

macro_rules! flat_dtypes {
    ($($variant:ident($arrow:ty, $native:ty, $put:ident, $get:ident) = $name:literal;)*) => {
        /// Element type of a stored array.
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
        enum FlatDType {
            $(#[serde(rename = $name)] $variant,)*
        }

        impl FlatDType {
            fn of(data_type: &DataType) -> Option<Self> {
                $(if *data_type == <$arrow as ArrowPrimitiveType>::DATA_TYPE {
                    return Some(FlatDType::$variant);
                })*
                None
            }

            fn width(self) -> usize {
                match self {
                    $(FlatDType::$variant => std::mem::size_of::<$native>(),)*
                }
            }

            fn data_type(self) -> DataType {
                match self {
                    $(FlatDType::$variant => <$arrow as ArrowPrimitiveType>::DATA_TYPE,)*
                }
            }

            fn encode(self, array: &dyn Array) -> Bytes {
                match self {
                    $(FlatDType::$variant => {
                        let values = array.as_primitive::<$arrow>();
                        let mut buf = BytesMut::with_capacity(values.len() * self.width());
                        for v in values.values().iter() {
                            buf.$put(*v);
                        }
                        buf.freeze()
                    })*
                }
            }

            /// `raw` must hold exactly `len * width` bytes.
            fn decode(self, mut raw: &[u8], len: usize) -> ArrayRef {
                match self {
                    $(FlatDType::$variant => {
                        let mut values: Vec<$native> = Vec::with_capacity(len);
                        for _ in 0..len {
                            values.push(raw.$get());
                        }
                        Arc::new(PrimitiveArray::<$arrow>::from(values))
                    })*
                }
            }
        }
    };
}

flat_dtypes! {
    F64(Float64Type, f64, put_f64_le, get_f64_le) = "f64";
    F32(Float32Type, f32, put_f32_le, get_f32_le) = "f32";
    I64(Int64Type, i64, put_i64_le, get_i64_le) = "i64";
    I32(Int32Type, i32, put_i32_le, get_i32_le) = "i32";
    I16(Int16Type, i16, put_i16_le, get_i16_le) = "i16";
    I8(Int8Type, i8, put_i8, get_i8) = "i8";
    U64(UInt64Type, u64, put_u64_le, get_u64_le) = "u64";
    U32(UInt32Type, u32, put_u32_le, get_u32_le) = "u32";
    U16(UInt16Type, u16, put_u16_le, get_u16_le) = "u16";
    U8(UInt8Type, u8, put_u8, get_u8) = "u8";
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Directory {
    format_version: u32,
    arrays: Vec<ArrayEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ArrayEntry {
    name: String,
    dtype: FlatDType,
    len: u64,
    block: Span,
    #[serde(default)]
    nullable: bool,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    attrs: BTreeMap<String, String>,
}

/// Adapter for the flat engine.
#[derive(Debug, Clone, Copy, Default)]
pub struct FlatEngine;

/// `"k/"` for key `k`, `""` for the root.
fn prefix_for(key: Option<&str>) -> String {
    normalize_key(key)
        .map(|k| format!("{k}/"))
        .unwrap_or_default()
}

fn marker_name(prefix: &str) -> String {
    format!("{prefix}{MARKER_SUFFIX}")
}

/// Whether array `name` belongs to the table stored under `prefix`.
fn owned_by(name: &str, prefix: &str) -> bool {
    name.strip_prefix(prefix)
        .is_some_and(|rest| !rest.contains('/'))
}

fn corrupt(path: &Path, reason: impl Into<String>) -> DatabankError {
    DatabankError::FileCorrupt {
        path: path.display().to_string(),
        engine: Engine::Flat,
        reason: reason.into(),
    }
}

fn open(path: &Path) -> DatabankResult<(File, Directory)> {
    ensure_engine(path, Engine::Flat)?;
    let mut file = storage::open_read(path)?;
    let dir: Directory = container::read_catalog(&mut file, path, Engine::Flat, MAGIC)?;
    if dir.format_version > FORMAT_VERSION {
        return Err(corrupt(
            path,
            format!(
                "directory format version {} is newer than supported version {FORMAT_VERSION}",
                dir.format_version
            ),
        ));
    }
    let file_len = file
        .metadata()
        .map_err(|e| classify_io(&path.display().to_string(), e))?
        .len();
    for entry in &dir.arrays {
        container::check_span(path, Engine::Flat, entry.block, file_len)?;
    }
    Ok((file, dir))
}

fn stored_keys(dir: &Directory) -> Vec<String> {
    dir.arrays
        .iter()
        .filter_map(|a| a.name.strip_suffix(MARKER_SUFFIX))
        .filter(|prefix| prefix.is_empty() || prefix.ends_with('/'))
        .map(|prefix| match prefix.trim_end_matches('/') {
            "" => ROOT_KEY.to_string(),
            key => key.to_string(),
        })
        .collect()
}

/// The stored table under `prefix`, as seen through its marker.
struct StoredTable<'d> {
    dir: &'d Directory,
    prefix: String,
    marker: &'d ArrayEntry,
    columns: Vec<String>,
    rows: usize,
}

impl<'d> StoredTable<'d> {
    fn find(dir: &'d Directory, path: &Path, key: Option<&str>) -> DatabankResult<Self> {
        let prefix = prefix_for(key);
        let marker_name = marker_name(&prefix);
        let marker = dir
            .arrays
            .iter()
            .find(|a| a.name == marker_name)
            .ok_or_else(|| DatabankError::MissingKey {
                path: path.display().to_string(),
                key: normalize_key(key).unwrap_or(ROOT_KEY).to_string(),
                available: stored_keys(dir),
            })?;

        let columns = match marker.attrs.get(ATTR_COLUMNS) {
            Some(raw) => serde_json::from_str(raw)
                .map_err(|e| corrupt(path, format!("bad column list on {marker_name}: {e}")))?,
            None => return Err(corrupt(path, format!("marker {marker_name} has no column list"))),
        };
        let rows = marker
            .attrs
            .get(ATTR_ROWS)
            .and_then(|r| r.parse::<usize>().ok())
            .ok_or_else(|| corrupt(path, format!("marker {marker_name} has no row count")))?;

        Ok(StoredTable {
            dir,
            prefix,
            marker,
            columns,
            rows,
        })
    }

    fn entry(&self, path: &Path, column: &str) -> DatabankResult<&'d ArrayEntry> {
        let name = format!("{}{column}", self.prefix);
        self.dir
            .arrays
            .iter()
            .find(|a| a.name == name)
            .ok_or_else(|| DatabankError::UnknownColumn {
                path: path.display().to_string(),
                column: column.to_string(),
                available: self.columns.clone(),
            })
    }

    fn field(&self, path: &Path, column: &str) -> DatabankResult<Field> {
        let entry = self.entry(path, column)?;
        Ok(Field::new(column, entry.dtype.data_type(), entry.nullable))
    }

    fn read_array(&self, file: &mut File, path: &Path, column: &str) -> DatabankResult<ArrayRef> {
        let entry = self.entry(path, column)?;
        let len = usize::try_from(entry.len)
            .map_err(|_| corrupt(path, format!("array {} is too long", entry.name)))?;
        let expected = len
            .checked_mul(entry.dtype.width())
            .and_then(|n| u64::try_from(n).ok());
        if expected != Some(entry.block.len) {
            return Err(corrupt(
                path,
                format!(
                    "array {} holds {} bytes, expected {} values of {} bytes",
                    entry.name,
                    entry.block.len,
                    len,
                    entry.dtype.width()
                ),
            ));
        }
        let raw = storage::read_range(file, path, entry.block.offset, entry.block.len)?;
        Ok(entry.dtype.decode(&raw, len))
    }
}

fn check_storable(path: &Path, table: &RecordBatch) -> DatabankResult<Vec<FlatDType>> {
    let schema = table.schema();
    schema
        .fields()
        .iter()
        .zip(table.columns())
        .map(|(field, column)| {
            let name = field.name();
            if name.starts_with('.') || name.contains('/') {
                return Err(DatabankError::ReservedColumnName {
                    column: name.clone(),
                });
            }
            let unsupported = |reason: &str| DatabankError::UnsupportedColumnType {
                path: path.display().to_string(),
                engine: Engine::Flat,
                column: name.clone(),
                data_type: field.data_type().clone(),
                reason: reason.to_string(),
            };
            let dtype = FlatDType::of(field.data_type())
                .ok_or_else(|| unsupported("only primitive numeric columns are storable"))?;
            if column.null_count() > 0 {
                return Err(unsupported("null values are not storable"));
            }
            Ok(dtype)
        })
        .collect()
}

/// Rewrite the container with `arrays`, each paired with where its bytes
/// come from.
fn rewrite(path: &Path, arrays: Vec<(ArrayEntry, Block<'_>)>) -> DatabankResult<()> {
    let (mut entries, blocks): (Vec<ArrayEntry>, Vec<Block<'_>>) = arrays.into_iter().unzip();
    container::write_container(path, MAGIC, &blocks, move |spans| {
        for (entry, span) in entries.iter_mut().zip(spans) {
            entry.block = *span;
        }
        Directory {
            format_version: FORMAT_VERSION,
            arrays: entries,
        }
    })
}

fn existing<'a>(dir: Directory) -> impl Iterator<Item = (ArrayEntry, Block<'a>)> {
    dir.arrays.into_iter().map(|entry| {
        let block = Block::Existing(entry.block);
        (entry, block)
    })
}

const MARKER_BYTES: &[u8] = &[1];

impl EngineAdapter for FlatEngine {
    fn engine(&self) -> Engine {
        Engine::Flat
    }

    fn matches(&self, probe: &FileHeadTail) -> bool {
        container::signature_matches(probe, MAGIC)
    }

    fn supports_filter_pushdown(&self) -> bool {
        true
    }

    fn write_table(&self, path: &Path, key: Option<&str>, table: &RecordBatch) -> DatabankResult<()> {
        let dtypes = check_storable(path, table)?;
        let prefix = prefix_for(key);
        let dir = if ensure_engine_if_exists(path, Engine::Flat)? {
            Some(open(path)?.1)
        } else {
            None
        };

        let schema = table.schema();
        let encoded: Vec<Bytes> = dtypes
            .iter()
            .zip(table.columns())
            .map(|(dtype, column)| dtype.encode(column.as_ref()))
            .collect();
        let column_names: Vec<&String> = schema.fields().iter().map(|f| f.name()).collect();
        let columns_attr = serde_json::to_string(&column_names)
            .map_err(|e| corrupt(path, format!("cannot encode column list: {e}")))?;

        let mut arrays: Vec<(ArrayEntry, Block<'_>)> = dir
            .map(|d| existing(d).filter(|(e, _)| !owned_by(&e.name, &prefix)).collect())
            .unwrap_or_default();

        for ((field, dtype), bytes) in schema.fields().iter().zip(&dtypes).zip(&encoded) {
            arrays.push((
                ArrayEntry {
                    name: format!("{prefix}{}", field.name()),
                    dtype: *dtype,
                    len: table.num_rows() as u64,
                    block: Span { offset: 0, len: 0 },
                    nullable: field.is_nullable(),
                    attrs: BTreeMap::new(),
                },
                Block::New(bytes),
            ));
        }
        arrays.push((
            ArrayEntry {
                name: marker_name(&prefix),
                dtype: FlatDType::U8,
                len: 1,
                block: Span { offset: 0, len: 0 },
                nullable: false,
                attrs: BTreeMap::from([
                    (ATTR_COLUMNS.to_string(), columns_attr),
                    (ATTR_ROWS.to_string(), table.num_rows().to_string()),
                ]),
            },
            Block::New(MARKER_BYTES),
        ));

        rewrite(path, arrays)?;
        debug!(
            "flat-engine wrote {} columns x {} rows to {} (prefix {prefix:?})",
            table.num_columns(),
            table.num_rows(),
            path.display()
        );
        Ok(())
    }

    fn write_metadata(&self, path: &Path, key: Option<&str>, meta: &Metadata) -> DatabankResult<()> {
        let (_, dir) = open(path)?;
        let marker = StoredTable::find(&dir, path, key)?.marker.name.clone();
        let encoded = metadata::encode(meta).context(MetadataSnafu {
            path: path.display().to_string(),
            key: normalize_key(key).unwrap_or(ROOT_KEY),
        })?;

        let arrays = existing(dir)
            .map(|(mut entry, block)| {
                if entry.name == marker {
                    entry
                        .attrs
                        .insert(ATTR_METADATA.to_string(), encoded.clone());
                }
                (entry, block)
            })
            .collect();
        rewrite(path, arrays)
    }

    fn read_metadata(&self, path: &Path, key: Option<&str>) -> DatabankResult<Metadata> {
        let (_, dir) = open(path)?;
        let stored = StoredTable::find(&dir, path, key)?;
        match stored.marker.attrs.get(ATTR_METADATA) {
            Some(raw) => metadata::decode(raw).context(MetadataSnafu {
                path: path.display().to_string(),
                key: normalize_key(key).unwrap_or(ROOT_KEY),
            }),
            None => Ok(Metadata::new()),
        }
    }

    fn schema(&self, path: &Path, key: Option<&str>) -> DatabankResult<SchemaRef> {
        let (_, dir) = open(path)?;
        let stored = StoredTable::find(&dir, path, key)?;
        let fields = stored
            .columns
            .iter()
            .map(|c| stored.field(path, c))
            .collect::<DatabankResult<Vec<_>>>()?;
        Ok(Arc::new(Schema::new(fields)))
    }

    fn keys(&self, path: &Path) -> DatabankResult<Vec<String>> {
        let (_, dir) = open(path)?;
        Ok(stored_keys(&dir))
    }

    fn read(
        &self,
        path: &Path,
        key: Option<&str>,
        columns: Option<&[String]>,
        filter: &RowFilter,
    ) -> DatabankResult<RecordBatch> {
        let path_str = path.display().to_string();
        let (mut file, dir) = open(path)?;
        let stored = StoredTable::find(&dir, path, key)?;
        let wanted: Vec<String> = match columns {
            Some(cols) => cols.to_vec(),
            None => stored.columns.clone(),
        };

        let mut loaded: HashMap<String, ArrayRef> = HashMap::new();
        let mask: Option<BooleanArray> = if filter.is_empty() {
            None
        } else {
            let mut fields = Vec::new();
            let mut arrays = Vec::new();
            for column in filter.columns() {
                let array = stored.read_array(&mut file, path, column)?;
                fields.push(stored.field(path, column)?);
                arrays.push(Arc::clone(&array));
                loaded.insert(column.to_string(), array);
            }
            let batch = RecordBatch::try_new(Arc::new(Schema::new(fields)), arrays)
                .context(ArrowSnafu { path: &path_str })?;
            Some(filter.evaluate(&batch).context(ArrowSnafu { path: &path_str })?)
        };

        let num_rows = match &mask {
            Some(mask) => mask.iter().filter(|v| *v == Some(true)).count(),
            None => stored.rows,
        };

        let mut fields = Vec::with_capacity(wanted.len());
        let mut arrays = Vec::with_capacity(wanted.len());
        for column in &wanted {
            let array = match loaded.get(column) {
                Some(array) => Arc::clone(array),
                None => stored.read_array(&mut file, path, column)?,
            };
            let array = match &mask {
                Some(mask) => filter_array(array.as_ref(), mask).context(ArrowSnafu { path: &path_str })?,
                None => array,
            };
            fields.push(stored.field(path, column)?);
            arrays.push(array);
        }

        RecordBatch::try_new_with_options(
            Arc::new(Schema::new(fields)),
            arrays,
            &RecordBatchOptions::new().with_row_count(Some(num_rows)),
        )
        .context(ArrowSnafu { path: path_str })
    }
}
