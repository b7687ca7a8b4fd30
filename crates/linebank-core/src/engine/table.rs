//! Table engine: a catalog container holding one Arrow IPC table per key.
//!
//! Intended for small and medium tables. Every table is stored whole as an
//! Arrow IPC stream block; the JSON catalog in the footer maps each key to
//! its block, its row count, and its encoded metadata. Row filters are not
//! pushed down: a load decodes the full block and the caller filters in
//! memory.

use std::{
    collections::BTreeMap,
    fs::File,
    io::{BufReader, Cursor, Read, Seek, SeekFrom},
    path::Path,
};

use arrow::{
    array::RecordBatch,
    compute::concat_batches,
    datatypes::SchemaRef,
    ipc::{reader::StreamReader, writer::StreamWriter},
};
use log::debug;
use serde::{Deserialize, Serialize};
use snafu::prelude::*;

use crate::{
    engine::{
        DEFAULT_KEY, Engine, EngineAdapter,
        container::{self, Block, Span},
        ensure_engine, ensure_engine_if_exists, normalize_key, project_columns,
    },
    error::{ArrowSnafu, DatabankError, DatabankResult, MetadataSnafu},
    filter::RowFilter,
    metadata::{self, Metadata},
    storage::{self, FileHeadTail, classify_io},
};

const MAGIC: &[u8; 8] = b"LBTABLE1";
const FORMAT_VERSION: u32 = 1;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Catalog {
    format_version: u32,
    tables: BTreeMap<String, CatalogEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct CatalogEntry {
    block: Span,
    num_rows: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    metadata: Option<String>,
}

/// Adapter for the table engine.
#[derive(Debug, Clone, Copy, Default)]
pub struct TableEngine;

fn table_key(key: Option<&str>) -> &str {
    normalize_key(key).unwrap_or(DEFAULT_KEY)
}

fn open(path: &Path) -> DatabankResult<(File, Catalog)> {
    ensure_engine(path, Engine::Table)?;
    let mut file = storage::open_read(path)?;
    let catalog: Catalog = container::read_catalog(&mut file, path, Engine::Table, MAGIC)?;
    if catalog.format_version > FORMAT_VERSION {
        return Err(DatabankError::FileCorrupt {
            path: path.display().to_string(),
            engine: Engine::Table,
            reason: format!(
                "catalog format version {} is newer than supported version {FORMAT_VERSION}",
                catalog.format_version
            ),
        });
    }
    let file_len = file
        .metadata()
        .map_err(|e| classify_io(&path.display().to_string(), e))?
        .len();
    for entry in catalog.tables.values() {
        container::check_span(path, Engine::Table, entry.block, file_len)?;
    }
    Ok((file, catalog))
}

fn lookup<'c>(catalog: &'c Catalog, path: &Path, key: &str) -> DatabankResult<&'c CatalogEntry> {
    catalog
        .tables
        .get(key)
        .ok_or_else(|| DatabankError::MissingKey {
            path: path.display().to_string(),
            key: key.to_string(),
            available: catalog.tables.keys().cloned().collect(),
        })
}

fn encode_block(path: &Path, table: &RecordBatch) -> DatabankResult<Vec<u8>> {
    let path_str = path.display().to_string();
    let mut writer =
        StreamWriter::try_new(Vec::new(), &table.schema()).context(ArrowSnafu { path: &path_str })?;
    writer.write(table).context(ArrowSnafu { path: &path_str })?;
    writer.finish().context(ArrowSnafu { path: &path_str })?;
    writer.into_inner().context(ArrowSnafu { path: path_str })
}

fn decode_block(path: &Path, bytes: Vec<u8>) -> DatabankResult<RecordBatch> {
    let path_str = path.display().to_string();
    let reader = StreamReader::try_new(Cursor::new(bytes), None).map_err(|e| {
        DatabankError::FileCorrupt {
            path: path_str.clone(),
            engine: Engine::Table,
            reason: format!("table block is not an Arrow IPC stream: {e}"),
        }
    })?;
    let schema = reader.schema();
    let batches = reader
        .collect::<Result<Vec<_>, _>>()
        .context(ArrowSnafu { path: &path_str })?;
    concat_batches(&schema, &batches).context(ArrowSnafu { path: path_str })
}

/// Rewrite the container, copying every table except `replace` and letting
/// `edit` adjust the catalog entries before they are stored.
fn rewrite(
    path: &Path,
    catalog: Option<Catalog>,
    replace: Option<(&str, &[u8], u64)>,
    edit: impl FnOnce(&mut BTreeMap<String, CatalogEntry>),
) -> DatabankResult<()> {
    let mut entries = catalog.map(|c| c.tables).unwrap_or_default();
    if let Some((key, _, _)) = replace {
        entries.remove(key);
    }

    let mut order: Vec<String> = Vec::with_capacity(entries.len() + 1);
    let mut blocks: Vec<Block<'_>> = Vec::with_capacity(entries.len() + 1);
    for (key, entry) in &entries {
        order.push(key.clone());
        blocks.push(Block::Existing(entry.block));
    }
    if let Some((key, bytes, num_rows)) = replace {
        entries.insert(
            key.to_string(),
            CatalogEntry {
                block: Span { offset: 0, len: 0 },
                num_rows,
                metadata: None,
            },
        );
        order.push(key.to_string());
        blocks.push(Block::New(bytes));
    }
    edit(&mut entries);

    container::write_container(path, MAGIC, &blocks, |spans| {
        for (key, span) in order.iter().zip(spans) {
            if let Some(entry) = entries.get_mut(key) {
                entry.block = *span;
            }
        }
        Catalog {
            format_version: FORMAT_VERSION,
            tables: entries,
        }
    })
}

impl EngineAdapter for TableEngine {
    fn engine(&self) -> Engine {
        Engine::Table
    }

    fn matches(&self, probe: &FileHeadTail) -> bool {
        container::signature_matches(probe, MAGIC)
    }

    fn supports_filter_pushdown(&self) -> bool {
        false
    }

    fn write_table(&self, path: &Path, key: Option<&str>, table: &RecordBatch) -> DatabankResult<()> {
        let key = table_key(key);
        let catalog = if ensure_engine_if_exists(path, Engine::Table)? {
            Some(open(path)?.1)
        } else {
            None
        };

        let bytes = encode_block(path, table)?;
        rewrite(path, catalog, Some((key, &bytes, table.num_rows() as u64)), |_| {})?;
        debug!(
            "table-engine wrote {} rows to {}:{key}",
            table.num_rows(),
            path.display()
        );
        Ok(())
    }

    fn write_metadata(&self, path: &Path, key: Option<&str>, meta: &Metadata) -> DatabankResult<()> {
        let key = table_key(key);
        let (_, catalog) = open(path)?;
        lookup(&catalog, path, key)?;

        let encoded = metadata::encode(meta).context(MetadataSnafu {
            path: path.display().to_string(),
            key,
        })?;
        rewrite(path, Some(catalog), None, |entries| {
            if let Some(entry) = entries.get_mut(key) {
                entry.metadata = Some(encoded);
            }
        })
    }

    fn read_metadata(&self, path: &Path, key: Option<&str>) -> DatabankResult<Metadata> {
        let key = table_key(key);
        let (_, catalog) = open(path)?;
        match &lookup(&catalog, path, key)?.metadata {
            Some(raw) => metadata::decode(raw).context(MetadataSnafu {
                path: path.display().to_string(),
                key,
            }),
            None => Ok(Metadata::new()),
        }
    }

    fn schema(&self, path: &Path, key: Option<&str>) -> DatabankResult<SchemaRef> {
        let key = table_key(key);
        let (mut file, catalog) = open(path)?;
        let block = lookup(&catalog, path, key)?.block;

        // Only the leading schema message of the stream is decoded.
        file.seek(SeekFrom::Start(block.offset))
            .map_err(|e| classify_io(&path.display().to_string(), e))?;
        let reader = StreamReader::try_new(BufReader::new(file.take(block.len)), None).map_err(
            |e| DatabankError::FileCorrupt {
                path: path.display().to_string(),
                engine: Engine::Table,
                reason: format!("table block is not an Arrow IPC stream: {e}"),
            },
        )?;
        Ok(reader.schema())
    }

    fn keys(&self, path: &Path) -> DatabankResult<Vec<String>> {
        let (_, catalog) = open(path)?;
        Ok(catalog.tables.into_keys().collect())
    }

    fn read(
        &self,
        path: &Path,
        key: Option<&str>,
        columns: Option<&[String]>,
        filter: &RowFilter,
    ) -> DatabankResult<RecordBatch> {
        let key = table_key(key);
        let (mut file, catalog) = open(path)?;
        let block = lookup(&catalog, path, key)?.block;
        let bytes = storage::read_range(&mut file, path, block.offset, block.len)?;
        let table = decode_block(path, bytes)?;

        let path_str = path.display().to_string();
        let table = filter.apply(&table).context(ArrowSnafu { path: &path_str })?;
        project_columns(&table, columns).context(ArrowSnafu { path: path_str })
    }
}
