//! Footer-catalog container shared by the table and flat engines.
//!
//! ```text
//! +----------+------------------+--------------+-------------+----------+
//! | magic(8) | blocks ...       | catalog JSON | cat_len u64 | magic(8) |
//! +----------+------------------+--------------+-------------+----------+
//! ```
//!
//! The catalog records where each block lives. Because the magic appears at
//! both ends, a file can be classified from its first and last 8 bytes, and
//! a truncated write (which the atomic rename already prevents) would fail
//! the tail check rather than decode garbage.
//!
//! Rewrites copy the surviving blocks byte-for-byte from the previous file
//! into a temporary file, append new blocks and a fresh catalog, then rename
//! over the original.

use std::{
    fs::File,
    io::{BufWriter, Read, Seek, SeekFrom, Write},
    path::Path,
};

use serde::{Deserialize, Serialize, de::DeserializeOwned};

use crate::{
    engine::Engine,
    error::{DatabankError, DatabankResult},
    storage::{self, FileHeadTail, PROBE_LEN, classify_io},
};

const TRAILER_LEN: u64 = 8 + PROBE_LEN as u64;
/// Smallest possible container: magic, `{}`, trailer.
const MIN_LEN: u64 = PROBE_LEN as u64 + 2 + TRAILER_LEN;

/// Byte range of one block inside a container.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct Span {
    pub(crate) offset: u64,
    pub(crate) len: u64,
}

/// A block to place in a rewritten container.
pub(crate) enum Block<'a> {
    /// Copy this range from the previous version of the file.
    Existing(Span),
    /// Write these bytes.
    New(&'a [u8]),
}

impl Block<'_> {
    fn len(&self) -> u64 {
        match self {
            Block::Existing(span) => span.len,
            Block::New(bytes) => bytes.len() as u64,
        }
    }
}

pub(crate) fn signature_matches(probe: &FileHeadTail, magic: &[u8; PROBE_LEN]) -> bool {
    probe.len >= MIN_LEN && probe.head == *magic && probe.tail == *magic
}

fn corrupt(path: &Path, engine: Engine, reason: impl Into<String>) -> DatabankError {
    DatabankError::FileCorrupt {
        path: path.display().to_string(),
        engine,
        reason: reason.into(),
    }
}

/// Read and decode the catalog of an open container.
pub(crate) fn read_catalog<C: DeserializeOwned>(
    file: &mut File,
    path: &Path,
    engine: Engine,
    magic: &[u8; PROBE_LEN],
) -> DatabankResult<C> {
    let io_err = |e| classify_io(&path.display().to_string(), e);
    let len = file.metadata().map_err(io_err)?.len();
    if len < MIN_LEN {
        return Err(corrupt(path, engine, format!("file too short ({len} bytes)")));
    }

    let mut head = [0u8; PROBE_LEN];
    file.seek(SeekFrom::Start(0)).map_err(io_err)?;
    file.read_exact(&mut head).map_err(io_err)?;

    let mut trailer = [0u8; TRAILER_LEN as usize];
    file.seek(SeekFrom::Start(len - TRAILER_LEN)).map_err(io_err)?;
    file.read_exact(&mut trailer).map_err(io_err)?;

    let (len_bytes, tail) = trailer.split_at(8);
    if head != *magic || tail != magic.as_slice() {
        return Err(corrupt(path, engine, "container signature missing"));
    }

    let mut buf = [0u8; 8];
    buf.copy_from_slice(len_bytes);
    let catalog_len = u64::from_le_bytes(buf);

    let body_end = len - TRAILER_LEN;
    if catalog_len > body_end - PROBE_LEN as u64 {
        return Err(corrupt(
            path,
            engine,
            format!("catalog length {catalog_len} exceeds file size {len}"),
        ));
    }

    let raw = storage::read_range(file, path, body_end - catalog_len, catalog_len)?;
    serde_json::from_slice(&raw)
        .map_err(|e| corrupt(path, engine, format!("catalog is not valid JSON: {e}")))
}

/// Check that `span` lies inside the block region of a container of `len` bytes.
pub(crate) fn check_span(path: &Path, engine: Engine, span: Span, file_len: u64) -> DatabankResult<()> {
    let end = span.offset.checked_add(span.len);
    match end {
        Some(end) if span.offset >= PROBE_LEN as u64 && end <= file_len.saturating_sub(TRAILER_LEN) => {
            Ok(())
        }
        _ => Err(corrupt(
            path,
            engine,
            format!(
                "block [{}, +{}) lies outside the container",
                span.offset, span.len
            ),
        )),
    }
}

/// Atomically write a container at `path`.
///
/// `Block::Existing` spans are copied from the current file at `path`, which
/// therefore must exist whenever such blocks are present. `catalog` receives
/// the final span of every block, in the order given.
pub(crate) fn write_container<C, F>(
    path: &Path,
    magic: &[u8; PROBE_LEN],
    blocks: &[Block<'_>],
    catalog: F,
) -> DatabankResult<()>
where
    C: Serialize,
    F: FnOnce(&[Span]) -> C,
{
    let mut source = if blocks.iter().any(|b| matches!(b, Block::Existing(_))) {
        Some(storage::open_read(path)?)
    } else {
        None
    };

    storage::write_atomic_with(path, |file: File| {
        let out_err = |e| classify_io(&path.display().to_string(), e);
        let mut w = BufWriter::new(file);
        w.write_all(magic).map_err(out_err)?;

        let mut offset = PROBE_LEN as u64;
        let mut spans = Vec::with_capacity(blocks.len());
        for block in blocks {
            match block {
                Block::Existing(span) => {
                    if let Some(src) = source.as_mut() {
                        storage::copy_range(src, path, &mut w, span.offset, span.len)?;
                    }
                }
                Block::New(bytes) => w.write_all(bytes).map_err(out_err)?,
            }
            spans.push(Span {
                offset,
                len: block.len(),
            });
            offset += block.len();
        }

        let json = serde_json::to_vec(&catalog(&spans)).map_err(|e| {
            classify_io(
                &path.display().to_string(),
                std::io::Error::new(std::io::ErrorKind::InvalidData, e),
            )
        })?;
        w.write_all(&json).map_err(out_err)?;
        w.write_all(&(json.len() as u64).to_le_bytes())
            .map_err(out_err)?;
        w.write_all(magic).map_err(out_err)?;

        let file = w.into_inner().map_err(|e| out_err(e.into_error()))?;
        Ok::<File, DatabankError>(file)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use tempfile::TempDir;

    type TestResult = Result<(), Box<dyn std::error::Error>>;

    const MAGIC: &[u8; 8] = b"LBTEST01";

    #[test]
    fn blocks_survive_rewrite() -> TestResult {
        let tmp = TempDir::new()?;
        let path = tmp.path().join("c.bin");

        write_container(&path, MAGIC, &[Block::New(b"alpha"), Block::New(b"beta")], |spans| {
            BTreeMap::from([("a", spans[0]), ("b", spans[1])])
        })?;

        let mut file = storage::open_read(&path)?;
        let cat: BTreeMap<String, Span> = read_catalog(&mut file, &path, Engine::Table, MAGIC)?;
        drop(file);

        // Keep "b", replace "a".
        write_container(
            &path,
            MAGIC,
            &[Block::Existing(cat["b"]), Block::New(b"ALPHA!")],
            |spans| BTreeMap::from([("b", spans[0]), ("a", spans[1])]),
        )?;

        let mut file = storage::open_read(&path)?;
        let cat: BTreeMap<String, Span> = read_catalog(&mut file, &path, Engine::Table, MAGIC)?;
        assert_eq!(storage::read_range(&mut file, &path, cat["b"].offset, cat["b"].len)?, b"beta");
        assert_eq!(storage::read_range(&mut file, &path, cat["a"].offset, cat["a"].len)?, b"ALPHA!");

        let probe = storage::read_head_tail(&path)?;
        assert!(signature_matches(&probe, MAGIC));
        Ok(())
    }

    #[test]
    fn truncated_container_is_corrupt() -> TestResult {
        let tmp = TempDir::new()?;
        let path = tmp.path().join("c.bin");
        write_container(&path, MAGIC, &[Block::New(b"data")], |spans| spans.to_vec())?;

        let bytes = std::fs::read(&path)?;
        std::fs::write(&path, &bytes[..bytes.len() - 3])?;

        let mut file = storage::open_read(&path)?;
        let err = read_catalog::<Vec<Span>>(&mut file, &path, Engine::Flat, MAGIC)
            .expect_err("truncated file");
        assert!(matches!(err, DatabankError::FileCorrupt { .. }));
        Ok(())
    }

    #[test]
    fn spans_outside_the_body_are_rejected() {
        let path = Path::new("x");
        assert!(check_span(path, Engine::Flat, Span { offset: 8, len: 4 }, 100).is_ok());
        assert!(check_span(path, Engine::Flat, Span { offset: 0, len: 4 }, 100).is_err());
        assert!(check_span(path, Engine::Flat, Span { offset: 80, len: 10 }, 100).is_err());
        assert!(check_span(path, Engine::Flat, Span { offset: u64::MAX, len: 2 }, 100).is_err());
    }
}
