//! Filesystem helpers shared by every engine and by the registry store.
//!
//! All writes that replace a file go through a write-then-rename sequence:
//! the payload is written to a uniquely named temporary file next to the
//! target, synced, and renamed into place. Readers therefore see either the
//! previous complete file or the new complete file, never a torn one.
//!
//! Reads are plain positional reads on `std::fs::File`; callers that only
//! need to classify a file (engine detection) use [`read_head_tail`], which
//! touches at most 16 bytes.

mod error;

pub use error::StorageError;
pub(crate) use error::{OtherIoSnafu, classify_io};

use snafu::prelude::*;
use std::{
    fs::{self, File},
    io::{self, Read, Seek, SeekFrom, Write},
    path::{Path, PathBuf},
    sync::atomic::{AtomicU64, Ordering},
};

/// General result type used by storage operations.
pub type StorageResult<T> = Result<T, StorageError>;

/// Number of bytes captured at each end of a file by [`read_head_tail`].
pub const PROBE_LEN: usize = 8;

static TMP_COUNTER: AtomicU64 = AtomicU64::new(0);

fn display(path: &Path) -> String {
    path.display().to_string()
}

fn create_parent_dir(abs: &Path) -> StorageResult<()> {
    if let Some(parent) = abs.parent() {
        if parent.as_os_str().is_empty() {
            return Ok(());
        }
        fs::create_dir_all(parent)
            .context(OtherIoSnafu {
                path: display(parent),
            })?;
    }
    Ok(())
}

/// Temporary sibling path, unique per process and call.
fn tmp_path_for(abs: &Path) -> PathBuf {
    let name = abs
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "linebank".to_string());
    let n = TMP_COUNTER.fetch_add(1, Ordering::Relaxed);
    abs.with_file_name(format!(".{name}.{}.{n}.tmp", std::process::id()))
}

/// Removes the temporary file of an unfinished atomic write.
struct PendingTmp(Option<PathBuf>);

impl PendingTmp {
    /// The rename happened; nothing left to clean up.
    fn committed(mut self) {
        self.0 = None;
    }
}

impl Drop for PendingTmp {
    fn drop(&mut self) {
        if let Some(path) = self.0.take() {
            let _ = fs::remove_file(path);
        }
    }
}

/// Atomically replace `path` with whatever `write` produces.
///
/// `write` receives the freshly created temporary file and must hand it back
/// once the payload is complete, which lets owning writers (for example a
/// Parquet `ArrowWriter`) take the file and return it from `into_inner`.
/// The file is synced and renamed over `path` only if `write` succeeds; on
/// any failure the temporary file is removed and `path` is left untouched.
pub fn write_atomic_with<F, E>(path: &Path, write: F) -> Result<(), E>
where
    F: FnOnce(File) -> Result<File, E>,
    E: From<StorageError>,
{
    create_parent_dir(path)?;

    let tmp_path = tmp_path_for(path);
    let pending = PendingTmp(Some(tmp_path.clone()));

    let file = File::create(&tmp_path)
        .context(OtherIoSnafu {
            path: display(&tmp_path),
        })?;

    let file = write(file)?;

    file.sync_all()
        .context(OtherIoSnafu {
            path: display(&tmp_path),
        })?;
    drop(file);

    fs::rename(&tmp_path, path)
        .context(OtherIoSnafu {
            path: display(path),
        })?;

    pending.committed();
    Ok(())
}

/// Write `contents` to `path` using write-then-rename.
pub fn write_atomic(path: &Path, contents: &[u8]) -> StorageResult<()> {
    write_atomic_with(path, |mut file: File| {
        file.write_all(contents)
            .context(OtherIoSnafu {
                path: display(path),
            })?;
        Ok::<_, StorageError>(file)
    })
}

/// Open `path` for reading, classifying a missing file as `NotFound`.
pub fn open_read(path: &Path) -> StorageResult<File> {
    File::open(path).map_err(|e| classify_io(&display(path), e))
}

/// Read the whole file at `path` into a `String`.
pub fn read_to_string(path: &Path) -> StorageResult<String> {
    fs::read_to_string(path).map_err(|e| classify_io(&display(path), e))
}

/// Read the whole file at `path` into memory.
pub fn read_all_bytes(path: &Path) -> StorageResult<Vec<u8>> {
    fs::read(path).map_err(|e| classify_io(&display(path), e))
}

/// Read exactly `len` bytes starting at `offset` from an open file.
pub fn read_range(file: &mut File, path: &Path, offset: u64, len: u64) -> StorageResult<Vec<u8>> {
    let io_err = |e: io::Error| classify_io(&display(path), e);
    let len = usize::try_from(len)
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "range too large"))
        .map_err(io_err)?;
    file.seek(SeekFrom::Start(offset)).map_err(io_err)?;
    let mut buf = vec![0u8; len];
    file.read_exact(&mut buf).map_err(io_err)?;
    Ok(buf)
}

/// Copy `len` bytes starting at `offset` from `src` into `dst`.
pub fn copy_range(
    src: &mut File,
    src_path: &Path,
    dst: &mut impl Write,
    offset: u64,
    len: u64,
) -> StorageResult<()> {
    let io_err = |e: io::Error| classify_io(&display(src_path), e);
    src.seek(SeekFrom::Start(offset)).map_err(io_err)?;
    let copied = io::copy(&mut Read::by_ref(src).take(len), dst).map_err(io_err)?;
    if copied != len {
        return Err(io_err(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            format!("expected {len} bytes at offset {offset}, copied {copied}"),
        )));
    }
    Ok(())
}

/// Length of a file plus its first and last [`PROBE_LEN`] bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileHeadTail {
    /// Length of the file in bytes.
    pub len: u64,
    /// First bytes of the file (zero-filled if the file is shorter).
    pub head: [u8; PROBE_LEN],
    /// Last bytes of the file (zero-filled unless the file holds both ends
    /// without overlap).
    pub tail: [u8; PROBE_LEN],
}

/// Read the length, first 8 bytes, and last 8 bytes of the file at `path`.
///
/// Semantics:
/// - On missing file or a non-regular file: `StorageError::NotFound`.
/// - On other I/O problems: `StorageError::OtherIo`.
///
/// For files shorter than 8 bytes both `head` and `tail` stay zero-filled;
/// for files shorter than 16 bytes `tail` stays zero-filled.
pub fn read_head_tail(path: &Path) -> StorageResult<FileHeadTail> {
    let path_str = display(path);
    let meta = fs::metadata(path).map_err(|e| classify_io(&path_str, e))?;

    if !meta.is_file() {
        return Err(classify_io(
            &path_str,
            io::Error::new(io::ErrorKind::NotFound, "not a regular file"),
        ));
    }

    let len = meta.len();
    let mut file = open_read(path)?;
    let io_err = |e: io::Error| classify_io(&path_str, e);

    let mut head = [0u8; PROBE_LEN];
    let mut tail = [0u8; PROBE_LEN];

    if len >= PROBE_LEN as u64 {
        file.read_exact(&mut head).map_err(io_err)?;
    }
    if len >= 2 * PROBE_LEN as u64 {
        file.seek(SeekFrom::End(-(PROBE_LEN as i64)))
            .map_err(io_err)?;
        file.read_exact(&mut tail).map_err(io_err)?;
    }

    Ok(FileHeadTail { len, head, tail })
}
