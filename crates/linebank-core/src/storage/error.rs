use std::io;

use snafu::{Backtrace, IntoError, prelude::*};

/// Filesystem failures, split by whether the file was simply absent.
///
/// The registry treats a missing store as empty and engine detection maps a
/// missing input to `NotFound`, so that case gets its own variant.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum StorageError {
    /// Nothing exists at `path`, or it is not a regular file.
    #[snafu(display("No such file: {path}"))]
    NotFound {
        /// Path that was looked up.
        path: String,
        /// Error reported by the OS.
        source: io::Error,
        /// Backtrace for debugging.
        backtrace: Backtrace,
    },

    /// Any other read, write, sync, or rename failure.
    #[snafu(display("I/O error on {path}: {source}"))]
    OtherIo {
        /// File being accessed.
        path: String,
        /// Error reported by the OS.
        source: io::Error,
        /// Backtrace for debugging.
        backtrace: Backtrace,
    },
}

impl StorageError {
    /// Returns true when the error reports a missing file.
    pub fn is_not_found(&self) -> bool {
        matches!(self, StorageError::NotFound { .. })
    }
}

/// Classify an `io::Error` for `path` into `NotFound` or `OtherIo`.
pub(crate) fn classify_io(path: &str, e: io::Error) -> StorageError {
    let path = path.to_string();
    if e.kind() == io::ErrorKind::NotFound {
        NotFoundSnafu { path }.into_error(e)
    } else {
        OtherIoSnafu { path }.into_error(e)
    }
}
