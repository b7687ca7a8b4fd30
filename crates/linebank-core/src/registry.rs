//! Persistent registry of named local databases.
//!
//! The registry maps a logical database name to the files holding it, the
//! engine that wrote them, and free-form registration metadata. It is backed
//! by a JSON store:
//!
//! ```json
//! {
//!   "format_version": 1,
//!   "databases": {
//!     "HITEMP-CO2": {
//!       "paths": ["/data/co2_2000_2500.parquet"],
//!       "engine": "lazy-columnar-engine",
//!       "metadata": {"download_date": "2024-05-01"},
//!       "registered_at": "2024-05-01T10:00:00Z",
//!       "updated_at": "2024-05-01T10:00:00Z"
//!     }
//!   }
//! }
//! ```
//!
//! ## Concurrency
//!
//! Every mutation runs under an exclusive advisory lock on `<store>.lock`.
//! While holding it, the store is re-read from disk, the change is applied
//! to that fresh copy, and the result is written with write-then-rename. The
//! in-memory view is replaced only after the rename succeeds, so a failed
//! flush leaves both the store and the in-memory view unchanged, and
//! concurrent writers in other processes never lose each other's entries.
//!
//! Reads use the in-memory view; [`DatabaseRegistry::reload`] refreshes it.

use std::{
    collections::{BTreeMap, btree_map::Entry as MapEntry},
    fs::{self, File, OpenOptions},
    io,
    path::{Path, PathBuf},
    sync::{Mutex, OnceLock},
};

use chrono::{DateTime, Utc};
use fs2::FileExt;
use log::{debug, info};
use serde::{Deserialize, Serialize};
use snafu::{Backtrace, prelude::*};

use crate::{
    engine::Engine,
    metadata::{Metadata, MetadataError},
    storage::{self, StorageError},
};

/// Version of the store layout written by this crate.
pub const REGISTRY_FORMAT_VERSION: u32 = 1;

/// Errors from the database registry.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum RegistryError {
    /// The name was never registered.
    #[snafu(display("Unknown database {name:?} (registered: {available:?})"))]
    UnknownDatabase {
        /// Requested name.
        name: String,
        /// Names the registry does hold.
        available: Vec<String>,
    },

    /// The name is registered with a different engine.
    #[snafu(display(
        "Database {name:?} is registered with {recorded}, cannot add a file written by {requested}"
    ))]
    EngineConflict {
        /// Database name.
        name: String,
        /// Engine already recorded for the name.
        recorded: Engine,
        /// Engine of the rejected registration.
        requested: Engine,
    },

    /// Database names must be non-empty.
    #[snafu(display("Database name must not be empty"))]
    EmptyName,

    /// Registration metadata holds a value the store cannot represent.
    #[snafu(display("Invalid registration metadata for {name:?}: {source}"))]
    InvalidMetadata {
        /// Database name.
        name: String,
        /// What was wrong with the metadata.
        source: MetadataError,
    },

    /// The store exists but cannot be parsed.
    #[snafu(display("Corrupt registry store {path}: {msg}"))]
    CorruptStore {
        /// Store path.
        path: String,
        /// What was wrong.
        msg: String,
        /// Backtrace for debugging.
        backtrace: Backtrace,
    },

    /// Reading or writing the store failed.
    #[snafu(display("Storage error while accessing registry: {source}"))]
    Storage {
        /// Underlying storage error.
        #[snafu(backtrace)]
        source: StorageError,
    },

    /// The store lock could not be taken.
    #[snafu(display("Cannot lock registry store {path}: {source}"))]
    Lock {
        /// Lock file path.
        path: String,
        /// Underlying I/O error.
        source: io::Error,
        /// Backtrace for debugging.
        backtrace: Backtrace,
    },

    /// The process-wide registry has not been initialized.
    #[snafu(display("Global database registry is not initialized; call init_global first"))]
    NotInitialized,

    /// The process-wide registry was already initialized.
    #[snafu(display("Global database registry is already initialized with store {path}"))]
    AlreadyInitialized {
        /// Store of the existing global registry.
        path: String,
    },

    /// A thread panicked while holding the global registry.
    #[snafu(display("Global database registry lock is poisoned"))]
    Poisoned,
}

impl From<StorageError> for RegistryError {
    fn from(source: StorageError) -> Self {
        RegistryError::Storage { source }
    }
}

/// Convenience alias for registry results.
pub type RegistryResult<T> = Result<T, RegistryError>;

/// One registered database.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegistryEntry {
    /// Files holding the database, in registration order.
    pub paths: Vec<PathBuf>,
    /// Engine that wrote every file in `paths`.
    pub engine: Engine,
    /// Registration metadata (download date, format version, ...).
    #[serde(default)]
    pub metadata: Metadata,
    /// When the name was first registered.
    pub registered_at: DateTime<Utc>,
    /// When the entry last changed.
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct RegistryDocument {
    format_version: u32,
    #[serde(default)]
    databases: BTreeMap<String, RegistryEntry>,
}

impl Default for RegistryDocument {
    fn default() -> Self {
        Self {
            format_version: REGISTRY_FORMAT_VERSION,
            databases: BTreeMap::new(),
        }
    }
}

/// Held for the duration of a mutation; unlocks on drop.
struct StoreLock {
    file: File,
}

impl Drop for StoreLock {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.file);
    }
}

/// Registry of named databases backed by a JSON store.
#[derive(Debug, Clone)]
pub struct DatabaseRegistry {
    store: PathBuf,
    doc: RegistryDocument,
}

impl DatabaseRegistry {
    /// Open the registry stored at `store`.
    ///
    /// A missing store is an empty registry; it is created on the first
    /// mutation.
    pub fn open(store: impl Into<PathBuf>) -> RegistryResult<Self> {
        let store = store.into();
        let doc = load_document(&store)?;
        debug!(
            "opened registry {} ({} databases)",
            store.display(),
            doc.databases.len()
        );
        Ok(Self { store, doc })
    }

    /// Path of the backing store.
    pub fn store_path(&self) -> &Path {
        &self.store
    }

    /// Re-read the store, picking up changes made by other processes.
    pub fn reload(&mut self) -> RegistryResult<()> {
        self.doc = load_document(&self.store)?;
        Ok(())
    }

    /// Add `path` to the database `name`, creating the entry if needed.
    ///
    /// - A path already listed is not added twice.
    /// - `metadata` is merged into the entry, overwriting existing keys.
    /// - Fails with `EngineConflict` if `name` is recorded with another
    ///   engine, and with `InvalidMetadata` if a value has no JSON form
    ///   (NaN, infinities); nothing is written in either case.
    ///
    /// The store is flushed before this returns.
    pub fn register(
        &mut self,
        name: &str,
        path: impl AsRef<Path>,
        engine: Engine,
        metadata: Metadata,
    ) -> RegistryResult<RegistryEntry> {
        ensure!(!name.is_empty(), EmptyNameSnafu);
        crate::metadata::validate(&metadata).context(InvalidMetadataSnafu { name })?;
        let path = path.as_ref().to_path_buf();

        self.mutate(|doc| {
            let now = Utc::now();
            let entry = match doc.databases.entry(name.to_string()) {
                MapEntry::Occupied(slot) => {
                    let entry = slot.into_mut();
                    ensure!(
                        entry.engine == engine,
                        EngineConflictSnafu {
                            name,
                            recorded: entry.engine,
                            requested: engine,
                        }
                    );
                    if !entry.paths.contains(&path) {
                        entry.paths.push(path.clone());
                    }
                    entry.metadata.extend(metadata);
                    entry.updated_at = now;
                    entry
                }
                MapEntry::Vacant(slot) => slot.insert(RegistryEntry {
                    paths: vec![path.clone()],
                    engine,
                    metadata,
                    registered_at: now,
                    updated_at: now,
                }),
            };
            Ok(entry.clone())
        })
        .inspect(|entry| {
            info!(
                "registered {} under {name:?} ({}, {} files)",
                path.display(),
                entry.engine,
                entry.paths.len()
            );
        })
    }

    /// Remove the database `name`, returning its entry. The files are not
    /// touched.
    pub fn unregister(&mut self, name: &str) -> RegistryResult<RegistryEntry> {
        let removed = self.mutate(|doc| {
            let available = doc.databases.keys().cloned().collect::<Vec<_>>();
            doc.databases
                .remove(name)
                .context(UnknownDatabaseSnafu { name, available })
        })?;
        info!("unregistered {name:?}");
        Ok(removed)
    }

    /// The entry for `name`.
    pub fn resolve(&self, name: &str) -> RegistryResult<&RegistryEntry> {
        self.doc
            .databases
            .get(name)
            .with_context(|| UnknownDatabaseSnafu {
                name,
                available: self.doc.databases.keys().cloned().collect::<Vec<_>>(),
            })
    }

    /// Like [`DatabaseRegistry::resolve`], but a miss reloads the store once
    /// before failing.
    pub fn resolve_fresh(&mut self, name: &str) -> RegistryResult<&RegistryEntry> {
        if !self.contains(name) {
            self.reload()?;
        }
        self.resolve(name)
    }

    /// The entry for `name`, if registered.
    pub fn get(&self, name: &str) -> Option<&RegistryEntry> {
        self.doc.databases.get(name)
    }

    /// Returns true if `name` is registered.
    pub fn contains(&self, name: &str) -> bool {
        self.doc.databases.contains_key(name)
    }

    /// Registered names in sorted order.
    pub fn names(&self) -> impl Iterator<Item = &str> + '_ {
        self.doc.databases.keys().map(String::as_str)
    }

    /// Number of registered databases.
    pub fn len(&self) -> usize {
        self.doc.databases.len()
    }

    /// Returns true if no database is registered.
    pub fn is_empty(&self) -> bool {
        self.doc.databases.is_empty()
    }

    fn lock(&self) -> RegistryResult<StoreLock> {
        let lock_path = lock_path_for(&self.store);
        let path = lock_path.display().to_string();
        if let Some(parent) = lock_path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).context(LockSnafu { path: &path })?;
        }
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&lock_path)
            .context(LockSnafu { path: &path })?;
        file.lock_exclusive().context(LockSnafu { path })?;
        Ok(StoreLock { file })
    }

    /// Apply `change` to a fresh copy of the store under the store lock,
    /// flush it, then adopt it as the in-memory view.
    fn mutate<T>(
        &mut self,
        change: impl FnOnce(&mut RegistryDocument) -> RegistryResult<T>,
    ) -> RegistryResult<T> {
        let _lock = self.lock()?;
        let mut doc = load_document(&self.store)?;
        let out = change(&mut doc)?;

        let json = serde_json::to_vec_pretty(&doc).map_err(|e| RegistryError::CorruptStore {
            path: self.store.display().to_string(),
            msg: format!("cannot serialize registry: {e}"),
            backtrace: Backtrace::capture(),
        })?;
        storage::write_atomic(&self.store, &json)?;
        debug!("flushed registry {}", self.store.display());

        self.doc = doc;
        Ok(out)
    }
}

fn lock_path_for(store: &Path) -> PathBuf {
    let mut name = store
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_else(|| "registry.json".into());
    name.push(".lock");
    store.with_file_name(name)
}

fn load_document(store: &Path) -> RegistryResult<RegistryDocument> {
    let raw = match storage::read_to_string(store) {
        Ok(raw) => raw,
        Err(e) if e.is_not_found() => return Ok(RegistryDocument::default()),
        Err(source) => return Err(RegistryError::Storage { source }),
    };
    if raw.trim().is_empty() {
        return Ok(RegistryDocument::default());
    }

    let doc: RegistryDocument = serde_json::from_str(&raw).map_err(|e| RegistryError::CorruptStore {
        path: store.display().to_string(),
        msg: format!("invalid JSON: {e}"),
        backtrace: Backtrace::capture(),
    })?;
    ensure!(
        doc.format_version <= REGISTRY_FORMAT_VERSION,
        CorruptStoreSnafu {
            path: store.display().to_string(),
            msg: format!(
                "format version {} is newer than supported version {REGISTRY_FORMAT_VERSION}",
                doc.format_version
            ),
        }
    );
    Ok(doc)
}

static GLOBAL: OnceLock<Mutex<DatabaseRegistry>> = OnceLock::new();

/// Load the process-wide registry from `store`. May be called once.
pub fn init_global(store: impl Into<PathBuf>) -> RegistryResult<()> {
    let registry = DatabaseRegistry::open(store)?;
    let path = registry.store_path().display().to_string();
    GLOBAL
        .set(Mutex::new(registry))
        .map_err(|_| RegistryError::AlreadyInitialized {
            path: GLOBAL
                .get()
                .and_then(|m| m.lock().ok().map(|r| r.store_path().display().to_string()))
                .unwrap_or(path),
        })
}

/// Run `f` with exclusive access to the process-wide registry.
pub fn with_global<T>(
    f: impl FnOnce(&mut DatabaseRegistry) -> RegistryResult<T>,
) -> RegistryResult<T> {
    let registry = GLOBAL.get().context(NotInitializedSnafu)?;
    let mut guard = registry.lock().map_err(|_| RegistryError::Poisoned)?;
    f(&mut guard)
}

/// [`DatabaseRegistry::register`] on the process-wide registry.
pub fn register_database(
    name: &str,
    path: impl AsRef<Path>,
    engine: Engine,
    metadata: Metadata,
) -> RegistryResult<RegistryEntry> {
    with_global(|registry| registry.register(name, path, engine, metadata))
}

/// Resolve `name` in the process-wide registry, reloading the store once on
/// a miss.
pub fn resolve_database(name: &str) -> RegistryResult<RegistryEntry> {
    with_global(|registry| registry.resolve_fresh(name).cloned())
}
