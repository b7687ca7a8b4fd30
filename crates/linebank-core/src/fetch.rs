//! Boundary with the collaborator that downloads or converts datasets.
//!
//! A [`DatasetSource`] knows where a dataset selection lives on disk and how
//! to produce those files. [`FetchOrchestrator::ensure_local`] drives it:
//! files that are registered and still pass structural validation are
//! reused, anything else is materialized, validated, and registered. Calling
//! it twice with the same arguments does no work the second time.

use std::path::{Path, PathBuf};

use log::{debug, info, warn};
use snafu::prelude::*;

use crate::{
    engine::{self, Engine},
    error::DatabankError,
    metadata::Metadata,
    registry::{DatabaseRegistry, RegistryError},
};

/// Selection parameters for a dataset (wavenumber range, isotopes, ...).
pub type Selection = Metadata;

/// Error type returned by [`DatasetSource`] implementations.
pub type SourceError = Box<dyn std::error::Error + Send + Sync>;

/// Downloads or converts datasets into local files.
pub trait DatasetSource {
    /// Files that hold `selection` of dataset `name`, in order.
    fn plan(&self, name: &str, selection: &Selection) -> Result<Vec<PathBuf>, SourceError>;

    /// Produce the file at `path` using `engine`, returning the metadata to
    /// record in the registry.
    fn materialize(
        &self,
        name: &str,
        selection: &Selection,
        path: &Path,
        engine: Engine,
    ) -> Result<Metadata, SourceError>;
}

/// Errors from [`FetchOrchestrator::ensure_local`].
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum FetchError {
    /// The source could not plan the selection.
    #[snafu(display("Cannot plan files for {name:?}: {source}"))]
    Plan {
        /// Dataset name.
        name: String,
        /// Source error.
        source: SourceError,
    },

    /// The source planned no files.
    #[snafu(display("Source planned no files for {name:?}"))]
    EmptyPlan {
        /// Dataset name.
        name: String,
    },

    /// The source failed to produce a file.
    #[snafu(display("Cannot materialize {path} for {name:?}: {source}"))]
    Materialize {
        /// Dataset name.
        name: String,
        /// Target file.
        path: String,
        /// Source error.
        source: SourceError,
    },

    /// A freshly materialized file does not carry the expected engine's
    /// structure.
    #[snafu(display("Materialized file {path} for {name:?} is not a valid {engine} file: {source}"))]
    Validation {
        /// Dataset name.
        name: String,
        /// Offending file.
        path: String,
        /// Engine the file should have been written with.
        engine: Engine,
        /// What detection reported.
        source: DatabankError,
    },

    /// Registering the file failed.
    #[snafu(display("Registry error: {source}"))]
    Registry {
        /// Underlying registry error.
        source: RegistryError,
    },
}

impl From<RegistryError> for FetchError {
    fn from(source: RegistryError) -> Self {
        FetchError::Registry { source }
    }
}

/// Ensures datasets exist locally and are registered.
#[derive(Debug, Clone)]
pub struct FetchOrchestrator<S> {
    source: S,
    engine: Engine,
}

impl<S: DatasetSource> FetchOrchestrator<S> {
    /// Orchestrator writing new datasets with `engine`.
    ///
    /// Datasets already registered keep the engine recorded for them.
    pub fn new(source: S, engine: Engine) -> Self {
        Self { source, engine }
    }

    /// The wrapped source.
    pub fn source(&self) -> &S {
        &self.source
    }

    /// Make sure every file of `selection` exists locally, is valid, and is
    /// registered under `name`. Returns the planned paths.
    pub fn ensure_local(
        &self,
        registry: &mut DatabaseRegistry,
        name: &str,
        selection: &Selection,
    ) -> Result<Vec<PathBuf>, FetchError> {
        let planned = self
            .source
            .plan(name, selection)
            .context(PlanSnafu { name })?;
        ensure!(!planned.is_empty(), EmptyPlanSnafu { name });

        let recorded = registry.get(name).map(|e| (e.engine, e.paths.clone()));
        let engine = recorded.as_ref().map_or(self.engine, |(engine, _)| *engine);

        let mut fetched = 0usize;
        for path in &planned {
            let registered = recorded
                .as_ref()
                .is_some_and(|(_, paths)| paths.contains(path));

            if registered {
                match validate(path, engine) {
                    Ok(()) => {
                        debug!("reusing {} for {name:?}", path.display());
                        continue;
                    }
                    Err(e) => warn!(
                        "registered file {} for {name:?} failed validation ({e}); materializing again",
                        path.display()
                    ),
                }
            }

            let path_str = path.display().to_string();
            let metadata = self
                .source
                .materialize(name, selection, path, engine)
                .context(MaterializeSnafu {
                    name,
                    path: &path_str,
                })?;
            validate(path, engine).context(ValidationSnafu {
                name,
                path: &path_str,
                engine,
            })?;
            registry.register(name, path, engine, metadata)?;
            fetched += 1;
        }

        if fetched > 0 {
            info!(
                "materialized {fetched} of {} files for {name:?}",
                planned.len()
            );
        }
        Ok(planned)
    }
}

/// The file at `path` exists and carries `engine`'s signature.
fn validate(path: &Path, engine: Engine) -> Result<(), DatabankError> {
    let found = engine::detect(path)?;
    if found == engine {
        Ok(())
    } else {
        Err(DatabankError::EngineMismatch {
            path: path.display().to_string(),
            expected: engine,
            found: Some(found),
        })
    }
}
