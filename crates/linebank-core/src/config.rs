//! Runtime configuration.
//!
//! [`LinebankConfig`] gathers the few settings the storage layer needs:
//! where the registry store lives, which columns the range and category
//! filters apply to by default, and which engine new downloads are written
//! with. It deserializes from any serde format (missing fields take their
//! defaults) and can be overlaid from `LINEBANK_*` environment variables.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use snafu::prelude::*;

use crate::{
    engine::{Engine, ParseEngineError},
    filter::{DEFAULT_CATEGORY_COLUMN, DEFAULT_RANGE_COLUMN},
    loader::LoadOptions,
    registry::{DatabaseRegistry, RegistryResult},
};

/// Registry store path.
pub const ENV_REGISTRY: &str = "LINEBANK_REGISTRY";
/// Default range column.
pub const ENV_RANGE_COLUMN: &str = "LINEBANK_RANGE_COLUMN";
/// Default category column.
pub const ENV_CATEGORY_COLUMN: &str = "LINEBANK_CATEGORY_COLUMN";
/// Engine used for new downloads.
pub const ENV_FETCH_ENGINE: &str = "LINEBANK_FETCH_ENGINE";

/// Errors from reading configuration.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum ConfigError {
    /// An environment variable holds an unusable value.
    #[snafu(display("Invalid value {value:?} for {var}: {reason}"))]
    InvalidEnv {
        /// Variable name.
        var: &'static str,
        /// Value found.
        value: String,
        /// Why it was rejected.
        reason: String,
    },
}

/// Storage layer settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LinebankConfig {
    /// JSON store backing the database registry.
    pub registry_path: PathBuf,
    /// Column that `load_value_min`/`load_value_max` apply to.
    pub range_column: String,
    /// Column that the isotope selector applies to.
    pub category_column: String,
    /// Engine used when a dataset is materialized for the first time.
    pub fetch_engine: Engine,
}

impl Default for LinebankConfig {
    fn default() -> Self {
        Self {
            registry_path: default_registry_path(),
            range_column: DEFAULT_RANGE_COLUMN.to_string(),
            category_column: DEFAULT_CATEGORY_COLUMN.to_string(),
            fetch_engine: Engine::LazyColumnar,
        }
    }
}

/// `~/.linebank/registry.json`, or `./.linebank/registry.json` without a
/// home directory.
fn default_registry_path() -> PathBuf {
    std::env::var_os("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".linebank")
        .join("registry.json")
}

impl LinebankConfig {
    /// Defaults overlaid with the `LINEBANK_*` environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::default().overlay(|var| std::env::var(var).ok())
    }

    /// Overlay settings found through `lookup` (an environment stand-in).
    /// Empty values are ignored.
    pub fn overlay<F>(mut self, lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |var: &str| lookup(var).filter(|v| !v.trim().is_empty());

        if let Some(path) = get(ENV_REGISTRY) {
            self.registry_path = PathBuf::from(path);
        }
        if let Some(column) = get(ENV_RANGE_COLUMN) {
            self.range_column = column;
        }
        if let Some(column) = get(ENV_CATEGORY_COLUMN) {
            self.category_column = column;
        }
        if let Some(value) = get(ENV_FETCH_ENGINE) {
            self.fetch_engine = value.parse().map_err(|e: ParseEngineError| {
                ConfigError::InvalidEnv {
                    var: ENV_FETCH_ENGINE,
                    value: value.clone(),
                    reason: e.to_string(),
                }
            })?;
        }
        Ok(self)
    }

    /// Open the registry at `registry_path`.
    pub fn open_registry(&self) -> RegistryResult<DatabaseRegistry> {
        DatabaseRegistry::open(&self.registry_path)
    }

    /// Load options using this configuration's filter columns.
    pub fn load_options(&self) -> LoadOptions {
        LoadOptions::new().with_config(self)
    }
}
