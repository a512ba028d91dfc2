//! Run configuration: table patterns and the concurrency bound.

use crate::pattern::{ConfigurationError, PatternSet};
use crate::scheduler::Scheduler;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// The tunable knobs of a sync.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SyncConfig {
    /// Glob patterns of tables to sync. Empty means every table.
    pub included_tables: Vec<String>,
    /// Glob patterns of tables to skip, with their relations.
    pub excluded_tables: Vec<String>,
    /// Maximum number of collectors polled at once.
    pub max_concurrency: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            included_tables: Vec::new(),
            excluded_tables: Vec::new(),
            max_concurrency: Scheduler::DEFAULT_MAX_CONCURRENCY,
        }
    }
}

impl SyncConfig {
    pub const ENV_MAX_CONCURRENCY: &'static str = "CANOPY_MAX_CONCURRENCY";

    pub fn from_toml_str(text: &str) -> Result<Self, ConfigurationError> {
        parse_document("toml", text)
    }

    pub fn from_yaml_str(text: &str) -> Result<Self, ConfigurationError> {
        parse_document("yaml", text)
    }

    pub fn from_json_str(text: &str) -> Result<Self, ConfigurationError> {
        parse_document("json", text)
    }

    /// Load a config file, picking the format from its extension.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigurationError> {
        load_document(path.as_ref())
    }

    /// Apply `CANOPY_*` environment overrides.
    pub fn with_env_overrides(self) -> Result<Self, ConfigurationError> {
        self.with_overrides_from(|var| std::env::var(var).ok())
    }

    /// Apply overrides from an arbitrary variable lookup.
    pub fn with_overrides_from(
        mut self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<Self, ConfigurationError> {
        if let Some(value) = lookup(Self::ENV_MAX_CONCURRENCY) {
            self.max_concurrency =
                value
                    .trim()
                    .parse()
                    .map_err(|_| ConfigurationError::InvalidEnv {
                        var: Self::ENV_MAX_CONCURRENCY,
                        value,
                    })?;
        }
        Ok(self)
    }

    /// Compile the include and exclude patterns.
    pub fn pattern_set(&self) -> Result<PatternSet, ConfigurationError> {
        PatternSet::new(&self.included_tables, &self.excluded_tables)
    }

    /// Check every knob without building anything that outlives the call.
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        Scheduler::from_config(self)?;
        self.pattern_set()?;
        Ok(())
    }
}

/// Configuration format for a file extension.
pub fn format_for_path(path: &Path) -> Result<&'static str, ConfigurationError> {
    match path.extension().and_then(|ext| ext.to_str()) {
        Some("toml") => Ok("toml"),
        Some("yaml" | "yml") => Ok("yaml"),
        Some("json") => Ok("json"),
        other => Err(ConfigurationError::UnknownFormat(
            other.unwrap_or_default().to_string(),
        )),
    }
}

/// Parse a document in one of the supported configuration formats.
pub fn parse_document<T: DeserializeOwned>(
    format: &str,
    text: &str,
) -> Result<T, ConfigurationError> {
    match format {
        "toml" => toml::from_str(text).map_err(|e| ConfigurationError::Parse {
            format: "TOML",
            message: e.to_string(),
        }),
        "yaml" => serde_yaml::from_str(text).map_err(|e| ConfigurationError::Parse {
            format: "YAML",
            message: e.to_string(),
        }),
        "json" => serde_json::from_str(text).map_err(|e| ConfigurationError::Parse {
            format: "JSON",
            message: e.to_string(),
        }),
        other => Err(ConfigurationError::UnknownFormat(other.to_string())),
    }
}

/// Read and parse a configuration file of any supported format.
pub fn load_document<T: DeserializeOwned>(path: &Path) -> Result<T, ConfigurationError> {
    let format = format_for_path(path)?;
    let text = std::fs::read_to_string(path).map_err(|source| ConfigurationError::Io {
        path: path.display().to_string(),
        source,
    })?;
    parse_document(format, &text)
}
