//! # Configuration
//!
//! TOML configuration for the Oracle binary. Every section is optional and
//! falls back to the defaults shown here:
//!
//! ```toml
//! [server]
//! host = "127.0.0.1"
//! port = 8080
//!
//! [storage]
//! backend = "memory"        # or "redb"
//! database = "oracle.redb"
//!
//! [capacity]
//! blend_rate = 300          # per-mille weight of each new observation
//!
//! [sessions]
//! initial_stage_policy = "highest_satisfied"   # or "lowest"
//! ```
//!
//! A `[stages]` section replaces the whole stage table. It must define all
//! four stages and pass the same validation as the built-in table.

use clap::ValueEnum;
use oracle_core::primitives::DEFAULT_BLEND_RATE;
use oracle_core::{InMemoryCapacityStore, Level, Oracle, OracleError, OracleSettings, StageTable};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

// =============================================================================
// STORAGE BACKEND
// =============================================================================

/// Where sessions and transition history live.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum Backend {
    /// Volatile, lost on exit.
    #[default]
    Memory,
    /// redb database file.
    Redb,
}

impl Backend {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Backend::Memory => "memory",
            Backend::Redb => "redb",
        }
    }
}

impl std::fmt::Display for Backend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// =============================================================================
// SECTIONS
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8080,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct StorageConfig {
    pub backend: Backend,
    pub database: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: Backend::Memory,
            database: PathBuf::from("oracle.redb"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CapacityConfig {
    /// Weight of each new observation in the moving average.
    pub blend_rate: Level,
}

impl Default for CapacityConfig {
    fn default() -> Self {
        Self {
            blend_rate: DEFAULT_BLEND_RATE,
        }
    }
}

// =============================================================================
// ORACLE CONFIG
// =============================================================================

/// The full configuration file.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct OracleConfig {
    pub server: ServerConfig,
    pub storage: StorageConfig,
    pub capacity: CapacityConfig,
    pub sessions: OracleSettings,
    /// Replaces the built-in stage table when present.
    pub stages: Option<StageTable>,
}

impl OracleConfig {
    /// Parse a configuration from TOML text.
    pub fn from_toml_str(text: &str) -> Result<Self, OracleError> {
        let config: OracleConfig = toml::from_str(text)
            .map_err(|e| OracleError::InvalidConfig(format!("Invalid TOML: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Read and parse a configuration file.
    pub fn load(path: &Path) -> Result<Self, OracleError> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            OracleError::Io(format!("Cannot read '{}': {}", path.display(), e))
        })?;
        let config = Self::from_toml_str(&text)?;
        tracing::info!(event = "config_loaded", path = %path.display());
        Ok(config)
    }

    /// Load `path` when given, otherwise use the defaults.
    pub fn resolve(path: Option<&Path>) -> Result<Self, OracleError> {
        match path {
            Some(p) => Self::load(p),
            None => Ok(Self::default()),
        }
    }

    pub fn validate(&self) -> Result<(), OracleError> {
        if self.capacity.blend_rate == Level::MIN {
            return Err(OracleError::InvalidConfig(
                "capacity.blend_rate must be between 1 and 1000".to_string(),
            ));
        }
        if let Some(table) = &self.stages {
            table.validate()?;
        }
        Ok(())
    }

    /// Assemble the engine this configuration describes.
    pub fn build_oracle(&self) -> Result<Oracle, OracleError> {
        self.validate()?;

        let mut builder = Oracle::builder()
            .capacity_store(Box::new(InMemoryCapacityStore::with_blend_rate(
                self.capacity.blend_rate,
            )))
            .settings(self.sessions.clone());

        if let Some(table) = &self.stages {
            builder = builder.table(table.clone());
        }
        if self.storage.backend == Backend::Redb {
            builder = builder.redb(&self.storage.database)?;
        }

        tracing::info!(
            event = "oracle_configured",
            backend = %self.storage.backend,
            blend_rate = %self.capacity.blend_rate,
            custom_stages = self.stages.is_some(),
        );
        builder.build()
    }
}

// =============================================================================
// TESTS
// =============================================================================
