// Copyright 2025 Cowboy AI, LLC.

//! Runtime configuration
//!
//! Every field has a default, so a partial JSON document (or none at all) is
//! a valid configuration.
//!
//! ```rust
//! use cim_event_sourcing::RuntimeConfig;
//!
//! let config = RuntimeConfig::from_json_str(r#"{ "snapshots": { "replay_threshold": 50 } }"#).unwrap();
//! assert_eq!(config.snapshots.replay_threshold, 50);
//! assert_eq!(config.command_processing.max_retries, 10);
//! ```

use schemars::schema::RootSchema;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The document is not valid JSON for this structure
    #[error("Failed to parse configuration: {0}")]
    Parse(#[from] serde_json::Error),

    /// A value is out of range
    #[error("Invalid configuration value for {field}: {reason}")]
    Invalid {
        /// Dotted path of the field
        field: &'static str,
        /// What is wrong with it
        reason: String,
    },
}

/// Top-level runtime configuration
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Command processing settings
    pub command_processing: CommandProcessingConfig,
    /// Snapshot cache settings
    pub snapshots: SnapshotConfig,
    /// View dispatch settings
    pub views: ViewConfig,
}

/// Command processing settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct CommandProcessingConfig {
    /// Retries after a concurrency conflict before giving up
    pub max_retries: u32,
}

impl Default for CommandProcessingConfig {
    fn default() -> Self {
        Self { max_retries: 10 }
    }
}

/// Snapshot cache settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct SnapshotConfig {
    /// Approximate upper bound on cached snapshots; 0 disables the cache
    pub approximate_max_entries: usize,
    /// A reconstructed root is cached when more events than this were replayed
    pub replay_threshold: usize,
}

impl Default for SnapshotConfig {
    fn default() -> Self {
        Self {
            approximate_max_entries: 1000,
            replay_threshold: 10,
        }
    }
}

/// View dispatch settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct ViewConfig {
    /// Events read from the store per catch-up chunk
    pub max_items_per_batch: usize,
    /// How often waiting callers re-check view positions
    pub wait_poll_interval_ms: u64,
    /// How often background catch-up runs without a local commit signal
    pub idle_poll_interval_ms: u64,
}

impl Default for ViewConfig {
    fn default() -> Self {
        Self {
            max_items_per_batch: 1000,
            wait_poll_interval_ms: 20,
            idle_poll_interval_ms: 1000,
        }
    }
}

impl ViewConfig {
    /// Poll interval for waiting callers
    pub fn wait_poll_interval(&self) -> Duration {
        Duration::from_millis(self.wait_poll_interval_ms)
    }

    /// Poll interval for idle background catch-up
    pub fn idle_poll_interval(&self) -> Duration {
        Duration::from_millis(self.idle_poll_interval_ms)
    }
}

impl RuntimeConfig {
    /// Parse and validate a JSON document
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Check value ranges
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.views.max_items_per_batch == 0 {
            return Err(ConfigError::Invalid {
                field: "views.max_items_per_batch",
                reason: "must be at least 1".to_string(),
            });
        }
        if self.views.wait_poll_interval_ms == 0 {
            return Err(ConfigError::Invalid {
                field: "views.wait_poll_interval_ms",
                reason: "must be at least 1".to_string(),
            });
        }
        if self.views.idle_poll_interval_ms == 0 {
            return Err(ConfigError::Invalid {
                field: "views.idle_poll_interval_ms",
                reason: "must be at least 1".to_string(),
            });
        }
        Ok(())
    }

    /// JSON schema of the configuration document
    pub fn json_schema() -> RootSchema {
        schemars::schema_for!(RuntimeConfig)
    }
}
