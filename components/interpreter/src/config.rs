//! VM configuration
//!
//! Hosts build a [`VmConfig`] in code or read it from JSON. Every field has a
//! default, so a partial document such as `{"heap_ceiling": 1048576}` is
//! valid.

use std::path::Path;

use memory_manager::HeapConfig;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::sandbox::SecurityPolicy;

/// Errors raised while reading or applying configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The configuration file could not be read
    #[error("cannot read configuration: {0}")]
    Io(#[from] std::io::Error),

    /// The document is not valid JSON for [`VmConfig`]
    #[error("invalid configuration document: {0}")]
    Json(#[from] serde_json::Error),

    /// A network host rule is not a valid pattern
    #[error("invalid host pattern: {0}")]
    Pattern(#[from] regex::Error),

    /// A value is out of range
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Construction parameters of a [`crate::Vm`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VmConfig {
    /// Heap ceiling in bytes
    pub heap_ceiling: usize,
    /// Heap usage, in percent of the ceiling, that triggers cycle collection
    pub gc_threshold_percent: u8,
    /// Whether the cycle collector runs
    pub cycle_collection: bool,
    /// Instructions between resource checkpoints
    pub checkpoint_interval: u32,
    /// Calls after which a function is reported to the JIT hook
    pub jit_threshold: u64,
    /// Size of the list-buffer pool, `None` to disable pooling
    pub pool_size: Option<usize>,
    /// Maximum nesting of bytecode calls
    pub max_call_depth: usize,
    /// Sandbox policy installed at construction
    pub policy: SecurityPolicy,
}

impl Default for VmConfig {
    fn default() -> Self {
        Self {
            heap_ceiling: 256 * 1024 * 1024,
            gc_threshold_percent: 75,
            cycle_collection: true,
            checkpoint_interval: 1024,
            jit_threshold: 100,
            pool_size: None,
            max_call_depth: 1024,
            policy: SecurityPolicy::default(),
        }
    }
}

impl VmConfig {
    /// Parse a JSON document
    pub fn from_json(text: &str) -> Result<Self, ConfigError> {
        let config: VmConfig = serde_json::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Read a JSON document from disk
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json(&text)
    }

    /// Serialize as pretty-printed JSON
    pub fn to_json(&self) -> Result<String, ConfigError> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Reject values the VM cannot run with
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.checkpoint_interval == 0 {
            return Err(ConfigError::Invalid(
                "checkpoint_interval must be at least 1".to_string(),
            ));
        }
        if self.gc_threshold_percent == 0 || self.gc_threshold_percent > 100 {
            return Err(ConfigError::Invalid(format!(
                "gc_threshold_percent {} is outside 1..=100",
                self.gc_threshold_percent
            )));
        }
        if self.max_call_depth == 0 {
            return Err(ConfigError::Invalid(
                "max_call_depth must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    /// Heap parameters, with the policy's memory limit applied
    pub fn heap_config(&self) -> HeapConfig {
        let ceiling = match self.policy.limits.max_memory_bytes {
            Some(limit) => limit.min(self.heap_ceiling),
            None => self.heap_ceiling,
        };
        HeapConfig {
            ceiling,
            gc_threshold_percent: self.gc_threshold_percent,
            cycle_collection: self.cycle_collection,
        }
    }
}
