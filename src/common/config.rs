//! Engine configuration
//!
//! All policy thresholds live here rather than in code: request deadlines,
//! the continuation round-trip bound, and the consecutive-failure count that
//! declares a device unreachable.

use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

use super::{Error, Result};

/// Configuration for a conformance run
#[derive(Debug, Clone, Deserialize)]
pub struct EngineConfig {
    /// Deadline for a single request/response exchange, in seconds
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,

    /// Maximum request/response round trips a single test may chain
    /// before it is finalized as broken
    #[serde(default = "default_max_rounds")]
    pub max_continuation_rounds: u32,

    /// Consecutive transport failures after which the rest of the run is
    /// abandoned as "device unreachable"
    #[serde(default = "default_unreachable_threshold")]
    pub unreachable_threshold: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            request_timeout_secs: default_request_timeout(),
            max_continuation_rounds: default_max_rounds(),
            unreachable_threshold: default_unreachable_threshold(),
        }
    }
}

fn default_request_timeout() -> u64 {
    5
}
fn default_max_rounds() -> u32 {
    8
}
fn default_unreachable_threshold() -> u32 {
    5
}

impl EngineConfig {
    /// Load configuration from a TOML file
    ///
    /// Returns default configuration if the file doesn't exist.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path).map_err(|e| Error::FileRead {
            path: path.display().to_string(),
            error: e.to_string(),
        })?;
        toml::from_str(&content).map_err(|e| Error::ConfigParse(e.to_string()))
    }

    /// Request deadline as a [`Duration`]
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}
