//! Launcher configuration.

use crate::error::{LaunchError, LaunchResult};
use capmesh_p2p::StreamConfig;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Capability ID prefix of streams triggers
pub const DEFAULT_STREAM_TRIGGER_PREFIX: &str = "streams-trigger";

/// Tunables of the capability launcher
///
/// Every field has a default, so an empty TOML document is a valid configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LauncherConfig {
    /// Stream profile applied to every peer connection
    pub stream: StreamConfig,
    /// Timeout of remote action/target requests, in seconds
    pub request_timeout_secs: u64,
    /// Concurrent executions per exposed action/target
    pub max_parallel_requests: usize,
    /// Capability ID prefix selecting the streams aggregators
    pub stream_trigger_prefix: String,
    /// Maximum report age accepted by the v2 streams aggregator, in seconds
    pub signed_report_max_age_secs: u64,
}

impl Default for LauncherConfig {
    fn default() -> Self {
        Self {
            stream: StreamConfig::default(),
            request_timeout_secs: 8 * 60,
            max_parallel_requests: 1000,
            stream_trigger_prefix: DEFAULT_STREAM_TRIGGER_PREFIX.to_string(),
            signed_report_max_age_secs: 120,
        }
    }
}

impl LauncherConfig {
    /// Parse from a TOML document
    pub fn from_toml_str(content: &str) -> LaunchResult<Self> {
        toml::from_str(content).map_err(|e| LaunchError::Config(e.to_string()))
    }

    /// Load from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> LaunchResult<Self> {
        let content =
            std::fs::read_to_string(path).map_err(|e| LaunchError::Config(e.to_string()))?;
        Self::from_toml_str(&content)
    }

    /// Remote request timeout
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    /// Maximum accepted report age
    pub fn signed_report_max_age(&self) -> Duration {
        Duration::from_secs(self.signed_report_max_age_secs)
    }
}
