//! Runtime configuration.
//!
//! Configuration is read from TOML with camelCase keys. Every key is
//! optional:
//!
//! ```toml
//! timerThreadPoolSize = 4
//! validateTopics = true
//! defaultResponseTimeoutMs = 3000
//!
//! [serviceDetails]
//! name = "orders"
//! version = "2.1.0"
//! instanceId = "orders-1"   # generated when absent
//! ```

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{MsbError, MsbResult};

/// Response timeout used when a request does not configure one.
pub const DEFAULT_RESPONSE_TIMEOUT_MS: u64 = 3000;

/// Default number of threads running conversation timers.
pub const DEFAULT_TIMER_THREAD_POOL_SIZE: usize = 2;

/// Identity of this service instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ServiceDetailsConfig {
    pub name: String,
    pub version: String,
    /// Suffix of this instance's private response topics
    pub instance_id: Option<String>,
}

impl Default for ServiceDetailsConfig {
    fn default() -> Self {
        Self {
            name: "msb-service".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            instance_id: None,
        }
    }
}

/// Top-level configuration of a messaging context.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct MsbConfig {
    pub service_details: ServiceDetailsConfig,
    /// Worker threads of the timeout scheduler
    pub timer_thread_pool_size: usize,
    /// Reject producer/consumer topics that violate the topic grammar
    pub validate_topics: bool,
    pub default_response_timeout_ms: u64,
}

impl Default for MsbConfig {
    fn default() -> Self {
        Self {
            service_details: ServiceDetailsConfig::default(),
            timer_thread_pool_size: DEFAULT_TIMER_THREAD_POOL_SIZE,
            validate_topics: true,
            default_response_timeout_ms: DEFAULT_RESPONSE_TIMEOUT_MS,
        }
    }
}

impl MsbConfig {
    /// Parse and validate configuration from a TOML string.
    pub fn from_toml_str(content: &str) -> MsbResult<Self> {
        let config: MsbConfig =
            toml::from_str(content).map_err(|e| MsbError::config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> MsbResult<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    pub fn default_response_timeout(&self) -> Duration {
        Duration::from_millis(self.default_response_timeout_ms)
    }

    /// Check values that deserialization alone cannot rule out.
    pub fn validate(&self) -> MsbResult<()> {
        if self.timer_thread_pool_size == 0 {
            return Err(MsbError::config("timerThreadPoolSize must be at least 1"));
        }
        if self.service_details.name.trim().is_empty() {
            return Err(MsbError::config("serviceDetails.name must not be empty"));
        }
        if let Some(instance_id) = &self.service_details.instance_id {
            let valid = !instance_id.is_empty()
                && instance_id
                    .chars()
                    .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-');
            if !valid {
                return Err(MsbError::config(format!(
                    "serviceDetails.instanceId '{instance_id}' must be lowercase alphanumeric or '-'"
                )));
            }
        }
        Ok(())
    }
}
