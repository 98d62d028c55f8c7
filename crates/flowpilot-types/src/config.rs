//! Engine configuration types.
//!
//! `EngineConfig` mirrors `{data_dir}/config.toml`. Every field has a default,
//! so an empty or missing file yields a fully usable configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Top-level configuration for the Flowpilot engine and CLI host.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// First retry delay; doubles on every further attempt.
    pub retry_base_backoff_ms: u64,
    /// Retries per node when neither the node nor the workflow sets one.
    pub default_retries: u32,
    /// Per-attempt timeout when neither the node nor the workflow sets one.
    pub default_node_timeout_ms: u64,
    /// Wall-clock budget for a whole run.
    pub default_global_timeout_ms: u64,
    /// Per-task timeout for `parallel_execute` when the node does not set one.
    pub parallel_task_timeout_ms: u64,
    /// Capacity of the per-run network call ring buffer.
    pub network_log_capacity: usize,
    pub drain_poll_interval_ms: u64,
    pub drain_timeout_ms: u64,
    pub event_bus_capacity: usize,
    /// Request timeout for the built-in HTTP handlers.
    pub http_timeout_ms: u64,
    /// Base URL of the desktop automation agent, e.g. `http://127.0.0.1:8765`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub desktop_agent_url: Option<String>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            retry_base_backoff_ms: 250,
            default_retries: 2,
            default_node_timeout_ms: 10_000,
            default_global_timeout_ms: 1_800_000,
            parallel_task_timeout_ms: 15_000,
            network_log_capacity: 50,
            drain_poll_interval_ms: 100,
            drain_timeout_ms: 30_000,
            event_bus_capacity: 256,
            http_timeout_ms: 30_000,
            desktop_agent_url: None,
        }
    }
}

impl EngineConfig {
    pub fn retry_base_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_base_backoff_ms)
    }

    pub fn parallel_task_timeout(&self) -> Duration {
        Duration::from_millis(self.parallel_task_timeout_ms)
    }

    pub fn drain_poll_interval(&self) -> Duration {
        Duration::from_millis(self.drain_poll_interval_ms)
    }

    pub fn drain_timeout(&self) -> Duration {
        Duration::from_millis(self.drain_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_values() {
        let config = EngineConfig::default();
        assert_eq!(config.retry_base_backoff_ms, 250);
        assert_eq!(config.default_retries, 2);
        assert_eq!(config.default_node_timeout_ms, 10_000);
        assert_eq!(config.parallel_task_timeout(), Duration::from_secs(15));
        assert!(config.desktop_agent_url.is_none());
    }

    #[test]
    fn partial_toml_keeps_other_defaults() {
        let config: EngineConfig = toml::from_str(
            r#"
default_retries = 5
desktop_agent_url = "http://127.0.0.1:8765"
"#,
        )
        .unwrap();
        assert_eq!(config.default_retries, 5);
        assert_eq!(config.default_node_timeout_ms, 10_000);
        assert_eq!(config.desktop_agent_url.as_deref(), Some("http://127.0.0.1:8765"));
    }
}
