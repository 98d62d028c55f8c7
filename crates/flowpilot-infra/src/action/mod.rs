//! Built-in action handlers.
//!
//! - `http` -- `http_request` / `integration_request` over `reqwest`
//! - `desktop` -- desktop automation forwarded to a local desktop agent

pub mod desktop;
pub mod http;

use std::sync::Arc;
use std::time::Duration;

use flowpilot_core::workflow::dispatcher::ActionRegistry;
use flowpilot_types::config::EngineConfig;
use flowpilot_types::workflow::{HTTP_REQUEST, INTEGRATION_REQUEST};

use self::desktop::{DESKTOP_NODE_TYPES, DesktopAgentClient};
use self::http::HttpRequestHandler;

/// Registry with every built-in handler the configuration enables.
///
/// Desktop node types are only registered when `desktop_agent_url` is set;
/// without it they fall through to the dispatcher's no-op.
pub fn default_registry(config: &EngineConfig) -> Result<ActionRegistry, reqwest::Error> {
    let timeout = Duration::from_millis(config.http_timeout_ms);

    let http = Arc::new(HttpRequestHandler::new(timeout)?);
    let mut registry = ActionRegistry::new()
        .with(HTTP_REQUEST, http.clone())
        .with(INTEGRATION_REQUEST, http);

    if let Some(url) = &config.desktop_agent_url {
        let desktop = Arc::new(DesktopAgentClient::new(url, timeout)?);
        for node_type in DESKTOP_NODE_TYPES {
            registry.register(*node_type, desktop.clone());
        }
        tracing::debug!(url = url.as_str(), "desktop agent handlers registered");
    }

    Ok(registry)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn desktop_types_only_with_agent_url() {
        let registry = default_registry(&EngineConfig::default()).unwrap();
        assert!(registry.contains(HTTP_REQUEST));
        assert!(registry.contains(INTEGRATION_REQUEST));
        assert!(!registry.contains("desktop_click"));

        let config = EngineConfig {
            desktop_agent_url: Some("http://127.0.0.1:8765".into()),
            ..Default::default()
        };
        let registry = default_registry(&config).unwrap();
        for node_type in DESKTOP_NODE_TYPES {
            assert!(registry.contains(node_type), "{node_type} missing");
        }
    }
}
