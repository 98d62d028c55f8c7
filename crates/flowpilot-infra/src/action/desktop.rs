//! Desktop automation via a local desktop agent process.
//!
//! The agent exposes `GET /health`, `GET /preflight` and `POST /run`. A run
//! request carries the node type and the node's data; the agent answers with
//! `{ "ok": true, ... }` or `{ "ok": false, "error": "..." }`.

use std::time::{Duration, Instant};

use chrono::Utc;
use flowpilot_core::workflow::context::{ExecutionContext, NetworkCall};
use flowpilot_core::workflow::dispatcher::{ActionHandler, DispatchEnv, HandlerError, HandlerResult};
use flowpilot_types::workflow::Node;
use futures_util::future::BoxFuture;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

pub const DESKTOP_CLICK: &str = "desktop_click";
pub const DESKTOP_CLICK_IMAGE: &str = "desktop_click_image";
pub const DESKTOP_TYPE: &str = "desktop_type";
pub const DESKTOP_WAIT_FOR_IMAGE: &str = "desktop_wait_for_image";

pub const DESKTOP_NODE_TYPES: &[&str] = &[
    DESKTOP_CLICK,
    DESKTOP_CLICK_IMAGE,
    DESKTOP_TYPE,
    DESKTOP_WAIT_FOR_IMAGE,
];

#[derive(Debug, Error)]
pub enum DesktopAgentError {
    #[error("desktop agent unreachable: {0}")]
    Http(#[from] reqwest::Error),

    #[error("desktop agent returned {0}")]
    Status(u16),
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Screen {
    pub width: u32,
    pub height: u32,
}

/// Answer of the agent's `/preflight` endpoint.
#[derive(Debug, Clone, Deserialize)]
pub struct Preflight {
    pub ok: bool,
    #[serde(default)]
    pub display: Option<String>,
    #[serde(default)]
    pub screen: Option<Screen>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub hint: Option<String>,
}

#[derive(Serialize)]
struct RunRequest<'a> {
    #[serde(rename = "type")]
    node_type: &'a str,
    data: &'a Map<String, Value>,
}

#[derive(Deserialize)]
struct RunResponse {
    ok: bool,
    #[serde(default)]
    error: Option<String>,
    #[serde(flatten)]
    rest: Map<String, Value>,
}

pub struct DesktopAgentClient {
    client: reqwest::Client,
    base_url: String,
}

impl DesktopAgentClient {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub async fn health(&self) -> Result<bool, DesktopAgentError> {
        let response = self
            .client
            .get(format!("{}/health", self.base_url))
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(DesktopAgentError::Status(response.status().as_u16()));
        }
        let body: Value = response.json().await?;
        Ok(body.get("ok").and_then(Value::as_bool).unwrap_or(false))
    }

    pub async fn preflight(&self) -> Result<Preflight, DesktopAgentError> {
        let response = self
            .client
            .get(format!("{}/preflight", self.base_url))
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(DesktopAgentError::Status(response.status().as_u16()));
        }
        Ok(response.json().await?)
    }

    async fn run(&self, node: &Node, ctx: &mut ExecutionContext) -> HandlerResult {
        let url = format!("{}/run", self.base_url);
        let started = Instant::now();
        let sent = self
            .client
            .post(&url)
            .json(&RunRequest {
                node_type: &node.node_type,
                data: &node.data,
            })
            .send()
            .await;

        let mut call = NetworkCall {
            node_id: node.id.clone(),
            method: "POST".to_string(),
            url: url.clone(),
            status: None,
            duration_ms: 0,
            at: Utc::now(),
            error: None,
        };

        let response = match sent {
            Ok(response) => response,
            Err(e) => {
                call.duration_ms = started.elapsed().as_millis() as u64;
                call.error = Some(e.to_string());
                ctx.record_network_call(call);
                return Err(HandlerError::failed(format!("desktop agent unreachable: {e}")));
            }
        };
        let status = response.status();
        call.status = Some(status.as_u16());
        call.duration_ms = started.elapsed().as_millis() as u64;
        ctx.record_network_call(call);

        let body: RunResponse = response
            .json()
            .await
            .map_err(|e| HandlerError::failed(format!("invalid desktop agent response ({status}): {e}")))?;

        if !body.ok {
            let error = body
                .error
                .unwrap_or_else(|| format!("desktop agent rejected {}", node.node_type));
            tracing::debug!(node_id = node.id.as_str(), error = error.as_str(), "desktop action failed");
            return Err(HandlerError::failed(error));
        }

        tracing::debug!(
            node_id = node.id.as_str(),
            node_type = node.node_type.as_str(),
            "desktop action completed"
        );

        match node.data.get("outputKey").and_then(Value::as_str) {
            Some(key) => {
                ctx.set(key, Value::Object(body.rest));
                Ok(Some(key.to_string()))
            }
            None => Ok(None),
        }
    }
}

impl ActionHandler for DesktopAgentClient {
    fn execute<'a>(
        &'a self,
        node: &'a Node,
        ctx: &'a mut ExecutionContext,
        _env: &'a DispatchEnv,
    ) -> BoxFuture<'a, HandlerResult> {
        Box::pin(self.run(node, ctx))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::Json;
    use axum::Router;
    use axum::routing::{get, post};
    use serde_json::json;
    use uuid::Uuid;

    async fn agent(router: Router) -> DesktopAgentClient {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        DesktopAgentClient::new(&format!("http://{addr}/"), Duration::from_secs(5)).unwrap()
    }

    async fn run_endpoint(Json(req): Json<Value>) -> Json<Value> {
        match req["type"].as_str() {
            Some("desktop_click") => Json(json!({ "ok": true, "x": req["data"]["x"], "y": req["data"]["y"] })),
            Some("desktop_wait_for_image") => Json(json!({ "ok": false, "error": "image not found" })),
            _ => Json(json!({ "ok": false })),
        }
    }

    fn router() -> Router {
        Router::new()
            .route("/health", get(|| async { Json(json!({ "ok": true })) }))
            .route(
                "/preflight",
                get(|| async {
                    Json(json!({ "ok": true, "display": ":0", "screen": { "width": 1920, "height": 1080 } }))
                }),
            )
            .route("/run", post(run_endpoint))
    }

    fn env() -> DispatchEnv {
        DispatchEnv::new(Uuid::now_v7(), "wf", false)
    }

    #[tokio::test]
    async fn health_and_preflight() {
        let client = agent(router()).await;
        assert!(!client.base_url().ends_with('/'));
        assert!(client.health().await.unwrap());

        let preflight = client.preflight().await.unwrap();
        assert!(preflight.ok);
        assert_eq!(preflight.display.as_deref(), Some(":0"));
        assert_eq!(preflight.screen, Some(Screen { width: 1920, height: 1080 }));
    }

    #[tokio::test]
    async fn click_stores_agent_response() {
        let client = agent(router()).await;
        let node = Node::new("click", DESKTOP_CLICK, json!({ "x": 10, "y": 20, "outputKey": "clicked" }));
        let mut ctx = ExecutionContext::new();

        let key = client.execute(&node, &mut ctx, &env()).await.unwrap();

        assert_eq!(key.as_deref(), Some("clicked"));
        assert_eq!(ctx.get("clicked.x"), Some(&json!(10)));
        assert_eq!(ctx.get("clicked.y"), Some(&json!(20)));
        assert_eq!(ctx.network_log.len(), 1);
        assert_eq!(ctx.network_log[0].status, Some(200));
    }

    #[tokio::test]
    async fn agent_error_fails_attempt() {
        let client = agent(router()).await;
        let node = Node::new("wait", DESKTOP_WAIT_FOR_IMAGE, json!({ "image": "button.png" }));
        let mut ctx = ExecutionContext::new();

        let err = client.execute(&node, &mut ctx, &env()).await.unwrap_err();
        assert_eq!(err.to_string(), "image not found");
    }

    #[tokio::test]
    async fn missing_error_message_names_node_type() {
        let client = agent(router()).await;
        let node = Node::new("type", DESKTOP_TYPE, json!({ "text": "hello" }));
        let mut ctx = ExecutionContext::new();

        let err = client.execute(&node, &mut ctx, &env()).await.unwrap_err();
        assert!(err.to_string().contains("desktop_type"));
    }

    #[tokio::test]
    async fn unreachable_agent() {
        let client = DesktopAgentClient::new("http://127.0.0.1:9", Duration::from_secs(2)).unwrap();
        assert!(client.health().await.is_err());

        let node = Node::new("click", DESKTOP_CLICK, json!({}));
        let mut ctx = ExecutionContext::new();
        let err = client.execute(&node, &mut ctx, &env()).await.unwrap_err();
        assert!(err.to_string().contains("unreachable"));
        assert!(ctx.network_log[0].error.is_some());
    }
}
