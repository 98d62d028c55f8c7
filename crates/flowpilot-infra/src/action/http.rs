//! `http_request` / `integration_request` handler.
//!
//! Node data: `url`, `method` (default `GET`), `headers`, `body`, `outputKey`.
//! A string body is sent as-is; any other JSON body is sent as JSON. The
//! response is stored as `{status, body}` under `outputKey`, with the body
//! parsed as JSON when possible. Every call, successful or not, is appended
//! to the context's network log. Non-2xx responses fail the attempt.

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use chrono::Utc;
use flowpilot_core::workflow::context::{ExecutionContext, NetworkCall};
use flowpilot_core::workflow::dispatcher::{ActionHandler, DispatchEnv, HandlerError, HandlerResult};
use flowpilot_types::workflow::Node;
use futures_util::future::BoxFuture;
use serde::Deserialize;
use serde_json::{Value, json};

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct HttpParams {
    url: String,
    #[serde(default = "default_method")]
    method: String,
    #[serde(default)]
    headers: BTreeMap<String, String>,
    #[serde(default)]
    body: Option<Value>,
    #[serde(default)]
    output_key: Option<String>,
}

fn default_method() -> String {
    "GET".to_string()
}

pub struct HttpRequestHandler {
    client: reqwest::Client,
}

impl HttpRequestHandler {
    pub fn new(timeout: Duration) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("flowpilot/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self { client })
    }

    async fn call(&self, node: &Node, ctx: &mut ExecutionContext) -> HandlerResult {
        let params: HttpParams = serde_json::from_value(Value::Object(node.data.clone()))
            .map_err(|e| HandlerError::InvalidParams(format!("{}: {e}", node.node_type)))?;
        let method: reqwest::Method = params
            .method
            .to_uppercase()
            .parse()
            .map_err(|_| HandlerError::InvalidParams(format!("invalid HTTP method: {}", params.method)))?;

        let mut request = self.client.request(method.clone(), &params.url);
        for (key, value) in &params.headers {
            request = request.header(key.as_str(), value.as_str());
        }
        request = match &params.body {
            None | Some(Value::Null) => request,
            Some(Value::String(text)) => request.body(text.clone()),
            Some(other) => request.json(other),
        };

        let started = Instant::now();
        let mut call = NetworkCall {
            node_id: node.id.clone(),
            method: method.to_string(),
            url: params.url.clone(),
            status: None,
            duration_ms: 0,
            at: Utc::now(),
            error: None,
        };

        let response = match request.send().await {
            Ok(response) => response,
            Err(e) => {
                call.duration_ms = started.elapsed().as_millis() as u64;
                call.error = Some(e.to_string());
                ctx.record_network_call(call);
                return Err(HandlerError::failed(format!(
                    "HTTP request to '{}' failed: {e}",
                    params.url
                )));
            }
        };

        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| HandlerError::failed(format!("failed to read HTTP response body: {e}")))?;
        call.status = Some(status.as_u16());
        call.duration_ms = started.elapsed().as_millis() as u64;
        ctx.record_network_call(call);

        tracing::debug!(
            node_id = node.id.as_str(),
            url = params.url.as_str(),
            status = status.as_u16(),
            body_len = text.len(),
            "HTTP request completed"
        );

        if !status.is_success() {
            return Err(HandlerError::failed(format!(
                "{method} {} returned {status}",
                params.url
            )));
        }

        let body = serde_json::from_str::<Value>(&text).unwrap_or(Value::String(text));
        let key = params
            .output_key
            .unwrap_or_else(|| format!("{}_output", node.id));
        ctx.set(key.clone(), json!({ "status": status.as_u16(), "body": body }));
        Ok(Some(key))
    }
}

impl ActionHandler for HttpRequestHandler {
    fn execute<'a>(
        &'a self,
        node: &'a Node,
        ctx: &'a mut ExecutionContext,
        _env: &'a DispatchEnv,
    ) -> BoxFuture<'a, HandlerResult> {
        Box::pin(self.call(node, ctx))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::Json;
    use axum::Router;
    use axum::http::StatusCode;
    use axum::routing::{get, post};
    use uuid::Uuid;

    async fn serve(router: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        format!("http://{addr}")
    }

    fn router() -> Router {
        Router::new()
            .route("/items", get(|| async { Json(json!({ "items": [1, 2, 3] })) }))
            .route("/echo", post(|Json(body): Json<Value>| async move { Json(body) }))
            .route("/plain", get(|| async { "pong" }))
            .route("/broken", get(|| async { (StatusCode::BAD_GATEWAY, "upstream down") }))
    }

    fn handler() -> HttpRequestHandler {
        HttpRequestHandler::new(Duration::from_secs(5)).unwrap()
    }

    fn env() -> DispatchEnv {
        DispatchEnv::new(Uuid::now_v7(), "wf", false)
    }

    #[tokio::test]
    async fn get_stores_status_and_json_body() {
        let base = serve(router()).await;
        let node = Node::new("fetch", "http_request", json!({ "url": format!("{base}/items"), "outputKey": "items" }));
        let mut ctx = ExecutionContext::new();

        let key = handler().execute(&node, &mut ctx, &env()).await.unwrap();

        assert_eq!(key.as_deref(), Some("items"));
        assert_eq!(ctx.get("items.status"), Some(&json!(200)));
        assert_eq!(ctx.get("items.body.items"), Some(&json!([1, 2, 3])));
        assert_eq!(ctx.network_log.len(), 1);
        assert_eq!(ctx.network_log[0].status, Some(200));
        assert_eq!(ctx.network_log[0].method, "GET");
    }

    #[tokio::test]
    async fn post_sends_json_body() {
        let base = serve(router()).await;
        let node = Node::new(
            "send",
            "integration_request",
            json!({ "url": format!("{base}/echo"), "method": "post", "body": { "id": 7 } }),
        );
        let mut ctx = ExecutionContext::new();

        let key = handler().execute(&node, &mut ctx, &env()).await.unwrap();

        assert_eq!(key.as_deref(), Some("send_output"));
        assert_eq!(ctx.get("send_output.body.id"), Some(&json!(7)));
    }

    #[tokio::test]
    async fn non_json_body_kept_as_text() {
        let base = serve(router()).await;
        let node = Node::new("ping", "http_request", json!({ "url": format!("{base}/plain") }));
        let mut ctx = ExecutionContext::new();

        handler().execute(&node, &mut ctx, &env()).await.unwrap();

        assert_eq!(ctx.get("ping_output.body"), Some(&json!("pong")));
    }

    #[tokio::test]
    async fn non_success_status_fails_and_is_logged() {
        let base = serve(router()).await;
        let node = Node::new("bad", "http_request", json!({ "url": format!("{base}/broken") }));
        let mut ctx = ExecutionContext::new();

        let err = handler().execute(&node, &mut ctx, &env()).await.unwrap_err();

        assert!(err.to_string().contains("502"), "{err}");
        assert!(ctx.get("bad_output").is_none());
        assert_eq!(ctx.network_log[0].status, Some(502));
    }

    #[tokio::test]
    async fn connection_error_recorded() {
        let node = Node::new("down", "http_request", json!({ "url": "http://127.0.0.1:9/nothing" }));
        let mut ctx = ExecutionContext::new();

        let err = handler().execute(&node, &mut ctx, &env()).await.unwrap_err();

        assert!(err.to_string().contains("failed"));
        assert!(ctx.network_log[0].error.is_some());
        assert_eq!(ctx.network_log[0].status, None);
    }

    #[tokio::test]
    async fn missing_url_is_invalid_params() {
        let node = Node::new("x", "http_request", json!({}));
        let mut ctx = ExecutionContext::new();

        let err = handler().execute(&node, &mut ctx, &env()).await.unwrap_err();
        assert!(matches!(err, HandlerError::InvalidParams(_)));
    }
}
