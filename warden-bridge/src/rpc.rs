//! RPC over HTTP: the endpoint in front of a bridge, and its client

use crate::bridge::Bridge;
use crate::error::{BridgeError, BridgeResult, RemoteError};
use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::post,
    Json, Router,
};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value as JsonValue};
use std::time::Duration;
use tower::ServiceBuilder;
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::trace::TraceLayer;
use tracing::debug;
use url::Url;

const MAX_REQUEST_BYTES: usize = 4 * 1024 * 1024;

/// Body of an RPC request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcRequest {
    pub command: String,
    #[serde(default)]
    pub args: Vec<JsonValue>,
}

#[derive(Clone)]
struct RpcState {
    bridge: Bridge,
}

/// Router serving `POST <rpc_path>` by forwarding each request over `bridge`
pub fn rpc_router(bridge: Bridge, rpc_path: &str) -> Router {
    let path = if rpc_path.starts_with('/') {
        rpc_path.to_string()
    } else {
        format!("/{}", rpc_path)
    };

    Router::new()
        .route(&path, post(handle_rpc))
        .with_state(RpcState { bridge })
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(RequestBodyLimitLayer::new(MAX_REQUEST_BYTES)),
        )
}

async fn handle_rpc(
    State(state): State<RpcState>,
    Json(request): Json<RpcRequest>,
) -> Result<Json<JsonValue>, RpcError> {
    debug!(command = %request.command, "RPC call");
    let result = state.bridge.call(&request.command, request.args).await?;
    Ok(Json(json!({ "result": result })))
}

/// A failed RPC call, rendered as `{"error": {kind, message}}`
#[derive(Debug)]
pub struct RpcError(BridgeError);

impl From<BridgeError> for RpcError {
    fn from(error: BridgeError) -> Self {
        Self(error)
    }
}

impl RpcError {
    pub fn status(&self) -> StatusCode {
        match &self.0 {
            BridgeError::Remote(remote) => match remote.kind.as_str() {
                "not_found" => StatusCode::NOT_FOUND,
                "already_exists" | "invalid_state" => StatusCode::CONFLICT,
                "invalid_arguments" => StatusCode::BAD_REQUEST,
                "not_implemented" => StatusCode::NOT_IMPLEMENTED,
                _ => StatusCode::INTERNAL_SERVER_ERROR,
            },
            BridgeError::Closed => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn remote(&self) -> RemoteError {
        match &self.0 {
            BridgeError::Remote(remote) => remote.clone(),
            BridgeError::Closed => RemoteError::new("unavailable", self.0.to_string()),
            other => RemoteError::internal(other.to_string()),
        }
    }
}

impl IntoResponse for RpcError {
    fn into_response(self) -> Response {
        let status = self.status();
        let body = json!({ "error": self.remote().to_payload() });
        (status, Json(body)).into_response()
    }
}

/// Client for an RPC endpoint
#[derive(Debug, Clone)]
pub struct RpcClient {
    client: Client,
    url: Url,
}

impl RpcClient {
    pub fn new(url: &str) -> BridgeResult<Self> {
        Self::with_timeout(url, Duration::from_secs(30))
    }

    pub fn with_timeout(url: &str, timeout: Duration) -> BridgeResult<Self> {
        let url = Url::parse(url)
            .map_err(|e| BridgeError::Http(format!("invalid RPC url '{}': {}", url, e)))?;
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self { client, url })
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    /// Issue one call; a failure reported by the endpoint comes back as
    /// [`BridgeError::Remote`]
    pub async fn call(&self, command: &str, args: Vec<JsonValue>) -> BridgeResult<JsonValue> {
        let request = RpcRequest {
            command: command.to_string(),
            args,
        };
        let response = self.client.post(self.url.clone()).json(&request).send().await?;
        let status = response.status();
        let body: JsonValue = response.json().await?;

        if status.is_success() {
            return Ok(body.get("result").cloned().unwrap_or(JsonValue::Null));
        }
        match body.get("error") {
            Some(error) => Err(BridgeError::Remote(RemoteError::from_payload(Some(error)))),
            None => Err(BridgeError::Http(format!("{}: {}", status, body))),
        }
    }
}
