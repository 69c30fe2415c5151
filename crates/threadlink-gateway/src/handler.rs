//! JSON-RPC request handlers.
//!
//! Method names map onto Service calls:
//!
//! - `"<service>.<method>"` calls a method with `params` as the argument list.
//! - `"stream:<service>.<name>"` opens a stream and returns every chunk once
//!   it closes.
//! - `"disconnect:<service>"` drops the cached Client for the Service.

use crate::server::AppState;
use axum::{extract::State, http::StatusCode, response::IntoResponse, Json};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::{Arc, Mutex};
use threadlink::ThreadsError;
use tracing::{debug, error};

/// JSON-RPC 2.0 request structure.
#[derive(Debug, Deserialize)]
#[allow(dead_code)]
pub struct JsonRpcRequest {
    pub jsonrpc: String,
    pub method: String,
    #[serde(default)]
    pub params: Option<Value>,
    pub id: Option<Value>,
}

/// JSON-RPC 2.0 response structure.
#[derive(Debug, Serialize)]
pub struct JsonRpcResponse {
    pub jsonrpc: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<JsonRpcError>,
    pub id: Option<Value>,
}

/// JSON-RPC 2.0 error structure.
#[derive(Debug, Serialize)]
pub struct JsonRpcError {
    pub code: i32,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl JsonRpcResponse {
    pub fn success(id: Option<Value>, result: Value) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            result: Some(result),
            error: None,
            id,
        }
    }

    pub fn error(id: Option<Value>, code: i32, message: String, data: Option<Value>) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            result: None,
            error: Some(JsonRpcError {
                code,
                message,
                data,
            }),
            id,
        }
    }
}

/// What a JSON-RPC method name asks for.
#[derive(Debug, PartialEq, Eq)]
enum Call<'a> {
    Method { service: &'a str, method: &'a str },
    Stream { service: &'a str, stream: &'a str },
    Disconnect { service: &'a str },
}

impl<'a> Call<'a> {
    fn parse(method: &'a str) -> Option<Self> {
        if let Some(service) = method.strip_prefix("disconnect:") {
            return (!service.is_empty()).then_some(Call::Disconnect { service });
        }
        if let Some(rest) = method.strip_prefix("stream:") {
            let (service, stream) = split_target(rest)?;
            return Some(Call::Stream { service, stream });
        }
        let (service, method) = split_target(method)?;
        Some(Call::Method { service, method })
    }
}

fn split_target(target: &str) -> Option<(&str, &str)> {
    match target.split_once('.') {
        Some((service, name)) if !service.is_empty() && !name.is_empty() => Some((service, name)),
        _ => None,
    }
}

/// `params` as a positional argument list.
fn arguments(params: Option<Value>) -> Vec<Value> {
    match params {
        None | Some(Value::Null) => Vec::new(),
        Some(Value::Array(args)) => args,
        Some(other) => vec![other],
    }
}

/// Health check endpoint.
pub async fn handle_health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "threads": state.manager.thread_count(),
    }))
}

/// Main JSON-RPC handler.
pub async fn handle_rpc(
    State(state): State<Arc<AppState>>,
    Json(request): Json<JsonRpcRequest>,
) -> impl IntoResponse {
    let method = request.method;
    let id = request.id;
    let args = arguments(request.params);

    debug!("RPC call: {}({:?})", method, args);

    match dispatch(&state, &method, args).await {
        Ok(value) => (StatusCode::OK, Json(JsonRpcResponse::success(id, value))),
        Err(e) => {
            error!("RPC error for {}: {}", method, e);
            let data = e.code().map(|code| json!({ "code": code }));
            (
                StatusCode::OK,
                Json(JsonRpcResponse::error(
                    id,
                    e.to_rpc_error_code(),
                    e.to_string(),
                    data,
                )),
            )
        }
    }
}

async fn dispatch(state: &AppState, method: &str, args: Vec<Value>) -> threadlink::Result<Value> {
    let call = Call::parse(method).ok_or_else(|| ThreadsError::UnknownRequestType {
        kind: method.to_string(),
    })?;

    match call {
        Call::Method { service, method } => {
            let client = state.client(service).await;
            client.method(method, args).await
        }
        Call::Stream { service, stream } => {
            let client = state.client(service).await;
            let chunks = Arc::new(Mutex::new(Vec::new()));
            let stream = client.stream(stream, args);
            let sink = chunks.clone();
            stream.listen(move |chunk| {
                if let Ok(mut chunks) = sink.lock() {
                    chunks.push(chunk.clone());
                }
            });
            stream.closed().await?;
            let chunks = chunks
                .lock()
                .map(|chunks| chunks.clone())
                .unwrap_or_default();
            Ok(json!({ "chunks": chunks }))
        }
        Call::Disconnect { service } => {
            let disconnected = match state.take_client(service).await {
                Some(client) => {
                    client.disconnect().await?;
                    true
                }
                None => false,
            };
            Ok(json!({ "disconnected": disconnected }))
        }
    }
}
