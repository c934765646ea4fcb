use crate::main_helper::AppState;
use crate::recorder::RequestScope;
use crate::types::*;
use axum::{
    body::Body,
    extract::{Path, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    Extension, Json,
};
use bytes::Bytes;
use futures_util::StreamExt;
use std::collections::BTreeSet;
use std::sync::Arc;
use tokio_stream::wrappers::ReceiverStream;

/// OpenAI- and Claude-shaped chat/completion requests carry the model in
/// the JSON body.
pub async fn chat_completions(
    State(state): State<Arc<AppState>>,
    scope: Option<Extension<RequestScope>>,
    Json(payload): Json<serde_json::Value>,
) -> Response {
    let model = match payload.get("model").and_then(|m| m.as_str()) {
        Some(model) if !model.is_empty() => model.to_string(),
        _ => {
            let err: ObservedError = ManifoldError::Validation(vec![ValidationError::new(
                "model",
                "model is required",
            )])
            .into();
            return err.into_response();
        }
    };
    let streaming = payload
        .get("stream")
        .and_then(|s| s.as_bool())
        .unwrap_or(false);

    dispatch_and_respond(state, scope, &model, payload, streaming).await
}

/// Gemini-shaped requests carry `model:action` in the path, e.g.
/// `/v1beta/models/gemini-pro:streamGenerateContent`.
pub async fn gemini_generate(
    State(state): State<Arc<AppState>>,
    scope: Option<Extension<RequestScope>>,
    Path(model_and_action): Path<String>,
    Json(payload): Json<serde_json::Value>,
) -> Response {
    let (model, action) = match model_and_action.split_once(':') {
        Some((model, action)) => (model.to_string(), action.to_string()),
        None => (model_and_action.clone(), String::new()),
    };
    let streaming = action.to_lowercase().contains("stream");

    dispatch_and_respond(state, scope, &model, payload, streaming).await
}

async fn dispatch_and_respond(
    state: Arc<AppState>,
    scope: Option<Extension<RequestScope>>,
    model: &str,
    payload: serde_json::Value,
    streaming: bool,
) -> Response {
    if !state.config.settings().enabled {
        let err: ObservedError = ManifoldError::Exhausted {
            status: 503,
            message: "unified routing is disabled".to_string(),
        }
        .into();
        return err.into_response();
    }

    let scope = scope.map(|Extension(scope)| scope).unwrap_or_default();

    let stream = match state.engine.dispatch(model, payload, scope).await {
        Ok(stream) => stream,
        Err(e) => return e.into_response(),
    };

    tracing::debug!(
        "model {} served by target {} (streaming={})",
        model,
        stream.target_id,
        streaming
    );

    if streaming {
        sse_response(stream.rx)
    } else {
        aggregate_response(stream.rx).await
    }
}

/// Forwards upstream chunks verbatim as an event stream. A mid-stream
/// error is surfaced as a final SSE error event: the client has already
/// seen bytes, so there is nothing transparent left to do.
fn sse_response(rx: tokio::sync::mpsc::Receiver<Result<Bytes>>) -> Response {
    let body_stream = ReceiverStream::new(rx).map(|item| {
        Ok::<Bytes, std::io::Error>(match item {
            Ok(chunk) => chunk,
            Err(e) => {
                let event = serde_json::json!({ "error": { "message": e.to_string() } });
                Bytes::from(format!("data: {}\n\n", event))
            }
        })
    });

    (
        StatusCode::OK,
        [
            (header::CONTENT_TYPE, "text/event-stream"),
            (header::CACHE_CONTROL, "no-cache"),
        ],
        Body::from_stream(body_stream),
    )
        .into_response()
}

/// Collects the whole upstream body for non-streaming clients.
async fn aggregate_response(mut rx: tokio::sync::mpsc::Receiver<Result<Bytes>>) -> Response {
    let mut body: Vec<u8> = Vec::new();
    while let Some(item) = rx.recv().await {
        match item {
            Ok(chunk) => body.extend_from_slice(&chunk),
            Err(e) => {
                if body.is_empty() {
                    return e.into_response();
                }
                tracing::warn!("upstream failed mid-body after {} bytes: {}", body.len(), e);
                break;
            }
        }
    }

    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "application/json")],
        body,
    )
        .into_response()
}

/// Lists routable models: every route name and alias, plus the raw target
/// models unless the settings hide them.
pub async fn list_models(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    let settings = state.config.settings();
    let mut ids: Vec<String> = Vec::new();
    let mut seen: BTreeSet<String> = BTreeSet::new();

    for route in state.config.list_routes() {
        if seen.insert(route.name.to_lowercase()) {
            ids.push(route.name.clone());
        }
        for alias in &route.aliases {
            if seen.insert(alias.to_lowercase()) {
                ids.push(alias.clone());
            }
        }
        if !settings.hide_original_models {
            if let Ok(pipeline) = state.config.get_pipeline(&route.id) {
                for layer in &pipeline.layers {
                    for target in &layer.targets {
                        if seen.insert(target.model.to_lowercase()) {
                            ids.push(target.model.clone());
                        }
                    }
                }
            }
        }
    }

    let data: Vec<serde_json::Value> = ids
        .into_iter()
        .map(|id| {
            serde_json::json!({
                "id": id,
                "object": "model",
                "owned_by": "manifold",
            })
        })
        .collect();

    Json(serde_json::json!({ "object": "list", "data": data }))
}
