use crate::detail_log::{hash_api_key, mask_api_key, DetailedRequestRecord, RECORD_BODY_LIMIT};
use crate::main_helper::AppState;
use crate::recorder::RequestScope;
use axum::{
    body::{Body, Bytes},
    extract::State,
    http::{HeaderMap, Request, Response},
    middleware::Next,
};
use futures_util::Stream;
use std::collections::BTreeMap;
use std::panic;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Instant;
use tracing::{error, info_span, Instrument};
use uuid::Uuid;

pub const REQUEST_ID_HEADER: &str = "x-manifold-request-id";

/// In-process capture of the client-facing response body is hard-capped
/// here regardless of the record-level limits.
const RESPONSE_CAPTURE_LIMIT: usize = 100_000;

/// Identifies the request id assigned by the span middleware.
#[derive(Clone)]
pub struct RequestId(pub String);

/// Sets up a global panic hook that logs panics through tracing before the
/// default hook runs.
pub fn setup_panic_hook() {
    let original_hook = panic::take_hook();
    panic::set_hook(Box::new(move |panic_info| {
        let payload = panic_info.payload();
        let message = if let Some(s) = payload.downcast_ref::<&str>() {
            *s
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.as_str()
        } else {
            "Unknown panic payload"
        };

        let location = panic_info
            .location()
            .map(|l| format!("{}:{}:{}", l.file(), l.line(), l.column()))
            .unwrap_or_else(|| "unknown location".to_string());

        error!(
            target: "panic",
            message = %message,
            location = %location,
            "FATAL: Application panicked"
        );

        original_hook(panic_info);
    }));
}

/// Assigns every request a uuid, exposes it as an extension and response
/// header, and instruments the handler span with it.
pub async fn request_id_middleware(mut req: Request<Body>, next: Next) -> Response<Body> {
    let request_id = Uuid::new_v4().simple().to_string();
    req.extensions_mut().insert(RequestId(request_id.clone()));

    let span = info_span!("request", request_id = %request_id);
    let mut response = next.run(req).instrument(span).await;

    if let Ok(value) = request_id.parse() {
        response.headers_mut().insert(REQUEST_ID_HEADER, value);
    }
    response
}

/// Captures client-facing requests for the detailed request log.
///
/// Installs the per-request `RequestScope` (the two audit channels the
/// dispatcher records attempts into), then wraps the response body so the
/// finished record (headers, truncated bodies, structured attempts,
/// duration) is assembled when the stream ends, which for SSE responses
/// is long after this middleware returns.
pub async fn detail_capture_middleware(
    State(state): State<Arc<AppState>>,
    req: Request<Body>,
    next: Next,
) -> Response<Body> {
    let path = req.uri().path().to_string();
    let capturable = should_capture(&path, req.method());
    let detail_enabled = state.detail_log.is_enabled() && capturable;
    let request_log_enabled = state.args.request_log && capturable;

    if !detail_enabled && !request_log_enabled {
        return next.run(req).await;
    }

    let started = Instant::now();
    let method = req.method().to_string();
    let request_headers = headers_to_btree(req.headers());
    let api_key = extract_api_key(req.headers());
    let request_id = req
        .extensions()
        .get::<RequestId>()
        .map(|id| id.0.clone())
        .unwrap_or_else(|| Uuid::new_v4().simple().to_string());

    // Buffer and restore the body so the handler still sees it.
    let (parts, body) = req.into_parts();
    let body_bytes = match axum::body::to_bytes(body, state.args.max_body_size).await {
        Ok(bytes) => bytes,
        Err(_) => Bytes::new(),
    };
    let mut req = Request::from_parts(parts, Body::from(body_bytes.clone()));

    let scope = RequestScope::new(request_log_enabled, detail_enabled);
    req.extensions_mut().insert(scope.clone());

    let response = next.run(req).await;

    let (parts, body) = response.into_parts();
    let is_streaming = parts
        .headers
        .get("content-type")
        .and_then(|v| v.to_str().ok())
        .map(|ct| ct.contains("text/event-stream"))
        .unwrap_or(false);

    let mut record = DetailedRequestRecord {
        id: request_id,
        url: path,
        method,
        status_code: parts.status.as_u16(),
        request_headers,
        response_headers: headers_to_btree(&parts.headers),
        is_streaming,
        ..Default::default()
    };
    if !api_key.is_empty() {
        record.api_key = mask_api_key(&api_key);
        record.api_key_hash = hash_api_key(&api_key);
    }
    if !body_bytes.is_empty() {
        let body_text = String::from_utf8_lossy(&body_bytes);
        if let Ok(json) = serde_json::from_slice::<serde_json::Value>(&body_bytes) {
            if let Some(model) = json.get("model").and_then(|m| m.as_str()) {
                record.model = model.to_string();
            }
        }
        record.request_body =
            crate::str_utils::truncate_with_marker(&body_text, RECORD_BODY_LIMIT);
    }

    let detail_log = state.detail_log.clone();
    let finalizer = move |captured: &[u8]| {
        record.total_duration_ms = started.elapsed().as_millis() as u64;
        if !captured.is_empty() {
            record.response_body = crate::str_utils::truncate_with_marker(
                &String::from_utf8_lossy(captured),
                RECORD_BODY_LIMIT,
            );
        }
        if let Some(recorder) = &scope.detail_log {
            record.attempts = recorder.attempts();
            if record.status_code >= 400 {
                record.error = recorder.last_error().unwrap_or_default();
            }
        }
        if let Some(recorder) = &scope.request_log {
            tracing::debug!(
                target: "request_log",
                "{}\n{}",
                recorder.render_request_log(),
                recorder.render_response_log()
            );
        }
        // Re-check the flag: it may have been flipped mid-request.
        if detail_enabled && detail_log.is_enabled() {
            detail_log.log_record(record);
        }
    };

    let wrapped = CaptureBody::new(body.into_data_stream(), Box::new(finalizer));
    Response::from_parts(parts, Body::from_stream(wrapped))
}

/// GETs and the management surface are never captured.
fn should_capture(path: &str, method: &axum::http::Method) -> bool {
    if method == axum::http::Method::GET {
        return false;
    }
    !(path.starts_with("/v0/management") || path.starts_with("/management"))
}

fn headers_to_btree(headers: &HeaderMap) -> BTreeMap<String, Vec<String>> {
    let mut out: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for (name, value) in headers {
        let value = String::from_utf8_lossy(value.as_bytes()).to_string();
        out.entry(name.to_string()).or_default().push(value);
    }
    out
}

fn extract_api_key(headers: &HeaderMap) -> String {
    if let Some(auth) = headers.get("authorization").and_then(|v| v.to_str().ok()) {
        if let Some(token) = auth.strip_prefix("Bearer ") {
            return token.to_string();
        }
        return auth.to_string();
    }
    headers
        .get("x-api-key")
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_string()
}

type Finalizer = Box<dyn FnOnce(&[u8]) + Send>;

/// Tees the response body into a bounded buffer and runs the finalizer
/// exactly once, when the stream ends, errors, or is dropped (client
/// disconnect). That is the only point at which the full record, including
/// every streamed chunk, exists.
struct CaptureBody<S> {
    inner: S,
    buffer: Vec<u8>,
    finalizer: Option<Finalizer>,
}

impl<S> CaptureBody<S> {
    fn new(inner: S, finalizer: Finalizer) -> Self {
        Self {
            inner,
            buffer: Vec::new(),
            finalizer: Some(finalizer),
        }
    }

    fn capture(&mut self, chunk: &[u8]) {
        if self.buffer.len() >= RESPONSE_CAPTURE_LIMIT {
            return;
        }
        let remaining = RESPONSE_CAPTURE_LIMIT - self.buffer.len();
        if chunk.len() > remaining {
            self.buffer.extend_from_slice(&chunk[..remaining]);
        } else {
            self.buffer.extend_from_slice(chunk);
        }
    }

    fn finalize(&mut self) {
        if let Some(finalizer) = self.finalizer.take() {
            finalizer(&self.buffer);
        }
    }
}

impl<S, E> Stream for CaptureBody<S>
where
    S: Stream<Item = std::result::Result<Bytes, E>> + Unpin,
{
    type Item = std::result::Result<Bytes, E>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        match Pin::new(&mut this.inner).poll_next(cx) {
            Poll::Ready(Some(Ok(chunk))) => {
                this.capture(&chunk);
                Poll::Ready(Some(Ok(chunk)))
            }
            Poll::Ready(Some(Err(e))) => {
                this.finalize();
                Poll::Ready(Some(Err(e)))
            }
            Poll::Ready(None) => {
                this.finalize();
                Poll::Ready(None)
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

impl<S> Drop for CaptureBody<S> {
    fn drop(&mut self) {
        self.finalize();
    }
}
