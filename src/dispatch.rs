use crate::recorder::{RequestScope, UpstreamRequestInfo};
use crate::types::*;
use bytes::Bytes;
use futures_util::future::BoxFuture;
use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::mpsc;

/// A credential managed outside the routing core. `id` is what pipeline
/// targets reference as `credential_id`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Auth {
    pub id: String,
    pub provider: String,
    #[serde(default)]
    pub label: String,
    #[serde(flatten)]
    pub kind: AuthKind,
    /// Base URL of the provider's OpenAI-compatible API.
    pub base_url: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AuthKind {
    ApiKey { api_key: String },
    Oauth,
}

impl Auth {
    pub fn auth_type(&self) -> &'static str {
        match self.kind {
            AuthKind::ApiKey { .. } => "api_key",
            AuthKind::Oauth => "oauth",
        }
    }

    pub fn api_key(&self) -> Option<&str> {
        match &self.kind {
            AuthKind::ApiKey { api_key } => Some(api_key),
            AuthKind::Oauth => None,
        }
    }
}

/// Credential list loaded from a JSON file at startup.
#[derive(Default)]
pub struct AuthRegistry {
    auths: Vec<Auth>,
}

impl AuthRegistry {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let raw = match std::fs::read_to_string(path.as_ref()) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::warn!(
                    "credentials file {} not found, starting with no upstream credentials",
                    path.as_ref().display()
                );
                return Ok(Self::default());
            }
            Err(e) => return Err(ManifoldError::Io(e).into()),
        };
        let auths: Vec<Auth> = serde_json::from_str(&raw)?;
        Ok(Self { auths })
    }

    pub fn from_auths(auths: Vec<Auth>) -> Self {
        Self { auths }
    }

    pub fn find(&self, credential_id: &str) -> Option<&Auth> {
        self.auths.iter().find(|a| a.id == credential_id)
    }

    pub fn list(&self) -> &[Auth] {
        &self.auths
    }
}

#[derive(Debug, Clone)]
pub struct UpstreamRequest {
    pub model: String,
    pub payload: serde_json::Value,
}

#[derive(Clone, Default)]
pub struct DispatchOptions {
    pub stream: bool,
    /// Audit channels for this request; implementations record the attempt
    /// request/response/error through it.
    pub scope: RequestScope,
}

/// Chunks of an upstream response stream. The receiver side sees `Ok`
/// payload bytes until either the stream ends or a single terminal `Err`.
pub type ChunkReceiver = mpsc::Receiver<Result<Bytes>>;

/// The seam to the auth manager: everything the routing core knows about
/// talking to a provider. Returns once the upstream has accepted the
/// request; chunks arrive on the returned channel.
pub trait UpstreamDispatcher: Send + Sync {
    fn execute_stream_with_auth(
        &self,
        auth: Auth,
        request: UpstreamRequest,
        options: DispatchOptions,
    ) -> BoxFuture<'static, Result<ChunkReceiver>>;
}

/// Real dispatcher: posts the payload to the credential's
/// chat-completions endpoint and forwards the SSE bytes verbatim.
pub struct HttpDispatcher {
    client: reqwest::Client,
}

impl HttpDispatcher {
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }

    fn endpoint(auth: &Auth) -> String {
        format!("{}/chat/completions", auth.base_url.trim_end_matches('/'))
    }
}

impl UpstreamDispatcher for HttpDispatcher {
    fn execute_stream_with_auth(
        &self,
        auth: Auth,
        request: UpstreamRequest,
        options: DispatchOptions,
    ) -> BoxFuture<'static, Result<ChunkReceiver>> {
        let client = self.client.clone();
        Box::pin(async move {
            let url = Self::endpoint(&auth);
            let body = serde_json::to_string(&request.payload)?;

            let mut headers = BTreeMap::new();
            headers.insert(
                "Content-Type".to_string(),
                vec!["application/json".to_string()],
            );
            if let Some(key) = auth.api_key() {
                headers.insert(
                    "Authorization".to_string(),
                    vec![format!("Bearer {}", key)],
                );
            }

            options.scope.begin_attempt(&UpstreamRequestInfo {
                url: url.clone(),
                method: "POST".to_string(),
                headers: headers.clone(),
                body: Some(body.clone()),
                provider: auth.provider.clone(),
                auth_id: auth.id.clone(),
                auth_label: auth.label.clone(),
                auth_type: auth.auth_type().to_string(),
                auth_value: auth.api_key().unwrap_or_default().to_string(),
            });

            let mut req = client
                .post(&url)
                .header("Content-Type", "application/json")
                .body(body);
            if let Some(key) = auth.api_key() {
                req = req.header("Authorization", format!("Bearer {}", key));
            }

            let response = match req.send().await {
                Ok(response) => response,
                Err(e) => {
                    options.scope.record_error(&e.to_string());
                    return Err(ManifoldError::Network(e).into());
                }
            };

            let status = response.status();
            let response_headers = header_map_to_btree(response.headers());
            options
                .scope
                .record_response_metadata(status.as_u16(), &response_headers);

            if !status.is_success() {
                let body = response.text().await.unwrap_or_default();
                options.scope.append_response_chunk(body.as_bytes());
                return Err(parse_provider_error(status.as_u16(), &body).into());
            }

            let (tx, rx) = mpsc::channel::<Result<Bytes>>(64);
            let scope = options.scope.clone();
            tokio::spawn(async move {
                let mut stream = response.bytes_stream();
                while let Some(item) = stream.next().await {
                    match item {
                        Ok(chunk) => {
                            scope.append_response_chunk(&chunk);
                            if tx.send(Ok(chunk)).await.is_err() {
                                // Receiver gone: client disconnected or the
                                // engine abandoned this attempt.
                                break;
                            }
                        }
                        Err(e) => {
                            scope.record_error(&e.to_string());
                            let _ = tx.send(Err(ManifoldError::Network(e).into())).await;
                            break;
                        }
                    }
                }
            });

            Ok(rx)
        })
    }
}

fn header_map_to_btree(headers: &reqwest::header::HeaderMap) -> BTreeMap<String, Vec<String>> {
    let mut out: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for (name, value) in headers {
        let value = String::from_utf8_lossy(value.as_bytes()).to_string();
        out.entry(name.to_string()).or_default().push(value);
    }
    out
}

/// Builds a typed provider error from a non-2xx response body. Honours an
/// explicit `"retryable"` field when the provider sends one.
pub fn parse_provider_error(status: u16, body: &str) -> ManifoldError {
    let parsed: Option<serde_json::Value> = serde_json::from_str(body).ok();

    let message = parsed
        .as_ref()
        .and_then(|v| v.pointer("/error/message"))
        .and_then(|v| v.as_str())
        .map(|s| s.to_string())
        .unwrap_or_else(|| {
            if body.is_empty() {
                format!("upstream returned status {}", status)
            } else {
                body.to_string()
            }
        });

    let retryable = parsed
        .as_ref()
        .and_then(|v| {
            v.pointer("/error/retryable")
                .or_else(|| v.pointer("/retryable"))
        })
        .and_then(|v| v.as_bool());

    ManifoldError::Provider {
        status,
        message,
        retryable,
    }
}

/// Shared dispatcher handle used across the engine and health checker.
pub type SharedDispatcher = Arc<dyn UpstreamDispatcher>;
