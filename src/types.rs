use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;
use tracing_error::SpanTrace;
use uuid::Uuid;

/// --- ROUTING CONFIG MODEL ---

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Settings {
    pub enabled: bool,
    #[serde(default)]
    pub hide_original_models: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct HealthCheckConfig {
    pub check_interval_seconds: u64,
    pub check_timeout_seconds: u64,
    pub default_cooldown_seconds: u64,
}

impl Default for HealthCheckConfig {
    fn default() -> Self {
        Self {
            check_interval_seconds: 30,
            check_timeout_seconds: 10,
            default_cooldown_seconds: 60,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Route {
    #[serde(default)]
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub aliases: Vec<String>,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
}

impl Route {
    /// True if `model` matches the route name or any alias, case-insensitively.
    pub fn matches(&self, model: &str) -> bool {
        self.name.eq_ignore_ascii_case(model)
            || self.aliases.iter().any(|a| a.eq_ignore_ascii_case(model))
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
    RoundRobin,
    WeightedRound,
    LeastConn,
    Random,
    #[default]
    FirstAvailable,
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Strategy::RoundRobin => "round_robin",
            Strategy::WeightedRound => "weighted_round",
            Strategy::LeastConn => "least_conn",
            Strategy::Random => "random",
            Strategy::FirstAvailable => "first_available",
        };
        write!(f, "{}", s)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Target {
    #[serde(default)]
    pub id: String,
    pub credential_id: String,
    pub model: String,
    #[serde(default = "default_weight")]
    pub weight: u32,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

fn default_weight() -> u32 {
    1
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Layer {
    pub level: i32,
    #[serde(default)]
    pub strategy: Strategy,
    #[serde(default)]
    pub cooldown_seconds: u64,
    pub targets: Vec<Target>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Pipeline {
    #[serde(default)]
    pub route_id: String,
    #[serde(default)]
    pub layers: Vec<Layer>,
}

impl Pipeline {
    /// Layers in priority order, lowest level first.
    pub fn layers_by_level(&self) -> Vec<&Layer> {
        let mut layers: Vec<&Layer> = self.layers.iter().collect();
        layers.sort_by_key(|l| l.level);
        layers
    }

    pub fn find_target(&self, target_id: &str) -> Option<&Target> {
        self.layers
            .iter()
            .flat_map(|l| l.targets.iter())
            .find(|t| t.id == target_id)
    }
}

/// --- RUNTIME STATE ---

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum TargetStatus {
    Healthy,
    Cooling,
    Checking,
}

impl fmt::Display for TargetStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TargetStatus::Healthy => write!(f, "healthy"),
            TargetStatus::Cooling => write!(f, "cooling"),
            TargetStatus::Checking => write!(f, "checking"),
        }
    }
}

/// Runtime state of a single target. Not persisted: every target is
/// rebuilt as `healthy` after process restart.
///
/// `cooldown_ends_at == None` while cooling means *untimed* cooling:
/// the target is only probed again when a new request hits its route.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TargetState {
    pub target_id: String,
    pub status: TargetStatus,
    pub consecutive_failures: u32,
    pub last_success_at: Option<DateTime<Utc>>,
    pub last_failure_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_failure_reason: String,
    pub cooldown_ends_at: Option<DateTime<Utc>>,
    pub total_requests: u64,
    pub successful_requests: u64,
}

impl TargetState {
    pub fn new_healthy(target_id: &str) -> Self {
        Self {
            target_id: target_id.to_string(),
            status: TargetStatus::Healthy,
            consecutive_failures: 0,
            last_success_at: None,
            last_failure_at: None,
            last_failure_reason: String::new(),
            cooldown_ends_at: None,
            total_requests: 0,
            successful_requests: 0,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct LayerState {
    pub level: i32,
    pub status: String,
    pub target_states: Vec<TargetState>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RouteState {
    pub route_id: String,
    pub route_name: String,
    pub status: String,
    pub active_layer: i32,
    pub layer_states: Vec<LayerState>,
}

#[derive(Debug, Clone, Serialize)]
pub struct StateOverview {
    pub unified_routing_enabled: bool,
    pub hide_original_models: bool,
    pub total_routes: usize,
    pub healthy_routes: usize,
    pub degraded_routes: usize,
    pub unhealthy_routes: usize,
    pub routes: Vec<RouteState>,
}

/// --- HEALTH CHECKING ---

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResult {
    pub target_id: String,
    pub credential_id: String,
    pub model: String,
    pub status: String,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub latency_ms: u64,
    pub checked_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default)]
pub struct HealthHistoryFilter {
    pub target_id: Option<String>,
    pub status: Option<String>,
    pub since: Option<DateTime<Utc>>,
    pub limit: usize,
}

/// --- CONFIG EXPORT SCHEMA ---

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouteWithPipeline {
    pub route: Route,
    pub pipeline: Pipeline,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ExportedConfig {
    #[serde(default)]
    pub settings: Settings,
    #[serde(default)]
    pub health_check: HealthCheckConfig,
    #[serde(default)]
    pub routes: Vec<RouteWithPipeline>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExportData {
    pub version: String,
    pub exported_at: DateTime<Utc>,
    pub config: ExportedConfig,
}

impl ExportData {
    pub const SCHEMA_VERSION: &'static str = "1.0";
}

#[derive(Debug, Clone)]
pub struct ConfigChangeEvent {
    pub kind: ConfigChangeKind,
    pub route_id: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigChangeKind {
    SettingsUpdated,
    HealthConfigUpdated,
    RouteCreated,
    RouteUpdated,
    RouteDeleted,
    PipelineUpdated,
    ConfigImported,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct ValidationError {
    pub field: String,
    pub message: String,
}

impl ValidationError {
    pub fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
        }
    }
}

/// --- ERRORS ---

#[derive(Error, Debug)]
pub enum ManifoldError {
    #[error("validation failed: {}", format_validation_errors(.0))]
    Validation(Vec<ValidationError>),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("upstream error (status {status}): {message}")]
    Provider {
        status: u16,
        message: String,
        retryable: Option<bool>,
    },

    #[error("all targets exhausted: {message}")]
    Exhausted { status: u16, message: String },

    #[error("request cancelled")]
    Cancelled,

    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("internal error: {0}")]
    Internal(String, SpanTrace),
}

fn format_validation_errors(errors: &[ValidationError]) -> String {
    errors
        .iter()
        .map(|e| format!("{}: {}", e.field, e.message))
        .collect::<Vec<_>>()
        .join("; ")
}

impl ManifoldError {
    pub fn internal(msg: impl Into<String>) -> Self {
        ManifoldError::Internal(msg.into(), SpanTrace::capture())
    }
}

#[derive(Debug)]
pub struct ObservedError {
    pub inner: ManifoldError,
    pub span_trace: SpanTrace,
}

impl fmt::Display for ObservedError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.inner)
    }
}

impl std::error::Error for ObservedError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.inner)
    }
}

impl<E> From<E> for ObservedError
where
    E: Into<ManifoldError>,
{
    fn from(error: E) -> Self {
        Self {
            inner: error.into(),
            span_trace: SpanTrace::capture(),
        }
    }
}

impl axum::response::IntoResponse for ObservedError {
    fn into_response(self) -> axum::response::Response {
        use axum::http::StatusCode;

        let (status, body) = match &self.inner {
            ManifoldError::Validation(errors) => (
                StatusCode::BAD_REQUEST,
                serde_json::json!({ "error": "validation failed", "errors": errors }),
            ),
            ManifoldError::Conflict(msg) => (
                StatusCode::CONFLICT,
                serde_json::json!({ "error": msg, "code": "CONFLICT" }),
            ),
            ManifoldError::NotFound(msg) => (
                StatusCode::NOT_FOUND,
                serde_json::json!({ "error": msg, "code": "NOT_FOUND" }),
            ),
            ManifoldError::Provider {
                status, message, ..
            } => (
                StatusCode::from_u16(*status).unwrap_or(StatusCode::BAD_GATEWAY),
                serde_json::json!({ "error": message, "code": "UPSTREAM_ERROR" }),
            ),
            ManifoldError::Exhausted { status, message } => (
                StatusCode::from_u16(*status).unwrap_or(StatusCode::SERVICE_UNAVAILABLE),
                serde_json::json!({ "error": message, "code": "EXHAUSTED" }),
            ),
            ManifoldError::Cancelled => (
                StatusCode::BAD_REQUEST,
                serde_json::json!({ "error": "request cancelled", "code": "CANCELLED" }),
            ),
            ManifoldError::Network(e) => (
                StatusCode::BAD_GATEWAY,
                serde_json::json!({ "error": e.to_string(), "code": "NETWORK_ERROR" }),
            ),
            ManifoldError::Io(_)
            | ManifoldError::Serialization(_)
            | ManifoldError::Internal(_, _) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                serde_json::json!({ "error": "internal error", "code": "INTERNAL_ERROR" }),
            ),
        };

        (status, axum::Json(body)).into_response()
    }
}

pub type Result<T> = std::result::Result<T, ObservedError>;

/// Allocates a short id with the given prefix, e.g. `route-a1b2c3d4`.
pub fn short_id(prefix: &str) -> String {
    let id = Uuid::new_v4().simple().to_string();
    format!("{}-{}", prefix, crate::str_utils::prefix_chars(&id, 8))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_route_matches_case_insensitive() {
        let route = Route {
            id: "route-1".into(),
            name: "gpt-pro".into(),
            aliases: vec!["Pro".into(), "chatpro".into()],
            ..Default::default()
        };
        assert!(route.matches("gpt-pro"));
        assert!(route.matches("GPT-PRO"));
        assert!(route.matches("PRO"));
        assert!(route.matches("ChatPro"));
        assert!(!route.matches("other"));
    }

    #[test]
    fn test_strategy_serde_snake_case() {
        let s: Strategy = serde_json::from_str("\"weighted_round\"").unwrap();
        assert_eq!(s, Strategy::WeightedRound);
        assert_eq!(
            serde_json::to_string(&Strategy::FirstAvailable).unwrap(),
            "\"first_available\""
        );
    }

    #[test]
    fn test_layers_by_level_orders_ascending() {
        let pipeline = Pipeline {
            route_id: "r".into(),
            layers: vec![
                Layer {
                    level: 3,
                    strategy: Strategy::default(),
                    cooldown_seconds: 0,
                    targets: vec![],
                },
                Layer {
                    level: 1,
                    strategy: Strategy::default(),
                    cooldown_seconds: 0,
                    targets: vec![],
                },
            ],
        };
        let levels: Vec<i32> = pipeline.layers_by_level().iter().map(|l| l.level).collect();
        assert_eq!(levels, vec![1, 3]);
    }

    #[test]
    fn test_health_check_config_defaults() {
        let cfg = HealthCheckConfig::default();
        assert_eq!(cfg.check_interval_seconds, 30);
        assert_eq!(cfg.check_timeout_seconds, 10);
        assert_eq!(cfg.default_cooldown_seconds, 60);
    }
}
