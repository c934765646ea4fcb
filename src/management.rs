use crate::detail_log::{DetailedRequestRecord, RecordFilter};
use crate::main_helper::AppState;
use crate::types::*;
use axum::{
    extract::{Path, Query, State},
    routing::{get, post},
    Json, Router,
};
use chrono::DateTime;
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::atomic::Ordering;
use std::sync::Arc;

/// Builds the management router. Mounted under both `/v0/management` and
/// `/management`; both trees are exempt from detailed request capture.
pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/routes", get(list_routes).put(create_route))
        .route(
            "/routes/:id",
            get(get_route).put(update_route).delete(delete_route),
        )
        .route(
            "/routes/:id/pipeline",
            get(get_pipeline).put(update_pipeline),
        )
        .route("/settings", get(get_settings).put(update_settings))
        .route(
            "/health-check",
            get(get_health_check_config).put(update_health_check_config),
        )
        .route("/targets/:id/reset", post(reset_target))
        .route("/targets/:id/force-cooldown", post(force_cooldown))
        .route("/state/overview", get(state_overview))
        .route("/state/routes/:id", get(route_state))
        .route("/health/history", get(health_history))
        .route("/health/check", post(run_health_check))
        .route(
            "/detailed-log",
            get(get_detailed_log_status).put(update_detailed_log),
        )
        .route(
            "/detailed-requests",
            get(list_detailed_requests).delete(delete_detailed_requests),
        )
        .route("/detailed-requests/:id", get(get_detailed_request))
        .route("/config/export", get(export_config))
        .route("/config/import", post(import_config))
}

// --- Routes ---

async fn list_routes(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    let routes = state.config.list_routes();
    Json(serde_json::json!({ "routes": routes }))
}

async fn create_route(
    State(state): State<Arc<AppState>>,
    Json(route): Json<Route>,
) -> Result<Json<Route>> {
    let created = state.config.create_route(route)?;
    Ok(Json(created))
}

async fn get_route(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<Route>> {
    Ok(Json(state.config.get_route(&id)?))
}

async fn update_route(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(mut route): Json<Route>,
) -> Result<Json<Route>> {
    route.id = id;
    let updated = state.config.update_route(route)?;
    Ok(Json(updated))
}

async fn delete_route(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>> {
    // Drop runtime state for every target the pipeline owned.
    if let Ok(pipeline) = state.config.get_pipeline(&id) {
        for layer in &pipeline.layers {
            for target in &layer.targets {
                state.states.remove_target(&target.id);
            }
        }
    }
    state.config.delete_route(&id)?;
    Ok(Json(serde_json::json!({ "success": true })))
}

// --- Pipelines ---

async fn get_pipeline(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<Pipeline>> {
    Ok(Json(state.config.get_pipeline(&id)?))
}

async fn update_pipeline(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(pipeline): Json<Pipeline>,
) -> Result<Json<Pipeline>> {
    let previous = state.config.get_pipeline(&id)?;
    let saved = state.config.update_pipeline(&id, pipeline)?;

    // Prune runtime state for targets that no longer exist.
    for layer in &previous.layers {
        for target in &layer.targets {
            if saved.find_target(&target.id).is_none() {
                state.states.remove_target(&target.id);
            }
        }
    }

    Ok(Json(saved))
}

// --- Settings ---

async fn get_settings(State(state): State<Arc<AppState>>) -> Json<Settings> {
    Json(state.config.settings())
}

async fn update_settings(
    State(state): State<Arc<AppState>>,
    Json(settings): Json<Settings>,
) -> Result<Json<Settings>> {
    state.config.update_settings(&settings)?;
    Ok(Json(settings))
}

async fn get_health_check_config(State(state): State<Arc<AppState>>) -> Json<HealthCheckConfig> {
    Json(state.config.health_check_config())
}

async fn update_health_check_config(
    State(state): State<Arc<AppState>>,
    Json(config): Json<HealthCheckConfig>,
) -> Result<Json<HealthCheckConfig>> {
    state.config.update_health_check_config(&config)?;
    Ok(Json(config))
}

// --- Target operations ---

async fn reset_target(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Json<serde_json::Value> {
    state.states.reset_target(&id);
    Json(serde_json::json!({ "success": true }))
}

async fn force_cooldown(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Json<serde_json::Value> {
    state.states.force_cooldown(&id);
    // Untimed cooling has no deadline; a pending timer would be stale.
    state.health.cancel_target_check(&id);
    Json(serde_json::json!({ "success": true }))
}

// --- State overviews ---

async fn state_overview(State(state): State<Arc<AppState>>) -> Json<StateOverview> {
    Json(state.states.get_overview())
}

async fn route_state(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<RouteState>> {
    Ok(Json(state.states.get_route_state(&id)?))
}

// --- Health checking ---

#[derive(Deserialize, Default)]
struct HistoryQuery {
    target_id: Option<String>,
    status: Option<String>,
    since: Option<i64>,
    limit: Option<usize>,
}

async fn health_history(
    State(state): State<Arc<AppState>>,
    Query(query): Query<HistoryQuery>,
) -> Json<serde_json::Value> {
    let filter = HealthHistoryFilter {
        target_id: query.target_id,
        status: query.status,
        since: query.since.and_then(|ts| DateTime::from_timestamp(ts, 0)),
        limit: query.limit.unwrap_or(0),
    };
    let results = state.health.history(&filter);
    Json(serde_json::json!({ "results": results }))
}

#[derive(Deserialize, Default)]
struct CheckQuery {
    route_id: Option<String>,
    target_id: Option<String>,
}

async fn run_health_check(
    State(state): State<Arc<AppState>>,
    Query(query): Query<CheckQuery>,
) -> Result<Json<serde_json::Value>> {
    let results = if let Some(target_id) = query.target_id {
        vec![state.health.check_target(&target_id).await?]
    } else if let Some(route_id) = query.route_id {
        state.health.check_route(&route_id).await
    } else {
        state.health.check_all().await
    };
    Ok(Json(serde_json::json!({ "results": results })))
}

// --- Detailed request log ---

async fn get_detailed_log_status(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    let (size_bytes, record_count) = state.detail_log.stats();
    Json(serde_json::json!({
        "detailed-request-log": state.detail_log.is_enabled(),
        "detailed-request-log-max-size-mb": state.detail_log.max_size_mb(),
        "detailed-request-log-show-retries": state.show_retries.load(Ordering::Relaxed),
        "size_bytes": size_bytes,
        "size_mb": format!("{:.2}", size_bytes as f64 / 1024.0 / 1024.0),
        "record_count": record_count,
    }))
}

#[derive(Deserialize)]
struct DetailedLogUpdate {
    value: Option<bool>,
    show_retries: Option<bool>,
    max_size_mb: Option<u64>,
}

async fn update_detailed_log(
    State(state): State<Arc<AppState>>,
    Json(body): Json<DetailedLogUpdate>,
) -> Result<Json<serde_json::Value>> {
    if body.value.is_none() && body.show_retries.is_none() && body.max_size_mb.is_none() {
        return Err(ManifoldError::Validation(vec![ValidationError::new(
            "value",
            "expected at least one of value, show_retries, max_size_mb",
        )])
        .into());
    }
    if let Some(enabled) = body.value {
        state.detail_log.set_enabled(enabled);
    }
    if let Some(show_retries) = body.show_retries {
        state.show_retries.store(show_retries, Ordering::Relaxed);
    }
    if let Some(max_size_mb) = body.max_size_mb {
        state.detail_log.set_max_size_mb(max_size_mb);
    }
    Ok(Json(serde_json::json!({ "success": true })))
}

#[derive(Deserialize, Default)]
struct DetailedRequestsQuery {
    api_key_hash: Option<String>,
    api_key: Option<String>,
    status_code: Option<String>,
    after: Option<i64>,
    before: Option<i64>,
    offset: Option<usize>,
    limit: Option<usize>,
}

async fn list_detailed_requests(
    State(state): State<Arc<AppState>>,
    Query(query): Query<DetailedRequestsQuery>,
) -> Result<Json<serde_json::Value>> {
    let limit = query.limit.unwrap_or(50).clamp(1, 200);
    let filter = RecordFilter {
        api_key_hash: query
            .api_key_hash
            .or(query.api_key)
            .unwrap_or_default()
            .trim()
            .to_string(),
        status_code: query.status_code.unwrap_or_default().trim().to_string(),
        after: query.after.and_then(|ts| DateTime::from_timestamp(ts, 0)),
        before: query.before.and_then(|ts| DateTime::from_timestamp(ts, 0)),
        offset: query.offset.unwrap_or(0),
        limit,
    };

    let (records, total, api_keys) = state
        .detail_log
        .read_records(&filter)
        .map_err(ManifoldError::Io)?;

    Ok(Json(serde_json::json!({
        "records": records,
        "total": total,
        "offset": filter.offset,
        "limit": filter.limit,
        "api_keys": api_keys,
    })))
}

async fn get_detailed_request(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>> {
    let record = state
        .detail_log
        .read_record_by_id(id.trim())
        .ok_or_else(|| ManifoldError::NotFound(format!("record {}", id)))?;

    let curl = generate_curl_command(&record);
    Ok(Json(serde_json::json!({ "record": record, "curl": curl })))
}

async fn delete_detailed_requests(
    State(state): State<Arc<AppState>>,
) -> Result<Json<serde_json::Value>> {
    state.detail_log.delete_all().map_err(ManifoldError::Io)?;
    Ok(Json(serde_json::json!({
        "success": true,
        "message": "all detailed request records deleted",
    })))
}

// --- Config export / import ---

async fn export_config(State(state): State<Arc<AppState>>) -> Json<ExportData> {
    Json(state.config.export())
}

async fn import_config(
    State(state): State<Arc<AppState>>,
    Query(params): Query<HashMap<String, String>>,
    Json(data): Json<ExportData>,
) -> Result<Json<serde_json::Value>> {
    let merge = params
        .get("merge")
        .map(|v| v == "true")
        .unwrap_or(false);
    state.config.import(&data, merge)?;
    Ok(Json(serde_json::json!({ "success": true, "merge": merge })))
}

/// Builds a cURL command that replays the captured request. Volatile
/// headers are dropped and sensitive non-authorization headers masked;
/// `Authorization` stays intact so the replay actually works.
pub fn generate_curl_command(record: &DetailedRequestRecord) -> String {
    let mut out = format!("curl -X {} '{}'", record.method, record.url);

    for (key, values) in &record.request_headers {
        let lower = key.to_lowercase();
        if lower == "content-length" || lower == "host" || lower == "accept-encoding" {
            continue;
        }
        for value in values {
            let value = if crate::redaction::is_curl_masked_header(&lower) {
                "***".to_string()
            } else {
                value.clone()
            };
            out.push_str(&format!(" \\\n  -H '{}: {}'", key, escape_shell_single(&value)));
        }
    }

    if !record.request_body.is_empty() {
        let body = crate::str_utils::truncate_with_marker(&record.request_body, 10_000);
        out.push_str(&format!(" \\\n  -d '{}'", escape_shell_single(&body)));
    }

    out
}

fn escape_shell_single(s: &str) -> String {
    s.replace('\'', "'\\''")
}
