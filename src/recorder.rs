use crate::redaction::mask_sensitive_header_value;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

/// Attempt-body cap inside a persisted record.
pub const ATTEMPT_BODY_LIMIT: usize = 30_000;

/// One upstream dispatch within a single client request.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct DetailedAttempt {
    pub index: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub upstream_url: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub method: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub auth: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub request_headers: BTreeMap<String, Vec<String>>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub request_body: String,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub status_code: u16,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub response_headers: BTreeMap<String, Vec<String>>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub response_body: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
}

fn is_zero(v: &u16) -> bool {
    *v == 0
}

/// Metadata describing the outbound side of an attempt, captured once at
/// dispatch time.
#[derive(Debug, Clone, Default)]
pub struct UpstreamRequestInfo {
    pub url: String,
    pub method: String,
    pub headers: BTreeMap<String, Vec<String>>,
    pub body: Option<String>,
    pub provider: String,
    pub auth_id: String,
    pub auth_label: String,
    pub auth_type: String,
    pub auth_value: String,
}

impl UpstreamRequestInfo {
    fn auth_summary(&self) -> String {
        let mut parts = Vec::new();
        if !self.provider.trim().is_empty() {
            parts.push(format!("provider={}", self.provider.trim()));
        }
        if !self.auth_id.trim().is_empty() {
            parts.push(format!("auth_id={}", self.auth_id.trim()));
        }
        if !self.auth_label.trim().is_empty() {
            parts.push(format!("label={}", self.auth_label.trim()));
        }
        match self.auth_type.trim().to_lowercase().as_str() {
            "api_key" => {
                if self.auth_value.trim().is_empty() {
                    parts.push("type=api_key".to_string());
                } else {
                    parts.push(format!(
                        "type=api_key value={}",
                        crate::redaction::hide_api_key(self.auth_value.trim())
                    ));
                }
            }
            "oauth" => parts.push("type=oauth".to_string()),
            "" => {}
            other => parts.push(format!("type={}", other)),
        }
        parts.join(", ")
    }
}

#[derive(Default)]
struct AttemptEntry {
    attempt: DetailedAttempt,
    body_chunks: usize,
    error_count: usize,
}

/// Captures every upstream attempt of one client request as structured
/// data. The `=== API REQUEST/RESPONSE N ===` text views are derived from
/// the structured attempts, never parsed back out of them.
#[derive(Default)]
pub struct AttemptRecorder {
    attempts: Mutex<Vec<AttemptEntry>>,
}

impl AttemptRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Opens a new attempt; returns its 1-based index.
    pub fn begin_attempt(&self, info: &UpstreamRequestInfo) -> usize {
        let mut attempts = lock(&self.attempts);
        let index = attempts.len() + 1;
        attempts.push(AttemptEntry {
            attempt: DetailedAttempt {
                index,
                timestamp: Some(Utc::now()),
                upstream_url: info.url.clone(),
                method: info.method.clone(),
                auth: info.auth_summary(),
                request_headers: info.headers.clone(),
                request_body: info.body.clone().unwrap_or_default(),
                ..Default::default()
            },
            body_chunks: 0,
            error_count: 0,
        });
        index
    }

    pub fn record_response_metadata(&self, status: u16, headers: &BTreeMap<String, Vec<String>>) {
        let mut attempts = lock(&self.attempts);
        let entry = ensure_current(&mut attempts);
        if status > 0 && entry.attempt.status_code == 0 {
            entry.attempt.status_code = status;
        }
        if entry.attempt.response_headers.is_empty() {
            entry.attempt.response_headers = headers.clone();
        }
    }

    pub fn append_response_chunk(&self, chunk: &[u8]) {
        let text = String::from_utf8_lossy(chunk);
        let trimmed = text.trim();
        if trimmed.is_empty() {
            return;
        }
        let mut attempts = lock(&self.attempts);
        let entry = ensure_current(&mut attempts);
        if entry.body_chunks > 0 {
            entry.attempt.response_body.push_str("\n\n");
        }
        entry.attempt.response_body.push_str(trimmed);
        entry.body_chunks += 1;
    }

    pub fn record_error(&self, error: &str) {
        let mut attempts = lock(&self.attempts);
        let entry = ensure_current(&mut attempts);
        if entry.error_count > 0 {
            entry.attempt.error.push('\n');
        }
        entry.attempt.error.push_str(error);
        entry.error_count += 1;
    }

    pub fn finish_attempt(&self, duration_ms: u64) {
        let mut attempts = lock(&self.attempts);
        if let Some(entry) = attempts.last_mut() {
            entry.attempt.duration_ms = Some(duration_ms);
        }
    }

    /// Snapshot of all attempts with body caps applied.
    pub fn attempts(&self) -> Vec<DetailedAttempt> {
        let attempts = lock(&self.attempts);
        attempts
            .iter()
            .map(|entry| {
                let mut a = entry.attempt.clone();
                a.request_body = crate::str_utils::truncate_with_marker(
                    &a.request_body,
                    ATTEMPT_BODY_LIMIT,
                );
                a.response_body = crate::str_utils::truncate_with_marker(
                    &a.response_body,
                    ATTEMPT_BODY_LIMIT,
                );
                a
            })
            .collect()
    }

    pub fn last_error(&self) -> Option<String> {
        let attempts = lock(&self.attempts);
        attempts
            .iter()
            .rev()
            .find(|e| !e.attempt.error.is_empty())
            .map(|e| e.attempt.error.clone())
    }

    /// Human-readable view of every outbound request, in attempt order.
    pub fn render_request_log(&self) -> String {
        let attempts = lock(&self.attempts);
        let mut out = String::new();
        for entry in attempts.iter() {
            let a = &entry.attempt;
            out.push_str(&format!("=== API REQUEST {} ===\n", a.index));
            if let Some(ts) = a.timestamp {
                out.push_str(&format!("Timestamp: {}\n", ts.to_rfc3339()));
            }
            if a.upstream_url.is_empty() {
                out.push_str("Upstream URL: <unknown>\n");
            } else {
                out.push_str(&format!("Upstream URL: {}\n", a.upstream_url));
            }
            if !a.method.is_empty() {
                out.push_str(&format!("HTTP Method: {}\n", a.method));
            }
            if !a.auth.is_empty() {
                out.push_str(&format!("Auth: {}\n", a.auth));
            }
            out.push_str("\nHeaders:\n");
            write_headers(&mut out, &a.request_headers);
            out.push_str("\nBody:\n");
            if a.request_body.is_empty() {
                out.push_str("<empty>");
            } else {
                out.push_str(&a.request_body);
            }
            out.push_str("\n\n");
        }
        out
    }

    /// Human-readable view of every upstream response or error.
    pub fn render_response_log(&self) -> String {
        let attempts = lock(&self.attempts);
        let mut out = String::new();
        for (idx, entry) in attempts.iter().enumerate() {
            let a = &entry.attempt;
            let has_response =
                a.status_code > 0 || !a.response_body.is_empty() || !a.error.is_empty();
            if !has_response {
                continue;
            }
            out.push_str(&format!("=== API RESPONSE {} ===\n", a.index));
            if let Some(ts) = a.timestamp {
                out.push_str(&format!("Timestamp: {}\n", ts.to_rfc3339()));
            }
            out.push('\n');
            if a.status_code > 0 {
                out.push_str(&format!("Status: {}\n", a.status_code));
                out.push_str("Headers:\n");
                write_headers(&mut out, &a.response_headers);
                out.push('\n');
            }
            if !a.response_body.is_empty() {
                out.push_str("Body:\n");
                out.push_str(&a.response_body);
            }
            if !a.error.is_empty() {
                for line in a.error.lines() {
                    out.push_str(&format!("Error: {}\n", line));
                }
            }
            if !out.ends_with('\n') {
                out.push('\n');
            }
            if idx < attempts.len() - 1 {
                out.push('\n');
            }
        }
        out
    }
}

fn lock(attempts: &Mutex<Vec<AttemptEntry>>) -> std::sync::MutexGuard<'_, Vec<AttemptEntry>> {
    match attempts.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

fn ensure_current<'a>(attempts: &'a mut Vec<AttemptEntry>) -> &'a mut AttemptEntry {
    if attempts.is_empty() {
        attempts.push(AttemptEntry {
            attempt: DetailedAttempt {
                index: 1,
                ..Default::default()
            },
            body_chunks: 0,
            error_count: 0,
        });
    }
    let idx = attempts.len() - 1;
    &mut attempts[idx]
}

fn write_headers(out: &mut String, headers: &BTreeMap<String, Vec<String>>) {
    if headers.is_empty() {
        out.push_str("<none>\n");
        return;
    }
    for (key, values) in headers {
        if values.is_empty() {
            out.push_str(&format!("{}:\n", key));
            continue;
        }
        for value in values {
            out.push_str(&format!(
                "{}: {}\n",
                key,
                mask_sensitive_header_value(key, value)
            ));
        }
    }
}

/// The two per-request audit channels. The generic request log and the
/// detailed request log each get their own recorder handle, created only
/// when the corresponding feature flag is on; the handles never share
/// storage, so flipping one flag cannot change the other's output.
#[derive(Clone, Default)]
pub struct RequestScope {
    pub request_log: Option<Arc<AttemptRecorder>>,
    pub detail_log: Option<Arc<AttemptRecorder>>,
}

impl RequestScope {
    pub fn new(request_log_enabled: bool, detail_log_enabled: bool) -> Self {
        Self {
            request_log: request_log_enabled.then(|| Arc::new(AttemptRecorder::new())),
            detail_log: detail_log_enabled.then(|| Arc::new(AttemptRecorder::new())),
        }
    }

    fn each(&self, f: impl Fn(&AttemptRecorder)) {
        if let Some(recorder) = &self.request_log {
            f(recorder);
        }
        if let Some(recorder) = &self.detail_log {
            f(recorder);
        }
    }

    pub fn begin_attempt(&self, info: &UpstreamRequestInfo) {
        self.each(|r| {
            r.begin_attempt(info);
        });
    }

    pub fn record_response_metadata(&self, status: u16, headers: &BTreeMap<String, Vec<String>>) {
        self.each(|r| r.record_response_metadata(status, headers));
    }

    pub fn append_response_chunk(&self, chunk: &[u8]) {
        self.each(|r| r.append_response_chunk(chunk));
    }

    pub fn record_error(&self, error: &str) {
        self.each(|r| r.record_error(error));
    }

    pub fn finish_attempt(&self, duration_ms: u64) {
        self.each(|r| r.finish_attempt(duration_ms));
    }
}
