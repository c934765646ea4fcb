use crate::recorder::DetailedAttempt;
use chrono::{DateTime, Utc};
use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Mutex;
use tokio::sync::mpsc;

const DETAIL_FILE_PREFIX: &str = "detail-";
const DETAIL_FILE_SUFFIX: &str = ".json";

/// Old append-only JSONL file. Still read for backward-compatible queries,
/// never written.
const LEGACY_JSONL_NAME: &str = "detailed-requests.jsonl";

const DEFAULT_MAX_SIZE_MB: u64 = 20;
const DEFAULT_MAX_FILES: usize = 500;

/// Capacity of the async write channel; a full channel drops the record.
const WRITE_BUFFER_SIZE: usize = 256;

/// Cleanup runs every this many writes.
const CLEANUP_INTERVAL_WRITES: u64 = 20;

/// Record-level body cap.
pub const RECORD_BODY_LIMIT: usize = 50_000;

/// One finished client request with all its upstream attempts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DetailedRequestRecord {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub api_key: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub api_key_hash: String,
    pub url: String,
    pub method: String,
    pub status_code: u16,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub model: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub request_headers: BTreeMap<String, Vec<String>>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub request_body: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub response_headers: BTreeMap<String, Vec<String>>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub response_body: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub attempts: Vec<DetailedAttempt>,
    pub total_duration_ms: u64,
    pub is_streaming: bool,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub error: String,
}

impl Default for DetailedRequestRecord {
    fn default() -> Self {
        Self {
            id: String::new(),
            timestamp: Utc::now(),
            api_key: String::new(),
            api_key_hash: String::new(),
            url: String::new(),
            method: String::new(),
            status_code: 0,
            model: String::new(),
            request_headers: BTreeMap::new(),
            request_body: String::new(),
            response_headers: BTreeMap::new(),
            response_body: String::new(),
            attempts: Vec::new(),
            total_duration_ms: 0,
            is_streaming: false,
            error: String::new(),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct RecordFilter {
    /// Matches either the stored hash or the masked key.
    pub api_key_hash: String,
    /// Exact ("200") or class ("4xx") status pattern.
    pub status_code: String,
    pub after: Option<DateTime<Utc>>,
    pub before: Option<DateTime<Utc>>,
    pub offset: usize,
    pub limit: usize,
}

/// Persists each finished client request as an individual JSON file with
/// size/count-bounded retention. Writes are asynchronous: a bounded channel
/// feeds a single background writer, so request handling never blocks on
/// disk.
pub struct DetailedRequestLogger {
    enabled: AtomicBool,
    logs_dir: PathBuf,
    max_size_mb: AtomicU64,
    max_files: AtomicUsize,
    write_count: AtomicU64,
    tx: Mutex<Option<mpsc::Sender<DetailedRequestRecord>>>,
    done: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl DetailedRequestLogger {
    pub fn new(enabled: bool, logs_dir: impl AsRef<Path>, max_size_mb: u64) -> std::sync::Arc<Self> {
        let max_size_mb = if max_size_mb == 0 {
            DEFAULT_MAX_SIZE_MB
        } else {
            max_size_mb
        };
        let logger = std::sync::Arc::new(Self {
            enabled: AtomicBool::new(enabled),
            logs_dir: logs_dir.as_ref().to_path_buf(),
            max_size_mb: AtomicU64::new(max_size_mb),
            max_files: AtomicUsize::new(DEFAULT_MAX_FILES),
            write_count: AtomicU64::new(0),
            tx: Mutex::new(None),
            done: Mutex::new(None),
        });

        let (tx, mut rx) = mpsc::channel::<DetailedRequestRecord>(WRITE_BUFFER_SIZE);
        let writer = logger.clone();
        let handle = tokio::spawn(async move {
            while let Some(record) = rx.recv().await {
                if let Err(e) = writer.write_record_file(&record) {
                    tracing::warn!("failed to write detailed request record: {}", e);
                }
            }
        });

        if let Ok(mut guard) = logger.tx.lock() {
            *guard = Some(tx);
        }
        if let Ok(mut guard) = logger.done.lock() {
            *guard = Some(handle);
        }
        logger
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Relaxed);
    }

    pub fn max_size_mb(&self) -> u64 {
        self.max_size_mb.load(Ordering::Relaxed)
    }

    /// Applies to the next retention sweep.
    pub fn set_max_size_mb(&self, max_size_mb: u64) {
        let value = if max_size_mb == 0 {
            DEFAULT_MAX_SIZE_MB
        } else {
            max_size_mb
        };
        self.max_size_mb.store(value, Ordering::Relaxed);
    }

    pub fn set_max_files(&self, max_files: usize) {
        let value = if max_files == 0 {
            DEFAULT_MAX_FILES
        } else {
            max_files
        };
        self.max_files.store(value, Ordering::Relaxed);
    }

    /// Queues a record for the background writer. A full channel drops the
    /// record with a warning: observability, not correctness.
    pub fn log_record(&self, record: DetailedRequestRecord) {
        if !self.is_enabled() {
            return;
        }
        let tx = match self.tx.lock() {
            Ok(guard) => guard.clone(),
            Err(_) => None,
        };
        if let Some(tx) = tx {
            if tx.try_send(record).is_err() {
                tracing::warn!("detailed request log write channel full, dropping record");
            }
        }
    }

    /// Stops the background writer after draining queued records.
    pub async fn close(&self) {
        let tx = match self.tx.lock() {
            Ok(mut guard) => guard.take(),
            Err(_) => None,
        };
        drop(tx);
        let handle = match self.done.lock() {
            Ok(mut guard) => guard.take(),
            Err(_) => None,
        };
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }

    fn write_record_file(&self, record: &DetailedRequestRecord) -> std::io::Result<()> {
        std::fs::create_dir_all(&self.logs_dir)?;

        let filename = generate_detail_filename(record);
        let path = self.logs_dir.join(filename);

        let mut data = serde_json::to_vec_pretty(record).map_err(std::io::Error::other)?;
        data.push(b'\n');
        std::fs::write(&path, data)?;

        let count = self.write_count.fetch_add(1, Ordering::Relaxed) + 1;
        if count % CLEANUP_INTERVAL_WRITES == 0 {
            self.cleanup_old_files();
        }

        Ok(())
    }

    /// Deletes the oldest `detail-*.json` files until the directory is
    /// within both the file-count and total-size limits.
    pub fn cleanup_old_files(&self) {
        let mut files = match self.detail_files_oldest_first() {
            Ok(files) => files,
            Err(_) => return,
        };
        if files.is_empty() {
            return;
        }

        let max_files = self.max_files.load(Ordering::Relaxed);
        let max_bytes = self.max_size_mb.load(Ordering::Relaxed) * 1024 * 1024;
        let mut total_size: u64 = files.iter().map(|f| f.size).sum();

        while files.len() > max_files || (total_size > max_bytes && !files.is_empty()) {
            let oldest = files.remove(0);
            if std::fs::remove_file(&oldest.path).is_ok() {
                total_size = total_size.saturating_sub(oldest.size);
            }
        }
    }

    fn detail_files_oldest_first(&self) -> std::io::Result<Vec<DetailFileInfo>> {
        let entries = match std::fs::read_dir(&self.logs_dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };

        let mut files = Vec::new();
        for entry in entries.flatten() {
            let path = entry.path();
            if !path.is_file() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().to_string();
            if !name.starts_with(DETAIL_FILE_PREFIX) || !name.ends_with(DETAIL_FILE_SUFFIX) {
                continue;
            }
            let meta = match entry.metadata() {
                Ok(meta) => meta,
                Err(_) => continue,
            };
            files.push(DetailFileInfo {
                path,
                size: meta.len(),
                modified: meta.modified().unwrap_or(std::time::SystemTime::UNIX_EPOCH),
            });
        }

        files.sort_by_key(|f| f.modified);
        Ok(files)
    }

    /// Paginated records newest-first, plus the total match count and the
    /// distinct (masked) API keys seen, for the management UI's filter.
    pub fn read_records(
        &self,
        filter: &RecordFilter,
    ) -> std::io::Result<(Vec<DetailedRequestRecord>, usize, Vec<String>)> {
        let mut files = self.detail_files_oldest_first()?;
        files.reverse();

        let mut records = Vec::new();
        let mut api_keys: HashSet<String> = HashSet::new();

        for file in &files {
            let record = match read_record_file(&file.path) {
                Some(record) => record,
                None => continue,
            };
            if !record.api_key.is_empty() {
                api_keys.insert(record.api_key.clone());
            }
            records.push(record);
        }

        // Legacy JSONL, reversed so newest lines come first.
        let mut legacy = self.read_legacy_jsonl();
        legacy.reverse();
        for record in &legacy {
            if !record.api_key.is_empty() {
                api_keys.insert(record.api_key.clone());
            }
        }
        records.extend(legacy);

        let filtered: Vec<DetailedRequestRecord> = records
            .into_iter()
            .filter(|r| matches_filter(r, filter))
            .collect();
        let total = filtered.len();

        let page: Vec<DetailedRequestRecord> = filtered
            .into_iter()
            .skip(filter.offset)
            .take(if filter.limit > 0 { filter.limit } else { usize::MAX })
            .collect();

        let mut api_keys: Vec<String> = api_keys.into_iter().collect();
        api_keys.sort();

        Ok((page, total, api_keys))
    }

    /// Looks a record up by id: filename substring first (confirmed by
    /// opening the file), then a scan of the legacy JSONL.
    pub fn read_record_by_id(&self, id: &str) -> Option<DetailedRequestRecord> {
        if id.is_empty() {
            return None;
        }

        if let Ok(files) = self.detail_files_oldest_first() {
            for file in &files {
                let name = match file.path.file_name() {
                    Some(name) => name.to_string_lossy().to_string(),
                    None => continue,
                };
                if !name.contains(id) {
                    continue;
                }
                if let Some(record) = read_record_file(&file.path) {
                    if record.id == id {
                        return Some(record);
                    }
                }
            }
        }

        self.read_legacy_jsonl().into_iter().find(|r| r.id == id)
    }

    /// Removes every detail file and the legacy JSONL.
    pub fn delete_all(&self) -> std::io::Result<()> {
        let entries = match std::fs::read_dir(&self.logs_dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e),
        };

        let mut last_err = None;
        for entry in entries.flatten() {
            let path = entry.path();
            if !path.is_file() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().to_string();
            let is_detail =
                name.starts_with(DETAIL_FILE_PREFIX) && name.ends_with(DETAIL_FILE_SUFFIX);
            if is_detail || name == LEGACY_JSONL_NAME {
                if let Err(e) = std::fs::remove_file(&path) {
                    last_err = Some(e);
                }
            }
        }

        match last_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Total bytes and record count (legacy lines included).
    pub fn stats(&self) -> (u64, usize) {
        let files = match self.detail_files_oldest_first() {
            Ok(files) => files,
            Err(_) => return (0, 0),
        };
        let mut total_size: u64 = files.iter().map(|f| f.size).sum();
        let mut count = files.len();

        let legacy_path = self.logs_dir.join(LEGACY_JSONL_NAME);
        if let Ok(meta) = std::fs::metadata(&legacy_path) {
            total_size += meta.len();
            count += self.read_legacy_jsonl().len();
        }

        (total_size, count)
    }

    fn read_legacy_jsonl(&self) -> Vec<DetailedRequestRecord> {
        let path = self.logs_dir.join(LEGACY_JSONL_NAME);
        let raw = match std::fs::read_to_string(&path) {
            Ok(raw) => raw,
            Err(_) => return Vec::new(),
        };
        raw.lines()
            .filter(|line| !line.trim().is_empty())
            .filter_map(|line| serde_json::from_str(line).ok())
            .collect()
    }
}

struct DetailFileInfo {
    path: PathBuf,
    size: u64,
    modified: std::time::SystemTime,
}

fn read_record_file(path: &Path) -> Option<DetailedRequestRecord> {
    let raw = std::fs::read_to_string(path).ok()?;
    serde_json::from_str(&raw).ok()
}

/// Builds `detail-v1-chat-completions-2026-02-08T130145-42cf8292.json`.
fn generate_detail_filename(record: &DetailedRequestRecord) -> String {
    let path = record.url.split('?').next().unwrap_or("");
    let path = path.strip_prefix('/').unwrap_or(path);
    let sanitized = sanitize_path_for_filename(path);

    let timestamp = record.timestamp.format("%Y-%m-%dT%H%M%S");
    let id = if record.id.is_empty() {
        uuid::Uuid::new_v4().simple().to_string()
    } else {
        record.id.clone()
    };

    format!(
        "{}{}-{}-{}{}",
        DETAIL_FILE_PREFIX, sanitized, timestamp, id, DETAIL_FILE_SUFFIX
    )
}

lazy_static! {
    static ref UNSAFE_CHARS_RE: Regex = Regex::new(r#"[<>:"|?*\s/]"#).unwrap();
    static ref DASH_RUNS_RE: Regex = Regex::new(r"-+").unwrap();
}

pub fn sanitize_path_for_filename(path: &str) -> String {
    let sanitized = UNSAFE_CHARS_RE.replace_all(path, "-");
    let sanitized = DASH_RUNS_RE.replace_all(&sanitized, "-");
    let sanitized = sanitized.trim_matches('-');
    if sanitized.is_empty() {
        "root".to_string()
    } else {
        sanitized.to_string()
    }
}

fn matches_filter(record: &DetailedRequestRecord, filter: &RecordFilter) -> bool {
    if !filter.api_key_hash.is_empty()
        && record.api_key_hash != filter.api_key_hash
        && record.api_key != filter.api_key_hash
    {
        return false;
    }
    if !match_status_code(record.status_code, &filter.status_code) {
        return false;
    }
    if let Some(after) = filter.after {
        if record.timestamp < after {
            return false;
        }
    }
    if let Some(before) = filter.before {
        if record.timestamp > before {
            return false;
        }
    }
    true
}

/// Supports exact match ("200") and class match ("2xx", "4xx", "5xx").
pub fn match_status_code(code: u16, pattern: &str) -> bool {
    let pattern = pattern.trim().to_lowercase();
    if pattern.is_empty() {
        return true;
    }

    let bytes = pattern.as_bytes();
    if bytes.len() == 3 && bytes[1] == b'x' && bytes[2] == b'x' {
        let class_digit = bytes[0].wrapping_sub(b'0') as u16;
        return code / 100 == class_digit;
    }

    code.to_string() == pattern
}

/// Masked key for display: first 4 and last 4 characters.
pub fn mask_api_key(key: &str) -> String {
    crate::redaction::hide_api_key(key)
}

/// SHA-256 hash of the key (first 16 bytes, 32 hex chars) for exact-match
/// filtering without storing the key.
pub fn hash_api_key(key: &str) -> String {
    let digest = Sha256::digest(key.as_bytes());
    digest[..16].iter().map(|b| format!("{:02x}", b)).collect()
}
