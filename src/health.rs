use crate::activity::RouteActivityTracker;
use crate::config_service::ConfigService;
use crate::dispatch::{AuthRegistry, DispatchOptions, SharedDispatcher, UpstreamRequest};
use crate::state::StateManager;
use crate::types::*;
use chrono::Utc;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

const MAX_HISTORY: usize = 1000;

enum CheckerMessage {
    CheckDue(String),
}

/// Probes targets and drives their recovery out of cooling.
///
/// Timed cooling gets a per-target one-shot timer; the timer does nothing
/// but post a `CheckDue` message into the checker's inbox, and the single
/// inbox consumer performs the probe and the state transition. Untimed
/// cooling is recovered by `trigger_route_sweep`, which the engine fires
/// whenever a request enters a route.
pub struct HealthChecker {
    config: Arc<ConfigService>,
    states: Arc<StateManager>,
    auths: Arc<AuthRegistry>,
    dispatcher: SharedDispatcher,
    activity: Arc<RouteActivityTracker>,

    history: Mutex<VecDeque<HealthResult>>,
    timers: Mutex<HashMap<String, JoinHandle<()>>>,

    tx: mpsc::UnboundedSender<CheckerMessage>,
    rx: Mutex<Option<mpsc::UnboundedReceiver<CheckerMessage>>>,
    running: AtomicBool,
    this: Weak<HealthChecker>,
}

impl HealthChecker {
    pub fn new(
        config: Arc<ConfigService>,
        states: Arc<StateManager>,
        auths: Arc<AuthRegistry>,
        dispatcher: SharedDispatcher,
        activity: Arc<RouteActivityTracker>,
    ) -> Arc<Self> {
        let (tx, rx) = mpsc::unbounded_channel();
        Arc::new_cyclic(|this| Self {
            config,
            states,
            auths,
            dispatcher,
            activity,
            history: Mutex::new(VecDeque::with_capacity(MAX_HISTORY)),
            timers: Mutex::new(HashMap::new()),
            tx,
            rx: Mutex::new(Some(rx)),
            running: AtomicBool::new(false),
            this: this.clone(),
        })
    }

    /// Starts the inbox consumer and re-schedules timers for targets that
    /// were already in timed cooling, so restarts do not leak them.
    pub fn start(&self) {
        if self.running.swap(true, Ordering::SeqCst) {
            return;
        }

        let rx = match self.rx.lock() {
            Ok(mut guard) => guard.take(),
            Err(_) => None,
        };
        if let (Some(mut rx), Some(checker)) = (rx, self.this.upgrade()) {
            tokio::spawn(async move {
                while let Some(message) = rx.recv().await {
                    if !checker.running.load(Ordering::SeqCst) {
                        continue;
                    }
                    match message {
                        CheckerMessage::CheckDue(target_id) => {
                            checker.on_target_check_due(&target_id).await;
                        }
                    }
                }
            });
        }

        for state in self.states.list_target_states() {
            if state.status == TargetStatus::Cooling && state.cooldown_ends_at.is_some() {
                self.schedule_target_check(&state.target_id);
            }
        }
    }

    /// Cancels every live timer; queued inbox messages become no-ops.
    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        if let Ok(mut timers) = self.timers.lock() {
            for (_, handle) in timers.drain() {
                handle.abort();
            }
        }
    }

    // --- Scheduled path ---

    /// Arms (or re-arms) the one-shot timer that fires at the target's
    /// `cooldown_ends_at`. Safe to call repeatedly: the previous timer is
    /// replaced, so two calls in a row still leave exactly one live timer.
    pub fn schedule_target_check(&self, target_id: &str) {
        let state = match self.states.get_target_state(target_id) {
            Some(state) => state,
            None => return,
        };
        let ends_at = match (state.status, state.cooldown_ends_at) {
            (TargetStatus::Cooling, Some(ends_at)) => ends_at,
            _ => return,
        };

        let delay = (ends_at - Utc::now()).to_std().unwrap_or(Duration::ZERO);

        let tx = self.tx.clone();
        let id = target_id.to_string();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = tx.send(CheckerMessage::CheckDue(id));
        });

        if let Ok(mut timers) = self.timers.lock() {
            if let Some(previous) = timers.insert(target_id.to_string(), handle) {
                previous.abort();
            }
        }
    }

    /// Drops any pending timer for the target, e.g. when an operator
    /// forces it into untimed cooling.
    pub fn cancel_target_check(&self, target_id: &str) {
        if let Ok(mut timers) = self.timers.lock() {
            if let Some(handle) = timers.remove(target_id) {
                handle.abort();
            }
        }
    }

    pub fn live_timer_count(&self) -> usize {
        match self.timers.lock() {
            Ok(timers) => timers.values().filter(|h| !h.is_finished()).count(),
            Err(_) => 0,
        }
    }

    async fn on_target_check_due(&self, target_id: &str) {
        if let Ok(mut timers) = self.timers.lock() {
            timers.remove(target_id);
        }

        // Re-verify: the target may have recovered or been parked untimed
        // while the timer was pending.
        let state = match self.states.get_target_state(target_id) {
            Some(state) => state,
            None => return,
        };
        if state.status != TargetStatus::Cooling || state.cooldown_ends_at.is_none() {
            return;
        }

        self.states.start_checking(target_id);

        let result = match self.check_target(target_id).await {
            Ok(result) => result,
            Err(e) => {
                tracing::debug!(
                    "scheduled health check failed for target {}: {}",
                    target_id,
                    e
                );
                let interval = self.check_interval();
                self.states.set_cooldown_next_check_in(target_id, interval);
                self.schedule_target_check(target_id);
                return;
            }
        };

        if result.status == "healthy" {
            self.states.end_cooldown(target_id);
            tracing::info!("target {} recovered after scheduled health check", target_id);
            return;
        }

        // Still unhealthy. An active route keeps the timer cadence going;
        // an idle route parks the target until its next request.
        let route_id = self.route_id_for_target(target_id).unwrap_or_default();
        if self.activity.is_processing(&route_id) {
            let interval = self.check_interval();
            self.states.set_cooldown_next_check_in(target_id, interval);
            self.schedule_target_check(target_id);
        } else {
            self.states.start_cooldown_untimed(target_id);
        }
    }

    // --- On-request path ---

    /// Probes every cooling target of the route whose timer is absent or
    /// already expired. Runs detached so it survives the triggering HTTP
    /// request; never blocks the caller.
    pub fn trigger_route_sweep(&self, route_id: &str) {
        let pipeline = match self.config.get_pipeline(route_id) {
            Ok(pipeline) => pipeline,
            Err(_) => return,
        };

        let now = Utc::now();
        let mut eligible = Vec::new();
        for layer in &pipeline.layers {
            for target in &layer.targets {
                if !target.enabled {
                    continue;
                }
                let state = match self.states.get_target_state(&target.id) {
                    Some(state) => state,
                    None => continue,
                };
                let expired = match state.cooldown_ends_at {
                    None => true,
                    Some(ends_at) => ends_at <= now,
                };
                if state.status == TargetStatus::Cooling && expired {
                    eligible.push(target.id.clone());
                }
            }
        }
        if eligible.is_empty() {
            return;
        }

        for target_id in eligible {
            let checker = match self.this.upgrade() {
                Some(checker) => checker,
                None => return,
            };
            tokio::spawn(async move {
                checker.states.start_checking(&target_id);
                let result = match checker.check_target(&target_id).await {
                    Ok(result) => result,
                    Err(_) => return,
                };
                if result.status == "healthy" {
                    checker.states.end_cooldown(&target_id);
                    tracing::info!(
                        "target {} recovered after on-request health check",
                        target_id
                    );
                } else {
                    checker.states.start_cooldown_timed(&target_id);
                    checker.schedule_target_check(&target_id);
                }
            });
        }
    }

    // --- One-shot probes (also the management surface) ---

    pub async fn check_all(&self) -> Vec<HealthResult> {
        let mut results = Vec::new();
        for route in self.config.list_routes() {
            results.extend(self.check_route(&route.id).await);
        }
        results
    }

    pub async fn check_route(&self, route_id: &str) -> Vec<HealthResult> {
        let pipeline = match self.config.get_pipeline(route_id) {
            Ok(pipeline) => pipeline,
            Err(_) => return Vec::new(),
        };

        let mut results = Vec::new();
        for layer in &pipeline.layers {
            for target in &layer.targets {
                if !target.enabled {
                    continue;
                }
                match self.check_target(&target.id).await {
                    Ok(result) => results.push(result),
                    Err(e) => results.push(HealthResult {
                        target_id: target.id.clone(),
                        credential_id: target.credential_id.clone(),
                        model: target.model.clone(),
                        status: "unhealthy".to_string(),
                        message: e.to_string(),
                        latency_ms: 0,
                        checked_at: Utc::now(),
                    }),
                }
            }
        }
        results
    }

    /// Probes one target and folds the outcome into its runtime state.
    pub async fn check_target(&self, target_id: &str) -> Result<HealthResult> {
        let target = self
            .find_target(target_id)
            .ok_or_else(|| ManifoldError::NotFound(format!("target {}", target_id)))?;

        let result = self.run_probe(&target).await;
        self.record_result(result.clone());

        if result.status == "healthy" {
            self.states
                .record_success(target_id, Duration::from_millis(result.latency_ms));
        } else {
            self.states.record_failure(target_id, &result.message);
        }

        Ok(result)
    }

    /// Issues a tiny streamed completion and waits for the first chunk,
    /// bounded by `check_timeout_seconds`. Remaining chunks are drained in
    /// the background so the upstream connection closes cleanly.
    async fn run_probe(&self, target: &Target) -> HealthResult {
        let mut result = HealthResult {
            target_id: target.id.clone(),
            credential_id: target.credential_id.clone(),
            model: target.model.clone(),
            status: "unhealthy".to_string(),
            message: String::new(),
            latency_ms: 0,
            checked_at: Utc::now(),
        };

        let auth = match self.auths.find(&target.credential_id) {
            Some(auth) => auth.clone(),
            None => {
                result.message = "credential not found".to_string();
                return result;
            }
        };

        let payload = serde_json::json!({
            "model": target.model,
            "messages": [{"role": "user", "content": "hi"}],
            "stream": true,
            "max_tokens": 1,
        });
        let request = UpstreamRequest {
            model: target.model.clone(),
            payload,
        };
        let options = DispatchOptions {
            stream: true,
            scope: Default::default(),
        };

        let timeout = Duration::from_secs(self.check_timeout_secs());
        let started = Instant::now();

        let probe = async {
            let mut rx = self
                .dispatcher
                .execute_stream_with_auth(auth, request, options)
                .await?;
            let first = rx.recv().await;
            Ok::<_, ObservedError>((first, rx))
        };

        match tokio::time::timeout(timeout, probe).await {
            Ok(Ok((Some(Ok(_)), mut rx))) => {
                result.status = "healthy".to_string();
                result.latency_ms = started.elapsed().as_millis() as u64;
                tokio::spawn(async move { while rx.recv().await.is_some() {} });
            }
            Ok(Ok((Some(Err(e)), _))) => {
                result.message = e.to_string();
            }
            Ok(Ok((None, _))) => {
                result.message = "stream closed without data".to_string();
            }
            Ok(Err(e)) => {
                result.message = e.to_string();
            }
            Err(_) => {
                result.message = "health check timeout".to_string();
            }
        }

        result
    }

    // --- History ---

    fn record_result(&self, result: HealthResult) {
        if let Ok(mut history) = self.history.lock() {
            if history.len() >= MAX_HISTORY {
                history.pop_front();
            }
            history.push_back(result);
        }
    }

    /// Filtered probe history, newest first.
    pub fn history(&self, filter: &HealthHistoryFilter) -> Vec<HealthResult> {
        let history = match self.history.lock() {
            Ok(history) => history,
            Err(_) => return Vec::new(),
        };

        let mut results = Vec::new();
        for result in history.iter().rev() {
            if let Some(target_id) = &filter.target_id {
                if &result.target_id != target_id {
                    continue;
                }
            }
            if let Some(status) = &filter.status {
                if &result.status != status {
                    continue;
                }
            }
            if let Some(since) = filter.since {
                if result.checked_at < since {
                    continue;
                }
            }
            results.push(result.clone());
            if filter.limit > 0 && results.len() >= filter.limit {
                break;
            }
        }
        results
    }

    // --- Lookups ---

    fn find_target(&self, target_id: &str) -> Option<Target> {
        for route in self.config.list_routes() {
            if let Ok(pipeline) = self.config.get_pipeline(&route.id) {
                if let Some(target) = pipeline.find_target(target_id) {
                    return Some(target.clone());
                }
            }
        }
        None
    }

    fn route_id_for_target(&self, target_id: &str) -> Option<String> {
        for route in self.config.list_routes() {
            if let Ok(pipeline) = self.config.get_pipeline(&route.id) {
                if pipeline.find_target(target_id).is_some() {
                    return Some(route.id);
                }
            }
        }
        None
    }

    fn check_interval(&self) -> Duration {
        let cfg = self.config.health_check_config();
        let secs = if cfg.check_interval_seconds > 0 {
            cfg.check_interval_seconds
        } else {
            HealthCheckConfig::default().check_interval_seconds
        };
        Duration::from_secs(secs)
    }

    fn check_timeout_secs(&self) -> u64 {
        let cfg = self.config.health_check_config();
        if cfg.check_timeout_seconds > 0 {
            cfg.check_timeout_seconds
        } else {
            HealthCheckConfig::default().check_timeout_seconds
        }
    }
}
