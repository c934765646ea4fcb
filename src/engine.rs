use crate::activity::RouteActivityTracker;
use crate::classifier::{classify, ErrorClass};
use crate::config_service::ConfigService;
use crate::dispatch::{AuthRegistry, DispatchOptions, SharedDispatcher, UpstreamRequest};
use crate::health::HealthChecker;
use crate::recorder::RequestScope;
use crate::state::StateManager;
use crate::types::*;
use bytes::Bytes;
use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tokio::sync::mpsc;

/// Outcome of a successful dispatch: the first chunk has already arrived
/// upstream, and the rest of the stream is forwarded through `rx`.
pub struct EngineStream {
    pub target_id: String,
    pub rx: mpsc::Receiver<Result<Bytes>>,
}

impl std::fmt::Debug for EngineStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineStream")
            .field("target_id", &self.target_id)
            .finish()
    }
}

/// Per-layer scheduling state for the rotating strategies.
#[derive(Default)]
struct LayerScheduler {
    rr_cursor: usize,
    /// Smooth weighted round-robin running weights, keyed by target id.
    wrr_current: HashMap<String, i64>,
}

/// Decrements the target's in-flight counter when dropped. Moved into the
/// forwarding task for the winning attempt so `least_conn` sees a target
/// as busy until its client stream ends.
struct InflightGuard {
    counter: Arc<AtomicI64>,
}

impl InflightGuard {
    fn new(counter: Arc<AtomicI64>) -> Self {
        counter.fetch_add(1, Ordering::Relaxed);
        Self { counter }
    }
}

impl Drop for InflightGuard {
    fn drop(&mut self) {
        self.counter.fetch_sub(1, Ordering::Relaxed);
    }
}

/// Selects a target from the active layer for every client request,
/// dispatches through the auth manager seam, and advances failover on
/// retryable failures.
pub struct RoutingEngine {
    config: Arc<ConfigService>,
    states: Arc<StateManager>,
    health: Arc<HealthChecker>,
    activity: Arc<RouteActivityTracker>,
    auths: Arc<AuthRegistry>,
    dispatcher: SharedDispatcher,

    schedulers: Mutex<HashMap<String, LayerScheduler>>,
    inflight: Mutex<HashMap<String, Arc<AtomicI64>>>,
}

impl RoutingEngine {
    pub fn new(
        config: Arc<ConfigService>,
        states: Arc<StateManager>,
        health: Arc<HealthChecker>,
        activity: Arc<RouteActivityTracker>,
        auths: Arc<AuthRegistry>,
        dispatcher: SharedDispatcher,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            states,
            health,
            activity,
            auths,
            dispatcher,
            schedulers: Mutex::new(HashMap::new()),
            inflight: Mutex::new(HashMap::new()),
        })
    }

    /// Resolves the route for `model` (name or alias, case-insensitive).
    pub fn resolve_route(&self, model: &str) -> Result<Route> {
        self.config
            .resolve_route(model)
            .ok_or_else(|| ManifoldError::NotFound(format!("unknown model: {}", model)).into())
    }

    /// Dispatches one client request. Walks layers in priority order,
    /// trying targets per the layer's strategy; a retryable failure cools
    /// the target and moves on, a non-retryable failure stops immediately.
    pub async fn dispatch(
        &self,
        model: &str,
        payload: serde_json::Value,
        scope: RequestScope,
    ) -> Result<EngineStream> {
        let route = self.resolve_route(model)?;

        self.activity.mark(&route.id);
        // Give cooling targets that are due (or untimed) a recovery chance.
        self.health.trigger_route_sweep(&route.id);

        let pipeline = self.config.get_pipeline(&route.id)?;

        let mut last_err: Option<ObservedError> = None;

        for layer in pipeline.layers_by_level() {
            loop {
                let candidates = self.states.available_targets_in_layer(layer);
                if candidates.is_empty() {
                    break;
                }
                let target = self.select_target(&route.id, layer, &candidates).clone();

                tracing::debug!(
                    "dispatching model {} via route {} layer {} target {} ({})",
                    model,
                    route.name,
                    layer.level,
                    target.id,
                    layer.strategy
                );

                match self.try_target(&target, &payload, &scope).await {
                    Ok(stream) => return Ok(stream),
                    Err(e) => match classify(&e) {
                        ErrorClass::NonRetryable => {
                            tracing::warn!(
                                "non-retryable failure on target {}: {}",
                                target.id,
                                e
                            );
                            return Err(e);
                        }
                        ErrorClass::Retryable => {
                            tracing::warn!(
                                "retryable failure on target {}, cooling and moving on: {}",
                                target.id,
                                e
                            );
                            self.states.record_failure(&target.id, &e.to_string());
                            self.states.start_cooldown_timed(&target.id);
                            self.health.schedule_target_check(&target.id);
                            last_err = Some(e);
                        }
                    },
                }
            }
        }

        Err(exhausted_from(last_err))
    }

    /// One upstream attempt. Success means the first chunk arrived; the
    /// remaining chunks are forwarded on the returned channel.
    async fn try_target(
        &self,
        target: &Target,
        payload: &serde_json::Value,
        scope: &RequestScope,
    ) -> Result<EngineStream> {
        let auth = self
            .auths
            .find(&target.credential_id)
            .cloned()
            .ok_or_else(|| {
                ManifoldError::internal(format!(
                    "credential {} not found for target {}",
                    target.credential_id, target.id
                ))
            })?;

        // The upstream sees the target's model, not the client-facing name.
        let mut payload = payload.clone();
        if let Some(obj) = payload.as_object_mut() {
            obj.insert(
                "model".to_string(),
                serde_json::Value::String(target.model.clone()),
            );
        }

        let guard = InflightGuard::new(self.inflight_counter(&target.id));
        let started = Instant::now();

        let request = UpstreamRequest {
            model: target.model.clone(),
            payload,
        };
        let options = DispatchOptions {
            stream: true,
            scope: scope.clone(),
        };

        let attempt = async {
            let mut rx = self
                .dispatcher
                .execute_stream_with_auth(auth, request, options)
                .await?;
            match rx.recv().await {
                Some(Ok(first)) => Ok((first, rx)),
                Some(Err(e)) => Err(e),
                None => Err(ManifoldError::Provider {
                    status: 0,
                    message: "stream closed without data".to_string(),
                    retryable: None,
                }
                .into()),
            }
        };

        let (first, upstream_rx) = match attempt.await {
            Ok(pair) => pair,
            Err(e) => {
                scope.finish_attempt(started.elapsed().as_millis() as u64);
                return Err(e);
            }
        };

        self.states.record_success(&target.id, started.elapsed());

        let (tx, rx) = mpsc::channel::<Result<Bytes>>(64);
        let states = self.states.clone();
        let health = self.health.clone();
        let target_id = target.id.clone();
        let scope = scope.clone();
        tokio::spawn(async move {
            let _guard = guard;
            forward_stream(
                states,
                health,
                first,
                upstream_rx,
                tx,
                &target_id,
                &scope,
                started,
            )
            .await;
        });

        Ok(EngineStream {
            target_id: target.id.clone(),
            rx,
        })
    }

    fn inflight_counter(&self, target_id: &str) -> Arc<AtomicI64> {
        let mut inflight = match self.inflight.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        inflight
            .entry(target_id.to_string())
            .or_insert_with(|| Arc::new(AtomicI64::new(0)))
            .clone()
    }

    fn inflight_count(&self, target_id: &str) -> i64 {
        match self.inflight.lock() {
            Ok(inflight) => inflight
                .get(target_id)
                .map(|c| c.load(Ordering::Relaxed))
                .unwrap_or(0),
            Err(_) => 0,
        }
    }

    /// Picks one target from the layer's currently-available candidates.
    /// Declared order is preserved in `candidates`, which is what the
    /// order-sensitive strategies rely on.
    fn select_target<'a>(
        &self,
        route_id: &str,
        layer: &Layer,
        candidates: &[&'a Target],
    ) -> &'a Target {
        if candidates.len() == 1 {
            return candidates[0];
        }

        match layer.strategy {
            Strategy::FirstAvailable => candidates[0],
            Strategy::Random => candidates[fastrand::usize(..candidates.len())],
            Strategy::RoundRobin => {
                let mut schedulers = self.lock_schedulers();
                let sched = schedulers
                    .entry(scheduler_key(route_id, layer.level))
                    .or_default();
                let picked = candidates[sched.rr_cursor % candidates.len()];
                sched.rr_cursor = sched.rr_cursor.wrapping_add(1);
                picked
            }
            Strategy::WeightedRound => {
                let mut schedulers = self.lock_schedulers();
                let sched = schedulers
                    .entry(scheduler_key(route_id, layer.level))
                    .or_default();
                smooth_weighted_pick(sched, candidates)
            }
            Strategy::LeastConn => {
                let mut best = candidates[0];
                let mut best_count = self.inflight_count(&best.id);
                for target in &candidates[1..] {
                    let count = self.inflight_count(&target.id);
                    if count < best_count {
                        best = target;
                        best_count = count;
                    }
                }
                best
            }
        }
    }

    fn lock_schedulers(&self) -> std::sync::MutexGuard<'_, HashMap<String, LayerScheduler>> {
        match self.schedulers.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

fn scheduler_key(route_id: &str, level: i32) -> String {
    format!("{}:{}", route_id, level)
}

/// Forwards upstream chunks to the client. Once bytes have been sent
/// there is no transparent retry: a mid-stream retryable error still
/// cools the target, but the client sees the error in-stream.
#[allow(clippy::too_many_arguments)]
async fn forward_stream(
    states: Arc<StateManager>,
    health: Arc<HealthChecker>,
    first: Bytes,
    mut upstream_rx: mpsc::Receiver<Result<Bytes>>,
    tx: mpsc::Sender<Result<Bytes>>,
    target_id: &str,
    scope: &RequestScope,
    started: Instant,
) {
    if tx.send(Ok(first)).await.is_err() {
        // Client went away before the first chunk was delivered.
        scope.finish_attempt(started.elapsed().as_millis() as u64);
        return;
    }

    while let Some(item) = upstream_rx.recv().await {
        match item {
            Ok(chunk) => {
                if tx.send(Ok(chunk)).await.is_err() {
                    // Client disconnect is a cancellation, never a target
                    // failure.
                    break;
                }
            }
            Err(e) => {
                if classify(&e) == ErrorClass::Retryable {
                    states.record_failure(target_id, &e.to_string());
                    states.start_cooldown_timed(target_id);
                    health.schedule_target_check(target_id);
                }
                let _ = tx.send(Err(e)).await;
                break;
            }
        }
    }

    scope.finish_attempt(started.elapsed().as_millis() as u64);
}

/// Smooth weighted round-robin: each pick adds every candidate's weight to
/// its running value, takes the largest, then subtracts the total weight
/// from the winner. Produces an evenly interleaved sequence.
fn smooth_weighted_pick<'a>(sched: &mut LayerScheduler, candidates: &[&'a Target]) -> &'a Target {
    let total: i64 = candidates.iter().map(|t| t.weight as i64).sum();

    let mut best_idx = 0;
    let mut best_value = i64::MIN;
    for (i, target) in candidates.iter().enumerate() {
        let current = sched.wrr_current.entry(target.id.clone()).or_insert(0);
        *current += target.weight as i64;
        if *current > best_value {
            best_value = *current;
            best_idx = i;
        }
    }

    let winner = candidates[best_idx];
    if let Some(current) = sched.wrr_current.get_mut(&winner.id) {
        *current -= total;
    }
    winner
}

fn exhausted_from(last_err: Option<ObservedError>) -> ObservedError {
    match last_err {
        Some(err) => {
            let status = match &err.inner {
                ManifoldError::Provider { status, .. } if *status > 0 => *status,
                _ => 503,
            };
            ManifoldError::Exhausted {
                status,
                message: err.to_string(),
            }
            .into()
        }
        None => ManifoldError::Exhausted {
            status: 503,
            message: "no available targets".to_string(),
        }
        .into(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn target(id: &str, weight: u32) -> Target {
        Target {
            id: id.to_string(),
            credential_id: "cred".to_string(),
            model: "m".to_string(),
            weight,
            enabled: true,
        }
    }

    #[test]
    fn test_smooth_weighted_pick_distribution() {
        let a = target("a", 5);
        let b = target("b", 1);
        let c = target("c", 1);
        let candidates = vec![&a, &b, &c];
        let mut sched = LayerScheduler::default();

        let mut counts: HashMap<String, usize> = HashMap::new();
        for _ in 0..7 {
            let picked = smooth_weighted_pick(&mut sched, &candidates);
            *counts.entry(picked.id.clone()).or_default() += 1;
        }

        assert_eq!(counts.get("a"), Some(&5));
        assert_eq!(counts.get("b"), Some(&1));
        assert_eq!(counts.get("c"), Some(&1));
    }

    #[test]
    fn test_smooth_weighted_pick_interleaves() {
        let a = target("a", 2);
        let b = target("b", 1);
        let candidates = vec![&a, &b];
        let mut sched = LayerScheduler::default();

        let sequence: Vec<String> = (0..6)
            .map(|_| smooth_weighted_pick(&mut sched, &candidates).id.clone())
            .collect();

        // Never three of the same in a row for 2:1 weights.
        for window in sequence.windows(3) {
            assert!(
                !(window[0] == window[1] && window[1] == window[2]),
                "sequence {:?} not interleaved",
                sequence
            );
        }
    }

    #[test]
    fn test_exhausted_inherits_upstream_status() {
        let err: ObservedError = ManifoldError::Provider {
            status: 429,
            message: "rate limited".to_string(),
            retryable: None,
        }
        .into();
        let exhausted = exhausted_from(Some(err));
        match exhausted.inner {
            ManifoldError::Exhausted { status, .. } => assert_eq!(status, 429),
            other => panic!("expected exhausted, got {:?}", other),
        }
    }

    #[test]
    fn test_exhausted_defaults_to_503() {
        let exhausted = exhausted_from(None);
        match exhausted.inner {
            ManifoldError::Exhausted { status, .. } => assert_eq!(status, 503),
            other => panic!("expected exhausted, got {:?}", other),
        }
    }
}
