use crate::config_service::ConfigService;
use crate::types::*;
use chrono::{Duration as ChronoDuration, Utc};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

/// In-memory map of per-target runtime state. All writes go through the
/// `StateManager`; reads hand out snapshot copies so the UI overview never
/// blocks the engine.
#[derive(Default)]
pub struct StateStore {
    states: RwLock<HashMap<String, TargetState>>,
}

impl StateStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, target_id: &str) -> Option<TargetState> {
        match self.states.read() {
            Ok(states) => states.get(target_id).cloned(),
            Err(poisoned) => poisoned.into_inner().get(target_id).cloned(),
        }
    }

    pub fn list(&self) -> Vec<TargetState> {
        match self.states.read() {
            Ok(states) => states.values().cloned().collect(),
            Err(poisoned) => poisoned.into_inner().values().cloned().collect(),
        }
    }

    /// Runs `f` against the target's state under the write lock, creating a
    /// fresh healthy entry when the target has never been seen.
    pub fn update(&self, target_id: &str, f: impl FnOnce(&mut TargetState)) {
        let mut states = match self.states.write() {
            Ok(states) => states,
            Err(poisoned) => poisoned.into_inner(),
        };
        let state = states
            .entry(target_id.to_string())
            .or_insert_with(|| TargetState::new_healthy(target_id));
        f(state);
    }

    pub fn set(&self, state: TargetState) {
        let mut states = match self.states.write() {
            Ok(states) => states,
            Err(poisoned) => poisoned.into_inner(),
        };
        states.insert(state.target_id.clone(), state);
    }

    pub fn remove(&self, target_id: &str) {
        let mut states = match self.states.write() {
            Ok(states) => states,
            Err(poisoned) => poisoned.into_inner(),
        };
        states.remove(target_id);
    }
}

/// Transitions target states and derives the route/layer overviews used by
/// both the engine and the management UI.
pub struct StateManager {
    store: StateStore,
    config: Arc<ConfigService>,
}

impl StateManager {
    pub fn new(config: Arc<ConfigService>) -> Self {
        Self {
            store: StateStore::new(),
            config,
        }
    }

    // --- Queries ---

    pub fn get_target_state(&self, target_id: &str) -> Option<TargetState> {
        self.store.get(target_id)
    }

    pub fn list_target_states(&self) -> Vec<TargetState> {
        self.store.list()
    }

    pub fn get_overview(&self) -> StateOverview {
        let settings = self.config.settings();
        let routes = self.config.list_routes();

        let mut overview = StateOverview {
            unified_routing_enabled: settings.enabled,
            hide_original_models: settings.hide_original_models,
            total_routes: routes.len(),
            healthy_routes: 0,
            degraded_routes: 0,
            unhealthy_routes: 0,
            routes: Vec::with_capacity(routes.len()),
        };

        for route in routes {
            let route_state = match self.get_route_state(&route.id) {
                Ok(state) => state,
                Err(_) => continue,
            };
            match route_state.status.as_str() {
                "healthy" => overview.healthy_routes += 1,
                "degraded" => overview.degraded_routes += 1,
                "unhealthy" => overview.unhealthy_routes += 1,
                _ => {}
            }
            overview.routes.push(route_state);
        }

        overview
    }

    /// Derives per-layer status: the first layer (lowest level) with a
    /// healthy target is `active`, later layers are `standby`, layers with
    /// zero healthy targets are `exhausted`.
    pub fn get_route_state(&self, route_id: &str) -> Result<RouteState> {
        let route = self.config.get_route(route_id)?;
        let pipeline = self.config.get_pipeline(route_id)?;

        let mut route_state = RouteState {
            route_id: route.id.clone(),
            route_name: route.name.clone(),
            status: String::new(),
            active_layer: 1,
            layer_states: Vec::with_capacity(pipeline.layers.len()),
        };

        let mut healthy_targets = 0usize;
        let mut total_targets = 0usize;
        let mut active_layer_found = false;

        for layer in pipeline.layers_by_level() {
            let mut layer_state = LayerState {
                level: layer.level,
                status: "standby".to_string(),
                target_states: Vec::with_capacity(layer.targets.len()),
            };

            let mut healthy_in_layer = 0usize;
            for target in &layer.targets {
                total_targets += 1;
                let state = self
                    .store
                    .get(&target.id)
                    .unwrap_or_else(|| TargetState::new_healthy(&target.id));
                if state.status == TargetStatus::Healthy {
                    healthy_targets += 1;
                    healthy_in_layer += 1;
                }
                layer_state.target_states.push(state);
            }

            if healthy_in_layer > 0 && !active_layer_found {
                layer_state.status = "active".to_string();
                route_state.active_layer = layer.level;
                active_layer_found = true;
            } else if healthy_in_layer == 0 {
                layer_state.status = "exhausted".to_string();
            }

            route_state.layer_states.push(layer_state);
        }

        route_state.status = if total_targets > 0 && healthy_targets == total_targets {
            "healthy"
        } else if healthy_targets == 0 {
            "unhealthy"
        } else {
            "degraded"
        }
        .to_string();

        Ok(route_state)
    }

    // --- Transitions ---

    pub fn record_success(&self, target_id: &str, _latency: Duration) {
        self.store.update(target_id, |state| {
            state.status = TargetStatus::Healthy;
            state.consecutive_failures = 0;
            state.last_success_at = Some(Utc::now());
            state.cooldown_ends_at = None;
            state.total_requests += 1;
            state.successful_requests += 1;
        });
    }

    pub fn record_failure(&self, target_id: &str, reason: &str) {
        self.store.update(target_id, |state| {
            state.consecutive_failures += 1;
            state.last_failure_at = Some(Utc::now());
            state.last_failure_reason = reason.to_string();
            state.total_requests += 1;
        });
    }

    /// Enters timed cooling: a scheduled probe fires at `cooldown_ends_at`,
    /// which is now + the configured check interval.
    pub fn start_cooldown_timed(&self, target_id: &str) {
        let interval = self.check_interval();
        self.store.update(target_id, |state| {
            state.status = TargetStatus::Cooling;
            state.cooldown_ends_at =
                Some(Utc::now() + ChronoDuration::from_std(interval).unwrap_or_default());
        });
    }

    /// Enters untimed cooling: recovery waits for the next request on the
    /// owning route.
    pub fn start_cooldown_untimed(&self, target_id: &str) {
        self.store.update(target_id, |state| {
            state.status = TargetStatus::Cooling;
            state.cooldown_ends_at = None;
        });
    }

    /// Transient state while a probe is in flight, so UIs can distinguish
    /// "being checked" from "parked".
    pub fn start_checking(&self, target_id: &str) {
        self.store.update(target_id, |state| {
            state.status = TargetStatus::Checking;
            state.cooldown_ends_at = None;
        });
    }

    pub fn end_cooldown(&self, target_id: &str) {
        if self.store.get(target_id).is_none() {
            return;
        }
        self.store.update(target_id, |state| {
            state.status = TargetStatus::Healthy;
            state.consecutive_failures = 0;
            state.cooldown_ends_at = None;
        });
    }

    /// Pushes the next probe out by `d`. Only meaningful while cooling or
    /// checking; a healthy target is left alone.
    pub fn set_cooldown_next_check_in(&self, target_id: &str, d: Duration) {
        let current = match self.store.get(target_id) {
            Some(state) => state,
            None => return,
        };
        if current.status != TargetStatus::Cooling && current.status != TargetStatus::Checking {
            return;
        }
        self.store.update(target_id, |state| {
            state.status = TargetStatus::Cooling;
            state.cooldown_ends_at =
                Some(Utc::now() + ChronoDuration::from_std(d).unwrap_or_default());
        });
    }

    // --- Manual operations ---

    pub fn reset_target(&self, target_id: &str) {
        self.store.set(TargetState::new_healthy(target_id));
    }

    pub fn force_cooldown(&self, target_id: &str) {
        self.start_cooldown_untimed(target_id);
    }

    pub fn initialize_target(&self, target_id: &str) {
        self.store.set(TargetState::new_healthy(target_id));
    }

    pub fn remove_target(&self, target_id: &str) {
        self.store.remove(target_id);
    }

    // --- Availability ---

    pub fn is_target_available(&self, target_id: &str) -> bool {
        match self.store.get(target_id) {
            Some(state) => state.status == TargetStatus::Healthy,
            // Never-seen targets default to available.
            None => true,
        }
    }

    pub fn available_targets_in_layer<'a>(&self, layer: &'a Layer) -> Vec<&'a Target> {
        layer
            .targets
            .iter()
            .filter(|t| t.enabled && self.is_target_available(&t.id))
            .collect()
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
}
