use crate::config_store::ConfigStore;
use crate::types::*;
use chrono::Utc;
use lazy_static::lazy_static;
use regex::Regex;
use std::collections::HashSet;
use std::sync::Mutex;
use tokio::sync::mpsc;

lazy_static! {
    static ref MODEL_NAME_RE: Regex = Regex::new(r"^[A-Za-z0-9._-]+$").unwrap();
}

const MAX_NAME_LEN: usize = 64;

/// Validates and mutates routing configuration, and fans change events out
/// to subscribers. Each subscriber owns an unbounded queue drained by its
/// own task, so a slow handler never blocks a config mutation.
pub struct ConfigService {
    store: ConfigStore,
    subscribers: Mutex<Vec<mpsc::UnboundedSender<ConfigChangeEvent>>>,
}

impl ConfigService {
    pub fn new(store: ConfigStore) -> Self {
        Self {
            store,
            subscribers: Mutex::new(Vec::new()),
        }
    }

    // --- Settings ---

    pub fn settings(&self) -> Settings {
        self.store.load_settings()
    }

    pub fn update_settings(&self, settings: &Settings) -> Result<()> {
        self.store.save_settings(settings)?;
        self.notify(ConfigChangeKind::SettingsUpdated, None);
        Ok(())
    }

    pub fn health_check_config(&self) -> HealthCheckConfig {
        self.store.load_health_check_config()
    }

    pub fn update_health_check_config(&self, config: &HealthCheckConfig) -> Result<()> {
        let mut errors = Vec::new();
        if config.check_interval_seconds == 0 {
            errors.push(ValidationError::new(
                "check_interval_seconds",
                "must be at least 1",
            ));
        }
        if config.check_timeout_seconds == 0 {
            errors.push(ValidationError::new(
                "check_timeout_seconds",
                "must be at least 1",
            ));
        }
        if config.default_cooldown_seconds == 0 {
            errors.push(ValidationError::new(
                "default_cooldown_seconds",
                "must be at least 1",
            ));
        }
        if !errors.is_empty() {
            return Err(ManifoldError::Validation(errors).into());
        }

        self.store.save_health_check_config(config)?;
        self.notify(ConfigChangeKind::HealthConfigUpdated, None);
        Ok(())
    }

    // --- Routes ---

    pub fn list_routes(&self) -> Vec<Route> {
        self.store.list_routes()
    }

    pub fn get_route(&self, id: &str) -> Result<Route> {
        self.store.get_route(id)
    }

    /// Finds the route whose name or any alias matches `model`.
    pub fn resolve_route(&self, model: &str) -> Option<Route> {
        self.store.list_routes().into_iter().find(|r| r.matches(model))
    }

    pub fn create_route(&self, mut route: Route) -> Result<Route> {
        if route.id.is_empty() {
            route.id = short_id("route");
        }
        route.aliases = clean_aliases(&route.name, &route.aliases);

        let errors = validate_route(&route);
        if !errors.is_empty() {
            return Err(ManifoldError::Validation(errors).into());
        }
        check_name_conflicts(&route, &self.store.list_routes())?;

        let now = Utc::now();
        route.created_at = Some(now);
        route.updated_at = Some(now);

        self.store.create_route(&route)?;
        self.notify(ConfigChangeKind::RouteCreated, Some(route.id.clone()));
        Ok(route)
    }

    pub fn update_route(&self, mut route: Route) -> Result<Route> {
        let existing = self.store.get_route(&route.id)?;

        route.aliases = clean_aliases(&route.name, &route.aliases);

        let errors = validate_route(&route);
        if !errors.is_empty() {
            return Err(ManifoldError::Validation(errors).into());
        }
        check_name_conflicts(&route, &self.store.list_routes())?;

        route.created_at = existing.created_at;
        route.updated_at = Some(Utc::now());

        self.store.update_route(&route)?;
        self.notify(ConfigChangeKind::RouteUpdated, Some(route.id.clone()));
        Ok(route)
    }

    pub fn delete_route(&self, id: &str) -> Result<()> {
        self.store.delete_route(id)?;
        self.notify(ConfigChangeKind::RouteDeleted, Some(id.to_string()));
        Ok(())
    }

    // --- Pipelines ---

    pub fn get_pipeline(&self, route_id: &str) -> Result<Pipeline> {
        self.store.get_pipeline(route_id)
    }

    pub fn update_pipeline(&self, route_id: &str, mut pipeline: Pipeline) -> Result<Pipeline> {
        let errors = validate_pipeline(&pipeline);
        if !errors.is_empty() {
            return Err(ManifoldError::Validation(errors).into());
        }

        // Fill layer/target defaults so the stored config always reflects
        // the effective values.
        let default_cooldown = {
            let cfg = self.store.load_health_check_config();
            if cfg.default_cooldown_seconds > 0 {
                cfg.default_cooldown_seconds
            } else {
                HealthCheckConfig::default().default_cooldown_seconds
            }
        };
        for layer in &mut pipeline.layers {
            if layer.cooldown_seconds == 0 {
                layer.cooldown_seconds = default_cooldown;
            }
            for target in &mut layer.targets {
                if target.id.is_empty() {
                    target.id = short_id("target");
                }
                if target.weight == 0 {
                    target.weight = 1;
                }
            }
        }

        self.store.save_pipeline(route_id, &pipeline)?;
        self.notify(ConfigChangeKind::PipelineUpdated, Some(route_id.to_string()));
        self.store.get_pipeline(route_id)
    }

    // --- Export / import ---

    pub fn export(&self) -> ExportData {
        ExportData {
            version: ExportData::SCHEMA_VERSION.to_string(),
            exported_at: Utc::now(),
            config: self.store.snapshot(),
        }
    }

    /// `merge == false` replaces all routes with the imported set;
    /// `merge == true` upserts routes (and their pipelines) by id.
    pub fn import(&self, data: &ExportData, merge: bool) -> Result<()> {
        if !merge {
            for route in self.store.list_routes() {
                let _ = self.store.delete_route(&route.id);
            }
        }

        self.store.save_settings(&data.config.settings)?;
        self.store.save_health_check_config(&data.config.health_check)?;

        for entry in &data.config.routes {
            let route = &entry.route;
            let exists = merge && self.store.get_route(&route.id).is_ok();
            if exists {
                self.store.update_route(route)?;
            } else {
                self.store.create_route(route)?;
            }
            self.store.save_pipeline(&route.id, &entry.pipeline)?;
        }

        self.notify(ConfigChangeKind::ConfigImported, None);
        Ok(())
    }

    // --- Validation ---

    pub fn validate(&self, route: Option<&Route>, pipeline: Option<&Pipeline>) -> Vec<ValidationError> {
        let mut errors = Vec::new();
        if let Some(route) = route {
            errors.extend(validate_route(route));
        }
        if let Some(pipeline) = pipeline {
            errors.extend(validate_pipeline(pipeline));
        }
        errors
    }

    // --- Subscriptions ---

    /// Registers a change handler. The handler runs on its own task fed by
    /// a queue, so mutation order is preserved per subscriber.
    pub fn subscribe<F>(&self, handler: F)
    where
        F: Fn(ConfigChangeEvent) + Send + 'static,
    {
        let (tx, mut rx) = mpsc::unbounded_channel::<ConfigChangeEvent>();
        if let Ok(mut subs) = self.subscribers.lock() {
            subs.push(tx);
        }
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                handler(event);
            }
        });
    }

    fn notify(&self, kind: ConfigChangeKind, route_id: Option<String>) {
        let event = ConfigChangeEvent { kind, route_id };
        if let Ok(mut subs) = self.subscribers.lock() {
            subs.retain(|tx| tx.send(event.clone()).is_ok());
        }
    }
}

/// Trims, drops empties, drops anything matching the route name and
/// deduplicates, all case-insensitively.
fn clean_aliases(name: &str, aliases: &[String]) -> Vec<String> {
    let mut seen: HashSet<String> = HashSet::new();
    seen.insert(name.to_lowercase());

    let mut result = Vec::new();
    for alias in aliases {
        let alias = alias.trim();
        if alias.is_empty() {
            continue;
        }
        if seen.insert(alias.to_lowercase()) {
            result.push(alias.to_string());
        }
    }
    result
}

fn validate_route(route: &Route) -> Vec<ValidationError> {
    let mut errors = Vec::new();

    if route.name.is_empty() {
        errors.push(ValidationError::new("name", "route name is required"));
    } else {
        if route.name.len() > MAX_NAME_LEN {
            errors.push(ValidationError::new(
                "name",
                "route name must be 64 characters or less",
            ));
        }
        if !MODEL_NAME_RE.is_match(&route.name) {
            errors.push(ValidationError::new(
                "name",
                "route name must be alphanumeric with dots/dashes/underscores",
            ));
        }
    }

    for (i, alias) in route.aliases.iter().enumerate() {
        if alias.len() > MAX_NAME_LEN {
            errors.push(ValidationError::new(
                format!("aliases[{}]", i),
                "alias must be 64 characters or less",
            ));
        }
        if !MODEL_NAME_RE.is_match(alias) {
            errors.push(ValidationError::new(
                format!("aliases[{}]", i),
                format!(
                    "alias '{}' must be alphanumeric with dots/dashes/underscores",
                    alias
                ),
            ));
        }
    }

    errors
}

fn validate_pipeline(pipeline: &Pipeline) -> Vec<ValidationError> {
    let mut errors = Vec::new();

    if pipeline.layers.is_empty() {
        errors.push(ValidationError::new("layers", "at least one layer is required"));
        return errors;
    }

    let mut seen_levels = HashSet::new();
    for (i, layer) in pipeline.layers.iter().enumerate() {
        if !seen_levels.insert(layer.level) {
            errors.push(ValidationError::new(
                format!("layers[{}].level", i),
                format!("duplicate level {}", layer.level),
            ));
        }

        if layer.targets.is_empty() {
            errors.push(ValidationError::new(
                format!("layers[{}].targets", i),
                "at least one target is required per layer",
            ));
        }

        for (j, target) in layer.targets.iter().enumerate() {
            if target.credential_id.is_empty() {
                errors.push(ValidationError::new(
                    format!("layers[{}].targets[{}].credential_id", i, j),
                    "credential_id is required",
                ));
            }
            if target.model.is_empty() {
                errors.push(ValidationError::new(
                    format!("layers[{}].targets[{}].model", i, j),
                    "model is required",
                ));
            }
        }
    }

    errors
}

/// Ensures the route's name/alias set does not intersect any other route's
/// set, case-insensitively. Skips the route's own id so updates pass.
fn check_name_conflicts(route: &Route, all_routes: &[Route]) -> Result<()> {
    let mut new_names: HashSet<String> = HashSet::new();
    new_names.insert(route.name.to_lowercase());
    for alias in &route.aliases {
        new_names.insert(alias.to_lowercase());
    }

    for other in all_routes {
        if other.id == route.id {
            continue;
        }
        if new_names.contains(&other.name.to_lowercase()) {
            return Err(ManifoldError::Conflict(format!(
                "name/alias '{}' conflicts with route '{}'",
                other.name, other.name
            ))
            .into());
        }
        for alias in &other.aliases {
            if new_names.contains(&alias.to_lowercase()) {
                return Err(ManifoldError::Conflict(format!(
                    "name/alias '{}' conflicts with alias on route '{}'",
                    alias, other.name
                ))
                .into());
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn service() -> ConfigService {
        ConfigService::new(ConfigStore::in_memory())
    }

    fn route(name: &str, aliases: &[&str]) -> Route {
        Route {
            name: name.to_string(),
            aliases: aliases.iter().map(|s| s.to_string()).collect(),
            ..Default::default()
        }
    }

    #[test]
    fn test_create_route_allocates_id_and_cleans_aliases() {
        let svc = service();
        let created = svc
            .create_route(route("gpt-pro", &["Pro", " ", "pro", "GPT-PRO", "chatpro"]))
            .unwrap();
        assert!(created.id.starts_with("route-"));
        // "pro" duplicates "Pro", "GPT-PRO" duplicates the name, blanks drop.
        assert_eq!(created.aliases, vec!["Pro", "chatpro"]);
        assert!(created.created_at.is_some());
    }

    #[test]
    fn test_name_conflict_across_routes() {
        let svc = service();
        svc.create_route(route("gpt-pro", &["Pro"])).unwrap();
        let err = svc.create_route(route("other", &["PRO"])).unwrap_err();
        assert!(matches!(err.inner, ManifoldError::Conflict(_)));
    }

    #[test]
    fn test_invalid_name_rejected() {
        let svc = service();
        let err = svc.create_route(route("bad name!", &[])).unwrap_err();
        assert!(matches!(err.inner, ManifoldError::Validation(_)));
    }

    #[test]
    fn test_update_pipeline_fills_defaults() {
        let svc = service();
        let created = svc.create_route(route("gpt-pro", &[])).unwrap();
        let pipeline = Pipeline {
            route_id: created.id.clone(),
            layers: vec![Layer {
                level: 1,
                strategy: Strategy::FirstAvailable,
                cooldown_seconds: 0,
                targets: vec![Target {
                    id: String::new(),
                    credential_id: "cred-1".into(),
                    model: "gpt-4o".into(),
                    weight: 0,
                    enabled: true,
                }],
            }],
        };
        let saved = svc.update_pipeline(&created.id, pipeline).unwrap();
        assert_eq!(saved.layers[0].cooldown_seconds, 60);
        assert!(saved.layers[0].targets[0].id.starts_with("target-"));
        assert_eq!(saved.layers[0].targets[0].weight, 1);
    }

    #[test]
    fn test_update_pipeline_rejects_duplicate_levels() {
        let svc = service();
        let created = svc.create_route(route("gpt-pro", &[])).unwrap();
        let layer = Layer {
            level: 1,
            strategy: Strategy::FirstAvailable,
            cooldown_seconds: 0,
            targets: vec![Target {
                id: String::new(),
                credential_id: "cred-1".into(),
                model: "m".into(),
                weight: 1,
                enabled: true,
            }],
        };
        let pipeline = Pipeline {
            route_id: created.id.clone(),
            layers: vec![layer.clone(), layer],
        };
        let err = svc.update_pipeline(&created.id, pipeline).unwrap_err();
        assert!(matches!(err.inner, ManifoldError::Validation(_)));
    }

    #[test]
    fn test_import_replace_clears_existing_routes() {
        let svc = service();
        svc.create_route(route("old-route", &[])).unwrap();

        let incoming = route("new-route", &[]);
        let data = ExportData {
            version: ExportData::SCHEMA_VERSION.to_string(),
            exported_at: Utc::now(),
            config: ExportedConfig {
                settings: Settings {
                    enabled: true,
                    hide_original_models: false,
                },
                health_check: HealthCheckConfig::default(),
                routes: vec![RouteWithPipeline {
                    route: Route {
                        id: "route-new".into(),
                        ..incoming
                    },
                    pipeline: Pipeline::default(),
                }],
            },
        };
        svc.import(&data, false).unwrap();

        let names: Vec<String> = svc.list_routes().into_iter().map(|r| r.name).collect();
        assert_eq!(names, vec!["new-route"]);
        assert!(svc.settings().enabled);
    }

    #[test]
    fn test_resolve_route_by_alias() {
        let svc = service();
        svc.create_route(route("gpt-pro", &["Pro", "chatpro"])).unwrap();
        svc.create_route(route("gemini", &[])).unwrap();

        assert_eq!(svc.resolve_route("PRO").unwrap().name, "gpt-pro");
        assert_eq!(svc.resolve_route("gemini").unwrap().name, "gemini");
        assert!(svc.resolve_route("other").is_none());
    }
}
