use crate::types::*;
use chrono::Utc;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

/// Persistent store for routing configuration. The whole config lives in
/// one versioned JSON file (the same schema the export endpoint serves)
/// and is rewritten atomically on every mutation.
pub struct ConfigStore {
    path: PathBuf,
    inner: RwLock<ExportedConfig>,
}

impl ConfigStore {
    /// Opens the store, loading the config file if it exists. A missing
    /// file yields an empty config with default settings.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let inner = match std::fs::read_to_string(&path) {
            Ok(raw) => {
                let data: ExportData = serde_json::from_str(&raw)?;
                data.config
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => ExportedConfig::default(),
            Err(e) => return Err(ManifoldError::Io(e).into()),
        };
        Ok(Self {
            path,
            inner: RwLock::new(inner),
        })
    }

    #[cfg(test)]
    pub fn in_memory() -> Self {
        Self {
            path: PathBuf::new(),
            inner: RwLock::new(ExportedConfig::default()),
        }
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, ExportedConfig> {
        match self.inner.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn mutate<T>(&self, f: impl FnOnce(&mut ExportedConfig) -> T) -> Result<T> {
        let mut guard = match self.inner.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let out = f(&mut guard);
        self.persist(&guard)?;
        Ok(out)
    }

    /// Writes the config to a temp file then renames, so a crash mid-write
    /// never leaves a truncated config behind.
    fn persist(&self, config: &ExportedConfig) -> Result<()> {
        if self.path.as_os_str().is_empty() {
            return Ok(());
        }
        let data = ExportData {
            version: ExportData::SCHEMA_VERSION.to_string(),
            exported_at: Utc::now(),
            config: config.clone(),
        };
        let raw = serde_json::to_string_pretty(&data)?;
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(ManifoldError::Io)?;
            }
        }
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, raw).map_err(ManifoldError::Io)?;
        std::fs::rename(&tmp, &self.path).map_err(ManifoldError::Io)?;
        Ok(())
    }

    pub fn load_settings(&self) -> Settings {
        self.read().settings.clone()
    }

    pub fn save_settings(&self, settings: &Settings) -> Result<()> {
        self.mutate(|cfg| cfg.settings = settings.clone())
    }

    pub fn load_health_check_config(&self) -> HealthCheckConfig {
        self.read().health_check.clone()
    }

    pub fn save_health_check_config(&self, config: &HealthCheckConfig) -> Result<()> {
        self.mutate(|cfg| cfg.health_check = config.clone())
    }

    pub fn list_routes(&self) -> Vec<Route> {
        self.read().routes.iter().map(|r| r.route.clone()).collect()
    }

    pub fn get_route(&self, id: &str) -> Result<Route> {
        self.read()
            .routes
            .iter()
            .find(|r| r.route.id == id)
            .map(|r| r.route.clone())
            .ok_or_else(|| ManifoldError::NotFound(format!("route {}", id)).into())
    }

    pub fn create_route(&self, route: &Route) -> Result<()> {
        self.mutate(|cfg| {
            cfg.routes.push(RouteWithPipeline {
                route: route.clone(),
                pipeline: Pipeline {
                    route_id: route.id.clone(),
                    layers: Vec::new(),
                },
            });
        })
    }

    pub fn update_route(&self, route: &Route) -> Result<()> {
        self.mutate(|cfg| {
            match cfg.routes.iter_mut().find(|r| r.route.id == route.id) {
                Some(entry) => {
                    entry.route = route.clone();
                    Ok(())
                }
                None => Err(ManifoldError::NotFound(format!("route {}", route.id))),
            }
        })?
        .map_err(Into::into)
    }

    /// Deletes the route and its pipeline.
    pub fn delete_route(&self, id: &str) -> Result<()> {
        self.mutate(|cfg| {
            let before = cfg.routes.len();
            cfg.routes.retain(|r| r.route.id != id);
            if cfg.routes.len() == before {
                Err(ManifoldError::NotFound(format!("route {}", id)))
            } else {
                Ok(())
            }
        })?
        .map_err(Into::into)
    }

    pub fn get_pipeline(&self, route_id: &str) -> Result<Pipeline> {
        self.read()
            .routes
            .iter()
            .find(|r| r.route.id == route_id)
            .map(|r| r.pipeline.clone())
            .ok_or_else(|| ManifoldError::NotFound(format!("route {}", route_id)).into())
    }

    pub fn save_pipeline(&self, route_id: &str, pipeline: &Pipeline) -> Result<()> {
        self.mutate(|cfg| {
            match cfg.routes.iter_mut().find(|r| r.route.id == route_id) {
                Some(entry) => {
                    entry.pipeline = pipeline.clone();
                    entry.pipeline.route_id = route_id.to_string();
                    Ok(())
                }
                None => Err(ManifoldError::NotFound(format!("route {}", route_id))),
            }
        })?
        .map_err(Into::into)
    }

    pub fn snapshot(&self) -> ExportedConfig {
        self.read().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_file_yields_defaults() {
        let store = ConfigStore::open("/nonexistent-dir-for-sure/nope/config.json");
        // Parent dir missing is fine at open time; only writes create it.
        let store = match store {
            Ok(s) => s,
            Err(e) => panic!("open should tolerate a missing file: {}", e),
        };
        assert!(store.list_routes().is_empty());
        assert_eq!(store.load_health_check_config().check_interval_seconds, 30);
    }

    #[test]
    fn test_route_crud_in_memory() {
        let store = ConfigStore::in_memory();
        let route = Route {
            id: "route-1".into(),
            name: "gpt-pro".into(),
            ..Default::default()
        };
        store.create_route(&route).unwrap();
        assert_eq!(store.list_routes().len(), 1);
        assert_eq!(store.get_route("route-1").unwrap().name, "gpt-pro");

        // Pipeline rides along with the route.
        assert!(store.get_pipeline("route-1").unwrap().layers.is_empty());

        store.delete_route("route-1").unwrap();
        assert!(store.get_route("route-1").is_err());
        assert!(store.get_pipeline("route-1").is_err());
    }
}
