#![allow(dead_code)]

use bytes::Bytes;
use futures_util::future::BoxFuture;
use manifold::activity::RouteActivityTracker;
use manifold::config_service::ConfigService;
use manifold::config_store::ConfigStore;
use manifold::dispatch::{
    parse_provider_error, Auth, AuthKind, AuthRegistry, ChunkReceiver, DispatchOptions,
    UpstreamDispatcher, UpstreamRequest,
};
use manifold::engine::{EngineStream, RoutingEngine};
use manifold::health::HealthChecker;
use manifold::recorder::{RequestScope, UpstreamRequestInfo};
use manifold::state::StateManager;
use manifold::types::*;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

/// Scripted upstream behaviour, keyed by credential id. Each dispatch (and
/// each health probe) consumes the next queued outcome; an empty queue
/// defaults to a single-chunk success.
#[derive(Clone)]
pub enum MockOutcome {
    Chunks(Vec<String>),
    ChunksThenError(Vec<String>, u16, String),
    Status(u16, String),
}

#[derive(Default)]
pub struct MockDispatcher {
    outcomes: Mutex<HashMap<String, VecDeque<MockOutcome>>>,
    pub calls: Mutex<Vec<String>>,
}

impl MockDispatcher {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn queue(&self, credential_id: &str, outcome: MockOutcome) {
        if let Ok(mut outcomes) = self.outcomes.lock() {
            outcomes
                .entry(credential_id.to_string())
                .or_default()
                .push_back(outcome);
        }
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().map(|c| c.clone()).unwrap_or_default()
    }

    fn take_outcome(&self, credential_id: &str) -> MockOutcome {
        let mut outcomes = match self.outcomes.lock() {
            Ok(outcomes) => outcomes,
            Err(poisoned) => poisoned.into_inner(),
        };
        outcomes
            .get_mut(credential_id)
            .and_then(|queue| queue.pop_front())
            .unwrap_or_else(|| MockOutcome::Chunks(vec!["data: {\"ok\":true}\n\n".to_string()]))
    }
}

impl UpstreamDispatcher for MockDispatcher {
    fn execute_stream_with_auth(
        &self,
        auth: Auth,
        request: UpstreamRequest,
        options: DispatchOptions,
    ) -> BoxFuture<'static, Result<ChunkReceiver>> {
        let outcome = self.take_outcome(&auth.id);
        if let Ok(mut calls) = self.calls.lock() {
            calls.push(auth.id.clone());
        }

        Box::pin(async move {
            options.scope.begin_attempt(&UpstreamRequestInfo {
                url: format!("https://mock.upstream/{}/chat/completions", auth.id),
                method: "POST".to_string(),
                headers: Default::default(),
                body: serde_json::to_string(&request.payload).ok(),
                provider: auth.provider.clone(),
                auth_id: auth.id.clone(),
                auth_label: auth.label.clone(),
                auth_type: auth.auth_type().to_string(),
                auth_value: auth.api_key().unwrap_or_default().to_string(),
            });

            match outcome {
                MockOutcome::Status(code, body) => {
                    options
                        .scope
                        .record_response_metadata(code, &Default::default());
                    options.scope.append_response_chunk(body.as_bytes());
                    Err(parse_provider_error(code, &body).into())
                }
                MockOutcome::Chunks(chunks) => {
                    options
                        .scope
                        .record_response_metadata(200, &Default::default());
                    let scope = options.scope.clone();
                    let (tx, rx) = mpsc::channel::<Result<Bytes>>(16);
                    tokio::spawn(async move {
                        for chunk in chunks {
                            scope.append_response_chunk(chunk.as_bytes());
                            if tx.send(Ok(Bytes::from(chunk))).await.is_err() {
                                break;
                            }
                        }
                    });
                    Ok(rx)
                }
                MockOutcome::ChunksThenError(chunks, status, message) => {
                    options
                        .scope
                        .record_response_metadata(200, &Default::default());
                    let scope = options.scope.clone();
                    let (tx, rx) = mpsc::channel::<Result<Bytes>>(16);
                    tokio::spawn(async move {
                        for chunk in chunks {
                            scope.append_response_chunk(chunk.as_bytes());
                            if tx.send(Ok(Bytes::from(chunk))).await.is_err() {
                                return;
                            }
                        }
                        scope.record_error(&message);
                        let err: ObservedError = ManifoldError::Provider {
                            status,
                            message,
                            retryable: None,
                        }
                        .into();
                        let _ = tx.send(Err(err)).await;
                    });
                    Ok(rx)
                }
            }
        })
    }
}

pub struct Harness {
    pub config: Arc<ConfigService>,
    pub states: Arc<StateManager>,
    pub health: Arc<HealthChecker>,
    pub engine: Arc<RoutingEngine>,
    pub activity: Arc<RouteActivityTracker>,
    pub dispatcher: Arc<MockDispatcher>,
    pub route: Route,
}

pub fn cred_id(target_id: &str) -> String {
    format!("cred-{}", target_id)
}

fn temp_config_path() -> std::path::PathBuf {
    std::env::temp_dir().join(format!(
        "manifold-test-{}.json",
        uuid::Uuid::new_v4().simple()
    ))
}

/// Builds a fully wired routing stack over the mock dispatcher. Layers are
/// given as `(level, strategy, target ids)`; each target gets a matching
/// credential in the registry.
pub fn build_harness(
    name: &str,
    aliases: &[&str],
    layers: Vec<(i32, Strategy, Vec<&str>)>,
) -> Harness {
    let store = match ConfigStore::open(temp_config_path()) {
        Ok(store) => store,
        Err(e) => panic!("config store: {}", e),
    };
    let config = Arc::new(ConfigService::new(store));

    config
        .update_settings(&Settings {
            enabled: true,
            hide_original_models: false,
        })
        .unwrap();

    let route = config
        .create_route(Route {
            name: name.to_string(),
            aliases: aliases.iter().map(|s| s.to_string()).collect(),
            ..Default::default()
        })
        .unwrap();

    let mut auths = Vec::new();
    let pipeline_layers: Vec<Layer> = layers
        .into_iter()
        .map(|(level, strategy, target_ids)| Layer {
            level,
            strategy,
            cooldown_seconds: 0,
            targets: target_ids
                .iter()
                .map(|id| {
                    auths.push(Auth {
                        id: cred_id(id),
                        provider: "mock".to_string(),
                        label: format!("label-{}", id),
                        kind: AuthKind::ApiKey {
                            api_key: format!("sk-{}-0123456789", id),
                        },
                        base_url: "https://mock.upstream".to_string(),
                    });
                    Target {
                        id: id.to_string(),
                        credential_id: cred_id(id),
                        model: format!("m-{}", id),
                        weight: 1,
                        enabled: true,
                    }
                })
                .collect(),
        })
        .collect();

    config
        .update_pipeline(
            &route.id,
            Pipeline {
                route_id: route.id.clone(),
                layers: pipeline_layers,
            },
        )
        .unwrap();

    let dispatcher = MockDispatcher::new();
    let states = Arc::new(StateManager::new(config.clone()));
    let activity = Arc::new(RouteActivityTracker::new());
    let health = HealthChecker::new(
        config.clone(),
        states.clone(),
        Arc::new(AuthRegistry::from_auths(auths.clone())),
        dispatcher.clone(),
        activity.clone(),
    );
    health.start();

    let engine = RoutingEngine::new(
        config.clone(),
        states.clone(),
        health.clone(),
        activity.clone(),
        Arc::new(AuthRegistry::from_auths(auths)),
        dispatcher.clone(),
    );

    Harness {
        config,
        states,
        health,
        engine,
        activity,
        dispatcher,
        route,
    }
}

pub fn detail_scope() -> RequestScope {
    RequestScope::new(false, true)
}

/// Drains an engine stream, returning the concatenated body and the
/// terminal error, if any.
pub async fn collect_stream(mut stream: EngineStream) -> (String, Option<String>) {
    let mut body = String::new();
    let mut error = None;
    while let Some(item) = stream.rx.recv().await {
        match item {
            Ok(chunk) => body.push_str(&String::from_utf8_lossy(&chunk)),
            Err(e) => {
                error = Some(e.to_string());
                break;
            }
        }
    }
    (body, error)
}
