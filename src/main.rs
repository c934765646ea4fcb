use manifold::activity::RouteActivityTracker;
use manifold::config_service::ConfigService;
use manifold::config_store::ConfigStore;
use manifold::detail_log::DetailedRequestLogger;
use manifold::dispatch::{AuthRegistry, HttpDispatcher};
use manifold::engine::RoutingEngine;
use manifold::health::HealthChecker;
use manifold::log_rotation::RotationPolicy;
use manifold::state::StateManager;
use manifold::types::ConfigChangeKind;
use manifold::{AppState, Args};

use axum::{
    middleware,
    routing::{get, post},
    Router,
};
use clap::Parser;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();

    use tracing_subscriber::prelude::*;

    let filter = match tracing_subscriber::EnvFilter::try_from_default_env() {
        Ok(f) => f,
        Err(_) => "manifold=debug".into(),
    };

    let file_appender = tracing_appender::rolling::daily(".", "manifold.log");
    let (non_blocking, _guard) = tracing_appender::non_blocking(file_appender);

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(non_blocking)
                .with_ansi(false),
        )
        .with(tracing_error::ErrorLayer::default())
        .init();

    manifold::logging::setup_panic_hook();

    let rotation = RotationPolicy::default();
    let _ = rotation.rotate(std::path::Path::new("."), "manifold.log");

    let args = Arc::new(Args::parse());

    let store = match ConfigStore::open(&args.config) {
        Ok(store) => store,
        Err(e) => {
            eprintln!("Failed to load config {}: {}", args.config, e);
            std::process::exit(1);
        }
    };
    let config = Arc::new(ConfigService::new(store));

    let auths = match AuthRegistry::load(&args.credentials) {
        Ok(registry) => Arc::new(registry),
        Err(e) => {
            eprintln!("Failed to load credentials {}: {}", args.credentials, e);
            std::process::exit(1);
        }
    };

    let client = match reqwest::Client::builder()
        .timeout(std::time::Duration::from_secs(args.request_timeout_secs))
        .connect_timeout(std::time::Duration::from_secs(args.connect_timeout_secs))
        .pool_idle_timeout(std::time::Duration::from_secs(90))
        .pool_max_idle_per_host(10)
        .tcp_keepalive(Some(std::time::Duration::from_secs(60)))
        .build()
    {
        Ok(client) => client,
        Err(e) => {
            tracing::error!("Failed to build HTTP client: {}", e);
            std::process::exit(1);
        }
    };
    let dispatcher = Arc::new(HttpDispatcher::new(client));

    let states = Arc::new(StateManager::new(config.clone()));
    let activity = Arc::new(RouteActivityTracker::new());
    let health = HealthChecker::new(
        config.clone(),
        states.clone(),
        auths.clone(),
        dispatcher.clone(),
        activity.clone(),
    );
    health.start();

    let engine = RoutingEngine::new(
        config.clone(),
        states.clone(),
        health.clone(),
        activity.clone(),
        auths.clone(),
        dispatcher,
    );

    let detail_log = DetailedRequestLogger::new(
        args.detailed_request_log,
        &args.logs_dir,
        args.detailed_request_log_max_size_mb,
    );

    // Keep runtime state aligned with config: targets removed by an import
    // lose their state entry.
    {
        let config_for_prune = config.clone();
        let states_for_prune = states.clone();
        config.subscribe(move |event| {
            tracing::info!("config changed: {:?} route={:?}", event.kind, event.route_id);
            if !matches!(
                event.kind,
                ConfigChangeKind::ConfigImported
                    | ConfigChangeKind::RouteDeleted
                    | ConfigChangeKind::PipelineUpdated
            ) {
                return;
            }
            let mut known: std::collections::HashSet<String> = std::collections::HashSet::new();
            for route in config_for_prune.list_routes() {
                if let Ok(pipeline) = config_for_prune.get_pipeline(&route.id) {
                    for layer in &pipeline.layers {
                        for target in &layer.targets {
                            known.insert(target.id.clone());
                        }
                    }
                }
            }
            for state in states_for_prune.list_target_states() {
                if !known.contains(&state.target_id) {
                    states_for_prune.remove_target(&state.target_id);
                }
            }
        });
    }

    let state = Arc::new(AppState {
        config,
        states,
        health: health.clone(),
        engine,
        activity,
        auths,
        detail_log: detail_log.clone(),
        show_retries: Arc::new(AtomicBool::new(false)),
        args: args.clone(),
    });

    let app = Router::new()
        .route("/v1/chat/completions", post(manifold::ingress::chat_completions))
        .route("/chat/completions", post(manifold::ingress::chat_completions))
        .route("/v1/messages", post(manifold::ingress::chat_completions))
        .route(
            "/v1beta/models/:model_and_action",
            post(manifold::ingress::gemini_generate),
        )
        .route("/v1/models", get(manifold::ingress::list_models))
        .nest("/v0/management", manifold::management::router())
        .nest("/management", manifold::management::router())
        .layer(axum::extract::DefaultBodyLimit::max(args.max_body_size))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            manifold::logging::detail_capture_middleware,
        ))
        .layer(middleware::from_fn(manifold::logging::request_id_middleware))
        .with_state(state);

    let addr = format!("{}:{}", args.host, args.port);
    let listener = match tokio::net::TcpListener::bind(&addr).await {
        Ok(listener) => listener,
        Err(e) => {
            tracing::error!("Failed to bind to {}: {}", addr, e);
            std::process::exit(1);
        }
    };

    tracing::info!("Manifold listening on {}", addr);
    if let Err(e) = axum::serve(listener, app).await {
        tracing::error!("Server error: {}", e);
    }

    health.stop();
    detail_log.close().await;
}
