use crate::activity::RouteActivityTracker;
use crate::config_service::ConfigService;
use crate::detail_log::DetailedRequestLogger;
use crate::dispatch::AuthRegistry;
use crate::engine::RoutingEngine;
use crate::health::HealthChecker;
use crate::state::StateManager;
use clap::Parser;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    #[arg(long, default_value_t = 8080)]
    pub port: u16,
    #[arg(long, default_value = "127.0.0.1")]
    pub host: String,
    /// Routing configuration file (versioned export schema).
    #[arg(long, default_value = "manifold-config.json")]
    pub config: String,
    /// Upstream credentials file consumed by the auth registry.
    #[arg(long, default_value = "credentials.json")]
    pub credentials: String,
    /// Directory for per-request detail JSON files.
    #[arg(long, default_value = "logs")]
    pub logs_dir: String,
    #[arg(long, default_value_t = false)]
    pub detailed_request_log: bool,
    #[arg(long, default_value_t = 20)]
    pub detailed_request_log_max_size_mb: u64,
    /// Legacy aggregated request logging via tracing.
    #[arg(long, default_value_t = false)]
    pub request_log: bool,
    #[arg(long, default_value_t = 120)]
    pub request_timeout_secs: u64,
    #[arg(long, default_value_t = 10)]
    pub connect_timeout_secs: u64,
    #[arg(long, default_value_t = 50 * 1024 * 1024)]
    pub max_body_size: usize,
}

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<ConfigService>,
    pub states: Arc<StateManager>,
    pub health: Arc<HealthChecker>,
    pub engine: Arc<RoutingEngine>,
    pub activity: Arc<RouteActivityTracker>,
    pub auths: Arc<AuthRegistry>,
    pub detail_log: Arc<DetailedRequestLogger>,
    /// UI hint only: whether the management panel expands retries.
    pub show_retries: Arc<AtomicBool>,
    pub args: Arc<Args>,
}
