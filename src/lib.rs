pub mod activity;
pub mod classifier;
pub mod config_service;
pub mod config_store;
pub mod detail_log;
pub mod dispatch;
pub mod engine;
pub mod health;
pub mod ingress;
pub mod log_rotation;
pub mod logging;
pub mod main_helper;
pub mod management;
pub mod recorder;
pub mod redaction;
pub mod state;
pub mod str_utils;
pub mod types;

pub use types::*;

pub use main_helper::{AppState, Args};
