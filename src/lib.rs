pub mod connection;
pub mod constants;
pub mod hardening;
pub mod health;
pub mod logging;
pub mod main_helper;
pub mod normalizer;
pub mod redaction_layer;
pub mod session;
pub mod str_utils;
pub mod streaming;
pub mod types;
pub mod upstream;

pub use types::*;

pub use main_helper::{app_router, AppState, Args};
