use crate::connection::ConnectionSettings;
use crate::constants::{SESSION_SWEEP_MAX_SECS, WS_CHAT_PATH};
use crate::session::SessionStore;
use crate::types::{Result, UpstreamHealth};
use crate::upstream::UpstreamClient;
use axum::{http::HeaderValue, middleware, routing::get, Router};
use clap::Parser;
use std::sync::Arc;
use std::time::Duration;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};

#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    #[arg(long, env = "HOST", default_value = "127.0.0.1")]
    pub host: String,
    #[arg(long, env = "PORT", default_value_t = 8000)]
    pub port: u16,
    #[arg(long, env = "OLLAMA_URL", default_value = "http://127.0.0.1:11434")]
    pub ollama_url: String,
    #[arg(long, env = "OLLAMA_CHAT_PATH", default_value = "/api/chat")]
    pub ollama_chat_path: String,
    #[arg(long, env = "OLLAMA_MODEL", default_value = "gpt-oss:20b")]
    pub ollama_model: String,
    /// Log every raw upstream line at debug level.
    #[arg(long, env = "OLLAMA_DEBUG", default_value_t = false)]
    pub ollama_debug: bool,
    #[arg(long, env = "REQUEST_TIMEOUT_SECS", default_value_t = 30)]
    pub request_timeout_secs: u64,
    #[arg(long, env = "CONNECT_TIMEOUT_SECS", default_value_t = 5)]
    pub connect_timeout_secs: u64,
    /// Extra attempts for the non-streaming fallback.
    #[arg(long, env = "MAX_RETRIES", default_value_t = 2)]
    pub max_retries: u32,
    #[arg(long, env = "RETRY_BASE_DELAY_MS", default_value_t = 500)]
    pub retry_base_delay_ms: u64,
    /// Largest accepted inbound frame, in bytes.
    #[arg(long, env = "MAX_MESSAGE_SIZE", default_value_t = 10 * 1024)]
    pub max_message_size: usize,
    #[arg(long, env = "HISTORY_MAX_LENGTH", default_value_t = 20)]
    pub history_max_length: usize,
    #[arg(long, env = "SESSION_TTL_SECS", default_value_t = 3600)]
    pub session_ttl_secs: u64,
    #[arg(long, env = "MAX_SESSIONS", default_value_t = 1000)]
    pub max_sessions: usize,
    /// Shared secret chat requests must carry as `x_api_key`.
    #[arg(long, env = "API_KEY")]
    pub api_key: Option<String>,
    /// `Name: value; Other: value` headers added to every upstream request.
    #[arg(long, env = "UPSTREAM_HEADERS")]
    pub upstream_headers: Option<String>,
    #[arg(long, env = "CORS_ORIGINS", default_value = "http://localhost:5173,http://localhost:3000")]
    pub cors_origins: String,
    /// Daily rolling log files are written here when set.
    #[arg(long, env = "LOG_DIR")]
    pub log_dir: Option<String>,
}

impl Args {
    pub fn session_ttl(&self) -> Duration {
        Duration::from_secs(self.session_ttl_secs)
    }

    /// Sweeps run at least once a minute, and at least once per TTL.
    pub fn sweep_interval(&self) -> Duration {
        self.session_ttl()
            .min(Duration::from_secs(SESSION_SWEEP_MAX_SECS))
            .max(Duration::from_secs(1))
    }

    pub fn connection_settings(&self) -> ConnectionSettings {
        ConnectionSettings {
            max_message_size: self.max_message_size,
            default_model: self.ollama_model.clone(),
            api_key: self.api_key.clone().filter(|k| !k.is_empty()),
        }
    }
}

#[derive(Clone)]
pub struct AppState {
    pub args: Arc<Args>,
    pub sessions: Arc<SessionStore>,
    pub upstream: UpstreamClient,
    pub health: Arc<UpstreamHealth>,
}

impl AppState {
    pub fn new(args: Args) -> Result<Self> {
        let health = Arc::new(UpstreamHealth::default());
        let upstream = UpstreamClient::new(&args, health.clone())?;
        let sessions = Arc::new(SessionStore::new(
            args.max_sessions,
            args.session_ttl(),
            args.history_max_length,
        ));
        tracing::info!(
            "Upstream chat endpoint: {} (default model {})",
            upstream.chat_url(),
            args.ollama_model
        );
        Ok(Self {
            args: Arc::new(args),
            sessions,
            upstream,
            health,
        })
    }
}

fn cors_layer(origins: &str) -> CorsLayer {
    let trimmed = origins.trim();
    if trimmed == "*" {
        return CorsLayer::new().allow_origin(Any).allow_methods(Any).allow_headers(Any);
    }
    let allowed: Vec<HeaderValue> = trimmed
        .split(',')
        .map(str::trim)
        .filter(|o| !o.is_empty())
        .filter_map(|o| match HeaderValue::from_str(o) {
            Ok(v) => Some(v),
            Err(_) => {
                tracing::warn!("Ignoring invalid CORS origin {:?}", o);
                None
            }
        })
        .collect();
    CorsLayer::new()
        .allow_origin(AllowOrigin::list(allowed))
        .allow_methods(Any)
        .allow_headers(Any)
}

pub fn app_router(state: AppState) -> Router {
    let cors = cors_layer(&state.args.cors_origins);
    Router::new()
        .route(WS_CHAT_PATH, get(crate::connection::ws_chat))
        .route("/health", get(crate::health::health))
        .route("/", get(crate::health::root))
        .layer(middleware::from_fn(crate::logging::request_id_middleware))
        .layer(cors)
        .with_state(Arc::new(state))
}
