use crate::redaction_layer::RedactingMakeWriter;
use axum::{
    body::Body,
    http::{Request, Response},
    middleware::Next,
};
use std::panic;
use tracing::{error, info, info_span, Instrument};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::prelude::*;
use uuid::Uuid;

pub const REQUEST_ID_HEADER: &str = "x-request-id";
pub const DEFAULT_LOG_FILTER: &str = "chat_relay=info";
const LOG_FILE_PREFIX: &str = "chat-relay.log";

/// Installs the global subscriber. Keep the returned guards alive for the life
/// of the process or buffered file output is lost.
pub fn init_tracing(log_dir: Option<&str>) -> Vec<WorkerGuard> {
    let filter = match tracing_subscriber::EnvFilter::try_from_default_env() {
        Ok(f) => f,
        Err(_) => DEFAULT_LOG_FILTER.into(),
    };

    let mut guards = Vec::new();
    let (stdout, stdout_guard) = tracing_appender::non_blocking(std::io::stdout());
    guards.push(stdout_guard);

    let file_layer = log_dir.map(|dir| {
        if let Err(e) = std::fs::create_dir_all(dir) {
            eprintln!("Could not create log directory {}: {}", dir, e);
        }
        let appender = tracing_appender::rolling::daily(dir, LOG_FILE_PREFIX);
        let (file, file_guard) = tracing_appender::non_blocking(appender);
        guards.push(file_guard);
        tracing_subscriber::fmt::layer()
            .with_writer(RedactingMakeWriter::new(file))
            .with_ansi(false)
    });

    let init = tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(RedactingMakeWriter::new(stdout)))
        .with(file_layer)
        .with(tracing_error::ErrorLayer::default())
        .try_init();
    if let Err(e) = init {
        eprintln!("Tracing already initialized: {}", e);
    }
    guards
}

/// Sets up a global panic hook that logs panics using tracing.
pub fn setup_panic_hook() {
    let original_hook = panic::take_hook();
    panic::set_hook(Box::new(move |panic_info| {
        let backtrace = std::backtrace::Backtrace::capture();

        let payload = panic_info.payload();
        let message = if let Some(s) = payload.downcast_ref::<&str>() {
            *s
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.as_str()
        } else {
            "Unknown panic payload"
        };

        let location = panic_info
            .location()
            .map(|l| format!("{}:{}:{}", l.file(), l.line(), l.column()))
            .unwrap_or_else(|| "unknown location".to_string());

        error!(
            target: "panic",
            message = %message,
            location = %location,
            backtrace = %backtrace,
            "FATAL: Application panicked"
        );

        original_hook(panic_info);
    }));
}

/// Tags every HTTP request, including WebSocket upgrades, with an id and a span.
pub async fn request_id_middleware(mut req: Request<Body>, next: Next) -> Response<Body> {
    let request_id = Uuid::new_v4().to_string();
    if let Ok(val) = request_id.parse() {
        req.headers_mut().insert(REQUEST_ID_HEADER, val);
    }

    let span = info_span!("request", request_id = %request_id, path = %req.uri().path());
    next.run(req).instrument(span).await
}

/// Counters for one chat exchange, logged once when it ends.
#[derive(Default)]
pub struct StreamMetric {
    pub lines: usize,
    pub deltas: usize,
    pub text_chars: usize,
    pub fallback: bool,
}

impl StreamMetric {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_delta(&mut self, text: &str) {
        self.deltas += 1;
        self.text_chars += text.chars().count();
    }

    pub fn log_summary(&self, model: &str) {
        info!(
            "[STREAM END] Model: {} | Lines: {} | Deltas: {} | Text: {} chars | Fallback: {}",
            model,
            self.lines,
            self.deltas,
            self.text_chars,
            self.fallback
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stream_metric_counts_chars() {
        let mut metric = StreamMetric::new();
        metric.record_delta("héllo");
        metric.record_delta(" 世界");
        assert_eq!(metric.deltas, 2);
        assert_eq!(metric.text_chars, 8);
        assert!(!metric.fallback);
    }
}
