use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;
use tracing_error::SpanTrace;
use uuid::Uuid;

/// Identity of one accepted client connection. History never outlives it.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct SessionId(pub Uuid);

impl SessionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn short(&self) -> String {
        let simple = self.0.simple().to_string();
        crate::str_utils::prefix_chars(&simple, 8).to_string()
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

/// One half of a user/assistant exchange. Also the wire shape of an upstream message.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ConversationTurn {
    pub role: Role,
    pub content: String,
}

impl ConversationTurn {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }
}

/// Client-supplied message. Roles are kept as strings so unknown roles are ignored
/// instead of rejecting the whole frame.
#[derive(Debug, Clone, Deserialize)]
pub struct InboundMessage {
    pub role: String,
    #[serde(default)]
    pub content: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChatRequest {
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub messages: Vec<InboundMessage>,
    #[serde(default)]
    pub x_api_key: Option<String>,
}

impl ChatRequest {
    /// The live turn: the last user entry with visible content. Everything else the
    /// client sent is ignored; history comes from the session.
    pub fn live_user_message(&self) -> Option<&str> {
        self.messages
            .iter()
            .rev()
            .filter(|m| m.role == "user")
            .map(|m| m.content.as_str())
            .find(|c| !c.trim().is_empty())
    }
}

/// Uniform outcome of one normalization step, independent of upstream shape.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NormalizedEvent {
    Delta { text: String },
    Done,
    Error { message: String },
}

impl NormalizedEvent {
    pub fn delta(text: impl Into<String>) -> Self {
        Self::Delta { text: text.into() }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::Error {
            message: message.into(),
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Error { .. })
    }
}

/// Every frame the server writes to a client.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerFrame {
    Pong,
    HistoryCleared,
    Delta { text: String },
    Done,
    Error { error: String },
}

impl From<NormalizedEvent> for ServerFrame {
    fn from(event: NormalizedEvent) -> Self {
        match event {
            NormalizedEvent::Delta { text } => ServerFrame::Delta { text },
            NormalizedEvent::Done => ServerFrame::Done,
            NormalizedEvent::Error { message } => ServerFrame::Error { error: message },
        }
    }
}

impl From<&ProtocolError> for ServerFrame {
    fn from(err: &ProtocolError) -> Self {
        ServerFrame::Error {
            error: err.to_string(),
        }
    }
}

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

/// Upstream request counters reported by `/health`.
#[derive(Debug, Default)]
pub struct UpstreamHealth {
    pub requests: AtomicU64,
    pub failures: AtomicU64,
    pub consecutive_failures: AtomicU32,
}

impl UpstreamHealth {
    pub fn record_success(&self) {
        self.requests.fetch_add(1, Ordering::Relaxed);
        self.consecutive_failures.store(0, Ordering::Relaxed);
    }

    pub fn record_failure(&self) {
        self.requests.fetch_add(1, Ordering::Relaxed);
        self.failures.fetch_add(1, Ordering::Relaxed);
        self.consecutive_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> (u64, u64, u32) {
        (
            self.requests.load(Ordering::Relaxed),
            self.failures.load(Ordering::Relaxed),
            self.consecutive_failures.load(Ordering::Relaxed),
        )
    }
}

/// Client input problems. The `Display` strings are sent to the client verbatim.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("malformed request")]
    Malformed,

    #[error("message too large")]
    TooLarge,

    #[error("missing user message")]
    MissingUserMessage,

    #[error("invalid or missing api key")]
    Unauthorized,
}

#[derive(Error, Debug)]
pub enum RelayError {
    #[error("{0}")]
    Protocol(#[from] ProtocolError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Network error: {0}")]
    Network(reqwest::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Upstream timed out: {0}")]
    Timeout(String),

    #[error("Upstream error (status {0}): {1}")]
    Upstream(axum::http::StatusCode, String),

    #[error("Upstream reported an error: {0}")]
    UpstreamReported(String),

    #[error("Session error: {0}")]
    Session(String),

    #[error("Client transport error: {0}")]
    Transport(String),
}

impl From<reqwest::Error> for RelayError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            RelayError::Timeout(e.to_string())
        } else {
            RelayError::Network(e)
        }
    }
}

impl RelayError {
    /// Failures of the generation backend or the path to it. These trigger the
    /// non-streaming fallback.
    pub fn is_upstream(&self) -> bool {
        matches!(
            self,
            RelayError::Network(_)
                | RelayError::Io(_)
                | RelayError::Timeout(_)
                | RelayError::Upstream(_, _)
                | RelayError::Serialization(_)
        )
    }
}

#[derive(Debug)]
pub struct ObservedError {
    pub inner: RelayError,
    pub span_trace: SpanTrace,
}

impl std::fmt::Display for ObservedError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}\n\nSpan Trace:\n{}", self.inner, self.span_trace)
    }
}

impl std::error::Error for ObservedError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.inner)
    }
}

impl<E> From<E> for ObservedError
where
    E: Into<RelayError>,
{
    fn from(error: E) -> Self {
        Self {
            inner: error.into(),
            span_trace: SpanTrace::capture(),
        }
    }
}

pub type Result<T> = std::result::Result<T, ObservedError>;
