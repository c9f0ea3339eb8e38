use crate::constants::{
    HEALTH_CHECK_TIMEOUT_SECS, MAX_UPSTREAM_LINE_BYTES, STREAM_ACCEPT_HEADER, UPSTREAM_TAGS_PATH,
};
use crate::hardening::RetryPolicy;
use crate::main_helper::Args;
use crate::types::{ConversationTurn, RelayError, Result, UpstreamHealth};
use futures_util::{Stream, StreamExt};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, ACCEPT};
use serde::Serialize;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::codec::{FramedRead, LinesCodec, LinesCodecError};

/// Text lines of a streaming upstream response, in arrival order.
pub type LineStream = Pin<Box<dyn Stream<Item = std::result::Result<String, LinesCodecError>> + Send>>;

/// Body of a non-streaming upstream response.
#[derive(Debug, Clone, PartialEq)]
pub enum UpstreamPayload {
    Json(serde_json::Value),
    Text(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpstreamStatus {
    Connected,
    Error(u16),
    Disconnected(String),
}

#[derive(Serialize)]
struct ChatBody<'a> {
    model: &'a str,
    messages: &'a [ConversationTurn],
    stream: bool,
}

/// Client for an Ollama-compatible `/api/chat` backend.
#[derive(Clone)]
pub struct UpstreamClient {
    client: reqwest::Client,
    chat_url: String,
    tags_url: String,
    headers: HeaderMap,
    retry_policy: RetryPolicy,
    health: Arc<UpstreamHealth>,
    debug: bool,
}

impl UpstreamClient {
    pub fn new(args: &Args, health: Arc<UpstreamHealth>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(args.request_timeout_secs))
            .connect_timeout(Duration::from_secs(args.connect_timeout_secs))
            .pool_idle_timeout(Duration::from_secs(90))
            .tcp_keepalive(Some(Duration::from_secs(60)))
            .build()?;

        let base = normalize_base_url(&args.ollama_url);
        let headers = match args.upstream_headers.as_deref() {
            Some(raw) => parse_header_pairs(raw),
            None => HeaderMap::new(),
        };

        Ok(Self {
            client,
            chat_url: format!("{}{}", base, args.ollama_chat_path),
            tags_url: format!("{}{}", base, UPSTREAM_TAGS_PATH),
            headers,
            retry_policy: RetryPolicy::with_retries(args.max_retries, args.retry_base_delay_ms),
            health,
            debug: args.ollama_debug,
        })
    }

    pub fn chat_url(&self) -> &str {
        &self.chat_url
    }

    pub fn debug(&self) -> bool {
        self.debug
    }

    fn post_chat(&self, model: &str, messages: &[ConversationTurn], stream: bool) -> reqwest::RequestBuilder {
        self.client
            .post(&self.chat_url)
            .headers(self.headers.clone())
            .header(ACCEPT, STREAM_ACCEPT_HEADER)
            .json(&ChatBody {
                model,
                messages,
                stream,
            })
    }

    async fn check_status(&self, response: reqwest::Response) -> Result<reqwest::Response> {
        let status = response.status();
        if status.is_success() {
            self.health.record_success();
            return Ok(response);
        }
        self.health.record_failure();
        let body = match response.text().await {
            Ok(text) => text,
            Err(e) => format!("(body unreadable: {})", e),
        };
        tracing::error!("[☁️  -> ⚙️ ] Upstream returned {}: {}", status, crate::str_utils::prefix_chars(&body, 200));
        Err(RelayError::Upstream(status, body).into())
    }

    /// Opens a streaming chat request. Fails on connect errors, timeouts and
    /// non-2xx responses; never retried.
    pub async fn stream_chat(&self, model: &str, messages: &[ConversationTurn]) -> Result<LineStream> {
        tracing::debug!("[⚙️  -> ☁️ ] Streaming chat: model={} messages={}", model, messages.len());
        let response = match self.post_chat(model, messages, true).send().await {
            Ok(r) => r,
            Err(e) => {
                self.health.record_failure();
                return Err(RelayError::from(e).into());
            }
        };
        let response = self.check_status(response).await?;

        let bytes_stream = response
            .bytes_stream()
            .map(|r| r.map_err(std::io::Error::other));
        let lines = FramedRead::new(
            tokio_util::io::StreamReader::new(bytes_stream),
            LinesCodec::new_with_max_length(MAX_UPSTREAM_LINE_BYTES),
        );
        Ok(Box::pin(lines))
    }

    async fn complete_once(&self, model: &str, messages: &[ConversationTurn]) -> Result<UpstreamPayload> {
        let response = match self.post_chat(model, messages, false).send().await {
            Ok(r) => r,
            Err(e) => {
                self.health.record_failure();
                return Err(RelayError::from(e).into());
            }
        };
        let response = self.check_status(response).await?;
        let text = response.text().await.map_err(RelayError::from)?;
        Ok(match serde_json::from_str(&text) {
            Ok(value) => UpstreamPayload::Json(value),
            Err(_) => UpstreamPayload::Text(text),
        })
    }

    /// Non-streaming request, retried with backoff on transient failures.
    pub async fn complete_chat(&self, model: &str, messages: &[ConversationTurn]) -> Result<UpstreamPayload> {
        tracing::debug!("[⚙️  -> ☁️ ] Non-streaming chat: model={} messages={}", model, messages.len());
        self.retry_policy
            .execute_with_retry(|| self.complete_once(model, messages))
            .await
    }

    /// Reachability check against the backend's model listing.
    pub async fn check(&self) -> UpstreamStatus {
        let request = self
            .client
            .get(&self.tags_url)
            .headers(self.headers.clone())
            .timeout(Duration::from_secs(HEALTH_CHECK_TIMEOUT_SECS));
        match request.send().await {
            Ok(r) if r.status().is_success() => UpstreamStatus::Connected,
            Ok(r) => UpstreamStatus::Error(r.status().as_u16()),
            Err(e) => {
                tracing::warn!("Health check - upstream connection failed: {}", e);
                UpstreamStatus::Disconnected(e.to_string())
            }
        }
    }
}

/// Maps a line-reader failure back onto the error taxonomy, recovering
/// timeouts that reqwest reports through the body stream.
pub fn line_error(e: LinesCodecError) -> RelayError {
    match e {
        LinesCodecError::MaxLineLengthExceeded => {
            RelayError::Io(std::io::Error::other("upstream line exceeded maximum length"))
        }
        LinesCodecError::Io(io) => {
            let timed_out = io
                .get_ref()
                .and_then(|inner| inner.downcast_ref::<reqwest::Error>())
                .is_some_and(|re| re.is_timeout());
            if timed_out {
                RelayError::Timeout(io.to_string())
            } else {
                RelayError::Io(io)
            }
        }
    }
}

/// `host:port` gains an `http://` scheme, a `0.0.0.0` bind address is replaced
/// by loopback, and trailing slashes go.
pub fn normalize_base_url(raw: &str) -> String {
    let trimmed = raw.trim();
    let with_scheme = if trimmed.contains("://") {
        trimmed.to_string()
    } else {
        format!("http://{}", trimmed)
    };
    match reqwest::Url::parse(&with_scheme) {
        Ok(mut url) => {
            if url.host_str() == Some("0.0.0.0") && url.set_host(Some("127.0.0.1")).is_err() {
                tracing::warn!("Could not rewrite 0.0.0.0 in upstream URL {}", with_scheme);
            }
            url.as_str().trim_end_matches('/').to_string()
        }
        Err(e) => {
            tracing::warn!("Upstream URL {} did not parse ({}); using it as given", with_scheme, e);
            with_scheme.trim_end_matches('/').to_string()
        }
    }
}

/// Parses `Name: value; Other: value` into headers. Malformed pairs are skipped.
pub fn parse_header_pairs(raw: &str) -> HeaderMap {
    let mut headers = HeaderMap::new();
    for pair in raw.split(';') {
        let Some((name, value)) = pair.split_once(':') else {
            continue;
        };
        match (
            HeaderName::from_bytes(name.trim().as_bytes()),
            HeaderValue::from_str(value.trim()),
        ) {
            (Ok(n), Ok(v)) => {
                headers.insert(n, v);
            }
            _ => tracing::warn!("Ignoring malformed upstream header {:?}", name.trim()),
        }
    }
    headers
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_base_url() {
        assert_eq!(normalize_base_url("http://0.0.0.0:11434/"), "http://127.0.0.1:11434");
        assert_eq!(normalize_base_url("localhost:8008"), "http://localhost:8008");
        assert_eq!(normalize_base_url("https://llm.internal/ollama/"), "https://llm.internal/ollama");
    }

    #[test]
    fn test_parse_header_pairs() {
        let headers = parse_header_pairs("Authorization: Bearer abc; X-Team:core;broken");
        assert_eq!(headers.len(), 2);
        assert_eq!(
            headers.get("authorization").and_then(|v| v.to_str().ok()),
            Some("Bearer abc")
        );
        assert_eq!(headers.get("x-team").and_then(|v| v.to_str().ok()), Some("core"));
    }

    #[test]
    fn test_line_error_classification() {
        assert!(matches!(
            line_error(LinesCodecError::MaxLineLengthExceeded),
            RelayError::Io(_)
        ));
        let reset = std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset");
        assert!(line_error(LinesCodecError::Io(reset)).is_upstream());
    }

    #[test]
    fn test_chat_body_shape() {
        let messages = vec![ConversationTurn::user("hello")];
        let body = ChatBody {
            model: "m",
            messages: &messages,
            stream: true,
        };
        let value = match serde_json::to_value(&body) {
            Ok(v) => v,
            Err(e) => panic!("serialize failed: {}", e),
        };
        assert_eq!(
            value,
            serde_json::json!({
                "model": "m",
                "messages": [{"role": "user", "content": "hello"}],
                "stream": true
            })
        );
    }
}
