use crate::constants::FALLBACK_CHUNK_CHARS;
use crate::normalizer::{extract_text, parse_line, upstream_error, LineEvent};
use crate::types::{ConversationTurn, NormalizedEvent, ObservedError, RelayError};
use crate::upstream::{line_error, LineStream, UpstreamClient, UpstreamPayload};
use futures_util::StreamExt;
use tokio::sync::mpsc;
use tracing::Instrument;

/// Everything the worker needs for one chat exchange.
#[derive(Debug, Clone)]
pub struct ExchangeRequest {
    pub model: String,
    pub messages: Vec<ConversationTurn>,
}

enum StreamOutcome {
    /// A terminal event was published.
    Finished,
    /// The consumer hung up; nothing more to do.
    ConsumerGone,
    Failed(ObservedError),
}

/// Drives one exchange against the upstream and publishes [`NormalizedEvent`]s,
/// in order, to the connection that owns the receiving end. Exactly one terminal
/// event is published unless the receiver goes away first.
pub struct StreamHandler {
    upstream: UpstreamClient,
    tx: mpsc::Sender<NormalizedEvent>,
    metrics: crate::logging::StreamMetric,
    delivered: String,
}

impl StreamHandler {
    pub fn new(upstream: UpstreamClient, tx: mpsc::Sender<NormalizedEvent>) -> Self {
        Self {
            upstream,
            tx,
            metrics: crate::logging::StreamMetric::new(),
            delivered: String::new(),
        }
    }

    /// Runs the exchange on its own task so the connection loop never waits on
    /// the network directly.
    pub fn spawn(
        upstream: UpstreamClient,
        request: ExchangeRequest,
        tx: mpsc::Sender<NormalizedEvent>,
    ) -> tokio::task::JoinHandle<()> {
        let span = tracing::info_span!("exchange", model = %request.model, turns = request.messages.len());
        tokio::spawn(Self::new(upstream, tx).run(request).instrument(span))
    }

    pub async fn run(mut self, request: ExchangeRequest) {
        let ExchangeRequest { model, messages } = request;

        let outcome = match self.upstream.stream_chat(&model, &messages).await {
            Ok(lines) => {
                // `lines` owns the response body; it is dropped (and the
                // connection released) before any fallback request goes out.
                self.pump(lines).await
            }
            Err(e) => StreamOutcome::Failed(e),
        };

        match outcome {
            StreamOutcome::Finished => {}
            StreamOutcome::ConsumerGone => {
                tracing::debug!("Consumer went away; abandoning exchange");
            }
            StreamOutcome::Failed(e) if e.inner.is_upstream() => {
                tracing::warn!("Stream failed, falling back to non-streaming: {}", e.inner);
                self.metrics.fallback = true;
                self.fallback(&model, &messages).await;
            }
            StreamOutcome::Failed(e) => {
                tracing::error!("Exchange failed: {}", e);
                self.publish(NormalizedEvent::error(e.inner.to_string())).await;
            }
        }

        self.metrics.log_summary(&model);
    }

    async fn publish(&mut self, event: NormalizedEvent) -> bool {
        if let NormalizedEvent::Delta { text } = &event {
            self.metrics.record_delta(text);
            self.delivered.push_str(text);
        }
        if self.tx.send(event).await.is_err() {
            tracing::trace!("Event receiver dropped");
            return false;
        }
        true
    }

    async fn finish(&mut self, event: NormalizedEvent) -> StreamOutcome {
        if self.publish(event).await {
            StreamOutcome::Finished
        } else {
            StreamOutcome::ConsumerGone
        }
    }

    async fn pump(&mut self, mut lines: LineStream) -> StreamOutcome {
        while let Some(line) = lines.next().await {
            let line = match line {
                Ok(l) => l,
                Err(e) => {
                    let err = line_error(e);
                    tracing::error!("[☁️  -> ⚙️ ] Stream read error: {}", err);
                    return StreamOutcome::Failed(err.into());
                }
            };
            self.metrics.lines += 1;
            if self.upstream.debug() {
                tracing::debug!("RAW LINE: {}", crate::str_utils::prefix_chars(&line, 200));
            }

            match parse_line(&line) {
                LineEvent::Skip => continue,
                LineEvent::Delta(text) => {
                    if !self.publish(NormalizedEvent::delta(text)).await {
                        return StreamOutcome::ConsumerGone;
                    }
                }
                LineEvent::Final(text) => {
                    if let Some(text) = text {
                        if !self.publish(NormalizedEvent::delta(text)).await {
                            return StreamOutcome::ConsumerGone;
                        }
                    }
                    return self.finish(NormalizedEvent::Done).await;
                }
                LineEvent::Done => {
                    tracing::debug!("[☁️  -> ⚙️ ] Stream end marker received");
                    return self.finish(NormalizedEvent::Done).await;
                }
                LineEvent::Error(message) => {
                    tracing::error!("[☁️  -> ⚙️ ] Upstream reported: {}", message);
                    let err = RelayError::UpstreamReported(message);
                    return self.finish(NormalizedEvent::error(err.to_string())).await;
                }
            }
        }
        // Body ended without a terminator; what arrived is the whole answer.
        self.finish(NormalizedEvent::Done).await
    }

    async fn fallback(&mut self, model: &str, messages: &[ConversationTurn]) {
        let payload = match self.upstream.complete_chat(model, messages).await {
            Ok(p) => p,
            Err(e) => {
                tracing::error!("Non-streaming fallback failed: {}", e.inner);
                self.publish(NormalizedEvent::error(e.inner.to_string())).await;
                return;
            }
        };

        let text = match fallback_text(&payload) {
            Ok(t) => t,
            Err(e) => {
                tracing::error!("Non-streaming fallback unusable: {}", e);
                self.publish(NormalizedEvent::error(e.to_string())).await;
                return;
            }
        };

        // Text already forwarded before the stream broke is not sent twice.
        let pending = match crate::str_utils::remainder_after(&text, &self.delivered) {
            Some(rest) => rest.to_string(),
            None => text,
        };
        for chunk in crate::str_utils::chunk_chars(&pending, FALLBACK_CHUNK_CHARS) {
            if !self.publish(NormalizedEvent::delta(chunk)).await {
                return;
            }
        }
        self.publish(NormalizedEvent::Done).await;
    }
}

/// Visible text of a non-streaming response, using the same precedence as the
/// streaming path. Raw upstream JSON is never forwarded.
pub fn fallback_text(payload: &UpstreamPayload) -> std::result::Result<String, RelayError> {
    match payload {
        UpstreamPayload::Json(value) => {
            if let Some(message) = upstream_error(value) {
                return Err(RelayError::UpstreamReported(message));
            }
            match extract_text(value) {
                Some(text) => Ok(text.to_string()),
                None => Err(RelayError::UpstreamReported(
                    "model responded without text".to_string(),
                )),
            }
        }
        UpstreamPayload::Text(text) if !text.trim().is_empty() => Ok(text.trim().to_string()),
        UpstreamPayload::Text(_) => Err(RelayError::UpstreamReported(
            "model responded without text".to_string(),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_fallback_text_precedence() {
        let chat = UpstreamPayload::Json(json!({"message": {"content": "full answer"}, "done": true}));
        assert_eq!(fallback_text(&chat).ok().as_deref(), Some("full answer"));

        let flat = UpstreamPayload::Json(json!({"response": "generated"}));
        assert_eq!(fallback_text(&flat).ok().as_deref(), Some("generated"));

        let raw = UpstreamPayload::Text("  plain body \n".to_string());
        assert_eq!(fallback_text(&raw).ok().as_deref(), Some("plain body"));
    }

    #[test]
    fn test_fallback_text_failures() {
        let empty = UpstreamPayload::Json(json!({"done": true, "eval_count": 3}));
        assert!(fallback_text(&empty).is_err());

        let reported = UpstreamPayload::Json(json!({"error": "model not found"}));
        match fallback_text(&reported) {
            Err(RelayError::UpstreamReported(m)) => assert_eq!(m, "model not found"),
            other => panic!("expected reported error, got {:?}", other),
        }

        assert!(fallback_text(&UpstreamPayload::Text("   ".into())).is_err());
    }
}
