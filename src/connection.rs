use crate::constants::{CLOSE_COMMAND, EVENT_QUEUE_CAPACITY, TRANSPORT_MESSAGE_FLOOR_BYTES};
use crate::main_helper::AppState;
use crate::session::SessionStore;
use crate::streaming::{ExchangeRequest, StreamHandler};
use crate::types::{
    ChatRequest, ConversationTurn, NormalizedEvent, ProtocolError, RelayError, Result,
    ServerFrame, SessionId,
};
use crate::upstream::UpstreamClient;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::Response;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::Instrument;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Open,
    AwaitingMessage,
    Streaming,
    Closing,
    Closed,
}

#[derive(Debug, Clone)]
pub struct ConnectionSettings {
    pub max_message_size: usize,
    pub default_model: String,
    pub api_key: Option<String>,
}

/// A decoded client frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    Ping,
    ClearHistory,
    Chat { model: String, user_message: String },
    Close,
}

/// Decodes one text frame. The size limit is checked before anything is parsed.
pub fn decode_frame(
    text: &str,
    settings: &ConnectionSettings,
) -> std::result::Result<Inbound, ProtocolError> {
    if text.len() > settings.max_message_size {
        return Err(ProtocolError::TooLarge);
    }
    if text.trim().eq_ignore_ascii_case(CLOSE_COMMAND) {
        return Ok(Inbound::Close);
    }

    let value: serde_json::Value =
        serde_json::from_str(text).map_err(|_| ProtocolError::Malformed)?;
    if !value.is_object() {
        return Err(ProtocolError::Malformed);
    }
    match value.get("type").and_then(|t| t.as_str()) {
        Some("ping") => return Ok(Inbound::Ping),
        Some("clear_history") => return Ok(Inbound::ClearHistory),
        _ => {}
    }

    let request: ChatRequest = serde_json::from_value(value).map_err(|_| ProtocolError::Malformed)?;
    if let Some(expected) = settings.api_key.as_deref() {
        if request.x_api_key.as_deref() != Some(expected) {
            return Err(ProtocolError::Unauthorized);
        }
    }
    let user_message = request
        .live_user_message()
        .ok_or(ProtocolError::MissingUserMessage)?
        .to_string();
    let model = match request.model.as_deref().map(str::trim) {
        Some(m) if !m.is_empty() => m.to_string(),
        _ => settings.default_model.clone(),
    };
    Ok(Inbound::Chat {
        model,
        user_message,
    })
}

/// How an exchange left the connection.
enum ExchangeEnd {
    Completed,
    Disconnected,
}

type Sender = SplitSink<WebSocket, Message>;
type Receiver = SplitStream<WebSocket>;

async fn send_frame(sender: &mut Sender, frame: &ServerFrame) -> Result<()> {
    let text = serde_json::to_string(frame)?;
    sender
        .send(Message::Text(text))
        .await
        .map_err(|e| RelayError::Transport(e.to_string()))?;
    Ok(())
}

/// Owns one client connection from accept to close.
pub struct ConnectionHandler {
    session_id: SessionId,
    sessions: Arc<SessionStore>,
    upstream: UpstreamClient,
    settings: ConnectionSettings,
    state: ConnectionState,
    /// A frame that arrived while an exchange was streaming.
    pending: Option<Message>,
}

impl ConnectionHandler {
    pub fn new(sessions: Arc<SessionStore>, upstream: UpstreamClient, settings: ConnectionSettings) -> Self {
        Self {
            session_id: SessionId::new(),
            sessions,
            upstream,
            settings,
            state: ConnectionState::Open,
            pending: None,
        }
    }

    pub fn session_id(&self) -> SessionId {
        self.session_id
    }

    fn transition(&mut self, next: ConnectionState) {
        tracing::trace!("Connection state {:?} -> {:?}", self.state, next);
        self.state = next;
    }

    pub async fn run(mut self, socket: WebSocket) {
        let (mut sender, mut receiver) = socket.split();
        self.sessions.get(self.session_id);
        tracing::info!("Client connected");
        self.transition(ConnectionState::AwaitingMessage);

        loop {
            let next = match self.pending.take() {
                Some(msg) => Some(Ok(msg)),
                None => receiver.next().await,
            };
            let msg = match next {
                Some(Ok(msg)) => msg,
                Some(Err(e)) => {
                    tracing::debug!("Receive failed: {}", e);
                    break;
                }
                None => break,
            };

            let text = match msg {
                Message::Text(text) => text,
                Message::Binary(bytes) => match String::from_utf8(bytes) {
                    Ok(text) => text,
                    Err(e) => {
                        let err = if e.as_bytes().len() > self.settings.max_message_size {
                            ProtocolError::TooLarge
                        } else {
                            ProtocolError::Malformed
                        };
                        if send_frame(&mut sender, &ServerFrame::from(&err)).await.is_err() {
                            break;
                        }
                        continue;
                    }
                },
                Message::Ping(_) | Message::Pong(_) => continue,
                Message::Close(_) => break,
            };

            let inbound = match decode_frame(&text, &self.settings) {
                Ok(inbound) => inbound,
                Err(err) => {
                    tracing::warn!("Rejected client frame: {}", err);
                    if send_frame(&mut sender, &ServerFrame::from(&err)).await.is_err() {
                        break;
                    }
                    continue;
                }
            };

            let sent = match inbound {
                Inbound::Ping => send_frame(&mut sender, &ServerFrame::Pong).await,
                Inbound::ClearHistory => {
                    self.sessions.clear(self.session_id);
                    tracing::info!("History cleared");
                    send_frame(&mut sender, &ServerFrame::HistoryCleared).await
                }
                Inbound::Close => {
                    self.transition(ConnectionState::Closing);
                    if let Err(e) = sender.send(Message::Close(None)).await {
                        tracing::debug!("Close frame not delivered: {}", e);
                    }
                    break;
                }
                Inbound::Chat {
                    model,
                    user_message,
                } => match self.exchange(&mut sender, &mut receiver, model, user_message).await {
                    ExchangeEnd::Completed => Ok(()),
                    ExchangeEnd::Disconnected => break,
                },
            };
            if let Err(e) = sent {
                tracing::debug!("Write failed: {}", e.inner);
                break;
            }
        }

        self.transition(ConnectionState::Closing);
        self.sessions.evict(self.session_id);
        self.transition(ConnectionState::Closed);
        tracing::info!("Client disconnected");
    }

    async fn exchange(
        &mut self,
        sender: &mut Sender,
        receiver: &mut Receiver,
        model: String,
        user_message: String,
    ) -> ExchangeEnd {
        self.transition(ConnectionState::Streaming);
        let mut messages = self.sessions.history(self.session_id);
        messages.push(ConversationTurn::user(user_message.clone()));
        tracing::info!("Chat request: model={} history={}", model, messages.len() - 1);

        let (tx, mut rx) = mpsc::channel(EVENT_QUEUE_CAPACITY);
        let worker = StreamHandler::spawn(self.upstream.clone(), ExchangeRequest { model, messages }, tx);
        let mut accumulated = String::new();

        let end = loop {
            tokio::select! {
                event = rx.recv() => {
                    let event = match event {
                        Some(event) => event,
                        None => NormalizedEvent::error("upstream worker ended unexpectedly"),
                    };
                    let terminal = event.is_terminal();
                    let frame = match event {
                        NormalizedEvent::Delta { text } => {
                            accumulated.push_str(&text);
                            ServerFrame::Delta { text }
                        }
                        NormalizedEvent::Done => self.commit(&user_message, &accumulated),
                        NormalizedEvent::Error { message } => ServerFrame::Error { error: message },
                    };
                    if let Err(e) = send_frame(sender, &frame).await {
                        tracing::info!("Client went away mid-stream: {}", e.inner);
                        worker.abort();
                        break ExchangeEnd::Disconnected;
                    }
                    if terminal {
                        break ExchangeEnd::Completed;
                    }
                }
                incoming = receiver.next() => {
                    match incoming {
                        Some(Ok(Message::Ping(_) | Message::Pong(_))) => {}
                        Some(Ok(Message::Close(_))) | Some(Err(_)) | None => {
                            tracing::info!("Client disconnected mid-stream; aborting exchange");
                            worker.abort();
                            break ExchangeEnd::Disconnected;
                        }
                        // The socket keeps being read so a disconnect is always seen;
                        // only the first early frame is kept.
                        Some(Ok(msg)) if self.pending.is_none() => self.pending = Some(msg),
                        Some(Ok(_)) => {
                            tracing::warn!("Dropping frame received while an answer is still streaming");
                        }
                    }
                }
            }
        };

        if matches!(end, ExchangeEnd::Completed) {
            self.transition(ConnectionState::AwaitingMessage);
        }
        end
    }

    /// Records the finished exchange. Returns the terminal frame to send.
    fn commit(&self, user_message: &str, accumulated: &str) -> ServerFrame {
        if accumulated.is_empty() {
            tracing::debug!("Exchange produced no text; history unchanged");
            return ServerFrame::Done;
        }
        match self.sessions.append_pair(
            self.session_id,
            ConversationTurn::user(user_message),
            ConversationTurn::assistant(accumulated),
        ) {
            Ok(retained) => {
                tracing::debug!("History now {} turns", retained);
                ServerFrame::Done
            }
            Err(e) => {
                tracing::error!("Failed to record exchange: {}", e);
                ServerFrame::Error {
                    error: e.inner.to_string(),
                }
            }
        }
    }
}

/// `GET /ws/chat`
pub async fn ws_chat(ws: WebSocketUpgrade, State(state): State<Arc<AppState>>) -> Response {
    let settings = state.args.connection_settings();
    let transport_limit = settings
        .max_message_size
        .saturating_mul(4)
        .max(TRANSPORT_MESSAGE_FLOOR_BYTES);
    let handler = ConnectionHandler::new(state.sessions.clone(), state.upstream.clone(), settings);
    let span = tracing::info_span!("connection", session = %handler.session_id().short());

    ws.max_message_size(transport_limit)
        .max_frame_size(transport_limit)
        .on_upgrade(move |socket| handler.run(socket).instrument(span))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings(max: usize, api_key: Option<&str>) -> ConnectionSettings {
        ConnectionSettings {
            max_message_size: max,
            default_model: "default-model".to_string(),
            api_key: api_key.map(str::to_string),
        }
    }

    #[test]
    fn test_control_frames() {
        let s = settings(1024, None);
        assert_eq!(decode_frame(r#"{"type":"ping"}"#, &s), Ok(Inbound::Ping));
        assert_eq!(
            decode_frame(r#"{"type":"clear_history"}"#, &s),
            Ok(Inbound::ClearHistory)
        );
        assert_eq!(decode_frame("  CLOSE \n", &s), Ok(Inbound::Close));
    }

    #[test]
    fn test_chat_frame_uses_default_model() {
        let s = settings(1024, None);
        let frame = r#"{"messages":[{"role":"user","content":"hello"}]}"#;
        assert_eq!(
            decode_frame(frame, &s),
            Ok(Inbound::Chat {
                model: "default-model".into(),
                user_message: "hello".into()
            })
        );

        let with_model = r#"{"model":"llama3","messages":[{"role":"user","content":"hi"}]}"#;
        assert!(matches!(
            decode_frame(with_model, &s),
            Ok(Inbound::Chat { model, .. }) if model == "llama3"
        ));
    }

    #[test]
    fn test_size_boundary() {
        let base = r#"{"type":"ping"}"#;
        let exact = settings(base.len(), None);
        assert_eq!(decode_frame(base, &exact), Ok(Inbound::Ping));

        let over = settings(base.len() - 1, None);
        assert_eq!(decode_frame(base, &over), Err(ProtocolError::TooLarge));
    }

    #[test]
    fn test_oversize_is_not_decoded() {
        let s = settings(4, None);
        assert_eq!(decode_frame("not json at all", &s), Err(ProtocolError::TooLarge));
    }

    #[test]
    fn test_malformed_frames() {
        let s = settings(1024, None);
        for frame in ["not json", "[1,2]", "\"text\"", r#"{"messages":"nope"}"#] {
            assert_eq!(decode_frame(frame, &s), Err(ProtocolError::Malformed), "{}", frame);
        }
    }

    #[test]
    fn test_missing_user_message() {
        let s = settings(1024, None);
        for frame in [
            r#"{}"#,
            r#"{"messages":[]}"#,
            r#"{"messages":[{"role":"assistant","content":"x"}]}"#,
            r#"{"messages":[{"role":"user","content":"  "}]}"#,
        ] {
            assert_eq!(
                decode_frame(frame, &s),
                Err(ProtocolError::MissingUserMessage),
                "{}",
                frame
            );
        }
    }

    #[test]
    fn test_api_key_gate() {
        let s = settings(1024, Some("secret"));
        let missing = r#"{"messages":[{"role":"user","content":"hi"}]}"#;
        assert_eq!(decode_frame(missing, &s), Err(ProtocolError::Unauthorized));

        let wrong = r#"{"x_api_key":"nope","messages":[{"role":"user","content":"hi"}]}"#;
        assert_eq!(decode_frame(wrong, &s), Err(ProtocolError::Unauthorized));

        let right = r#"{"x_api_key":"secret","messages":[{"role":"user","content":"hi"}]}"#;
        assert!(matches!(decode_frame(right, &s), Ok(Inbound::Chat { .. })));

        // Control frames need no key.
        assert_eq!(decode_frame(r#"{"type":"ping"}"#, &s), Ok(Inbound::Ping));
    }
}
