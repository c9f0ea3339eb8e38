pub const RETRYABLE_STATUS_CODES: &[u16] = &[429, 500, 502, 503, 504];

/// WebSocket route for chat sessions
pub const WS_CHAT_PATH: &str = "/ws/chat";

/// Upstream stream framing
pub const SSE_DATA_PREFIX: &str = "data:";
pub const STREAM_DONE_MARKER: &str = "[DONE]";
pub const MAX_UPSTREAM_LINE_BYTES: usize = 1024 * 1024;
pub const STREAM_ACCEPT_HEADER: &str = "text/event-stream, application/json";

/// Upstream model listing used by the health check
pub const UPSTREAM_TAGS_PATH: &str = "/api/tags";
pub const HEALTH_CHECK_TIMEOUT_SECS: u64 = 5;

/// Flat text fields, checked in order after the `message.content` envelope
pub const FLAT_TEXT_FIELDS: &[&str] = &["response", "response_text", "text", "output", "content"];

/// Fragments containing any of these are metadata, not model text
pub const META_KEYWORDS: &[&str] = &[
    "thinking",
    "tool",
    "images",
    "eval",
    "done_reason",
    "created_at",
];

/// Non-streaming fallback text is replayed to the client in chunks of this many characters
pub const FALLBACK_CHUNK_CHARS: usize = 80;

/// Capacity of the per-exchange event queue between the upstream worker and the connection
pub const EVENT_QUEUE_CAPACITY: usize = 64;

/// Upper bound on the background session sweep interval
pub const SESSION_SWEEP_MAX_SECS: u64 = 60;

/// Bare text frame asking the server to close the connection
pub const CLOSE_COMMAND: &str = "close";

/// Smallest WebSocket message the transport accepts, so oversize chat frames
/// still reach the handler and get a protocol error instead of a dropped socket
pub const TRANSPORT_MESSAGE_FLOOR_BYTES: usize = 64 * 1024;
