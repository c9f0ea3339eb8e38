//! Upstream payload normalization.
//!
//! Generation backends answer in several shapes: Ollama chat envelopes
//! (`{"message":{"content":..},"done":..}`), generate-style flat fields
//! (`{"response":..}`), OpenAI-style `choices[].delta`, SSE `data:` framing and
//! bare text lines. Everything here collapses those into [`LineEvent`]s, which the
//! stream handler turns into client-facing [`crate::types::NormalizedEvent`]s.

use crate::constants::{FLAT_TEXT_FIELDS, META_KEYWORDS, SSE_DATA_PREFIX, STREAM_DONE_MARKER};
use serde_json::Value;

/// Classification of a single upstream line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LineEvent {
    /// Blank line or a payload without user-visible text.
    Skip,
    Delta(String),
    /// Payload declared `done: true`; carries its text, if any, to flush before `Done`.
    Final(Option<String>),
    /// Literal stream terminator.
    Done,
    /// The backend reported an error inside the stream.
    Error(String),
}

fn non_empty_str(v: Option<&Value>) -> Option<&str> {
    v.and_then(|v| v.as_str()).filter(|s| !s.is_empty())
}

/// Returns the user-visible text carried by `payload`, following the fixed
/// precedence: chat envelope, flat fields, `choices[].delta`, `choices[].text`.
/// Fields outside that list (reasoning traces, tool calls, timings) are never read.
pub fn extract_text(payload: &Value) -> Option<&str> {
    if let Some(content) = non_empty_str(payload.get("message").and_then(|m| m.get("content"))) {
        return Some(content);
    }

    for key in FLAT_TEXT_FIELDS {
        if let Some(v) = non_empty_str(payload.get(*key)) {
            return Some(v);
        }
    }

    let choices = payload.get("choices").and_then(|c| c.as_array())?;
    for choice in choices {
        if let Some(delta) = choice.get("delta") {
            let found = non_empty_str(delta.get("content")).or_else(|| non_empty_str(delta.get("text")));
            if found.is_some() {
                return found;
            }
        }
    }
    choices.iter().find_map(|c| non_empty_str(c.get("text")))
}

pub fn is_done(payload: &Value) -> bool {
    payload.get("done").and_then(|d| d.as_bool()) == Some(true)
}

/// Error message carried by an upstream payload, e.g. `{"error":"model not found"}`
/// or `{"error":{"message":".."}}`.
pub fn upstream_error(payload: &Value) -> Option<String> {
    match payload.get("error")? {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Object(obj) => Some(match non_empty_str(obj.get("message")) {
            Some(m) => m.to_string(),
            None => Value::Object(obj.clone()).to_string(),
        }),
        _ => None,
    }
}

fn is_punctuation_or_control(c: char) -> bool {
    c.is_control()
        || c.is_ascii_punctuation()
        || matches!(
            c,
            '。' | '，' | '、' | '！' | '？' | '：' | '；' | '…' | '—' | '–' | '·'
                | '「' | '」' | '『' | '』' | '（' | '）' | '《' | '》' | '【' | '】'
                | '“' | '”' | '‘' | '’' | '¡' | '¿' | '«' | '»'
                | '\u{200b}' | '\u{feff}'
        )
}

/// Token-level fragments are forwarded only when they hold something a person
/// would read. Single CJK characters pass; bare punctuation and metadata do not.
pub fn is_visible_fragment(fragment: &str) -> bool {
    let trimmed = fragment.trim();
    if trimmed.is_empty() || trimmed.chars().all(is_punctuation_or_control) {
        return false;
    }
    let lower = trimmed.to_lowercase();
    !META_KEYWORDS.iter().any(|k| lower.contains(k))
}

/// Token streams without a content envelope put each fragment in `token` (or a
/// top-level string `delta`).
fn token_fragment(payload: &Value) -> Option<&str> {
    non_empty_str(payload.get("token")).or_else(|| non_empty_str(payload.get("delta")))
}

/// Classifies one raw upstream line. SSE framing is stripped first; the
/// terminator ends the stream; anything that is not JSON is forwarded verbatim.
pub fn parse_line(raw: &str) -> LineEvent {
    let line = raw.trim();
    let data = match line.strip_prefix(SSE_DATA_PREFIX) {
        Some(rest) => rest.trim(),
        None => line,
    };
    if data.is_empty() {
        return LineEvent::Skip;
    }
    if data == STREAM_DONE_MARKER {
        return LineEvent::Done;
    }

    let payload: Value = match serde_json::from_str(data) {
        Ok(v) => v,
        Err(_) => return LineEvent::Delta(data.to_string()),
    };

    match &payload {
        Value::Object(_) => {}
        Value::String(s) if !s.is_empty() => return LineEvent::Delta(s.clone()),
        Value::Number(_) | Value::Bool(_) => return LineEvent::Delta(data.to_string()),
        _ => return LineEvent::Skip,
    }

    if let Some(message) = upstream_error(&payload) {
        return LineEvent::Error(message);
    }
    if is_done(&payload) {
        return LineEvent::Final(extract_text(&payload).map(str::to_string));
    }
    if let Some(text) = extract_text(&payload) {
        return LineEvent::Delta(text.to_string());
    }
    match token_fragment(&payload) {
        Some(fragment) if is_visible_fragment(fragment) => LineEvent::Delta(fragment.to_string()),
        _ => {
            let snippet = crate::str_utils::prefix_chars(data, 200);
            tracing::trace!("[STREAM] skipping non-visible payload: {}", snippet);
            LineEvent::Skip
        }
    }
}
