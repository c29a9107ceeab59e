//! Incremental decoder for the generation event stream.
//!
//! The wire format is a line-oriented, blank-line-terminated record per
//! event. The payload line carries a `data:` marker followed by a JSON
//! object keyed by `type`:
//!
//! ```text
//! data: {"type":"delta","content":"<ht","chunk_id":1,"session_id":"s-1"}
//!
//! data: {"type":"message_complete","usage":{"input_tokens":10,"output_tokens":3}}
//!
//! ```
//!
//! [`EventDecoder`] buffers bytes between network reads and only decodes a
//! record once its terminating blank line has arrived, so records (and
//! multi-byte characters) split across reads decode correctly. Records that
//! are not valid UTF-8, or whose payload is not valid JSON, are logged and
//! dropped; unknown `type` values come through as [`Event::Other`].

use serde::Deserialize;
use tracing::{debug, trace, warn};

use crate::api::usage::Usage;

/// A decoded protocol event.
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    /// The emitter accepted the request and started generating.
    Start { message: Option<String> },
    /// A content fragment. `chunk_id` is absent for emitters that do not
    /// support replay deduplication.
    Delta { text: String, chunk_id: Option<u64> },
    /// Incremental reasoning text (display only).
    ThinkingUpdate { text: String },
    /// Informational status, e.g. the emitter retrying an overloaded upstream.
    Status {
        message: String,
        retry_index: Option<u32>,
        max_retries: Option<u32>,
    },
    /// The full output in one piece, sent ahead of the terminal
    /// completion by emitters that do not stream deltas.
    ContentComplete { html: String, usage: Option<Usage> },
    /// Terminal success with the final token usage.
    Completion {
        usage: Usage,
        message_id: Option<String>,
        html: Option<String>,
    },
    /// Terminal failure reported by the emitter.
    Error { message: String, code: Option<u16> },
    /// End-of-stream marker.
    End { message: Option<String> },
    /// The emitter asks the client to reconnect (typically ahead of a
    /// platform timeout).
    Reconnect,
    /// Any record whose `type` is outside the known vocabulary.
    Other { kind: String },
}

impl Event {
    /// Whether this event ends the logical session.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Event::Completion { .. } | Event::Error { .. } | Event::End { .. }
        )
    }

    /// Convenience accessor for `Delta` text.
    pub fn as_text_delta(&self) -> Option<&str> {
        match self {
            Event::Delta { text, .. } => Some(text.as_str()),
            _ => None,
        }
    }
}

/// An [`Event`] plus the envelope fields shared by every payload.
#[derive(Debug, Clone, PartialEq)]
pub struct TaggedEvent {
    pub event: Event,
    /// Session identifier assigned by the emitter, if this record carried one.
    pub session_id: Option<String>,
}

impl TaggedEvent {
    pub fn new(event: Event) -> Self {
        Self {
            event,
            session_id: None,
        }
    }
}

/// Raw JSON payload. Every field is optional because the vocabulary
/// accepts several aliases for the same event.
#[derive(Deserialize, Debug, Default)]
struct RawEvent {
    #[serde(rename = "type")]
    kind: Option<String>,
    message: Option<String>,
    content: Option<serde_json::Value>,
    text: Option<String>,
    delta: Option<RawDelta>,
    thinking: Option<RawThinking>,
    chunk_id: Option<serde_json::Value>,
    session_id: Option<String>,
    retry: Option<u32>,
    max_retries: Option<u32>,
    usage: Option<Usage>,
    message_id: Option<String>,
    html: Option<String>,
    error: Option<serde_json::Value>,
    code: Option<serde_json::Value>,
}

#[derive(Deserialize, Debug)]
struct RawDelta {
    text: Option<String>,
    content: Option<String>,
}

#[derive(Deserialize, Debug)]
struct RawThinking {
    content: Option<String>,
}

/// Buffered, incremental decoder for one transport connection at a time.
#[derive(Debug, Default)]
pub struct EventDecoder {
    buffer: Vec<u8>,
    /// Offset from which the next delimiter search starts; bytes before it
    /// are known not to contain a record terminator.
    scan_from: usize,
}

impl EventDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append raw bytes from the transport.
    pub fn push(&mut self, bytes: &[u8]) {
        self.buffer.extend_from_slice(bytes);
    }

    /// Decode the next complete record, if one is buffered.
    ///
    /// Records that carry no payload (comments, keepalives without `data:`)
    /// and malformed payloads are skipped.
    pub fn next_event(&mut self) -> Option<TaggedEvent> {
        while let Some((record_end, consumed)) = find_record_end(&self.buffer, self.scan_from) {
            let record: Vec<u8> = self.buffer.drain(..consumed).collect();
            self.scan_from = 0;
            if let Some(event) = parse_record(&record[..record_end]) {
                return Some(event);
            }
        }
        // A terminator can straddle the boundary of the next read.
        self.scan_from = self.buffer.len().saturating_sub(2);
        None
    }

    /// Push `bytes` and collect every event that became complete.
    pub fn feed(&mut self, bytes: &[u8]) -> Vec<TaggedEvent> {
        self.push(bytes);
        let mut events = Vec::new();
        while let Some(event) = self.next_event() {
            events.push(event);
        }
        events
    }

    /// Forget any undelimited trailing bytes at the end of a connection.
    ///
    /// The decoder never carries partial records across connections; a
    /// reconnect replays from the last accepted chunk instead. Returns the
    /// number of bytes discarded.
    pub fn end_connection(&mut self) -> usize {
        let dropped = self.buffer.len();
        if dropped > 0 {
            debug!("Discarding {dropped} undelimited byte(s) at connection end");
        }
        self.buffer.clear();
        self.scan_from = 0;
        dropped
    }

    /// Number of bytes buffered but not yet part of a complete record.
    pub fn pending_bytes(&self) -> usize {
        self.buffer.len()
    }
}

/// Find the first blank-line terminator at or after `from`.
///
/// Returns `(record_end, consumed)`: the record occupies `buf[..record_end]`
/// and `consumed` bytes (record plus terminator) should be drained.
fn find_record_end(buf: &[u8], from: usize) -> Option<(usize, usize)> {
    let mut i = from;
    while i < buf.len() {
        if buf[i] == b'\n' {
            match (buf.get(i + 1), buf.get(i + 2)) {
                (Some(b'\n'), _) => return Some((i, i + 2)),
                (Some(b'\r'), Some(b'\n')) => return Some((i, i + 3)),
                _ => {}
            }
        }
        i += 1;
    }
    None
}

/// Parse one record (without its terminator) into an event.
fn parse_record(record: &[u8]) -> Option<TaggedEvent> {
    let text = match std::str::from_utf8(record) {
        Ok(text) => text,
        Err(e) => {
            warn!("Dropping record with invalid UTF-8: {e}");
            return None;
        }
    };
    let mut data_lines: Vec<&str> = Vec::new();
    let mut event_name: Option<&str> = None;

    for line in text.split('\n') {
        let line = line.strip_suffix('\r').unwrap_or(line);
        if line.is_empty() || line.starts_with(':') {
            continue;
        }
        if let Some(data) = line.strip_prefix("data:") {
            data_lines.push(data.strip_prefix(' ').unwrap_or(data));
        } else if let Some(name) = line.strip_prefix("event:") {
            event_name = Some(name.trim());
        }
    }

    if data_lines.is_empty() {
        trace!("Skipping record without payload");
        return None;
    }

    let payload = data_lines.join("\n");
    if payload.trim() == "[DONE]" {
        return Some(TaggedEvent::new(Event::End {
            message: Some("[DONE]".into()),
        }));
    }

    match serde_json::from_str::<RawEvent>(&payload) {
        Ok(raw) => {
            let tagged = interpret(raw, event_name);
            trace!("Decoded event: {:?}", tagged.event);
            Some(tagged)
        }
        Err(e) => {
            warn!("Dropping malformed event payload: {e}, data: {payload}");
            None
        }
    }
}

/// Map a raw payload onto the closed [`Event`] vocabulary.
fn interpret(raw: RawEvent, event_name: Option<&str>) -> TaggedEvent {
    let kind = raw
        .kind
        .clone()
        .or_else(|| event_name.map(str::to_string))
        .unwrap_or_default();

    let event = match kind.as_str() {
        "start" | "stream_start" | "message_start" => Event::Start {
            message: raw.message,
        },
        "delta" | "content_block_delta" | "content" | "chunk" | "deployment_note" => {
            let chunk_id = raw.chunk_id.as_ref().and_then(parse_chunk_id);
            let text = content_string(&raw.content)
                .or(raw.text)
                .or_else(|| raw.delta.and_then(|d| d.text.or(d.content)));
            match text {
                Some(text) => Event::Delta { text, chunk_id },
                None => {
                    warn!("Delta event without text (chunk_id={chunk_id:?}); ignoring");
                    Event::Other { kind: kind.clone() }
                }
            }
        }
        "thinking_update" => {
            let text = raw
                .thinking
                .and_then(|t| t.content)
                .or_else(|| content_string(&raw.content))
                .unwrap_or_default();
            Event::ThinkingUpdate { text }
        }
        "status" | "info" => Event::Status {
            message: raw.message.unwrap_or_default(),
            retry_index: raw.retry,
            max_retries: raw.max_retries,
        },
        "content_complete" => match content_string(&raw.content).or(raw.html) {
            Some(html) => Event::ContentComplete {
                html,
                usage: raw.usage,
            },
            None => {
                warn!("content_complete without content; ignoring");
                Event::Other { kind: kind.clone() }
            }
        },
        "message_complete" | "complete" | "usage" => Event::Completion {
            usage: raw.usage.unwrap_or_default(),
            message_id: raw.message_id,
            html: raw.html,
        },
        "error" => Event::Error {
            message: error_message(raw.error.as_ref())
                .or(raw.message)
                .unwrap_or_else(|| "unknown error".to_string()),
            code: raw.code.as_ref().and_then(parse_code),
        },
        "end" | "stream_end" => Event::End {
            message: raw.message,
        },
        "reconnect" => Event::Reconnect,
        _ => Event::Other { kind: kind.clone() },
    };

    TaggedEvent {
        event,
        session_id: raw.session_id.filter(|s| !s.is_empty()),
    }
}

fn content_string(value: &Option<serde_json::Value>) -> Option<String> {
    value.as_ref().and_then(|v| v.as_str()).map(str::to_string)
}

/// Chunk ids are numbers, numeric strings, or `"<session>_<n>"` strings.
fn parse_chunk_id(value: &serde_json::Value) -> Option<u64> {
    match value {
        serde_json::Value::Number(n) => n.as_u64(),
        serde_json::Value::String(s) => s
            .parse()
            .ok()
            .or_else(|| s.rsplit('_').next().and_then(|tail| tail.parse().ok())),
        _ => None,
    }
}

fn parse_code(value: &serde_json::Value) -> Option<u16> {
    match value {
        serde_json::Value::Number(n) => n.as_u64().and_then(|c| u16::try_from(c).ok()),
        serde_json::Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// `error` is either a plain string or an object with a `message` field.
fn error_message(value: Option<&serde_json::Value>) -> Option<String> {
    match value? {
        serde_json::Value::String(s) => Some(s.clone()),
        serde_json::Value::Object(obj) => obj
            .get("message")
            .and_then(|m| m.as_str())
            .map(str::to_string),
        _ => None,
    }
}
