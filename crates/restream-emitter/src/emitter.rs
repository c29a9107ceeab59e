//! The server side of the stream protocol.
//!
//! A [`StreamEmitter`] owns one logical session: it assigns the session id,
//! numbers every delta with a strictly increasing chunk id, remembers what it
//! sent so a reconnecting client can be resumed, and emits exactly one
//! terminal event. It produces encoded frames and does no I/O, so any server
//! can drive it.

use restream::api::usage::Usage;
use serde_json::{Value, json};

/// Encode one payload as a blank-line-terminated `data:` record.
pub fn encode_frame(payload: &Value) -> String {
    format!("data: {payload}\n\n")
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EmitterError {
    #[error("session {0} already sent its terminal event")]
    AlreadyFinished(String),
}

/// Per-session emitter state.
#[derive(Debug, Clone)]
pub struct StreamEmitter {
    session_id: String,
    /// Every delta sent so far, by chunk id.
    chunks: Vec<(u64, String)>,
    terminal: Option<String>,
}

impl Default for StreamEmitter {
    fn default() -> Self {
        Self::new()
    }
}

impl StreamEmitter {
    /// Start a session with a fresh random id.
    pub fn new() -> Self {
        Self::with_session_id(uuid::Uuid::new_v4().simple().to_string())
    }

    pub fn with_session_id(session_id: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            chunks: Vec::new(),
            terminal: None,
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn last_chunk_id(&self) -> Option<u64> {
        self.chunks.last().map(|(id, _)| *id)
    }

    /// Number of deltas emitted so far.
    pub fn emitted(&self) -> usize {
        self.chunks.len()
    }

    pub fn is_finished(&self) -> bool {
        self.terminal.is_some()
    }

    /// The terminal frame, once one was emitted.
    pub fn terminal_frame(&self) -> Option<&str> {
        self.terminal.as_deref()
    }

    fn frame(&self, mut payload: Value) -> String {
        payload["session_id"] = Value::String(self.session_id.clone());
        encode_frame(&payload)
    }

    fn ensure_open(&self) -> Result<(), EmitterError> {
        if self.is_finished() {
            return Err(EmitterError::AlreadyFinished(self.session_id.clone()));
        }
        Ok(())
    }

    pub fn start(&self, message: &str) -> String {
        self.frame(json!({"type": "start", "message": message}))
    }

    /// Emit the next content fragment under a new chunk id.
    pub fn delta(&mut self, text: &str) -> Result<String, EmitterError> {
        self.ensure_open()?;
        let chunk_id = self.last_chunk_id().map_or(1, |id| id + 1);
        self.chunks.push((chunk_id, text.to_string()));
        Ok(self.delta_frame(chunk_id, text))
    }

    fn delta_frame(&self, chunk_id: u64, text: &str) -> String {
        self.frame(json!({"type": "delta", "content": text, "chunk_id": chunk_id}))
    }

    pub fn thinking(&self, text: &str) -> String {
        self.frame(json!({"type": "thinking_update", "thinking": {"content": text}}))
    }

    /// Informational status while the emitter retries its own upstream.
    pub fn status(&self, message: &str, retry: Option<u32>, max_retries: Option<u32>) -> String {
        let mut payload = json!({"type": "status", "message": message});
        if let Some(retry) = retry {
            payload["retry"] = json!(retry);
        }
        if let Some(max) = max_retries {
            payload["max_retries"] = json!(max);
        }
        self.frame(payload)
    }

    /// Ask the client to reconnect, e.g. ahead of a platform timeout.
    pub fn reconnect(&self) -> String {
        self.frame(json!({"type": "reconnect"}))
    }

    /// Terminal success.
    pub fn complete(
        &mut self,
        usage: &Usage,
        message_id: &str,
        html: Option<&str>,
    ) -> Result<String, EmitterError> {
        self.ensure_open()?;
        let mut payload = json!({
            "type": "message_complete",
            "message_id": message_id,
            "usage": usage,
        });
        if let Some(html) = html {
            payload["html"] = json!(html);
        }
        let frame = self.frame(payload);
        self.terminal = Some(frame.clone());
        Ok(frame)
    }

    /// Terminal failure.
    pub fn error(&mut self, message: &str, code: Option<u16>) -> Result<String, EmitterError> {
        self.ensure_open()?;
        let mut payload = json!({"type": "error", "error": message});
        if let Some(code) = code {
            payload["code"] = json!(code);
        }
        let frame = self.frame(payload);
        self.terminal = Some(frame.clone());
        Ok(frame)
    }

    /// Re-encode the deltas a reconnecting client has not acknowledged.
    ///
    /// `overlap` extra chunks before `last_chunk_id` are included too, which
    /// the client must drop as duplicates.
    pub fn replay_after(&self, last_chunk_id: Option<u64>, overlap: u64) -> Vec<String> {
        let from = last_chunk_id.unwrap_or(0).saturating_sub(overlap);
        self.chunks
            .iter()
            .filter(|(id, _)| *id > from)
            .map(|(id, text)| self.delta_frame(*id, text))
            .collect()
    }
}
