//! One logical generation spanning any number of physical connections.
//!
//! [`StreamSession`] drives the state machine; [`Session`] is the record it
//! owns and returns. Side effects (printing, progress UI) go to an injected
//! [`SessionObserver`].
//!
//! ```text
//! Idle ─▶ Connecting ─▶ Streaming ─┬─▶ Completed
//!              ▲                   ├─▶ Failed(reason)
//!              └── Reconnecting ◀──┘
//! ```

pub mod config;
pub mod events;
pub mod runner;

pub use config::SessionConfig;
pub use events::{
    CompositeObserver, FnObserver, LoggingObserver, NoopObserver, SessionEvent, SessionObserver,
};
pub use runner::StreamSession;

use std::fmt;

use crate::api::retry::Failure;
use crate::api::usage::Usage;

// ── Status ─────────────────────────────────────────────────────────

/// Why a session ended in [`SessionStatus::Failed`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FailureReason {
    /// The emitter reported an error, or the request was rejected outright.
    #[error("unrecoverable failure: {message}")]
    Unrecoverable { message: String, code: Option<u16> },
    /// Every allowed reconnect was used up.
    #[error("gave up after {attempts} reconnect attempt(s)")]
    RetryExhausted { attempts: u32 },
    /// The caller cancelled the session.
    #[error("cancelled")]
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum SessionStatus {
    #[default]
    Idle,
    Connecting,
    Streaming,
    Reconnecting,
    Completed,
    Failed(FailureReason),
}

impl SessionStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionStatus::Completed | SessionStatus::Failed(_))
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionStatus::Idle => write!(f, "idle"),
            SessionStatus::Connecting => write!(f, "connecting"),
            SessionStatus::Streaming => write!(f, "streaming"),
            SessionStatus::Reconnecting => write!(f, "reconnecting"),
            SessionStatus::Completed => write!(f, "completed"),
            SessionStatus::Failed(reason) => write!(f, "failed ({reason})"),
        }
    }
}

// ── Session ────────────────────────────────────────────────────────

/// Outcome of offering a fragment to [`Session::accept_fragment`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FragmentOutcome {
    Appended,
    /// Replay of a chunk at or below `last_chunk_id`.
    Duplicate { last_chunk_id: u64 },
}

/// State of one logical session.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Session {
    /// Emitter-assigned identifier, carried on every reconnect.
    pub session_id: Option<String>,
    /// Id of the last fragment appended to `content`.
    pub last_chunk_id: Option<u64>,
    /// Reconnects since the last accepted fragment.
    pub reconnect_attempts: u32,
    /// Reconstructed output. Append-only except on a session reset.
    pub content: String,
    /// Accumulated reasoning text, for display.
    pub thinking: String,
    pub status: SessionStatus,
    /// Final usage, set once by the completion event.
    pub usage: Option<Usage>,
    pub message_id: Option<String>,
    /// Physical connections opened so far.
    pub connections: u32,
    /// Whether any delta so far carried a chunk id.
    pub saw_chunk_ids: bool,
    /// Fragments appended so far (across connections).
    pub fragments: u64,
    /// Whole output announced by a `content_complete` event, used when
    /// nothing was streamed.
    pub final_html: Option<String>,
}

impl Session {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a fragment unless it is a replay of an already-appended chunk.
    ///
    /// Fragments without a chunk id are always appended.
    pub fn accept_fragment(&mut self, text: &str, chunk_id: Option<u64>) -> FragmentOutcome {
        if let (Some(id), Some(last)) = (chunk_id, self.last_chunk_id)
            && id <= last
        {
            return FragmentOutcome::Duplicate { last_chunk_id: last };
        }
        self.content.push_str(text);
        self.fragments += 1;
        if let Some(id) = chunk_id {
            self.last_chunk_id = Some(id);
            self.saw_chunk_ids = true;
        }
        self.reconnect_attempts = 0;
        FragmentOutcome::Appended
    }

    /// Discard streamed output and adopt a new session id.
    pub fn reset(&mut self, session_id: String) {
        self.content.clear();
        self.thinking.clear();
        self.last_chunk_id = None;
        self.saw_chunk_ids = false;
        self.fragments = 0;
        self.final_html = None;
        self.session_id = Some(session_id);
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}

// ── SessionError ───────────────────────────────────────────────────

/// A session that ended in [`SessionStatus::Failed`].
///
/// Carries the partial [`Session`] so content streamed before the failure is
/// not lost.
#[derive(Debug, thiserror::Error)]
#[error("{message}")]
pub struct SessionError {
    pub reason: FailureReason,
    pub message: String,
    /// The last classified transport or emitter failure.
    #[source]
    pub last_failure: Option<Failure>,
    pub session: Box<Session>,
}

impl SessionError {
    pub fn partial_content(&self) -> &str {
        &self.session.content
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dedup_is_idempotent_under_replay() {
        let mut session = Session::new();
        let stream = [
            (1, "a"),
            (2, "b"),
            (1, "a"),
            (2, "b"),
            (3, "c"),
            (2, "b"),
            (3, "c"),
            (4, "d"),
        ];
        for (id, text) in stream {
            session.accept_fragment(text, Some(id));
        }
        assert_eq!(session.content, "abcd");
        assert_eq!(session.last_chunk_id, Some(4));
        assert_eq!(session.fragments, 4);
    }

    #[test]
    fn duplicate_reports_last_chunk() {
        let mut session = Session::new();
        assert_eq!(session.accept_fragment("AB", Some(1)), FragmentOutcome::Appended);
        assert_eq!(
            session.accept_fragment("AB", Some(1)),
            FragmentOutcome::Duplicate { last_chunk_id: 1 }
        );
    }

    #[test]
    fn fragments_without_ids_always_append() {
        let mut session = Session::new();
        session.accept_fragment("x", None);
        session.accept_fragment("x", None);
        assert_eq!(session.content, "xx");
        assert!(session.last_chunk_id.is_none());
        assert!(!session.saw_chunk_ids);
    }

    #[test]
    fn accepted_fragment_resets_reconnect_attempts() {
        let mut session = Session {
            reconnect_attempts: 3,
            ..Default::default()
        };
        session.accept_fragment("x", Some(1));
        assert_eq!(session.reconnect_attempts, 0);
    }

    #[test]
    fn reset_clears_stream_state() {
        let mut session = Session::new();
        session.session_id = Some("old".into());
        session.accept_fragment("abc", Some(5));
        session.thinking.push_str("hmm");
        session.final_html = Some("<p>old</p>".into());
        session.reset("new".into());
        assert!(session.content.is_empty());
        assert!(session.final_html.is_none());
        assert!(session.thinking.is_empty());
        assert_eq!(session.last_chunk_id, None);
        assert_eq!(session.session_id.as_deref(), Some("new"));
        assert_eq!(session.accept_fragment("z", Some(1)), FragmentOutcome::Appended);
    }

    #[test]
    fn terminal_statuses() {
        assert!(SessionStatus::Completed.is_terminal());
        assert!(SessionStatus::Failed(FailureReason::Cancelled).is_terminal());
        assert!(!SessionStatus::Reconnecting.is_terminal());
        assert_eq!(
            SessionStatus::Failed(FailureReason::RetryExhausted { attempts: 2 }).to_string(),
            "failed (gave up after 2 reconnect attempt(s))"
        );
    }
}
