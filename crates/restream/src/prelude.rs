//! Convenience re-exports for common `restream` types.
//!
//! ```ignore
//! use restream::prelude::*;
//! ```
//!
//! Covers running a session over HTTP with usage tracking and observers.
//! Decoder internals and classification helpers live in their modules.

// ── Requests ────────────────────────────────────────────────────────
pub use crate::{GenerationRequest, StreamRequest};

// ── Wire and transport ──────────────────────────────────────────────
pub use crate::api::decoder::{Event, EventDecoder, TaggedEvent};
pub use crate::api::retry::{Decision, Failure, FailureKind, ReconnectPolicy};
pub use crate::api::transport::{Connection, HttpTransport, Transport, TransportError};

// ── Usage ───────────────────────────────────────────────────────────
pub use crate::api::usage::{
    FileBackend, MemoryBackend, ModelPricing, Usage, UsageAggregator, UsageBackend, UsageStore,
    UsageTotals,
};

// ── Sessions ────────────────────────────────────────────────────────
pub use crate::session::{
    CompositeObserver, FailureReason, FnObserver, LoggingObserver, NoopObserver, Session,
    SessionConfig, SessionError, SessionEvent, SessionObserver, SessionStatus, StreamSession,
};

pub use tokio_util::sync::CancellationToken;
