//! Resumable event-stream client for long-running, token-generating requests.
//!
//! `restream` drives one logical generation over a chunked `text/event-stream`
//! response and keeps it alive across upstream disconnects, platform-imposed
//! gateway timeouts, and transient "overloaded" rejections. The core
//! abstraction is the [`StreamSession`](session::StreamSession): it opens the
//! transport, decodes events, reconnects with a continuation token when the
//! connection fails, drops fragments replayed after a reconnect, and returns
//! the reconstructed output together with the final token usage.
//!
//! # Getting started
//!
//! ```ignore
//! use restream::prelude::*;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), String> {
//!     let transport = HttpTransport::new("http://localhost:5001/api/process-stream")?;
//!     let store = UsageStore::open(FileBackend::new(".restream/usage.json"))?;
//!     let aggregator = UsageAggregator::new(std::sync::Arc::new(store));
//!
//!     let request = GenerationRequest::new("sk-...", "Turn these notes into a page.");
//!
//!     let session = StreamSession::new(&transport, SessionConfig::default())
//!         .with_observer(&LoggingObserver)
//!         .with_usage_aggregator(&aggregator)
//!         .run(request)
//!         .await
//!         .map_err(|e| e.to_string())?;
//!
//!     println!("{}", session.content);
//!     Ok(())
//! }
//! ```
//!
//! # Where to find things
//!
//! - **Wire format:** [`api::decoder`] turns raw bytes into [`Event`](api::decoder::Event)
//!   values, tolerating frames split across network reads.
//! - **Retry decisions:** [`api::retry`] classifies failures into
//!   [`FailureKind`](api::retry::FailureKind) and decides backoff via
//!   [`ReconnectPolicy`](api::retry::ReconnectPolicy).
//! - **Transport:** [`api::transport`] defines the [`Transport`](api::transport::Transport)
//!   seam and the reqwest-backed [`HttpTransport`](api::transport::HttpTransport).
//! - **Usage and cost:** [`api::usage`] holds [`UsageStore`](api::usage::UsageStore),
//!   its persistence backends, and [`UsageAggregator`](api::usage::UsageAggregator).
//! - **Orchestration:** [`session`] holds the [`Session`](session::Session)
//!   record, the state machine runner, and the observer trait.
//!
//! # Modules
//!
//! | Module | Description |
//! |--------|-------------|
//! | [`api`] | Event decoding, reconnect policy, HTTP transport, usage totals |
//! | [`session`] | Session record, state machine, observers, configuration |

pub mod api;
pub mod prelude;
pub mod session;

use serde::{Deserialize, Serialize};

// ── Constants ──────────────────────────────────────────────────────

/// Default model requested from the emitter.
pub const DEFAULT_MODEL: &str = "claude-3-7-sonnet-20250219";

/// Default output token ceiling.
pub const DEFAULT_MAX_TOKENS: u32 = 128_000;

/// Default extended-thinking token budget.
pub const DEFAULT_THINKING_BUDGET: u32 = 32_000;

/// Default sampling temperature.
pub const DEFAULT_TEMPERATURE: f32 = 1.0;

// ── Request types ──────────────────────────────────────────────────

/// The caller-supplied part of a generation request.
///
/// This is what the caller hands to
/// [`StreamSession::run()`](session::StreamSession::run). The session adds
/// the continuation fields ([`Continuation`]) itself on every reconnect.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct GenerationRequest {
    /// Credential forwarded to the upstream generator.
    pub api_key: String,
    /// Source text the generation works from.
    pub content: String,
    /// Additional formatting instructions.
    #[serde(rename = "format_prompt", default)]
    pub format_instructions: String,
    pub model: String,
    pub max_tokens: u32,
    pub temperature: f32,
    pub thinking_budget: u32,
}

impl GenerationRequest {
    /// Create a request with the default model and generation parameters.
    pub fn new(api_key: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            content: content.into(),
            format_instructions: String::new(),
            model: DEFAULT_MODEL.to_string(),
            max_tokens: DEFAULT_MAX_TOKENS,
            temperature: DEFAULT_TEMPERATURE,
            thinking_budget: DEFAULT_THINKING_BUDGET,
        }
    }

    pub fn with_format_instructions(mut self, instructions: impl Into<String>) -> Self {
        self.format_instructions = instructions.into();
        self
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = max_tokens;
        self
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }

    pub fn with_thinking_budget(mut self, budget: u32) -> Self {
        self.thinking_budget = budget;
        self
    }
}

/// Session-continuation fields attached to a reconnect.
///
/// All fields are omitted from the first request of a session.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq)]
pub struct Continuation {
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub session_id: Option<String>,
    #[serde(skip_serializing_if = "is_false", default)]
    pub is_reconnect: bool,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub last_chunk_id: Option<u64>,
}

fn is_false(v: &bool) -> bool {
    !*v
}

/// The full request body sent over the wire for one physical connection.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct StreamRequest {
    #[serde(flatten)]
    pub generation: GenerationRequest,
    #[serde(flatten)]
    pub continuation: Continuation,
}

impl StreamRequest {
    /// Body for the first connection of a session.
    pub fn initial(generation: GenerationRequest) -> Self {
        Self {
            generation,
            continuation: Continuation::default(),
        }
    }

    /// Body for a reconnect, carrying whatever continuation state is known.
    pub fn reconnect(
        generation: GenerationRequest,
        session_id: Option<String>,
        last_chunk_id: Option<u64>,
    ) -> Self {
        Self {
            generation,
            continuation: Continuation {
                session_id,
                is_reconnect: true,
                last_chunk_id,
            },
        }
    }

    pub fn is_reconnect(&self) -> bool {
        self.continuation.is_reconnect
    }
}
