//! Server side of the `restream` protocol, plus a scriptable test double.
//!
//! [`StreamEmitter`] is the protocol contract: session ids, strictly
//! increasing chunk ids, status events during internal retries, and exactly
//! one terminal event. The axum server built by [`spawn_emitter`] plays a
//! [`Script`] through it and can inject a [`Fault`] per connection, which is
//! how the client's reconnect and dedup behavior is exercised end to end.
//!
//! # Quick start
//!
//! ```ignore
//! use restream_emitter::{EmitterConfig, Fault, spawn_emitter};
//!
//! let config = EmitterConfig {
//!     faults: vec![Fault::DropAfter(2), Fault::GatewayTimeout],
//!     replay_overlap: 1,
//!     ..Default::default()
//! };
//! let (addr, state) = spawn_emitter(config).await?;
//! println!("POST http://{addr}{}", restream_emitter::STREAM_PATH);
//! ```
//!
//! # Architecture
//!
//! ```text
//! client ──POST StreamRequest──▶ process_stream ──▶ session cache (id ─▶ StreamEmitter)
//!        ◀──data: frames────────  (replay after last_chunk_id, then new deltas, then terminal)
//! ```

pub mod emitter;
pub mod script;
mod server;

pub use emitter::{EmitterError, StreamEmitter, encode_frame};
pub use script::{Fault, Script, ScriptOutcome};
pub use server::{EmitterState, STREAM_PATH, build_router};

use std::net::SocketAddr;
use std::time::Duration;

/// Configuration for the test-double server.
pub struct EmitterConfig {
    /// Address to bind to. Default: `127.0.0.1:5001`.
    pub bind_addr: SocketAddr,
    pub script: Script,
    /// Per-connection faults, consumed in connection order.
    pub faults: Vec<Fault>,
    /// Chunks before `last_chunk_id` re-sent on resume. Default: 0.
    pub replay_overlap: u64,
    /// Pause before each frame. Default: none.
    pub frame_delay: Duration,
}

impl Default for EmitterConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([127, 0, 0, 1], 5001)),
            script: Script::default(),
            faults: Vec::new(),
            replay_overlap: 0,
            frame_delay: Duration::ZERO,
        }
    }
}

/// Spawn the server on a Tokio task.
///
/// Returns the bound address and a handle for inspecting received requests.
/// The server runs until the Tokio runtime shuts down.
pub async fn spawn_emitter(config: EmitterConfig) -> std::io::Result<(SocketAddr, EmitterState)> {
    let state = EmitterState::new(
        config.script,
        config.faults,
        config.replay_overlap,
        config.frame_delay,
    );
    let router = server::build_router(state.clone());
    let addr = server::start_server(router, config.bind_addr).await?;
    Ok((addr, state))
}
