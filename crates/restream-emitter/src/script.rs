//! What the test-double server generates, and how each connection misbehaves.

use restream::api::usage::Usage;

/// How a scripted generation ends.
#[derive(Debug, Clone, PartialEq)]
pub enum ScriptOutcome {
    Complete { usage: Usage, html: Option<String> },
    Error { message: String, code: Option<u16> },
}

/// The generation every session on the server plays back.
#[derive(Debug, Clone, PartialEq)]
pub struct Script {
    pub fragments: Vec<String>,
    /// Reasoning updates sent at the start of a fresh session.
    pub thinking: Vec<String>,
    pub outcome: ScriptOutcome,
}

impl Script {
    /// A script that streams `fragments` and completes with `usage`.
    pub fn completing(fragments: &[&str], usage: Usage) -> Self {
        Self {
            fragments: fragments.iter().map(|f| f.to_string()).collect(),
            thinking: Vec::new(),
            outcome: ScriptOutcome::Complete { usage, html: None },
        }
    }

    pub fn with_thinking(mut self, thinking: &[&str]) -> Self {
        self.thinking = thinking.iter().map(|t| t.to_string()).collect();
        self
    }

    pub fn with_outcome(mut self, outcome: ScriptOutcome) -> Self {
        self.outcome = outcome;
        self
    }

    /// The full content a client should reconstruct.
    pub fn expected_content(&self) -> String {
        self.fragments.concat()
    }
}

impl Default for Script {
    fn default() -> Self {
        Self::completing(
            &["<html>", "<body>", "hello", "</body>", "</html>"],
            Usage {
                input_tokens: 12,
                output_tokens: 5,
                thinking_tokens: 0,
                elapsed_seconds: Some(0.1),
                total_cost: None,
            },
        )
    }
}

/// Misbehavior for one connection. Consumed in connection order; once the
/// list runs out every connection is [`Fault::Healthy`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fault {
    Healthy,
    /// Abort the body with an I/O error after `n` new deltas.
    DropAfter(usize),
    /// End the body cleanly, without a terminal event, after `n` new deltas.
    CloseAfter(usize),
    /// Send a `reconnect` event after `n` new deltas, then close.
    RequestReconnect(usize),
    /// Send `statuses` overload status events, then close.
    Overloaded { statuses: u32 },
    /// Answer `504` with a timeout marker and the session id.
    GatewayTimeout,
    /// Answer with this status code and no stream.
    Reject(u16),
}

impl Fault {
    /// Deltas this connection may send before it breaks, if it breaks.
    pub fn delta_limit(self) -> Option<usize> {
        match self {
            Fault::DropAfter(n) | Fault::CloseAfter(n) | Fault::RequestReconnect(n) => Some(n),
            _ => None,
        }
    }
}
