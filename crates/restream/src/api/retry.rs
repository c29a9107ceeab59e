//! Failure classification and reconnect backoff.
//!
//! Classifies transport failures into a [`FailureKind`] and decides, via the
//! stateless [`ReconnectPolicy`], whether and when to reconnect. Overload
//! (`529` / "overloaded") backs off from a longer base delay than plain
//! network errors. Authentication and validation failures (`400`, `401`,
//! `403`, `404`, `422`) are never retried.
//!
//! The status codes and message substrings matched here are a compatibility
//! contract with existing emitters. Keep them as they are.

use std::fmt;
use std::sync::LazyLock;
use std::time::Duration;

use regex::Regex;

/// Why a connection attempt or an open connection failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailureKind {
    /// Connection reset, refused, or a read error mid-body.
    TransientNetwork,
    /// The upstream generator reported it is overloaded.
    UpstreamOverloaded,
    /// An infrastructure timeout cut the response short.
    GatewayTimeout,
    /// Authentication/validation failures and emitter-reported errors.
    Unrecoverable,
}

impl FailureKind {
    pub fn is_recoverable(self) -> bool {
        !matches!(self, FailureKind::Unrecoverable)
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureKind::TransientNetwork => write!(f, "transient network failure"),
            FailureKind::UpstreamOverloaded => write!(f, "upstream overloaded"),
            FailureKind::GatewayTimeout => write!(f, "gateway timeout"),
            FailureKind::Unrecoverable => write!(f, "unrecoverable failure"),
        }
    }
}

/// A classified failure with its human-readable detail.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Failure {
    pub kind: FailureKind,
    pub detail: String,
}

impl Failure {
    pub fn new(kind: FailureKind, detail: impl Into<String>) -> Self {
        Self {
            kind,
            detail: detail.into(),
        }
    }
}

impl fmt::Display for Failure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.detail)
    }
}

impl std::error::Error for Failure {}

/// Outcome of [`ReconnectPolicy::decide`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Decision {
    pub retry: bool,
    pub delay: Duration,
}

impl Decision {
    fn give_up() -> Self {
        Self {
            retry: false,
            delay: Duration::ZERO,
        }
    }
}

/// Backoff configuration and the pure reconnect decision.
#[derive(Debug, Clone, PartialEq)]
pub struct ReconnectPolicy {
    /// Maximum number of reconnects after the initial connection.
    pub max_attempts: u32,
    /// Delay before the first reconnect for network errors and gateway timeouts.
    pub base_delay: Duration,
    /// Delay before the first reconnect after an overload rejection.
    pub overload_base_delay: Duration,
    /// Growth factor per attempt (2.0 doubles the delay each time).
    pub multiplier: f64,
    /// Upper bound on any single delay.
    pub max_delay: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_secs(1),
            overload_base_delay: Duration::from_secs(3),
            multiplier: 2.0,
            max_delay: Duration::from_secs(120),
        }
    }
}

impl ReconnectPolicy {
    /// Create a policy allowing `max_attempts` reconnects with default delays.
    pub fn with_max_attempts(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            ..Default::default()
        }
    }

    /// Decide whether reconnect number `attempt` (1-based) should happen.
    ///
    /// Deterministic in `(kind, attempt)`: no clocks, no jitter.
    pub fn decide(&self, kind: FailureKind, attempt: u32) -> Decision {
        if kind == FailureKind::Unrecoverable || attempt == 0 || attempt > self.max_attempts {
            return Decision::give_up();
        }
        let base = match kind {
            FailureKind::UpstreamOverloaded => self.overload_base_delay,
            _ => self.base_delay,
        };
        let exponent = i32::try_from(attempt - 1).unwrap_or(i32::MAX);
        let raw = base.as_secs_f64() * self.multiplier.powi(exponent);
        let capped = raw.min(self.max_delay.as_secs_f64());
        Decision {
            retry: true,
            delay: Duration::try_from_secs_f64(capped).unwrap_or(self.max_delay),
        }
    }
}

// ── Classification ─────────────────────────────────────────────────

/// Body substrings that identify an infrastructure-imposed timeout.
pub const GATEWAY_TIMEOUT_MARKERS: &[&str] = &[
    "FUNCTION_INVOCATION_TIMEOUT",
    "Vercel timeout",
    "Gateway Timeout",
];

/// HTTP status the upstream uses for "overloaded".
pub const OVERLOADED_STATUS: u16 = 529;

static SESSION_IN_BODY: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?:continue with session:\s*|"session_id"\s*:\s*")([A-Za-z0-9][A-Za-z0-9_-]*)"#)
        .unwrap_or_else(|e| panic!("invalid session pattern: {e}"))
});

/// Whether a message reports an overloaded upstream.
pub fn is_overloaded_message(message: &str) -> bool {
    message.to_lowercase().contains("overloaded")
}

/// Whether a response body carries a gateway-timeout marker.
pub fn is_gateway_timeout_body(body: &str) -> bool {
    GATEWAY_TIMEOUT_MARKERS.iter().any(|m| body.contains(m))
}

/// Classify a non-success HTTP response.
pub fn classify_status(status: u16, body: &str) -> FailureKind {
    if status == OVERLOADED_STATUS || is_overloaded_message(body) {
        return FailureKind::UpstreamOverloaded;
    }
    if status == 504 || is_gateway_timeout_body(body) {
        return FailureKind::GatewayTimeout;
    }
    match status {
        429 | 500 | 502 | 503 => FailureKind::TransientNetwork,
        _ => FailureKind::Unrecoverable,
    }
}

/// Extract a session id embedded in a gateway-timeout body.
pub fn extract_session_id(body: &str) -> Option<String> {
    SESSION_IN_BODY
        .captures(body)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_policy_values() {
        let policy = ReconnectPolicy::default();
        assert_eq!(policy.max_attempts, 5);
        assert_eq!(policy.base_delay, Duration::from_secs(1));
        assert_eq!(policy.overload_base_delay, Duration::from_secs(3));
    }

    #[test]
    fn overload_backoff_strictly_increases_then_stops() {
        let policy = ReconnectPolicy::default();
        let mut previous = Duration::ZERO;
        for attempt in 1..=policy.max_attempts {
            let d = policy.decide(FailureKind::UpstreamOverloaded, attempt);
            assert!(d.retry, "attempt {attempt} should retry");
            assert!(
                d.delay > previous,
                "attempt {attempt}: {:?} should be > {previous:?}",
                d.delay
            );
            previous = d.delay;
        }
        for kind in [
            FailureKind::TransientNetwork,
            FailureKind::UpstreamOverloaded,
            FailureKind::GatewayTimeout,
        ] {
            assert!(!policy.decide(kind, policy.max_attempts + 1).retry);
        }
    }

    #[test]
    fn delay_doubles_from_base() {
        let policy = ReconnectPolicy::default();
        assert_eq!(
            policy.decide(FailureKind::GatewayTimeout, 1).delay,
            Duration::from_secs(1)
        );
        assert_eq!(
            policy.decide(FailureKind::GatewayTimeout, 3).delay,
            Duration::from_secs(4)
        );
        assert_eq!(
            policy.decide(FailureKind::UpstreamOverloaded, 2).delay,
            Duration::from_secs(6)
        );
    }

    #[test]
    fn delay_capped_at_max() {
        let policy = ReconnectPolicy {
            max_attempts: 20,
            max_delay: Duration::from_secs(2),
            ..Default::default()
        };
        let d = policy.decide(FailureKind::TransientNetwork, 15);
        assert!(d.retry);
        assert!(d.delay <= Duration::from_secs(2));
    }

    #[test]
    fn degenerate_settings_fall_back_to_max_delay() {
        let nan = ReconnectPolicy {
            multiplier: f64::NAN,
            ..Default::default()
        };
        assert_eq!(
            nan.decide(FailureKind::TransientNetwork, 2).delay,
            nan.max_delay
        );

        let negative = ReconnectPolicy {
            multiplier: -2.0,
            ..Default::default()
        };
        assert_eq!(
            negative.decide(FailureKind::TransientNetwork, 2).delay,
            negative.max_delay
        );

        let unbounded = ReconnectPolicy {
            max_attempts: 200,
            max_delay: Duration::MAX,
            ..Default::default()
        };
        assert_eq!(
            unbounded.decide(FailureKind::TransientNetwork, 200).delay,
            Duration::MAX
        );
    }

    #[test]
    fn unrecoverable_never_retries() {
        let policy = ReconnectPolicy::default();
        for attempt in 0..=6 {
            assert!(!policy.decide(FailureKind::Unrecoverable, attempt).retry);
        }
    }

    #[test]
    fn decide_is_deterministic() {
        let policy = ReconnectPolicy::default();
        assert_eq!(
            policy.decide(FailureKind::UpstreamOverloaded, 3),
            policy.decide(FailureKind::UpstreamOverloaded, 3)
        );
    }

    #[test]
    fn status_classification() {
        assert_eq!(classify_status(529, ""), FailureKind::UpstreamOverloaded);
        assert_eq!(
            classify_status(500, "{\"error\":\"Overloaded\"}"),
            FailureKind::UpstreamOverloaded
        );
        assert_eq!(classify_status(504, ""), FailureKind::GatewayTimeout);
        assert_eq!(
            classify_status(500, "FUNCTION_INVOCATION_TIMEOUT"),
            FailureKind::GatewayTimeout
        );
        assert_eq!(classify_status(502, "bad gateway"), FailureKind::TransientNetwork);
        assert_eq!(classify_status(401, "unauthorized"), FailureKind::Unrecoverable);
        assert_eq!(classify_status(400, "bad request"), FailureKind::Unrecoverable);
    }

    #[test]
    fn session_id_extracted_from_timeout_body() {
        let body = "Vercel timeout - client should continue with session: 1712345678-abc1234";
        assert_eq!(
            extract_session_id(body).as_deref(),
            Some("1712345678-abc1234")
        );
        let json_body = "{\"error\":\"FUNCTION_INVOCATION_TIMEOUT\",\"session_id\":\"s9x\"}";
        assert_eq!(extract_session_id(json_body).as_deref(), Some("s9x"));
        assert!(extract_session_id("FUNCTION_INVOCATION_TIMEOUT").is_none());
    }

    #[test]
    fn overloaded_message_is_case_insensitive() {
        assert!(is_overloaded_message("Anthropic API is Overloaded, retrying"));
        assert!(is_overloaded_message("service overloaded"));
        assert!(!is_overloaded_message("rate limited"));
    }
}
