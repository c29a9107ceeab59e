//! Session configuration.

use std::time::Duration;

use crate::api::retry::ReconnectPolicy;

/// Configuration for a [`StreamSession`](super::StreamSession).
///
/// ```ignore
/// let config = SessionConfig::default()
///     .with_max_attempts(3)
///     .with_base_delay(Duration::from_millis(500));
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct SessionConfig {
    /// Reconnect backoff.
    pub policy: ReconnectPolicy,
    /// Use a completion's `html` as the content when nothing was streamed.
    pub html_fallback: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            policy: ReconnectPolicy::default(),
            html_fallback: true,
        }
    }
}

impl SessionConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_policy(mut self, policy: ReconnectPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.policy.max_attempts = max_attempts;
        self
    }

    pub fn with_base_delay(mut self, delay: Duration) -> Self {
        self.policy.base_delay = delay;
        self
    }

    pub fn with_overload_delay(mut self, delay: Duration) -> Self {
        self.policy.overload_base_delay = delay;
        self
    }

    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.policy.max_delay = delay;
        self
    }

    pub fn with_html_fallback(mut self, enabled: bool) -> Self {
        self.html_fallback = enabled;
        self
    }
}
