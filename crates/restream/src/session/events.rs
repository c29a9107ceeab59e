//! Session lifecycle events and the observers that consume them.
//!
//! [`StreamSession`](super::StreamSession) reports everything the caller may
//! want to display through [`SessionEvent`] values. Observers never influence
//! the state machine; they only watch.
//!
//! | Observer | Use case |
//! |----------|----------|
//! | [`NoopObserver`] | Tests or fire-and-forget runs |
//! | [`LoggingObserver`] | Structured logging via `tracing` |
//! | [`FnObserver`] | Quick closures, e.g. printing deltas to stdout |
//! | [`CompositeObserver`] | Compose multiple observers in order |

use std::time::Duration;

use tracing::{debug, info, trace, warn};

use super::{FailureReason, SessionStatus};
use crate::api::retry::Failure;
use crate::api::usage::Usage;

// ── Events ─────────────────────────────────────────────────────────

#[derive(Debug)]
pub enum SessionEvent<'a> {
    StateChanged {
        from: &'a SessionStatus,
        to: &'a SessionStatus,
    },
    /// A physical connection was established.
    Connected { connection: u32, reconnect: bool },
    /// The emitter assigned a session id.
    SessionAssigned { session_id: &'a str },
    /// A reconnect landed on a different session; streamed output was
    /// discarded.
    SessionReset { previous: &'a str, current: &'a str },
    /// A fragment was appended to the content.
    ContentDelta { text: &'a str, chunk_id: Option<u64> },
    /// A replayed fragment was dropped.
    DuplicateSkipped { chunk_id: u64, last_chunk_id: u64 },
    Thinking(&'a str),
    /// Informational status from the emitter (e.g. its own upstream retries).
    Status {
        message: &'a str,
        retry_index: Option<u32>,
        max_retries: Option<u32>,
    },
    /// About to wait `delay` before reconnect number `attempt`.
    Reconnecting {
        attempt: u32,
        max_attempts: u32,
        delay: Duration,
        failure: &'a Failure,
    },
    Completed {
        usage: Option<&'a Usage>,
        content_len: usize,
    },
    Failed { reason: &'a FailureReason },
}

/// Watches a running session.
pub trait SessionObserver: Send + Sync {
    fn on_event(&self, event: &SessionEvent<'_>) {
        let _ = event;
    }
}

pub struct NoopObserver;
impl SessionObserver for NoopObserver {}

/// An observer backed by a closure.
///
/// ```ignore
/// let printer = FnObserver::new(|event| {
///     if let SessionEvent::ContentDelta { text, .. } = event {
///         print!("{text}");
///     }
/// });
/// ```
pub struct FnObserver<F>(F)
where
    F: Fn(&SessionEvent<'_>) + Send + Sync;

impl<F> FnObserver<F>
where
    F: Fn(&SessionEvent<'_>) + Send + Sync,
{
    pub fn new(f: F) -> Self {
        Self(f)
    }
}

impl<F> SessionObserver for FnObserver<F>
where
    F: Fn(&SessionEvent<'_>) + Send + Sync,
{
    fn on_event(&self, event: &SessionEvent<'_>) {
        (self.0)(event)
    }
}

/// Dispatches every event to each inner observer in registration order.
pub struct CompositeObserver {
    observers: Vec<Box<dyn SessionObserver>>,
}

impl CompositeObserver {
    pub fn new() -> Self {
        Self {
            observers: Vec::new(),
        }
    }

    pub fn with(mut self, observer: impl SessionObserver + 'static) -> Self {
        self.observers.push(Box::new(observer));
        self
    }

    /// Conditionally add an observer without breaking the builder chain.
    pub fn with_if(self, condition: bool, observer: impl SessionObserver + 'static) -> Self {
        if condition { self.with(observer) } else { self }
    }

    pub fn with_opt(self, observer: Option<impl SessionObserver + 'static>) -> Self {
        match observer {
            Some(o) => self.with(o),
            None => self,
        }
    }
}

impl Default for CompositeObserver {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionObserver for CompositeObserver {
    fn on_event(&self, event: &SessionEvent<'_>) {
        for observer in &self.observers {
            observer.on_event(event);
        }
    }
}

/// Logs every event through `tracing`.
pub struct LoggingObserver;

impl SessionObserver for LoggingObserver {
    fn on_event(&self, event: &SessionEvent<'_>) {
        match event {
            SessionEvent::StateChanged { from, to } => {
                debug!("Session state: {from} -> {to}");
            }
            SessionEvent::Connected {
                connection,
                reconnect,
            } => {
                if *reconnect {
                    info!("Reconnected (connection #{connection})");
                } else {
                    debug!("Connected (connection #{connection})");
                }
            }
            SessionEvent::SessionAssigned { session_id } => {
                debug!("Session id assigned: {session_id}");
            }
            SessionEvent::SessionReset { previous, current } => {
                warn!("Emitter started a new session ({previous} -> {current}); discarding partial output");
            }
            SessionEvent::ContentDelta { text, chunk_id } => {
                trace!("Delta {chunk_id:?}: {} bytes", text.len());
            }
            SessionEvent::DuplicateSkipped {
                chunk_id,
                last_chunk_id,
            } => {
                debug!("Skipping replayed chunk {chunk_id} (last accepted {last_chunk_id})");
            }
            SessionEvent::Thinking(text) => {
                let preview: String = text.chars().take(200).collect();
                trace!(
                    "Thinking: {preview}{}",
                    if text.len() > 200 { "..." } else { "" }
                );
            }
            SessionEvent::Status {
                message,
                retry_index,
                max_retries,
            } => match (retry_index, max_retries) {
                (Some(i), Some(max)) => info!("Emitter status ({i}/{max}): {message}"),
                _ => info!("Emitter status: {message}"),
            },
            SessionEvent::Reconnecting {
                attempt,
                max_attempts,
                delay,
                failure,
            } => {
                warn!("{failure}. Reconnecting in {delay:?} (attempt {attempt}/{max_attempts})");
            }
            SessionEvent::Completed { usage, content_len } => match usage {
                Some(u) => info!(
                    "Session completed: {content_len} bytes, tokens: {} in + {} out + {} thinking",
                    u.input_tokens, u.output_tokens, u.thinking_tokens
                ),
                None => info!("Session completed: {content_len} bytes (no usage reported)"),
            },
            SessionEvent::Failed { reason } => {
                warn!("Session failed: {reason}");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn counting(counter: Arc<AtomicUsize>) -> FnObserver<impl Fn(&SessionEvent<'_>) + Send + Sync> {
        FnObserver::new(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        })
    }

    #[test]
    fn composite_dispatches_to_all() {
        let a = Arc::new(AtomicUsize::new(0));
        let b = Arc::new(AtomicUsize::new(0));
        let composite = CompositeObserver::new()
            .with(counting(a.clone()))
            .with(LoggingObserver)
            .with(counting(b.clone()));
        composite.on_event(&SessionEvent::Thinking("hm"));
        composite.on_event(&SessionEvent::Failed {
            reason: &FailureReason::Cancelled,
        });
        assert_eq!(a.load(Ordering::SeqCst), 2);
        assert_eq!(b.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn composite_with_if_and_opt() {
        let a = Arc::new(AtomicUsize::new(0));
        let composite = CompositeObserver::new()
            .with_if(false, counting(a.clone()))
            .with_opt(None::<NoopObserver>)
            .with_opt(Some(counting(a.clone())));
        composite.on_event(&SessionEvent::Thinking("x"));
        assert_eq!(a.load(Ordering::SeqCst), 1);
    }
}
