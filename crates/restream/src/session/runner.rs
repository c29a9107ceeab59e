//! The session state machine.
//!
//! [`StreamSession::run`] opens a connection, feeds body bytes through an
//! [`EventDecoder`], and reacts to each [`Event`]. When a connection fails
//! with a recoverable [`Failure`], it asks the [`ReconnectPolicy`] for a
//! delay, sleeps, and reopens with the session id and last accepted chunk
//! id so the emitter can resume. Every suspension point (open, read, sleep)
//! races the session's [`CancellationToken`].
//!
//! [`ReconnectPolicy`]: crate::api::retry::ReconnectPolicy

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use super::config::SessionConfig;
use super::events::{NoopObserver, SessionEvent, SessionObserver};
use super::{FailureReason, FragmentOutcome, Session, SessionError, SessionStatus};
use crate::api::decoder::{Event, EventDecoder, TaggedEvent};
use crate::api::retry::{self, Failure, FailureKind};
use crate::api::transport::{Transport, TransportError};
use crate::api::usage::UsageAggregator;
use crate::{GenerationRequest, StreamRequest};

/// How one physical connection ended.
enum ConnectionOutcome {
    Completed,
    /// Recoverable; the policy decides whether to reconnect.
    Interrupted(Failure),
    Fatal {
        reason: FailureReason,
        failure: Failure,
    },
    Cancelled,
}

/// Drives one logical generation to a terminal state.
///
/// A `StreamSession` can be `run` more than once; each run starts a fresh
/// [`Session`].
pub struct StreamSession<'a> {
    transport: &'a dyn Transport,
    config: SessionConfig,
    observer: &'a dyn SessionObserver,
    usage: Option<&'a UsageAggregator>,
    cancel: CancellationToken,
}

impl<'a> StreamSession<'a> {
    pub fn new(transport: &'a dyn Transport, config: SessionConfig) -> Self {
        Self {
            transport,
            config,
            observer: &NoopObserver,
            usage: None,
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_observer(mut self, observer: &'a dyn SessionObserver) -> Self {
        self.observer = observer;
        self
    }

    /// Record final usage here when a session completes.
    pub fn with_usage_aggregator(mut self, aggregator: &'a UsageAggregator) -> Self {
        self.usage = Some(aggregator);
        self
    }

    /// Cancel the session by cancelling `token` (or a parent of it).
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    /// A handle that cancels this session.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Run a generation until it completes, fails, or is cancelled.
    ///
    /// On failure the returned [`SessionError`] still holds whatever content
    /// was streamed.
    pub async fn run(&self, generation: GenerationRequest) -> Result<Session, SessionError> {
        let mut session = Session::new();
        let mut decoder = EventDecoder::new();
        let mut last_failure: Option<Failure> = None;

        self.transition(&mut session, SessionStatus::Connecting);

        loop {
            let request = if session.connections == 0 {
                StreamRequest::initial(generation.clone())
            } else {
                StreamRequest::reconnect(
                    generation.clone(),
                    session.session_id.clone(),
                    session.last_chunk_id,
                )
            };
            session.connections += 1;

            let outcome = self
                .run_connection(&mut session, &mut decoder, &request)
                .await;
            decoder.end_connection();

            let failure = match outcome {
                ConnectionOutcome::Completed => return Ok(self.complete(session).await),
                ConnectionOutcome::Cancelled => {
                    return Err(self.fail(session, FailureReason::Cancelled, last_failure));
                }
                ConnectionOutcome::Fatal { reason, failure } => {
                    return Err(self.fail(session, reason, Some(failure)));
                }
                ConnectionOutcome::Interrupted(failure) => failure,
            };

            let attempt = session.reconnect_attempts + 1;
            let decision = self.config.policy.decide(failure.kind, attempt);
            if !decision.retry {
                let reason = FailureReason::RetryExhausted {
                    attempts: session.reconnect_attempts,
                };
                return Err(self.fail(session, reason, Some(failure)));
            }

            session.reconnect_attempts = attempt;
            self.transition(&mut session, SessionStatus::Reconnecting);
            info!(
                "Connection #{} interrupted ({failure}); reconnecting in {:?}",
                session.connections, decision.delay
            );
            self.observer.on_event(&SessionEvent::Reconnecting {
                attempt,
                max_attempts: self.config.policy.max_attempts,
                delay: decision.delay,
                failure: &failure,
            });
            last_failure = Some(failure);

            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => {
                    debug!("Cancelled during reconnect backoff");
                    return Err(self.fail(session, FailureReason::Cancelled, last_failure));
                }
                _ = tokio::time::sleep(decision.delay) => {}
            }
        }
    }

    async fn run_connection(
        &self,
        session: &mut Session,
        decoder: &mut EventDecoder,
        request: &StreamRequest,
    ) -> ConnectionOutcome {
        let opened = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return ConnectionOutcome::Cancelled,
            result = self.transport.open(request) => result,
        };

        let mut connection = match opened {
            Ok(connection) => connection,
            Err(e) => return self.open_failed(session, e),
        };

        debug!("Connection #{} open", session.connections);
        self.transition(session, SessionStatus::Streaming);
        self.observer.on_event(&SessionEvent::Connected {
            connection: session.connections,
            reconnect: request.is_reconnect(),
        });

        // An overload status followed by a close backs off like an overload.
        let mut overloaded = false;

        loop {
            let chunk = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => {
                    debug!("Cancelled while streaming; dropping connection");
                    return ConnectionOutcome::Cancelled;
                }
                chunk = connection.next_chunk() => chunk,
            };

            match chunk {
                Ok(Some(bytes)) => {
                    decoder.push(&bytes);
                    while let Some(tagged) = decoder.next_event() {
                        if let Event::Status { message, .. } = &tagged.event
                            && retry::is_overloaded_message(message)
                        {
                            overloaded = true;
                        }
                        if let Some(outcome) = self.handle_event(session, tagged) {
                            return outcome;
                        }
                    }
                }
                Ok(None) => {
                    // Emitters without chunk ids close the body to finish.
                    if session.fragments > 0 && !session.saw_chunk_ids {
                        debug!("Body ended after untagged fragments; treating as complete");
                        return ConnectionOutcome::Completed;
                    }
                    let kind = if overloaded {
                        FailureKind::UpstreamOverloaded
                    } else {
                        FailureKind::TransientNetwork
                    };
                    return ConnectionOutcome::Interrupted(Failure::new(
                        kind,
                        "connection closed without a terminal event",
                    ));
                }
                Err(e) => {
                    let mut failure = e.to_failure();
                    if overloaded && failure.kind == FailureKind::TransientNetwork {
                        failure.kind = FailureKind::UpstreamOverloaded;
                    }
                    return ConnectionOutcome::Interrupted(failure);
                }
            }
        }
    }

    fn open_failed(&self, session: &mut Session, error: TransportError) -> ConnectionOutcome {
        if session.session_id.is_none()
            && let Some(id) = error.session_hint()
        {
            debug!("Recovered session id {id} from error body");
            self.adopt_session_id(session, id);
        }

        let failure = error.to_failure();
        if failure.kind != FailureKind::Unrecoverable {
            return ConnectionOutcome::Interrupted(failure);
        }
        let code = match &error {
            TransportError::Status { code, .. } => Some(*code),
            _ => None,
        };
        ConnectionOutcome::Fatal {
            reason: FailureReason::Unrecoverable {
                message: error.to_string(),
                code,
            },
            failure,
        }
    }

    /// React to one decoded event. `Some` ends the connection.
    fn handle_event(&self, session: &mut Session, tagged: TaggedEvent) -> Option<ConnectionOutcome> {
        if let Some(id) = tagged.session_id {
            self.adopt_session_id(session, id);
        }

        match tagged.event {
            Event::Start { message } => {
                debug!("Stream started: {}", message.as_deref().unwrap_or(""));
                None
            }
            Event::Delta { text, chunk_id } => {
                match session.accept_fragment(&text, chunk_id) {
                    FragmentOutcome::Appended => {
                        self.observer
                            .on_event(&SessionEvent::ContentDelta { text: &text, chunk_id });
                    }
                    FragmentOutcome::Duplicate { last_chunk_id } => {
                        let chunk_id = chunk_id.unwrap_or_default();
                        debug!("Dropping replayed chunk {chunk_id} (last {last_chunk_id})");
                        self.observer.on_event(&SessionEvent::DuplicateSkipped {
                            chunk_id,
                            last_chunk_id,
                        });
                    }
                }
                None
            }
            Event::ThinkingUpdate { text } => {
                session.thinking.push_str(&text);
                self.observer.on_event(&SessionEvent::Thinking(&text));
                None
            }
            Event::Status {
                message,
                retry_index,
                max_retries,
            } => {
                self.observer.on_event(&SessionEvent::Status {
                    message: &message,
                    retry_index,
                    max_retries,
                });
                None
            }
            Event::ContentComplete { html, usage } => {
                debug!(
                    "Received full content ({} bytes, usage {:?})",
                    html.len(),
                    usage.as_ref().map(|u| u.total_tokens())
                );
                session.final_html = Some(html);
                None
            }
            Event::Completion {
                usage,
                message_id,
                html,
            } => {
                let html = html.or_else(|| session.final_html.take());
                if self.config.html_fallback
                    && session.content.is_empty()
                    && let Some(html) = html
                {
                    debug!("No fragments streamed; using completion html");
                    session.content = html;
                }
                session.usage = Some(usage);
                session.message_id = message_id;
                Some(ConnectionOutcome::Completed)
            }
            Event::End { message } => {
                debug!("Stream ended: {}", message.as_deref().unwrap_or(""));
                Some(ConnectionOutcome::Completed)
            }
            Event::Error { message, code } => {
                let failure = Failure::new(FailureKind::Unrecoverable, message.clone());
                Some(ConnectionOutcome::Fatal {
                    reason: FailureReason::Unrecoverable { message, code },
                    failure,
                })
            }
            Event::Reconnect => Some(ConnectionOutcome::Interrupted(Failure::new(
                FailureKind::GatewayTimeout,
                "emitter requested reconnect",
            ))),
            Event::Other { kind } => {
                trace!("Ignoring event type '{kind}'");
                None
            }
        }
    }

    fn adopt_session_id(&self, session: &mut Session, id: String) {
        match session.session_id.take() {
            None => {
                self.observer
                    .on_event(&SessionEvent::SessionAssigned { session_id: &id });
                session.session_id = Some(id);
            }
            Some(current) if current == id => session.session_id = Some(current),
            Some(previous) => {
                warn!("Session id changed from {previous} to {id}; restarting output");
                session.reset(id);
                if let Some(current) = session.session_id.as_deref() {
                    self.observer.on_event(&SessionEvent::SessionReset {
                        previous: &previous,
                        current,
                    });
                }
            }
        }
    }

    fn transition(&self, session: &mut Session, to: SessionStatus) {
        let from = std::mem::replace(&mut session.status, to);
        self.observer.on_event(&SessionEvent::StateChanged {
            from: &from,
            to: &session.status,
        });
    }

    async fn complete(&self, mut session: Session) -> Session {
        self.transition(&mut session, SessionStatus::Completed);
        if let (Some(aggregator), Some(usage)) = (self.usage, session.usage.clone())
            && let Err(e) = aggregator.record_async(usage).await
        {
            warn!("Failed to record usage: {e}");
        }
        info!(
            "Session {} completed after {} connection(s)",
            session.session_id.as_deref().unwrap_or("(none)"),
            session.connections
        );
        self.observer.on_event(&SessionEvent::Completed {
            usage: session.usage.as_ref(),
            content_len: session.content.len(),
        });
        session
    }

    fn fail(
        &self,
        mut session: Session,
        reason: FailureReason,
        last_failure: Option<Failure>,
    ) -> SessionError {
        let message = match (&reason, &last_failure) {
            (FailureReason::RetryExhausted { .. }, Some(f)) => format!("{reason}; last failure: {f}"),
            _ => reason.to_string(),
        };
        self.transition(&mut session, SessionStatus::Failed(reason.clone()));
        info!("Session failed: {message}");
        self.observer.on_event(&SessionEvent::Failed { reason: &reason });
        SessionError {
            reason,
            message,
            last_failure,
            session: Box::new(session),
        }
    }
}
