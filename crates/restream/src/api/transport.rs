//! The transport seam between a session and the emitter.
//!
//! [`Transport::open`] issues one request and yields a [`Connection`] whose
//! body is pulled chunk by chunk. The session holds at most one connection
//! at a time and drops it before opening the next. [`HttpTransport`] is the
//! reqwest implementation; tests substitute scripted transports.

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use tracing::{debug, warn};

use crate::StreamRequest;
use crate::api::retry::{self, Failure, FailureKind};

/// Boxed future returned by transport operations.
pub type TransportFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Error opening or reading a connection.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    /// The request never produced a response (refused, reset, DNS).
    #[error("connection failed: {0}")]
    Connect(String),
    /// The emitter answered with a non-success status.
    #[error("HTTP {code}: {body}")]
    Status { code: u16, body: String },
    /// The body broke off mid-stream.
    #[error("read failed: {0}")]
    Read(String),
}

impl TransportError {
    /// Classify into a [`FailureKind`] for the reconnect policy.
    pub fn kind(&self) -> FailureKind {
        match self {
            TransportError::Connect(_) | TransportError::Read(_) => FailureKind::TransientNetwork,
            TransportError::Status { code, body } => retry::classify_status(*code, body),
        }
    }

    /// Session id embedded in a gateway-timeout response body, if any.
    pub fn session_hint(&self) -> Option<String> {
        match self {
            TransportError::Status { body, .. } => retry::extract_session_id(body),
            _ => None,
        }
    }

    pub fn to_failure(&self) -> Failure {
        Failure::new(self.kind(), self.to_string())
    }
}

/// One open response body.
pub trait Connection: Send {
    /// Next chunk of body bytes. `Ok(None)` on clean end of body.
    fn next_chunk(&mut self) -> TransportFuture<'_, Result<Option<Vec<u8>>, TransportError>>;
}

/// Opens connections to an emitter.
pub trait Transport: Send + Sync {
    fn open<'a>(
        &'a self,
        request: &'a StreamRequest,
    ) -> TransportFuture<'a, Result<Box<dyn Connection>, TransportError>>;
}

// ── HttpTransport ──────────────────────────────────────────────────

/// Default time to wait for the next body chunk before treating the
/// connection as dead.
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(300);

/// `POST`s the request as JSON and streams the `text/event-stream` body.
#[derive(Clone)]
pub struct HttpTransport {
    client: reqwest::Client,
    url: String,
    idle_timeout: Duration,
}

impl HttpTransport {
    pub fn new(url: impl Into<String>) -> Result<Self, String> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("restream/", env!("CARGO_PKG_VERSION")))
            .connect_timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| format!("failed to build HTTP client: {e}"))?;
        Ok(Self {
            client,
            url: url.into(),
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
        })
    }

    /// Maximum silence between body chunks.
    pub fn with_idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = timeout;
        self
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

impl Transport for HttpTransport {
    fn open<'a>(
        &'a self,
        request: &'a StreamRequest,
    ) -> TransportFuture<'a, Result<Box<dyn Connection>, TransportError>> {
        Box::pin(async move {
            debug!(
                "Opening stream to {} (reconnect={}, session={:?}, last_chunk_id={:?})",
                self.url,
                request.is_reconnect(),
                request.continuation.session_id,
                request.continuation.last_chunk_id,
            );

            let resp = self
                .client
                .post(&self.url)
                .header("Accept", "text/event-stream")
                .json(request)
                .send()
                .await
                .map_err(|e| TransportError::Connect(e.to_string()))?;

            let status = resp.status();
            if !status.is_success() {
                let body = resp.text().await.unwrap_or_default();
                return Err(TransportError::Status {
                    code: status.as_u16(),
                    body,
                });
            }

            let content_type = resp
                .headers()
                .get(reqwest::header::CONTENT_TYPE)
                .and_then(|v| v.to_str().ok())
                .unwrap_or_default();
            if !content_type.starts_with("text/event-stream") {
                warn!("Unexpected content type '{content_type}' for event stream; reading anyway");
            }

            Ok(Box::new(HttpConnection {
                resp,
                idle_timeout: self.idle_timeout,
            }) as Box<dyn Connection>)
        })
    }
}

struct HttpConnection {
    resp: reqwest::Response,
    idle_timeout: Duration,
}

impl Connection for HttpConnection {
    fn next_chunk(&mut self) -> TransportFuture<'_, Result<Option<Vec<u8>>, TransportError>> {
        Box::pin(async move {
            match tokio::time::timeout(self.idle_timeout, self.resp.chunk()).await {
                Ok(Ok(chunk)) => Ok(chunk.map(|b| b.to_vec())),
                Ok(Err(e)) => Err(TransportError::Read(e.to_string())),
                Err(_) => Err(TransportError::Read(format!(
                    "no data for {:?}",
                    self.idle_timeout
                ))),
            }
        })
    }
}
