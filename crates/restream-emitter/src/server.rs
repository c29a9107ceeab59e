//! Axum server setup, router construction, and the stream handler.

use std::collections::{HashMap, VecDeque};
use std::io;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::Json;
use axum::Router;
use axum::body::Body;
use axum::extract::State;
use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use futures::StreamExt;
use restream::StreamRequest;
use tower_http::cors::{Any, CorsLayer};
use tracing::{debug, info};

use crate::emitter::StreamEmitter;
use crate::script::{Fault, Script, ScriptOutcome};

/// Path the stream endpoint is served on.
pub const STREAM_PATH: &str = "/api/process-stream";

/// State shared by every request.
#[derive(Clone)]
pub struct EmitterState {
    inner: Arc<Mutex<Inner>>,
    frame_delay: Duration,
}

struct Inner {
    script: Script,
    faults: VecDeque<Fault>,
    replay_overlap: u64,
    sessions: HashMap<String, StreamEmitter>,
    requests: Vec<StreamRequest>,
}

impl EmitterState {
    pub fn new(script: Script, faults: Vec<Fault>, replay_overlap: u64, frame_delay: Duration) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                script,
                faults: faults.into(),
                replay_overlap,
                sessions: HashMap::new(),
                requests: Vec::new(),
            })),
            frame_delay,
        }
    }

    /// Every request body received, in arrival order.
    pub fn requests(&self) -> Vec<StreamRequest> {
        self.lock().requests.clone()
    }

    /// Ids of every session the server has started.
    pub fn session_ids(&self) -> Vec<String> {
        self.lock().sessions.keys().cloned().collect()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// One planned response.
enum Plan {
    Reject(StatusCode, String),
    Stream(Vec<Result<String, io::Error>>),
}

impl Inner {
    /// Find the session to resume or start a new one.
    fn emitter_for(&mut self, request: &StreamRequest) -> &mut StreamEmitter {
        let known = request
            .continuation
            .session_id
            .as_ref()
            .filter(|id| request.is_reconnect() && self.sessions.contains_key(*id))
            .cloned();
        let id = match known {
            Some(id) => {
                debug!("Resuming session {id} after chunk {:?}", request.continuation.last_chunk_id);
                id
            }
            None => {
                let emitter = StreamEmitter::new();
                let id = emitter.session_id().to_string();
                info!("Starting session {id}");
                self.sessions.insert(id.clone(), emitter);
                id
            }
        };
        self.sessions.entry(id).or_default()
    }

    fn plan(&mut self, request: StreamRequest) -> Plan {
        let fault = self.faults.pop_front().unwrap_or(Fault::Healthy);
        self.requests.push(request.clone());
        debug!("Connection #{} with fault {fault:?}", self.requests.len());

        if let Fault::Reject(code) = fault {
            let status = StatusCode::from_u16(code).unwrap_or(StatusCode::BAD_REQUEST);
            return Plan::Reject(status, format!("rejected with {code}"));
        }

        let script = self.script.clone();
        let overlap = self.replay_overlap;
        let emitter = self.emitter_for(&request);

        if fault == Fault::GatewayTimeout {
            return Plan::Reject(
                StatusCode::GATEWAY_TIMEOUT,
                format!(
                    "FUNCTION_INVOCATION_TIMEOUT: Vercel timeout - client should continue with session: {}",
                    emitter.session_id()
                ),
            );
        }

        let mut frames: Vec<Result<String, io::Error>> = Vec::new();
        let fresh = emitter.emitted() == 0 && !emitter.is_finished();
        frames.push(Ok(emitter.start(if fresh { "Generation started" } else { "Resuming" })));

        if request.is_reconnect() {
            frames.extend(
                emitter
                    .replay_after(request.continuation.last_chunk_id, overlap)
                    .into_iter()
                    .map(Ok),
            );
        }

        if let Some(terminal) = emitter.terminal_frame() {
            frames.push(Ok(terminal.to_string()));
            return Plan::Stream(frames);
        }

        if let Fault::Overloaded { statuses } = fault {
            for retry in 1..=statuses {
                frames.push(Ok(emitter.status(
                    "Upstream overloaded, retrying",
                    Some(retry),
                    Some(statuses),
                )));
            }
            return Plan::Stream(frames);
        }

        if fresh {
            frames.extend(script.thinking.iter().map(|t| Ok(emitter.thinking(t))));
        }

        let limit = fault.delta_limit();
        let mut sent = 0;
        for fragment in script.fragments.iter().skip(emitter.emitted()) {
            if limit == Some(sent) {
                match fault {
                    Fault::DropAfter(_) => {
                        frames.push(Err(io::Error::new(
                            io::ErrorKind::ConnectionReset,
                            "simulated connection drop",
                        )));
                    }
                    Fault::RequestReconnect(_) => frames.push(Ok(emitter.reconnect())),
                    _ => {}
                }
                return Plan::Stream(frames);
            }
            match emitter.delta(fragment) {
                Ok(frame) => frames.push(Ok(frame)),
                Err(_) => return Plan::Stream(frames),
            }
            sent += 1;
        }

        let terminal = match &script.outcome {
            ScriptOutcome::Complete { usage, html } => {
                let message_id = format!("msg_{}", emitter.session_id());
                emitter.complete(usage, &message_id, html.as_deref())
            }
            ScriptOutcome::Error { message, code } => emitter.error(message, *code),
        };
        if let Ok(frame) = terminal {
            frames.push(Ok(frame));
        }
        Plan::Stream(frames)
    }
}

/// POST /api/process-stream: stream one connection's worth of events.
async fn process_stream(
    State(state): State<EmitterState>,
    Json(request): Json<StreamRequest>,
) -> Response {
    let plan = state.lock().plan(request);
    match plan {
        Plan::Reject(status, body) => (status, body).into_response(),
        Plan::Stream(frames) => {
            let delay = state.frame_delay;
            let body = futures::stream::iter(frames).then(move |frame| async move {
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
                frame
            });
            (
                [
                    (header::CONTENT_TYPE, "text/event-stream"),
                    (header::CACHE_CONTROL, "no-cache"),
                ],
                Body::from_stream(body),
            )
                .into_response()
        }
    }
}

/// Build the axum router.
pub fn build_router(state: EmitterState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route(STREAM_PATH, post(process_stream))
        .with_state(state)
        .layer(cors)
}

/// Bind, spawn the server, and return the bound address.
pub async fn start_server(router: Router, bind_addr: SocketAddr) -> io::Result<SocketAddr> {
    let listener = tokio::net::TcpListener::bind(bind_addr).await?;
    let addr = listener.local_addr()?;

    tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, router).await {
            tracing::error!("Emitter server stopped: {e}");
        }
    });

    Ok(addr)
}
