//! HTTP front end.
//!
//! Three routes, no session logic of their own:
//!
//! - `POST /terminals?cols=&rows=` creates a session and returns its id.
//! - `POST /terminals/{pid}/size?cols=&rows=` resizes a session.
//! - `GET /terminals/{pid}` upgrades to a WebSocket and bridges it to the
//!   session until either side goes away.

use std::future;
use std::sync::Arc;

use axum::{
    extract::ws::{Message, WebSocket, WebSocketUpgrade},
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Router,
};
use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;

use crate::bridge::{self, Bridge};
use crate::session::{SessionError, SessionId, SessionRegistry};

/// Shared state handed to every handler.
#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<SessionRegistry>,
    pub bridge: Bridge,
}

impl AppState {
    pub fn new(registry: Arc<SessionRegistry>, bridge: Bridge) -> Self {
        Self { registry, bridge }
    }
}

/// Raw `cols`/`rows` query parameters.
///
/// Kept as strings so that create can fall back to defaults on garbage
/// instead of rejecting the request.
#[derive(Debug, Default, Deserialize)]
pub struct SizeQuery {
    cols: Option<String>,
    rows: Option<String>,
}

impl SizeQuery {
    fn lenient(value: &Option<String>) -> Option<i64> {
        value.as_deref().and_then(|v| v.trim().parse().ok())
    }

    fn strict(value: &Option<String>) -> Option<u16> {
        value.as_deref().and_then(|v| v.trim().parse().ok())
    }
}

/// An error rendered as an HTTP response.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error(transparent)]
    Session(#[from] SessionError),

    /// The path segment is not a session id at all.
    #[error("session not found: {0}")]
    UnknownSession(String),

    /// Resize parameters missing or not a 16-bit size.
    #[error("invalid size parameters: cols={}, rows={}", show(.cols), show(.rows))]
    InvalidSizeParameters {
        cols: Option<String>,
        rows: Option<String>,
    },
}

fn show(value: &Option<String>) -> String {
    match value {
        Some(v) => format!("{:?}", v),
        None => "missing".to_string(),
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self {
            ApiError::Session(err) => match err {
                SessionError::NotFound(_) => StatusCode::NOT_FOUND,
                SessionError::InvalidSize { .. } => StatusCode::BAD_REQUEST,
                SessionError::LimitReached(_) => StatusCode::SERVICE_UNAVAILABLE,
                SessionError::AlreadyAttached(_) => StatusCode::CONFLICT,
                SessionError::SpawnFailed(_)
                | SessionError::WriteFailed(_)
                | SessionError::ResizeFailed(_)
                | SessionError::KillFailed(_)
                | SessionError::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
            },
            ApiError::UnknownSession(_) => StatusCode::NOT_FOUND,
            ApiError::InvalidSizeParameters { .. } => StatusCode::BAD_REQUEST,
        };
        (status, self.to_string()).into_response()
    }
}

/// Builds the router.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/terminals", post(create_terminal))
        .route("/terminals/:pid/size", post(resize_terminal))
        .route("/terminals/:pid", get(connect_terminal))
        .with_state(state)
}

async fn create_terminal(
    State(state): State<AppState>,
    Query(size): Query<SizeQuery>,
) -> Result<String, ApiError> {
    let session_id = state
        .registry
        .create(SizeQuery::lenient(&size.cols), SizeQuery::lenient(&size.rows))
        .await?;
    Ok(session_id.to_string())
}

async fn resize_terminal(
    State(state): State<AppState>,
    Path(pid): Path<String>,
    Query(size): Query<SizeQuery>,
) -> Result<StatusCode, ApiError> {
    let session_id =
        parse_session_id(&pid).ok_or_else(|| ApiError::UnknownSession(pid.clone()))?;

    let (Some(cols), Some(rows)) = (SizeQuery::strict(&size.cols), SizeQuery::strict(&size.rows))
    else {
        tracing::debug!(session_id = session_id, "Rejecting resize with bad dimensions");
        return Err(ApiError::InvalidSizeParameters {
            cols: size.cols,
            rows: size.rows,
        });
    };

    state.registry.resize(session_id, cols, rows).await?;
    Ok(StatusCode::OK)
}

async fn connect_terminal(
    State(state): State<AppState>,
    Path(pid): Path<String>,
    ws: WebSocketUpgrade,
) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state, pid))
}

/// Bridges an upgraded socket to a session.
async fn handle_socket(mut socket: WebSocket, state: AppState, pid: String) {
    let Some(session_id) = parse_session_id(&pid) else {
        tracing::debug!(pid = %pid, "Closing socket for malformed session id");
        let _ = socket.send(Message::Close(None)).await;
        return;
    };

    let (sender, receiver) = socket.split();

    let sink = Box::pin(sender.with(|data: Bytes| {
        future::ready(Ok::<_, axum::Error>(Message::Binary(data.to_vec())))
    }));

    // The client is gone at the first close frame or transport error.
    let inbound = Box::pin(
        receiver
            .take_while(|message| {
                future::ready(matches!(message, Ok(m) if !matches!(m, Message::Close(_))))
            })
            .filter_map(|message| {
                future::ready(match message {
                    Ok(Message::Binary(data)) => Some(Bytes::from(data)),
                    Ok(Message::Text(text)) => Some(Bytes::from(text)),
                    _ => None,
                })
            }),
    );

    match bridge::serve(&state.registry, &state.bridge, session_id, sink, inbound).await {
        Ok(exit) => tracing::info!(session_id = session_id, exit = ?exit, "Connection closed"),
        Err(e) => tracing::info!(session_id = session_id, error = %e, "Connection rejected"),
    }
}

fn parse_session_id(raw: &str) -> Option<SessionId> {
    raw.parse().ok()
}
