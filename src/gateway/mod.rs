//! Axum HTTP ingress.
//!
//! Four POST routes, all JSON:
//! - `/zbus-remote` — a peer delivering a command for local consumers
//! - `/zbus-reply`  — a peer delivering reply traffic
//! - `/zbus-cmd`    — an HTTP caller issuing a command through this node,
//!   replies held for polling
//! - `/zbus-result` — polling the replies accumulated for a `/zbus-cmd`
//!
//! Every inbound peer message is authenticated here (field validation,
//! epoch replay window, signature against the sender's published key)
//! before anything touches the broker; nothing unverified is ever enqueued.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::rejection::JsonRejection;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use axum::routing::post;
use axum::Router;
use serde_json::json;
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::timeout::TimeoutLayer;
use uuid::Uuid;

use crate::identity;
use crate::message::{epoch_now, Message, MessageIdentifier};
use crate::relay::App;
use crate::twin::ResolveError;

/// Maximum request body size (64KB); a message is orders of magnitude smaller.
pub const MAX_BODY_SIZE: usize = 65_536;
/// Per-request timeout.
pub const REQUEST_TIMEOUT_SECS: u64 = 30;

/// Shared state for all handlers.
#[derive(Clone)]
pub struct AppState {
    app: Arc<App>,
}

impl AppState {
    pub fn new(app: Arc<App>) -> Self {
        Self { app }
    }
}

/// Ingress failures, each mapped to the HTTP status the protocol promises:
/// 400 for anything wrong with the message, 502 when the directory is
/// unreachable, 500 when the broker push fails.
#[derive(Debug, thiserror::Error)]
pub enum IngressError {
    #[error("couldn't parse json: {0}")]
    Parse(String),
    #[error("{0}")]
    Validation(String),
    #[error("unknown twin {0}")]
    UnknownTwin(u32),
    #[error("twin lookup failed: {0}")]
    Resolver(String),
    #[error("{0}")]
    Backend(String),
}

impl IngressError {
    fn status(&self) -> StatusCode {
        match self {
            Self::Parse(_) | Self::Validation(_) | Self::UnknownTwin(_) => StatusCode::BAD_REQUEST,
            Self::Resolver(_) => StatusCode::BAD_GATEWAY,
            Self::Backend(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for IngressError {
    fn into_response(self) -> Response {
        tracing::warn!("rejecting ingress request: {self}");
        let body = json!({"status": "error", "message": self.to_string()});
        (self.status(), Json(body)).into_response()
    }
}

fn accepted() -> Json<serde_json::Value> {
    Json(json!({"status": "accepted"}))
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/zbus-remote", post(handle_remote))
        .route("/zbus-reply", post(handle_reply))
        .route("/zbus-cmd", post(handle_cmd))
        .route("/zbus-result", post(handle_result))
        .with_state(state)
        .layer(RequestBodyLimitLayer::new(MAX_BODY_SIZE))
        .layer(TimeoutLayer::new(Duration::from_secs(REQUEST_TIMEOUT_SECS)))
}

/// Replay window + signature against the sender's published key.
async fn authenticate(app: &App, msg: &Message) -> Result<(), IngressError> {
    identity::ensure_fresh(msg).map_err(|e| IngressError::Validation(e.to_string()))?;

    let key = app
        .resolver
        .public_key(msg.twin_src)
        .await
        .map_err(|e| match e {
            ResolveError::NotFound(twin) => IngressError::UnknownTwin(twin),
            ResolveError::Transport(cause) => IngressError::Resolver(cause),
        })?;

    identity::verify_message(msg, &key).map_err(|e| IngressError::Validation(e.to_string()))
}

/// Full peer ingress gate: well-formed, fresh and signed.
async fn authenticate_peer(app: &App, msg: &Message) -> Result<(), IngressError> {
    msg.validate()
        .map_err(|e| IngressError::Validation(e.to_string()))?;
    authenticate(app, msg).await
}

/// POST /zbus-remote — a peer hands us a command for local consumers.
pub async fn handle_remote(
    State(state): State<AppState>,
    body: Result<Json<Message>, JsonRejection>,
) -> Result<Json<serde_json::Value>, IngressError> {
    let Json(msg) = body.map_err(|e| IngressError::Parse(e.to_string()))?;
    tracing::debug!(
        body = %serde_json::to_string(&msg).unwrap_or_default(),
        "remote message from peer"
    );

    authenticate_peer(&state.app, &msg).await?;
    state
        .app
        .backend
        .queue_remote(&msg)
        .await
        .map_err(|e| IngressError::Backend(format!("couldn't push entry to remote queue: {e}")))?;
    Ok(accepted())
}

/// POST /zbus-reply — a peer hands us reply traffic.
pub async fn handle_reply(
    State(state): State<AppState>,
    body: Result<Json<Message>, JsonRejection>,
) -> Result<Json<serde_json::Value>, IngressError> {
    let Json(msg) = body.map_err(|e| IngressError::Parse(e.to_string()))?;
    tracing::debug!(
        body = %serde_json::to_string(&msg).unwrap_or_default(),
        "reply message from peer"
    );

    authenticate_peer(&state.app, &msg).await?;
    state
        .app
        .backend
        .queue_reply(&msg)
        .await
        .map_err(|e| IngressError::Backend(format!("couldn't push entry to reply queue: {e}")))?;
    Ok(accepted())
}

/// POST /zbus-cmd — an HTTP caller issues a command through this node. The
/// reply is not pushed anywhere the caller could listen, so it is parked
/// under a fresh return-queue id the caller polls via `/zbus-result`.
pub async fn handle_cmd(
    State(state): State<AppState>,
    body: Result<Json<Message>, JsonRejection>,
) -> Result<Json<serde_json::Value>, IngressError> {
    let Json(mut msg) = body.map_err(|e| IngressError::Parse(e.to_string()))?;
    authenticate(&state.app, &msg).await?;

    msg.proxy = true;
    msg.retqueue = Uuid::new_v4().to_string();
    msg.validate()
        .map_err(|e| IngressError::Validation(e.to_string()))?;
    state
        .app
        .backend
        .queue_remote(&msg)
        .await
        .map_err(|e| IngressError::Backend(format!("couldn't push entry to remote queue: {e}")))?;

    Ok(Json(json!({"retqueue": msg.retqueue})))
}

/// POST /zbus-result — drain the replies parked for a proxy caller. Each
/// reply leaves freshly stamped and signed by this node so the caller can
/// authenticate it the same way peers authenticate each other.
pub async fn handle_result(
    State(state): State<AppState>,
    body: Result<Json<MessageIdentifier>, JsonRejection>,
) -> Result<Json<Vec<Message>>, IngressError> {
    let Json(ident) = body.map_err(|e| IngressError::Parse(e.to_string()))?;

    let uuid = Uuid::parse_str(&ident.retqueue)
        .map_err(|_| IngressError::Validation("retqueue is not a valid uuid".into()))?;
    if uuid.get_version() != Some(uuid::Version::Random) {
        return Err(IngressError::Validation("retqueue must be a v4 uuid".into()));
    }

    let mut replies = state
        .app
        .backend
        .get_message_reply(&ident)
        .await
        .map_err(|e| IngressError::Backend(format!("couldn't read reply queue: {e}")))?;

    for msg in &mut replies {
        msg.epoch = epoch_now();
        state.app.identity.sign_message(msg);
    }
    Ok(Json(replies))
}
