//! HTTP surface: slash-command endpoint and read-only JSON status API

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Form, Json, Router};
use hmac::{Hmac, Mac};
use serde::Deserialize;
use sha2::Sha256;
use tokio_util::sync::CancellationToken;

use crate::commands::{CommandHandler, CommandRequest};
use crate::state::StateHandle;
use crate::BridgeError;

type HmacSha256 = Hmac<Sha256>;

/// Server application state
#[derive(Clone)]
pub struct ServerState {
    pub state: StateHandle,
    pub commands: Arc<CommandHandler>,
    pub command_token: Option<String>,
}

/// Slash-command request as posted by the chat server. Unknown fields are
/// ignored.
#[derive(Debug, Deserialize)]
struct CommandForm {
    channel_id: String,
    user_id: String,
    #[serde(default)]
    text: String,
    #[serde(default)]
    command: Option<String>,
    #[serde(default)]
    token: Option<String>,
}

/// Build the axum router
pub fn build_router(server_state: ServerState) -> Router {
    Router::new()
        .route("/api/command", post(command_handler))
        .route("/api/status", get(status_handler))
        .route("/api/history", get(history_handler))
        .route("/health", get(health_handler))
        .with_state(server_state)
}

/// Serve until `cancel` fires
pub async fn serve(router: Router, port: u16, cancel: CancellationToken) -> crate::Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!("Command server listening on http://{}", addr);

    axum::serve(listener, router)
        .with_graceful_shutdown(async move {
            cancel.cancelled().await;
        })
        .await
        .map_err(BridgeError::Io)?;

    tracing::debug!("Command server stopped");
    Ok(())
}

async fn command_handler(State(server): State<ServerState>, Form(form): Form<CommandForm>) -> Response {
    if let Some(expected) = &server.command_token {
        let accepted = form
            .token
            .as_deref()
            .is_some_and(|supplied| token_matches(supplied, expected));
        if !accepted {
            tracing::warn!("Rejected command from {} with a bad token", form.user_id);
            return (StatusCode::UNAUTHORIZED, "invalid command token").into_response();
        }
    }

    tracing::debug!(
        "{} {} from {}",
        form.command.as_deref().unwrap_or("/teamcity"),
        form.text,
        form.user_id
    );
    let request = CommandRequest {
        channel_id: form.channel_id,
        user_id: form.user_id,
        text: form.text,
    };
    Json(server.commands.handle(&request).await).into_response()
}

/// Constant-time token check. Both sides are compared as HMAC tags keyed by
/// the expected token, so the comparison length is fixed.
fn token_matches(supplied: &str, expected: &str) -> bool {
    let tag = |value: &str| {
        HmacSha256::new_from_slice(expected.as_bytes()).map(|mut mac| {
            mac.update(value.as_bytes());
            mac
        })
    };
    match (tag(supplied), tag(expected)) {
        (Ok(supplied), Ok(expected)) => supplied
            .verify_slice(&expected.finalize().into_bytes())
            .is_ok(),
        _ => false,
    }
}

async fn status_handler(State(server): State<ServerState>) -> impl IntoResponse {
    let state = server.state.read().await;

    let statuses: Vec<serde_json::Value> = state
        .build_types
        .values()
        .map(|s| {
            serde_json::json!({
                "build_type": s.build_type,
                "observed": s.observed,
                "last_build": s.last_build,
                "last_poll_epoch_ms": s.last_poll_epoch_ms,
                "last_change_epoch_ms": s.last_change_epoch_ms,
                "consecutive_failures": s.consecutive_failures,
                "last_error": s.last_error,
            })
        })
        .collect();

    Json(serde_json::json!({
        "uptime_seconds": state.started_at.elapsed().as_secs(),
        "sweeps": state.sweeps,
        "last_sweep_epoch_ms": state.last_sweep_epoch_ms,
        "unauthorized": state.unauthorized,
        "build_types": statuses,
    }))
}

async fn history_handler(State(server): State<ServerState>) -> impl IntoResponse {
    let state = server.state.read().await;
    Json(state.history.iter().cloned().collect::<Vec<_>>())
}

async fn health_handler() -> impl IntoResponse {
    "OK"
}
