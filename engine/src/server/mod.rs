//! Webhook HTTP server
//!
//! Endpoints:
//! - GET /webhook - Messenger subscription handshake
//! - POST /webhook - message deliveries, one turn per message
//! - GET /health - liveness check
//!
//! A delivery is answered with 500 when at least one of its turns failed with
//! a recoverable error, so the platform redelivers it. Other failures are
//! logged and acknowledged with 200: redelivering would fail the same way.

use std::future::Future;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use futures::future::join_all;
use serde::Deserialize;
use tracing::{debug, info, warn};

use sdk::StorylineErrorExt;

use crate::messaging::WebhookPayload;
use crate::orchestrator::Orchestrator;

/// State shared across handlers
#[derive(Clone)]
pub struct ServerState {
    orchestrator: Arc<Orchestrator>,
    verify_token: Arc<str>,
}

impl ServerState {
    pub fn new(orchestrator: Arc<Orchestrator>, verify_token: impl Into<String>) -> Self {
        Self {
            orchestrator,
            verify_token: Arc::from(verify_token.into()),
        }
    }
}

#[derive(Deserialize, Debug)]
pub struct VerifyParams {
    #[serde(rename = "hub.mode")]
    mode: Option<String>,
    #[serde(rename = "hub.verify_token")]
    verify_token: Option<String>,
    #[serde(rename = "hub.challenge")]
    challenge: Option<String>,
}

/// Build the router
pub fn router(state: ServerState) -> Router {
    Router::new()
        .route("/webhook", get(verify_handler).post(receive_handler))
        .route("/health", get(health_handler))
        .with_state(state)
}

/// Serve until `shutdown` resolves
pub async fn serve(
    bind_addr: &str,
    state: ServerState,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(bind_addr)
        .await
        .with_context(|| format!("Failed to bind to {}", bind_addr))?;

    info!(
        "Webhook server listening on http://{}",
        listener.local_addr().context("Failed to get local address")?
    );

    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move {
            shutdown.await;
            info!("Webhook server shutting down gracefully");
        })
        .await
        .context("Webhook server error")?;

    Ok(())
}

async fn health_handler() -> &'static str {
    "ok"
}

/// Subscription handshake: echo the challenge if the token matches
async fn verify_handler(
    State(state): State<ServerState>,
    Query(params): Query<VerifyParams>,
) -> Response {
    let token_ok = params.verify_token.as_deref() == Some(&*state.verify_token);

    match (params.mode.as_deref(), params.challenge) {
        (Some("subscribe"), Some(challenge)) if token_ok => {
            info!("Webhook subscription verified");
            challenge.into_response()
        }
        _ => {
            warn!("Webhook verification rejected");
            StatusCode::FORBIDDEN.into_response()
        }
    }
}

async fn receive_handler(
    State(state): State<ServerState>,
    Json(payload): Json<WebhookPayload>,
) -> Response {
    if !payload.is_page() {
        debug!(object = %payload.object, "Ignoring non-page webhook");
        return StatusCode::NOT_FOUND.into_response();
    }

    let inbound = payload.inbound_messages();
    debug!("Webhook delivery with {} message(s)", inbound.len());

    // Same-user turns queue on the user lock in delivery order
    let results = join_all(
        inbound
            .into_iter()
            .map(|message| state.orchestrator.handle_message(message)),
    )
    .await;

    let retry = results
        .iter()
        .any(|result| matches!(result, Err(e) if e.is_recoverable()));

    if retry {
        StatusCode::INTERNAL_SERVER_ERROR.into_response()
    } else {
        (StatusCode::OK, "EVENT_RECEIVED").into_response()
    }
}
