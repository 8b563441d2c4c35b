//! WhatsApp Cloud API webhook: subscription handshake and deliveries.
//!
//! Deliveries are acknowledged with 200 whatever happens after signature
//! verification, so the provider never enters a retry storm. The stateful
//! work runs on the pipeline worker.

use std::collections::HashMap;

use axum::{
    body::Bytes,
    extract::{Query, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::{Duration, Utc};
use secrecy::ExposeSecret;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::sync::mpsc::error::TrySendError;

use crate::{
    models::NormalizedBatch,
    services::{
        normalizer_service::{collect_account_ids, normalize},
        pipeline_service::WebhookJob,
        signature_service::{verify, verify_body_signature, verify_handshake, HandshakeOutcome},
    },
    AppState,
};

pub const SIGNATURE_HEADER: &str = "x-hub-signature-256";

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/whatsapp", get(handshake).post(receive))
        .route("/meta/deauthorize", post(deauthorize))
}

#[derive(Debug, Deserialize)]
pub struct HandshakeQuery {
    #[serde(rename = "hub.mode")]
    pub mode: Option<String>,
    #[serde(rename = "hub.verify_token")]
    pub verify_token: Option<String>,
    #[serde(rename = "hub.challenge")]
    pub challenge: Option<String>,
}

async fn handshake(State(state): State<AppState>, Query(query): Query<HandshakeQuery>) -> Response {
    match verify_handshake(
        query.mode.as_deref(),
        query.verify_token.as_deref(),
        query.challenge.as_deref(),
        state.config.whatsapp_verify_token.expose_secret(),
    ) {
        HandshakeOutcome::Accept(challenge) => {
            tracing::info!("Webhook subscription verified");
            (StatusCode::OK, challenge).into_response()
        }
        HandshakeOutcome::Forbidden => {
            tracing::warn!(mode = ?query.mode, "Webhook handshake rejected");
            StatusCode::FORBIDDEN.into_response()
        }
    }
}

fn ack() -> Response {
    (StatusCode::OK, Json(json!({ "status": "ok" }))).into_response()
}

async fn receive(State(state): State<AppState>, headers: HeaderMap, body: Bytes) -> Response {
    let received_at = Utc::now();

    match &state.config.whatsapp_app_secret {
        Some(secret) => {
            let header = headers
                .get(SIGNATURE_HEADER)
                .and_then(|h| h.to_str().ok())
                .unwrap_or_default();
            if let Err(e) = verify_body_signature(&body, header, secret.expose_secret()) {
                tracing::warn!(error = %e, "Rejected webhook delivery");
                return StatusCode::FORBIDDEN.into_response();
            }
        }
        None => tracing::warn!("WHATSAPP_APP_SECRET not set, accepting unsigned webhook delivery"),
    }

    let payload: Value = match serde_json::from_slice(&body) {
        Ok(payload) => payload,
        Err(e) => {
            tracing::error!(error = %e, bytes = body.len(), "Webhook body is not JSON");
            return ack();
        }
    };

    let mut workspaces = HashMap::new();
    for account_id in collect_account_ids(&payload) {
        match state.store.workspace_for_account(&account_id).await {
            Ok(Some(workspace_id)) => {
                workspaces.insert(account_id, workspace_id);
            }
            Ok(None) => tracing::warn!(%account_id, "Webhook for unknown business account"),
            Err(e) => tracing::error!(%account_id, error = %e, "Workspace lookup failed"),
        }
    }

    let batch = match normalize(&payload, |id| workspaces.get(id).copied()) {
        Ok(batch) => batch,
        Err(e) => {
            tracing::error!(error = %e, "Webhook payload could not be normalized");
            return ack();
        }
    };

    for skipped in &batch.skipped {
        tracing::warn!(location = %skipped.location, reason = %skipped.reason, "Skipped webhook entry");
    }

    if batch.events.is_empty() {
        return ack();
    }

    note_sender_rates(&state, &batch).await;

    let events = batch.events.len();
    match state.webhook_tx.try_send(WebhookJob { batch, received_at }) {
        Ok(()) => tracing::debug!(events, "Webhook batch queued"),
        Err(TrySendError::Full(_)) => {
            tracing::error!(events, "Webhook queue full, delivery dropped")
        }
        Err(TrySendError::Closed(_)) => {
            tracing::error!(events, "Webhook pipeline stopped, delivery dropped")
        }
    }

    ack()
}

/// Advisory per-sender counter. Bursty senders are logged, never rejected.
async fn note_sender_rates(state: &AppState, batch: &NormalizedBatch) {
    let window = Duration::seconds(state.config.rate_limit_window_secs.max(1) as i64);
    for event in &batch.events {
        let key = format!("webhook:{}:{}", event.workspace_id, event.sender_id);
        match state
            .rate_limiter
            .hit(&key, state.config.rate_limit_max_requests, window)
            .await
        {
            Ok(decision) if !decision.allowed => tracing::warn!(
                workspace_id = %event.workspace_id,
                sender_id = %event.sender_id,
                count = decision.count,
                "Sender rate limited (advisory)"
            ),
            Ok(_) => {}
            Err(e) => tracing::debug!(error = %e, "Sender rate check unavailable"),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct SignedRequestBody {
    pub signed_request: String,
}

/// Meta app deauthorization callback carrying a `signed_request`
async fn deauthorize(State(state): State<AppState>, Json(body): Json<SignedRequestBody>) -> Response {
    let Some(secret) = &state.config.whatsapp_app_secret else {
        tracing::warn!("Deauthorize callback received but WHATSAPP_APP_SECRET is not set");
        return StatusCode::FORBIDDEN.into_response();
    };

    match verify(&body.signed_request, secret.expose_secret()) {
        Ok(payload) => {
            let user_id = payload.get("user_id").and_then(Value::as_str).unwrap_or_default();
            tracing::info!(%user_id, "App deauthorized");
            (StatusCode::OK, Json(json!({ "success": true }))).into_response()
        }
        Err(e) => {
            tracing::warn!(error = %e, "Rejected signed_request");
            (
                StatusCode::FORBIDDEN,
                Json(json!({ "success": false, "error": e.to_string() })),
            )
                .into_response()
        }
    }
}
