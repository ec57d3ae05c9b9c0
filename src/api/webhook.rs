//! Stripe Webhook Endpoint
//! Mission: Verify, ingest, and always answer the processor correctly
//!
//! A 2xx acknowledges the event (including duplicates and event types we
//! ignore). Any credit failure returns non-2xx so the processor retries;
//! retries are safe because the credit is idempotent on the payment intent.

use super::{ApiError, AppState};
use crate::deposits::WebhookOutcome;
use axum::{
    body::Bytes,
    extract::State,
    http::HeaderMap,
    response::Json,
};
use serde::Serialize;
use tracing::info;

#[derive(Serialize)]
pub struct WebhookAck {
    ok: bool,
}

pub async fn stripe_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<WebhookAck>, ApiError> {
    let signature = headers
        .get("Stripe-Signature")
        .and_then(|h| h.to_str().ok())
        .unwrap_or("");

    let event = state.webhook_verifier.verify(&body, signature)?;
    match state.deposits.on_payment_confirmed(&event).await? {
        WebhookOutcome::Credited { user_id, tokens, .. } => {
            info!(user = %user_id, tokens, "webhook credited deposit");
        }
        WebhookOutcome::Duplicate => {
            info!("webhook replay acknowledged");
        }
        WebhookOutcome::Ignored(reason) => {
            info!(reason, event_type = %event.event_type, "webhook ignored");
        }
    }
    Ok(Json(WebhookAck { ok: true }))
}
