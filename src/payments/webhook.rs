//! Webhook Verification
//! Mission: Authenticate processor events before any money moves
//!
//! Signature scheme: HMAC-SHA256 over `{timestamp}.{raw_body}` with the shared
//! webhook secret, carried in a `t=...,v1=...` header. Events older (or newer)
//! than the tolerance are rejected to blunt replay.

use crate::errors::{CoreError, CoreResult};
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use serde::Deserialize;
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

/// Maximum clock skew between the signed timestamp and our wall clock.
pub const SIGNATURE_TOLERANCE_SECS: i64 = 300;

pub const CHECKOUT_COMPLETED: &str = "checkout.session.completed";
pub const PAYMENT_STATUS_PAID: &str = "paid";

#[derive(Debug, Deserialize)]
pub struct WebhookEvent {
    #[serde(rename = "type")]
    pub event_type: String,
    pub data: EventData,
}

#[derive(Debug, Deserialize)]
pub struct EventData {
    pub object: EventObject,
}

/// The slice of the checkout session object the core consumes.
#[derive(Debug, Deserialize)]
pub struct EventObject {
    pub payment_intent: Option<String>,
    pub client_reference_id: Option<String>,
    pub amount_total: Option<i64>,
    pub payment_status: Option<String>,
}

#[derive(Clone)]
pub struct WebhookVerifier {
    secret: String,
}

impl WebhookVerifier {
    pub fn new(secret: String) -> Self {
        Self { secret }
    }

    /// Verify signature and freshness, then parse the event payload.
    pub fn verify(&self, payload: &[u8], signature_header: &str) -> CoreResult<WebhookEvent> {
        self.verify_at(payload, signature_header, Utc::now())
    }

    fn verify_at(
        &self,
        payload: &[u8],
        signature_header: &str,
        now: DateTime<Utc>,
    ) -> CoreResult<WebhookEvent> {
        let (timestamp, signature) = parse_signature_header(signature_header)?;

        let skew = (now.timestamp() - timestamp).abs();
        if skew > SIGNATURE_TOLERANCE_SECS {
            return Err(CoreError::InvalidSignature(format!(
                "timestamp skewed by {skew}s"
            )));
        }

        let mut mac = HmacSha256::new_from_slice(self.secret.as_bytes())
            .map_err(|e| CoreError::InvalidSignature(format!("bad secret: {e}")))?;
        mac.update(timestamp.to_string().as_bytes());
        mac.update(b".");
        mac.update(payload);

        let expected =
            hex::decode(&signature).map_err(|_| CoreError::InvalidSignature("v1 is not hex".into()))?;
        mac.verify_slice(&expected)
            .map_err(|_| CoreError::InvalidSignature("digest mismatch".into()))?;

        serde_json::from_slice(payload)
            .map_err(|e| CoreError::InvalidSignature(format!("unparseable payload: {e}")))
    }

    /// Produce a valid signature header for `payload` at `timestamp`.
    /// Counterpart of `verify`; used by tests and local tooling.
    pub fn sign(&self, payload: &[u8], timestamp: i64) -> String {
        let mut mac = HmacSha256::new_from_slice(self.secret.as_bytes())
            .expect("HMAC accepts any key length");
        mac.update(timestamp.to_string().as_bytes());
        mac.update(b".");
        mac.update(payload);
        let digest = hex::encode(mac.finalize().into_bytes());
        format!("t={timestamp},v1={digest}")
    }
}

fn parse_signature_header(header: &str) -> CoreResult<(i64, String)> {
    let mut timestamp = None;
    let mut signature = None;

    for part in header.split(',') {
        match part.trim().split_once('=') {
            Some(("t", v)) => timestamp = v.parse::<i64>().ok(),
            Some(("v1", v)) => signature = Some(v.to_string()),
            _ => {}
        }
    }

    match (timestamp, signature) {
        (Some(t), Some(s)) => Ok((t, s)),
        _ => Err(CoreError::InvalidSignature(
            "header missing t= or v1=".into(),
        )),
    }
}
