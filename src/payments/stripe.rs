//! Stripe Client
//! Mission: Checkout sessions and refunds over Stripe's form-encoded REST API

use super::{CheckoutRequest, CheckoutSession, PaymentProcessor};
use crate::errors::{CoreError, CoreResult};
use async_trait::async_trait;
use serde::Deserialize;
use std::time::Duration;
use tracing::warn;

const DEFAULT_API_BASE: &str = "https://api.stripe.com";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

pub struct StripeClient {
    http: reqwest::Client,
    secret_key: String,
    api_base: String,
}

impl StripeClient {
    pub fn new(secret_key: String) -> Self {
        Self::with_base(secret_key, DEFAULT_API_BASE.to_string())
    }

    pub fn with_base(secret_key: String, api_base: String) -> Self {
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .unwrap_or_default();
        Self {
            http,
            secret_key,
            api_base,
        }
    }

    async fn post_form<T: for<'de> Deserialize<'de>>(
        &self,
        path: &str,
        form: &[(String, String)],
    ) -> CoreResult<T> {
        let url = format!("{}{}", self.api_base, path);
        let resp = self
            .http
            .post(&url)
            .basic_auth(&self.secret_key, None::<&str>)
            .form(form)
            .send()
            .await
            .map_err(|e| CoreError::Processor(format!("stripe request failed: {e}")))?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            warn!(%status, path, "stripe returned error");
            return Err(CoreError::Processor(format!(
                "stripe {path} returned {status}: {body}"
            )));
        }

        resp.json::<T>()
            .await
            .map_err(|e| CoreError::Processor(format!("stripe response decode failed: {e}")))
    }
}

#[derive(Deserialize)]
struct SessionResponse {
    id: String,
    url: String,
}

#[derive(Deserialize)]
struct RefundResponse {
    id: String,
}

#[async_trait]
impl PaymentProcessor for StripeClient {
    async fn create_checkout_session(&self, req: CheckoutRequest) -> CoreResult<CheckoutSession> {
        let form: Vec<(String, String)> = vec![
            ("mode".into(), "payment".into()),
            // The webhook reads this back to find the user.
            ("client_reference_id".into(), req.user_id.to_string()),
            ("line_items[0][price_data][currency]".into(), "usd".into()),
            (
                "line_items[0][price_data][product_data][name]".into(),
                "PeerPush Token Top-up".into(),
            ),
            (
                "line_items[0][price_data][unit_amount]".into(),
                req.amount_cents.to_string(),
            ),
            ("line_items[0][quantity]".into(), "1".into()),
            (
                "payment_intent_data[metadata][user_id]".into(),
                req.user_id.to_string(),
            ),
            (
                "payment_intent_data[metadata][tokens_requested]".into(),
                req.tokens.to_string(),
            ),
            (
                "success_url".into(),
                format!("{}?session_id={{CHECKOUT_SESSION_ID}}", req.success_url),
            ),
            ("cancel_url".into(), req.cancel_url),
        ];

        let resp: SessionResponse = self.post_form("/v1/checkout/sessions", &form).await?;
        Ok(CheckoutSession {
            session_id: resp.id,
            checkout_url: resp.url,
        })
    }

    async fn refund_payment(&self, payment_ref: &str, amount_cents: i64) -> CoreResult<String> {
        let form: Vec<(String, String)> = vec![
            ("payment_intent".into(), payment_ref.to_string()),
            ("amount".into(), amount_cents.to_string()),
        ];
        let resp: RefundResponse = self.post_form("/v1/refunds", &form).await?;
        Ok(resp.id)
    }
}
