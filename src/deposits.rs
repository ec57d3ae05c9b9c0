//! Deposit Pipeline
//! Mission: Checkout-session creation and idempotent webhook ingestion
//!
//! `begin_deposit` never writes to the ledger; tokens only appear when the
//! processor confirms payment through the webhook, and that write is
//! idempotent on the payment intent id. A failed credit returns an error so
//! the processor retries; retries are harmless.

use crate::config::Config;
use crate::db::Database;
use crate::errors::{CoreError, CoreResult};
use crate::ledger::{self, EntryKind};
use crate::payments::webhook::{WebhookEvent, CHECKOUT_COMPLETED, PAYMENT_STATUS_PAID};
use crate::payments::{CheckoutRequest, CheckoutSession, PaymentProcessor};
use crate::wallet::{CreditKind, Wallet};
use chrono::Utc;
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

/// What an accepted webhook did.
#[derive(Debug)]
pub enum WebhookOutcome {
    Credited {
        user_id: Uuid,
        tokens: i64,
        entry_id: Uuid,
    },
    /// Event already processed; acknowledged without writes.
    Duplicate,
    /// Event type or payload the pipeline does not act on.
    Ignored(&'static str),
}

#[derive(Clone)]
pub struct DepositService {
    db: Database,
    wallet: Wallet,
    processor: Arc<dyn PaymentProcessor>,
    config: Config,
}

impl DepositService {
    pub fn new(
        db: Database,
        wallet: Wallet,
        processor: Arc<dyn PaymentProcessor>,
        config: Config,
    ) -> Self {
        Self {
            db,
            wallet,
            processor,
            config,
        }
    }

    /// Tokens the user may still deposit today (UTC day).
    pub async fn daily_remaining(&self, user_id: Uuid) -> CoreResult<i64> {
        let midnight = Utc::now()
            .date_naive()
            .and_hms_opt(0, 0, 0)
            .unwrap_or_default()
            .and_utc();
        let conn = self.db.lock().await;
        let today = ledger::sum_kind_since(&conn, user_id, EntryKind::Deposit, midnight)?;
        Ok((self.config.daily_deposit_cap_tokens - today).max(0))
    }

    /// Create a checkout session for `tokens`. No ledger writes happen here.
    pub async fn begin_deposit(
        &self,
        user_id: Uuid,
        tokens: i64,
        success_url: String,
        cancel_url: String,
    ) -> CoreResult<CheckoutSession> {
        if tokens <= 0 {
            return Err(CoreError::InvalidAmount("tokens must be > 0".into()));
        }

        let remaining = self.daily_remaining(user_id).await?;
        if tokens > remaining {
            return Err(CoreError::DailyLimit { remaining });
        }

        let amount_cents = tokens * self.config.token_price_cents;
        let session = self
            .processor
            .create_checkout_session(CheckoutRequest {
                user_id,
                tokens,
                amount_cents,
                success_url,
                cancel_url,
            })
            .await?;

        info!(user = %user_id, tokens, session = %session.session_id, "checkout session created");
        Ok(session)
    }

    /// React to a verified webhook event. Only completed, paid checkout
    /// sessions credit the wallet; everything else is acknowledged untouched.
    pub async fn on_payment_confirmed(&self, event: &WebhookEvent) -> CoreResult<WebhookOutcome> {
        if event.event_type != CHECKOUT_COMPLETED {
            return Ok(WebhookOutcome::Ignored("unhandled event type"));
        }
        let obj = &event.data.object;
        if obj.payment_status.as_deref() != Some(PAYMENT_STATUS_PAID) {
            return Ok(WebhookOutcome::Ignored("payment not completed"));
        }

        let Some(payment_ref) = obj.payment_intent.as_deref() else {
            warn!("paid checkout event without payment_intent");
            return Ok(WebhookOutcome::Ignored("missing payment_intent"));
        };
        let Some(user_id) = obj
            .client_reference_id
            .as_deref()
            .and_then(|s| Uuid::parse_str(s).ok())
        else {
            warn!(payment_ref, "paid checkout event without usable reference id");
            return Ok(WebhookOutcome::Ignored("missing client_reference_id"));
        };
        let amount_cents = obj.amount_total.unwrap_or(0);
        let tokens = amount_cents / self.config.token_price_cents;
        if tokens <= 0 {
            return Ok(WebhookOutcome::Ignored("zero-token amount"));
        }

        let outcome = self
            .wallet
            .credit(
                user_id,
                tokens,
                CreditKind::Deposit,
                Some(payment_ref),
                Some(payment_ref),
            )
            .await?;

        if outcome.duplicate {
            return Ok(WebhookOutcome::Duplicate);
        }
        info!(user = %user_id, tokens, payment_ref, "deposit credited");
        Ok(WebhookOutcome::Credited {
            user_id,
            tokens,
            entry_id: outcome.entry_id,
        })
    }
}
