//! Payment Processor Integration
//! Mission: One seam for everything that touches the card network
//!
//! The processor is an executor, never a source of truth: every call is
//! idempotent in the outer system (webhook external ids, refund audit rows),
//! so unbounded retries against it are safe.

pub mod stripe;
pub mod webhook;

use crate::errors::CoreResult;
use async_trait::async_trait;
use uuid::Uuid;

/// Checkout session request for a token top-up.
#[derive(Debug, Clone)]
pub struct CheckoutRequest {
    pub user_id: Uuid,
    pub tokens: i64,
    pub amount_cents: i64,
    pub success_url: String,
    pub cancel_url: String,
}

#[derive(Debug, Clone)]
pub struct CheckoutSession {
    pub session_id: String,
    pub checkout_url: String,
}

/// Capability set the core needs from the processor. Production uses
/// [`stripe::StripeClient`]; tests use [`MockProcessor`].
#[async_trait]
pub trait PaymentProcessor: Send + Sync {
    async fn create_checkout_session(&self, req: CheckoutRequest) -> CoreResult<CheckoutSession>;

    /// Refund `amount_cents` against the original charge. Returns the
    /// processor's refund id.
    async fn refund_payment(&self, payment_ref: &str, amount_cents: i64) -> CoreResult<String>;
}

// ===== In-memory processor for tests =====

use crate::errors::CoreError;
use parking_lot::Mutex;
use std::collections::HashSet;

#[derive(Debug, Clone)]
pub struct RecordedRefund {
    pub payment_ref: String,
    pub amount_cents: i64,
    pub refund_id: String,
}

/// Scriptable in-memory processor. Refunds against payment refs registered
/// via [`MockProcessor::fail_refunds_for`] are rejected, everything else
/// succeeds with a deterministic refund id.
#[derive(Default)]
pub struct MockProcessor {
    sessions: Mutex<Vec<CheckoutRequest>>,
    refunds: Mutex<Vec<RecordedRefund>>,
    failing_refs: Mutex<HashSet<String>>,
}

impl MockProcessor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_refunds_for(&self, payment_ref: &str) {
        self.failing_refs.lock().insert(payment_ref.to_string());
    }

    pub fn sessions(&self) -> Vec<CheckoutRequest> {
        self.sessions.lock().clone()
    }

    pub fn refunds(&self) -> Vec<RecordedRefund> {
        self.refunds.lock().clone()
    }
}

#[async_trait]
impl PaymentProcessor for MockProcessor {
    async fn create_checkout_session(&self, req: CheckoutRequest) -> CoreResult<CheckoutSession> {
        let mut sessions = self.sessions.lock();
        let n = sessions.len();
        sessions.push(req);
        Ok(CheckoutSession {
            session_id: format!("cs_test_{n}"),
            checkout_url: format!("https://checkout.example/session/{n}"),
        })
    }

    async fn refund_payment(&self, payment_ref: &str, amount_cents: i64) -> CoreResult<String> {
        if self.failing_refs.lock().contains(payment_ref) {
            return Err(CoreError::Processor(format!(
                "refund rejected for {payment_ref}"
            )));
        }
        let mut refunds = self.refunds.lock();
        let refund_id = format!("re_test_{}", refunds.len());
        refunds.push(RecordedRefund {
            payment_ref: payment_ref.to_string(),
            amount_cents,
            refund_id: refund_id.clone(),
        });
        Ok(refund_id)
    }
}
