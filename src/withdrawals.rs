//! Withdrawal Engine
//! Mission: Drive external refunds FIFO over deposit lots, surviving partial failure
//!
//! The engine holds the user's wallet lock across the processor calls: the
//! call result decides whether a lot's `remaining` may be decremented, so the
//! lot set must not move underneath it. Each lot refunds independently; a
//! processor rejection skips that lot and the rest continue. The WITHDRAWAL
//! ledger entry records only what actually left.

use crate::config::{Config, WithdrawMode};
use crate::db::Database;
use crate::errors::{CoreError, CoreResult};
use crate::ledger::{self, EntryKind};
use crate::locks::LockRegistry;
use crate::payments::PaymentProcessor;
use crate::wallet;
use chrono::{Duration, Utc};
use rusqlite::params;
use serde::Serialize;
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Serialize)]
pub struct WithdrawalResult {
    pub requested: i64,
    pub refunded: i64,
    pub refund_ids: Vec<String>,
    pub partial: bool,
}

struct ExecutedRefund {
    allocation_id: Uuid,
    amount: i64,
    external_refund_id: String,
}

#[derive(Clone)]
pub struct WithdrawalService {
    db: Database,
    locks: LockRegistry,
    processor: Arc<dyn PaymentProcessor>,
    config: Config,
}

impl WithdrawalService {
    pub fn new(
        db: Database,
        locks: LockRegistry,
        processor: Arc<dyn PaymentProcessor>,
        config: Config,
    ) -> Self {
        Self {
            db,
            locks,
            processor,
            config,
        }
    }

    pub async fn withdraw(&self, user_id: Uuid, tokens: i64) -> CoreResult<WithdrawalResult> {
        if tokens <= 0 {
            return Err(CoreError::InvalidAmount("tokens must be > 0".into()));
        }
        if self.config.withdraw_mode == WithdrawMode::Disabled {
            return Err(CoreError::Disabled);
        }

        let _guard = self.locks.acquire(user_id).await?;

        // Snapshot balance and the eligible lot set. Stable under the lock.
        let window_start = Utc::now() - Duration::days(self.config.refund_window_days);
        let eligible = {
            let conn = self.db.lock().await;
            let balance = ledger::balance(&conn, user_id)?;
            if balance < tokens {
                return Err(CoreError::Insufficient {
                    balance,
                    requested: tokens,
                });
            }
            wallet::refundable_allocations(&conn, user_id, window_start)?
        };
        if eligible.is_empty() {
            return Err(CoreError::NoRefundableFunds);
        }

        // Refund lot by lot, oldest first. The connection is not held across
        // processor calls; the user lock alone pins the wallet.
        let mut remaining_tokens = tokens;
        let mut executed: Vec<ExecutedRefund> = Vec::new();
        for lot in &eligible {
            if remaining_tokens == 0 {
                break;
            }
            let take = remaining_tokens.min(lot.remaining);
            let payment_ref = lot
                .payment_ref
                .as_deref()
                .unwrap_or_default();
            let amount_cents = take * self.config.token_price_cents;

            match self.processor.refund_payment(payment_ref, amount_cents).await {
                Ok(refund_id) => {
                    executed.push(ExecutedRefund {
                        allocation_id: lot.id,
                        amount: take,
                        external_refund_id: refund_id,
                    });
                    remaining_tokens -= take;
                }
                Err(e) => {
                    // This lot keeps its remaining; later lots still get a try.
                    warn!(user = %user_id, allocation = %lot.id, error = %e, "refund failed, skipping lot");
                }
            }
        }

        let refunded = tokens - remaining_tokens;
        if refunded == 0 {
            return Ok(WithdrawalResult {
                requested: tokens,
                refunded: 0,
                refund_ids: Vec::new(),
                partial: true,
            });
        }

        // Commit the ledger entry, lot decrements, and refund audit rows as one unit.
        let refund_ids = {
            let mut conn = self.db.lock().await;
            let tx = conn.transaction()?;
            let entry_id = ledger::append(
                &tx,
                user_id,
                EntryKind::Withdrawal,
                -refunded,
                None,
                Some("stripe_refund"),
            )?;

            let now = Utc::now().to_rfc3339();
            let mut refund_ids = Vec::with_capacity(executed.len());
            for r in &executed {
                tx.execute(
                    "UPDATE allocations SET remaining = remaining - ?1 WHERE id = ?2",
                    params![r.amount, r.allocation_id.to_string()],
                )?;
                tx.execute(
                    "INSERT INTO refunds (id, user_id, allocation_id, amount, external_refund_id, withdrawal_ledger_entry_id, created_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                    params![
                        Uuid::new_v4().to_string(),
                        user_id.to_string(),
                        r.allocation_id.to_string(),
                        r.amount,
                        r.external_refund_id,
                        entry_id.to_string(),
                        now,
                    ],
                )?;
                refund_ids.push(r.external_refund_id.clone());
            }
            tx.commit()?;
            refund_ids
        };

        info!(user = %user_id, requested = tokens, refunded, "withdrawal executed");
        Ok(WithdrawalResult {
            requested: tokens,
            refunded,
            refund_ids,
            partial: refunded < tokens,
        })
    }
}
