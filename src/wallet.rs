//! Wallet Operations
//! Mission: Per-user credit/debit under an exclusive lock, with FIFO lot tracking
//!
//! Every credit writes a ledger entry plus an allocation lot; every debit
//! writes a ledger entry and consumes lot capacity oldest-first. That dual
//! write is what lets refunds find their originating payment without scanning
//! ledger history, and keeps `balance == SUM(allocations.remaining)` at all
//! times.

use crate::db::Database;
use crate::errors::{CoreError, CoreResult};
use crate::ledger::{self, EntryKind, LedgerEntry};
use crate::locks::LockRegistry;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};
use serde::Serialize;
use tracing::info;
use uuid::Uuid;

/// Kinds allowed on the credit path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreditKind {
    Deposit,
    Payout,
}

impl CreditKind {
    fn entry_kind(&self) -> EntryKind {
        match self {
            CreditKind::Deposit => EntryKind::Deposit,
            CreditKind::Payout => EntryKind::Payout,
        }
    }
}

/// Kinds allowed on the debit path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DebitKind {
    Stake,
    Withdrawal,
}

impl DebitKind {
    fn entry_kind(&self) -> EntryKind {
        match self {
            DebitKind::Stake => EntryKind::Stake,
            DebitKind::Withdrawal => EntryKind::Withdrawal,
        }
    }
}

/// A FIFO deposit lot. `remaining` only ever decreases.
#[derive(Debug, Clone, Serialize)]
pub struct Allocation {
    pub id: Uuid,
    pub user_id: Uuid,
    pub original: i64,
    pub remaining: i64,
    pub payment_ref: Option<String>,
    pub ledger_entry_id: Uuid,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct CreditOutcome {
    pub entry_id: Uuid,
    /// True when `(kind, external_id)` was already recorded and nothing was
    /// written; callers treat the call as a success either way.
    pub duplicate: bool,
}

fn row_to_allocation(row: &rusqlite::Row<'_>) -> rusqlite::Result<Allocation> {
    let parse = |col: usize, s: String| {
        Uuid::parse_str(&s).map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(col, rusqlite::types::Type::Text, Box::new(e))
        })
    };
    Ok(Allocation {
        id: parse(0, row.get(0)?)?,
        user_id: parse(1, row.get(1)?)?,
        original: row.get(2)?,
        remaining: row.get(3)?,
        payment_ref: row.get(4)?,
        ledger_entry_id: parse(5, row.get(5)?)?,
        created_at: ledger::parse_ts(6, row.get(6)?)?,
    })
}

const ALLOC_COLS: &str = "id, user_id, original, remaining, payment_ref, ledger_entry_id, created_at";

// ===== Transaction-level operations =====
//
// These run inside an open transaction while the caller holds the user's
// advisory lock. The `Wallet` methods below wrap them for the single-user
// case; the settlement engine calls them directly so a whole payout commits
// as one unit.

/// Credit `amount` tokens. Idempotent on `(kind, external_id)` when an
/// external id is supplied. Every credit creates an allocation lot: a
/// refundable one when this is a deposit with a payment reference, a
/// synthetic non-refundable one otherwise (winnings never go back to a card).
pub fn apply_credit(
    conn: &Connection,
    user_id: Uuid,
    amount: i64,
    kind: CreditKind,
    external_id: Option<&str>,
    payment_ref: Option<&str>,
) -> CoreResult<CreditOutcome> {
    if amount <= 0 {
        return Err(CoreError::InvalidAmount(format!(
            "credit amount must be positive, got {amount}"
        )));
    }

    let entry_id = match ledger::append(conn, user_id, kind.entry_kind(), amount, external_id, None)
    {
        Ok(id) => id,
        Err(CoreError::Duplicate { entry_id }) => {
            return Ok(CreditOutcome {
                entry_id,
                duplicate: true,
            });
        }
        Err(e) => return Err(e),
    };

    let lot_ref = match kind {
        CreditKind::Deposit => payment_ref,
        CreditKind::Payout => None,
    };
    conn.execute(
        "INSERT INTO allocations (id, user_id, original, remaining, payment_ref, ledger_entry_id, created_at)
         VALUES (?1, ?2, ?3, ?3, ?4, ?5, ?6)",
        params![
            Uuid::new_v4().to_string(),
            user_id.to_string(),
            amount,
            lot_ref,
            entry_id.to_string(),
            Utc::now().to_rfc3339(),
        ],
    )?;

    Ok(CreditOutcome {
        entry_id,
        duplicate: false,
    })
}

/// Debit `amount` tokens, consuming allocation lots oldest-first. A single
/// debit may span several lots. Fails with `Insufficient` before any write.
pub fn apply_debit(
    conn: &Connection,
    user_id: Uuid,
    amount: i64,
    kind: DebitKind,
    note: Option<&str>,
) -> CoreResult<Uuid> {
    if amount <= 0 {
        return Err(CoreError::InvalidAmount(format!(
            "debit amount must be positive, got {amount}"
        )));
    }

    let balance = ledger::balance(conn, user_id)?;
    if balance < amount {
        return Err(CoreError::Insufficient {
            balance,
            requested: amount,
        });
    }

    let entry_id = ledger::append(conn, user_id, kind.entry_kind(), -amount, None, note)?;
    consume_allocations(conn, user_id, amount)?;
    Ok(entry_id)
}

/// Walk active lots in FIFO order, decrementing `remaining` until `amount`
/// is exhausted. The balance check above guarantees capacity exists as long
/// as the balance/allocation invariant holds.
fn consume_allocations(conn: &Connection, user_id: Uuid, amount: i64) -> CoreResult<()> {
    let mut left = amount;

    let mut stmt = conn.prepare_cached(
        "SELECT id, remaining FROM allocations
         WHERE user_id = ?1 AND remaining > 0
         ORDER BY created_at ASC, rowid ASC",
    )?;
    let lots = stmt
        .query_map(params![user_id.to_string()], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
        })?
        .collect::<Result<Vec<_>, _>>()?;

    for (lot_id, remaining) in lots {
        if left == 0 {
            break;
        }
        let take = left.min(remaining);
        conn.execute(
            "UPDATE allocations SET remaining = remaining - ?1 WHERE id = ?2",
            params![take, lot_id],
        )?;
        left -= take;
    }

    if left > 0 {
        // Balance said yes but the lots could not cover it: the dual-write
        // invariant is broken and the transaction must roll back.
        return Err(CoreError::StateConflict(format!(
            "allocation capacity short by {left} tokens for user {user_id}"
        )));
    }
    Ok(())
}

/// Lots eligible for external refund: active, card-backed, inside the window.
pub fn refundable_allocations(
    conn: &Connection,
    user_id: Uuid,
    window_start: DateTime<Utc>,
) -> CoreResult<Vec<Allocation>> {
    let mut stmt = conn.prepare_cached(&format!(
        "SELECT {ALLOC_COLS} FROM allocations
         WHERE user_id = ?1 AND remaining > 0 AND payment_ref IS NOT NULL AND created_at >= ?2
         ORDER BY created_at ASC, rowid ASC"
    ))?;
    let rows = stmt
        .query_map(
            params![user_id.to_string(), window_start.to_rfc3339()],
            row_to_allocation,
        )?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

pub fn allocations_for_user(conn: &Connection, user_id: Uuid) -> CoreResult<Vec<Allocation>> {
    let mut stmt = conn.prepare_cached(&format!(
        "SELECT {ALLOC_COLS} FROM allocations
         WHERE user_id = ?1 ORDER BY created_at ASC, rowid ASC"
    ))?;
    let rows = stmt
        .query_map(params![user_id.to_string()], row_to_allocation)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

/// Sum of active lot capacity; equals the ledger balance at all times.
pub fn sum_remaining(conn: &Connection, user_id: Uuid) -> CoreResult<i64> {
    let total: i64 = conn.query_row(
        "SELECT COALESCE(SUM(remaining), 0) FROM allocations WHERE user_id = ?1",
        params![user_id.to_string()],
        |row| row.get(0),
    )?;
    Ok(total)
}

// ===== Wallet service =====

/// Single-user wallet operations. Each mutation takes the user's exclusive
/// advisory lock and commits as one transaction.
#[derive(Clone)]
pub struct Wallet {
    db: Database,
    locks: LockRegistry,
}

impl Wallet {
    pub fn new(db: Database, locks: LockRegistry) -> Self {
        Self { db, locks }
    }

    pub async fn credit(
        &self,
        user_id: Uuid,
        amount: i64,
        kind: CreditKind,
        external_id: Option<&str>,
        payment_ref: Option<&str>,
    ) -> CoreResult<CreditOutcome> {
        let _guard = self.locks.acquire(user_id).await?;
        let mut conn = self.db.lock().await;
        let tx = conn.transaction()?;
        let outcome = apply_credit(&tx, user_id, amount, kind, external_id, payment_ref)?;
        tx.commit()?;
        if !outcome.duplicate {
            info!(user = %user_id, amount, entry = %outcome.entry_id, "wallet credit");
        }
        Ok(outcome)
    }

    pub async fn debit(
        &self,
        user_id: Uuid,
        amount: i64,
        kind: DebitKind,
        note: Option<&str>,
    ) -> CoreResult<Uuid> {
        let _guard = self.locks.acquire(user_id).await?;
        let mut conn = self.db.lock().await;
        let tx = conn.transaction()?;
        let entry_id = apply_debit(&tx, user_id, amount, kind, note)?;
        tx.commit()?;
        info!(user = %user_id, amount, entry = %entry_id, "wallet debit");
        Ok(entry_id)
    }

    pub async fn balance(&self, user_id: Uuid) -> CoreResult<i64> {
        let conn = self.db.lock().await;
        ledger::balance(&conn, user_id)
    }

    /// Balance plus full entry history, newest first.
    pub async fn snapshot(&self, user_id: Uuid) -> CoreResult<(i64, Vec<LedgerEntry>)> {
        let conn = self.db.lock().await;
        let balance = ledger::balance(&conn, user_id)?;
        let entries = ledger::entries_for_user(&conn, user_id)?;
        Ok((balance, entries))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn wallet() -> Wallet {
        Wallet::new(Database::open_in_memory().unwrap(), LockRegistry::new())
    }

    async fn assert_invariants(w: &Wallet, user: Uuid) {
        let conn = w.db.lock().await;
        let bal = ledger::balance(&conn, user).unwrap();
        assert!(bal >= 0, "balance went negative");
        assert_eq!(
            bal,
            sum_remaining(&conn, user).unwrap(),
            "balance != sum of allocation remaining"
        );
    }

    #[tokio::test]
    async fn test_deposit_creates_refundable_lot() {
        let w = wallet();
        let user = Uuid::new_v4();

        let out = w
            .credit(user, 1000, CreditKind::Deposit, Some("pi_1"), Some("pi_1"))
            .await
            .unwrap();
        assert!(!out.duplicate);

        let conn = w.db.lock().await;
        let lots = allocations_for_user(&conn, user).unwrap();
        assert_eq!(lots.len(), 1);
        assert_eq!(lots[0].original, 1000);
        assert_eq!(lots[0].remaining, 1000);
        assert_eq!(lots[0].payment_ref.as_deref(), Some("pi_1"));
        drop(conn);
        assert_invariants(&w, user).await;
    }

    #[tokio::test]
    async fn test_payout_lot_is_synthetic() {
        let w = wallet();
        let user = Uuid::new_v4();

        w.credit(user, 250, CreditKind::Payout, Some("payout_x"), None)
            .await
            .unwrap();

        let conn = w.db.lock().await;
        let lots = allocations_for_user(&conn, user).unwrap();
        assert_eq!(lots.len(), 1);
        assert!(lots[0].payment_ref.is_none());
    }

    #[tokio::test]
    async fn test_credit_idempotent_on_external_id() {
        let w = wallet();
        let user = Uuid::new_v4();

        let first = w
            .credit(user, 300, CreditKind::Deposit, Some("pi_once"), Some("pi_once"))
            .await
            .unwrap();
        let second = w
            .credit(user, 300, CreditKind::Deposit, Some("pi_once"), Some("pi_once"))
            .await
            .unwrap();

        assert!(second.duplicate);
        assert_eq!(first.entry_id, second.entry_id);
        assert_eq!(w.balance(user).await.unwrap(), 300);

        let conn = w.db.lock().await;
        assert_eq!(allocations_for_user(&conn, user).unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_debit_spans_multiple_lots_fifo() {
        let w = wallet();
        let user = Uuid::new_v4();

        w.credit(user, 300, CreditKind::Deposit, Some("pi_a"), Some("pi_a"))
            .await
            .unwrap();
        w.credit(user, 500, CreditKind::Deposit, Some("pi_b"), Some("pi_b"))
            .await
            .unwrap();

        w.debit(user, 400, DebitKind::Stake, Some("entry_stake"))
            .await
            .unwrap();

        let conn = w.db.lock().await;
        let lots = allocations_for_user(&conn, user).unwrap();
        // Oldest lot fully consumed, second partially.
        assert_eq!(lots[0].remaining, 0);
        assert_eq!(lots[1].remaining, 400);
        drop(conn);
        assert_invariants(&w, user).await;
    }

    #[tokio::test]
    async fn test_debit_insufficient() {
        let w = wallet();
        let user = Uuid::new_v4();

        w.credit(user, 100, CreditKind::Deposit, Some("pi_c"), Some("pi_c"))
            .await
            .unwrap();

        match w.debit(user, 101, DebitKind::Stake, None).await {
            Err(CoreError::Insufficient { balance, requested }) => {
                assert_eq!(balance, 100);
                assert_eq!(requested, 101);
            }
            other => panic!("expected Insufficient, got {other:?}"),
        }
        // Failed debit must leave no trace.
        assert_eq!(w.balance(user).await.unwrap(), 100);
        assert_invariants(&w, user).await;
    }

    #[tokio::test]
    async fn test_concurrent_debits_never_overdraw() {
        let w = wallet();
        let user = Uuid::new_v4();

        w.credit(user, 100, CreditKind::Deposit, Some("pi_d"), Some("pi_d"))
            .await
            .unwrap();

        // 5 concurrent debits of 30 against a balance of 100: at most 3 can win.
        let mut handles = Vec::new();
        for _ in 0..5 {
            let w2 = w.clone();
            handles.push(tokio::spawn(async move {
                w2.debit(user, 30, DebitKind::Stake, None).await
            }));
        }
        let mut ok = 0;
        let mut insufficient = 0;
        for h in handles {
            match h.await.unwrap() {
                Ok(_) => ok += 1,
                Err(CoreError::Insufficient { .. }) => insufficient += 1,
                Err(e) => panic!("unexpected error: {e:?}"),
            }
        }
        assert_eq!(ok, 3);
        assert_eq!(insufficient, 2);
        assert_eq!(w.balance(user).await.unwrap(), 10);
        assert_invariants(&w, user).await;
    }

    #[tokio::test]
    async fn test_refundable_excludes_synthetic_and_stale() {
        let w = wallet();
        let user = Uuid::new_v4();

        w.credit(user, 100, CreditKind::Deposit, Some("pi_e"), Some("pi_e"))
            .await
            .unwrap();
        w.credit(user, 50, CreditKind::Payout, Some("payout_e"), None)
            .await
            .unwrap();

        let conn = w.db.lock().await;
        let cutoff = Utc::now() - chrono::Duration::days(90);
        let eligible = refundable_allocations(&conn, user, cutoff).unwrap();
        assert_eq!(eligible.len(), 1);
        assert_eq!(eligible[0].payment_ref.as_deref(), Some("pi_e"));

        // Age the deposit lot past the window; it drops out.
        let stale = (Utc::now() - chrono::Duration::days(91)).to_rfc3339();
        conn.execute(
            "UPDATE allocations SET created_at = ?1 WHERE payment_ref = 'pi_e'",
            rusqlite::params![stale],
        )
        .unwrap();
        assert!(refundable_allocations(&conn, user, cutoff).unwrap().is_empty());
    }
}
