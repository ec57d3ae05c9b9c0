//! Token Ledger
//! Mission: Append-only record of every token movement; the only balance truth
//!
//! Balances are never stored as mutable scalars. Every read that matters
//! recomputes `SUM(amount)` from storage; the schema's CHECK constraint pins
//! the sign convention and the partial unique index on `(kind, external_id)`
//! carries idempotency for external events.

use crate::errors::{CoreError, CoreResult};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Movement kinds and their sign convention.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EntryKind {
    Deposit,
    Stake,
    Payout,
    Withdrawal,
}

impl EntryKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntryKind::Deposit => "DEPOSIT",
            EntryKind::Stake => "STAKE",
            EntryKind::Payout => "PAYOUT",
            EntryKind::Withdrawal => "WITHDRAWAL",
        }
    }

    fn from_str(s: &str) -> Option<Self> {
        match s {
            "DEPOSIT" => Some(EntryKind::Deposit),
            "STAKE" => Some(EntryKind::Stake),
            "PAYOUT" => Some(EntryKind::Payout),
            "WITHDRAWAL" => Some(EntryKind::Withdrawal),
            _ => None,
        }
    }

    /// +1 for credits, -1 for debits.
    pub fn sign(&self) -> i64 {
        match self {
            EntryKind::Deposit | EntryKind::Payout => 1,
            EntryKind::Stake | EntryKind::Withdrawal => -1,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct LedgerEntry {
    pub id: Uuid,
    pub user_id: Uuid,
    pub kind: EntryKind,
    pub amount: i64,
    pub currency: String,
    pub external_id: Option<String>,
    pub note: Option<String>,
    pub created_at: DateTime<Utc>,
}

fn parse_uuid(col: usize, s: String) -> rusqlite::Result<Uuid> {
    Uuid::parse_str(&s).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(col, rusqlite::types::Type::Text, Box::new(e))
    })
}

pub(crate) fn parse_ts(col: usize, s: String) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(&s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(col, rusqlite::types::Type::Text, Box::new(e))
        })
}

fn row_to_entry(row: &rusqlite::Row<'_>) -> rusqlite::Result<LedgerEntry> {
    let kind_str: String = row.get(2)?;
    let kind = EntryKind::from_str(&kind_str).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            2,
            rusqlite::types::Type::Text,
            format!("unknown ledger kind {kind_str}").into(),
        )
    })?;
    Ok(LedgerEntry {
        id: parse_uuid(0, row.get(0)?)?,
        user_id: parse_uuid(1, row.get(1)?)?,
        kind,
        amount: row.get(3)?,
        currency: row.get(4)?,
        external_id: row.get(5)?,
        note: row.get(6)?,
        created_at: parse_ts(7, row.get(7)?)?,
    })
}

const ENTRY_COLS: &str = "id, user_id, kind, amount, currency, external_id, note, created_at";

/// Append one entry. `amount` is signed and must match the kind's sign.
/// Fails with `Duplicate` when `(kind, external_id)` already exists.
pub fn append(
    conn: &Connection,
    user_id: Uuid,
    kind: EntryKind,
    amount: i64,
    external_id: Option<&str>,
    note: Option<&str>,
) -> CoreResult<Uuid> {
    if amount == 0 || amount.signum() != kind.sign() {
        return Err(CoreError::SignViolation {
            kind: kind.as_str(),
            amount,
        });
    }

    if let Some(ext) = external_id {
        if let Some(existing) = find_by_external_id(conn, kind, ext)? {
            return Err(CoreError::Duplicate {
                entry_id: existing.id,
            });
        }
    }

    let id = Uuid::new_v4();
    conn.execute(
        "INSERT INTO ledger_entries (id, user_id, kind, amount, currency, external_id, note, created_at)
         VALUES (?1, ?2, ?3, ?4, 'usd', ?5, ?6, ?7)",
        params![
            id.to_string(),
            user_id.to_string(),
            kind.as_str(),
            amount,
            external_id,
            note,
            Utc::now().to_rfc3339(),
        ],
    )
    .map_err(map_unique_violation)?;

    Ok(id)
}

/// A racing insert on the idempotency index surfaces as a constraint error;
/// report it as Duplicate so callers keep their no-op semantics.
fn map_unique_violation(e: rusqlite::Error) -> CoreError {
    if let rusqlite::Error::SqliteFailure(ref inner, _) = e {
        if inner.code == rusqlite::ErrorCode::ConstraintViolation {
            return CoreError::Duplicate {
                entry_id: Uuid::nil(),
            };
        }
    }
    CoreError::Storage(e)
}

/// Authoritative balance: `SUM(amount)` over the user's entries.
pub fn balance(conn: &Connection, user_id: Uuid) -> CoreResult<i64> {
    let total: i64 = conn.query_row(
        "SELECT COALESCE(SUM(amount), 0) FROM ledger_entries WHERE user_id = ?1",
        params![user_id.to_string()],
        |row| row.get(0),
    )?;
    Ok(total)
}

/// Sum of one kind since an instant (daily-limit checks).
pub fn sum_kind_since(
    conn: &Connection,
    user_id: Uuid,
    kind: EntryKind,
    since: DateTime<Utc>,
) -> CoreResult<i64> {
    let total: i64 = conn.query_row(
        "SELECT COALESCE(SUM(amount), 0) FROM ledger_entries
         WHERE user_id = ?1 AND kind = ?2 AND created_at >= ?3",
        params![user_id.to_string(), kind.as_str(), since.to_rfc3339()],
        |row| row.get(0),
    )?;
    Ok(total)
}

/// All entries for a user, newest first.
pub fn entries_for_user(conn: &Connection, user_id: Uuid) -> CoreResult<Vec<LedgerEntry>> {
    let mut stmt = conn.prepare_cached(&format!(
        "SELECT {ENTRY_COLS} FROM ledger_entries
         WHERE user_id = ?1 ORDER BY created_at DESC, rowid DESC"
    ))?;
    let rows = stmt
        .query_map(params![user_id.to_string()], row_to_entry)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

pub fn find_by_external_id(
    conn: &Connection,
    kind: EntryKind,
    external_id: &str,
) -> CoreResult<Option<LedgerEntry>> {
    let mut stmt = conn.prepare_cached(&format!(
        "SELECT {ENTRY_COLS} FROM ledger_entries WHERE kind = ?1 AND external_id = ?2"
    ))?;
    let entry = stmt
        .query_row(params![kind.as_str(), external_id], row_to_entry)
        .optional()?;
    Ok(entry)
}
