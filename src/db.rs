//! SQLite Persistence
//! Mission: Own the schema and hand out the shared connection

use anyhow::{Context, Result};
use rusqlite::Connection;
use std::sync::Arc;
use tokio::sync::Mutex;

/// Shared database handle. All money mutations go through this single
/// connection; wallet-level interleaving is prevented by the advisory locks
/// in `locks`, not by the connection mutex.
#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

impl Database {
    pub fn new(db_path: &str) -> Result<Self> {
        let conn = Connection::open(db_path).context("open database")?;
        conn.pragma_update(None, "journal_mode", "WAL").ok();
        conn.pragma_update(None, "synchronous", "NORMAL").ok();
        conn.pragma_update(None, "foreign_keys", "ON").ok();
        init_schema(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Fresh in-memory database, used by tests.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("open in-memory database")?;
        conn.pragma_update(None, "foreign_keys", "ON").ok();
        init_schema(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub async fn lock(&self) -> tokio::sync::MutexGuard<'_, Connection> {
        self.conn.lock().await
    }
}

fn init_schema(conn: &Connection) -> Result<()> {
    // Append-only ledger. The CHECK pins the sign convention per kind and the
    // partial unique index is the idempotency key for external events.
    conn.execute(
        "CREATE TABLE IF NOT EXISTS ledger_entries (
            id TEXT PRIMARY KEY,
            user_id TEXT NOT NULL,
            kind TEXT NOT NULL,
            amount INTEGER NOT NULL,
            currency TEXT NOT NULL DEFAULT 'usd',
            external_id TEXT,
            note TEXT,
            created_at TEXT NOT NULL,
            CHECK (
                (kind = 'DEPOSIT' AND amount > 0) OR
                (kind = 'PAYOUT' AND amount > 0) OR
                (kind = 'STAKE' AND amount < 0) OR
                (kind = 'WITHDRAWAL' AND amount < 0)
            )
        )",
        [],
    )?;
    conn.execute(
        "CREATE UNIQUE INDEX IF NOT EXISTS ux_ledger_kind_external
         ON ledger_entries(kind, external_id) WHERE external_id IS NOT NULL",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_ledger_user ON ledger_entries(user_id, created_at)",
        [],
    )?;

    // FIFO deposit lots. `remaining` is the only mutable money column in the
    // whole schema; rows are never deleted.
    conn.execute(
        "CREATE TABLE IF NOT EXISTS allocations (
            id TEXT PRIMARY KEY,
            user_id TEXT NOT NULL,
            original INTEGER NOT NULL CHECK (original > 0),
            remaining INTEGER NOT NULL CHECK (remaining >= 0 AND remaining <= original),
            payment_ref TEXT,
            ledger_entry_id TEXT NOT NULL REFERENCES ledger_entries(id),
            created_at TEXT NOT NULL
        )",
        [],
    )?;
    // The FIFO scan only ever touches active lots.
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_alloc_user_active
         ON allocations(user_id, created_at) WHERE remaining > 0",
        [],
    )?;

    // Audit record per executed external refund.
    conn.execute(
        "CREATE TABLE IF NOT EXISTS refunds (
            id TEXT PRIMARY KEY,
            user_id TEXT NOT NULL,
            allocation_id TEXT NOT NULL REFERENCES allocations(id),
            amount INTEGER NOT NULL CHECK (amount > 0),
            external_refund_id TEXT NOT NULL UNIQUE,
            withdrawal_ledger_entry_id TEXT REFERENCES ledger_entries(id),
            created_at TEXT NOT NULL
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_refunds_user ON refunds(user_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS challenges (
            id TEXT PRIMARY KEY,
            creator_id TEXT NOT NULL,
            stake INTEGER NOT NULL CHECK (stake > 0),
            max_participants INTEGER,
            start_at TEXT NOT NULL,
            end_at TEXT NOT NULL,
            status TEXT NOT NULL,
            verification_threshold INTEGER NOT NULL DEFAULT 1,
            created_at TEXT NOT NULL
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS participants (
            id TEXT PRIMARY KEY,
            challenge_id TEXT NOT NULL REFERENCES challenges(id),
            user_id TEXT NOT NULL,
            status TEXT NOT NULL,
            joined_at TEXT NOT NULL,
            stake_ledger_entry_id TEXT NOT NULL REFERENCES ledger_entries(id),
            UNIQUE (challenge_id, user_id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_participants_challenge ON participants(challenge_id)",
        [],
    )?;

    Ok(())
}
