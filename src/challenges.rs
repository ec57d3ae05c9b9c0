//! Challenge Registry
//! Mission: Challenge/participant records the settlement engine reads and transitions
//!
//! Verification itself (photo proofs, peer review) lives outside the core;
//! participants arrive here as JOINED and an external subsystem marks them
//! COMPLETED or FAILED before settlement.

use crate::db::Database;
use crate::errors::{CoreError, CoreResult};
use crate::ledger::{self, EntryKind};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ChallengeStatus {
    Draft,
    Active,
    Completed,
    Settled,
    Cancelled,
}

impl ChallengeStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChallengeStatus::Draft => "DRAFT",
            ChallengeStatus::Active => "ACTIVE",
            ChallengeStatus::Completed => "COMPLETED",
            ChallengeStatus::Settled => "SETTLED",
            ChallengeStatus::Cancelled => "CANCELLED",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "DRAFT" => Some(ChallengeStatus::Draft),
            "ACTIVE" => Some(ChallengeStatus::Active),
            "COMPLETED" => Some(ChallengeStatus::Completed),
            "SETTLED" => Some(ChallengeStatus::Settled),
            "CANCELLED" => Some(ChallengeStatus::Cancelled),
            _ => None,
        }
    }

    /// SETTLED and CANCELLED never transition again.
    pub fn is_terminal(&self) -> bool {
        matches!(self, ChallengeStatus::Settled | ChallengeStatus::Cancelled)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ParticipantStatus {
    Joined,
    Completed,
    Failed,
}

impl ParticipantStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ParticipantStatus::Joined => "JOINED",
            ParticipantStatus::Completed => "COMPLETED",
            ParticipantStatus::Failed => "FAILED",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "JOINED" => Some(ParticipantStatus::Joined),
            "COMPLETED" => Some(ParticipantStatus::Completed),
            "FAILED" => Some(ParticipantStatus::Failed),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Challenge {
    pub id: Uuid,
    pub creator_id: Uuid,
    pub stake: i64,
    pub max_participants: Option<i64>,
    pub start_at: DateTime<Utc>,
    pub end_at: DateTime<Utc>,
    pub status: ChallengeStatus,
    pub verification_threshold: i64,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Participant {
    pub id: Uuid,
    pub challenge_id: Uuid,
    pub user_id: Uuid,
    pub status: ParticipantStatus,
    pub joined_at: DateTime<Utc>,
    pub stake_ledger_entry_id: Uuid,
}

#[derive(Debug, Clone)]
pub struct NewChallenge {
    pub creator_id: Uuid,
    pub stake: i64,
    pub max_participants: Option<i64>,
    pub start_at: DateTime<Utc>,
    pub end_at: DateTime<Utc>,
    pub verification_threshold: i64,
}

fn parse_uuid(col: usize, s: String) -> rusqlite::Result<Uuid> {
    Uuid::parse_str(&s).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(col, rusqlite::types::Type::Text, Box::new(e))
    })
}

fn bad_enum(col: usize, s: &str) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        col,
        rusqlite::types::Type::Text,
        format!("unknown enum value {s}").into(),
    )
}

fn row_to_challenge(row: &rusqlite::Row<'_>) -> rusqlite::Result<Challenge> {
    let status_str: String = row.get(6)?;
    Ok(Challenge {
        id: parse_uuid(0, row.get(0)?)?,
        creator_id: parse_uuid(1, row.get(1)?)?,
        stake: row.get(2)?,
        max_participants: row.get(3)?,
        start_at: ledger::parse_ts(4, row.get(4)?)?,
        end_at: ledger::parse_ts(5, row.get(5)?)?,
        status: ChallengeStatus::from_str(&status_str).ok_or_else(|| bad_enum(6, &status_str))?,
        verification_threshold: row.get(7)?,
        created_at: ledger::parse_ts(8, row.get(8)?)?,
    })
}

fn row_to_participant(row: &rusqlite::Row<'_>) -> rusqlite::Result<Participant> {
    let status_str: String = row.get(3)?;
    Ok(Participant {
        id: parse_uuid(0, row.get(0)?)?,
        challenge_id: parse_uuid(1, row.get(1)?)?,
        user_id: parse_uuid(2, row.get(2)?)?,
        status: ParticipantStatus::from_str(&status_str).ok_or_else(|| bad_enum(3, &status_str))?,
        joined_at: ledger::parse_ts(4, row.get(4)?)?,
        stake_ledger_entry_id: parse_uuid(5, row.get(5)?)?,
    })
}

const CHALLENGE_COLS: &str =
    "id, creator_id, stake, max_participants, start_at, end_at, status, verification_threshold, created_at";
const PARTICIPANT_COLS: &str =
    "id, challenge_id, user_id, status, joined_at, stake_ledger_entry_id";

// ===== Connection-level reads/writes (composable inside transactions) =====

pub fn get_challenge(conn: &Connection, id: Uuid) -> CoreResult<Challenge> {
    let mut stmt = conn.prepare_cached(&format!(
        "SELECT {CHALLENGE_COLS} FROM challenges WHERE id = ?1"
    ))?;
    stmt.query_row(params![id.to_string()], row_to_challenge)
        .optional()?
        .ok_or_else(|| CoreError::NotFound(format!("challenge {id}")))
}

/// Participants ordered by join time (remainder distribution order):
/// `joined_at` ascending, tie-break on `user_id` lexicographic.
pub fn participants(conn: &Connection, challenge_id: Uuid) -> CoreResult<Vec<Participant>> {
    let mut stmt = conn.prepare_cached(&format!(
        "SELECT {PARTICIPANT_COLS} FROM participants
         WHERE challenge_id = ?1 ORDER BY joined_at ASC, user_id ASC"
    ))?;
    let rows = stmt
        .query_map(params![challenge_id.to_string()], row_to_participant)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

pub fn participant_count(conn: &Connection, challenge_id: Uuid) -> CoreResult<i64> {
    let n: i64 = conn.query_row(
        "SELECT COUNT(*) FROM participants WHERE challenge_id = ?1",
        params![challenge_id.to_string()],
        |row| row.get(0),
    )?;
    Ok(n)
}

pub fn find_participant(
    conn: &Connection,
    challenge_id: Uuid,
    user_id: Uuid,
) -> CoreResult<Option<Participant>> {
    let mut stmt = conn.prepare_cached(&format!(
        "SELECT {PARTICIPANT_COLS} FROM participants WHERE challenge_id = ?1 AND user_id = ?2"
    ))?;
    let p = stmt
        .query_row(
            params![challenge_id.to_string(), user_id.to_string()],
            row_to_participant,
        )
        .optional()?;
    Ok(p)
}

pub fn insert_participant(
    conn: &Connection,
    challenge_id: Uuid,
    user_id: Uuid,
    stake_ledger_entry_id: Uuid,
) -> CoreResult<Participant> {
    let p = Participant {
        id: Uuid::new_v4(),
        challenge_id,
        user_id,
        status: ParticipantStatus::Joined,
        joined_at: Utc::now(),
        stake_ledger_entry_id,
    };
    conn.execute(
        "INSERT INTO participants (id, challenge_id, user_id, status, joined_at, stake_ledger_entry_id)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![
            p.id.to_string(),
            p.challenge_id.to_string(),
            p.user_id.to_string(),
            p.status.as_str(),
            p.joined_at.to_rfc3339(),
            p.stake_ledger_entry_id.to_string(),
        ],
    )
    .map_err(|e| {
        if let rusqlite::Error::SqliteFailure(ref inner, _) = e {
            if inner.code == rusqlite::ErrorCode::ConstraintViolation {
                return CoreError::StateConflict(format!(
                    "user {user_id} already joined challenge {challenge_id}"
                ));
            }
        }
        CoreError::Storage(e)
    })?;
    Ok(p)
}

pub fn update_status(conn: &Connection, id: Uuid, status: ChallengeStatus) -> CoreResult<()> {
    conn.execute(
        "UPDATE challenges SET status = ?1 WHERE id = ?2",
        params![status.as_str(), id.to_string()],
    )?;
    Ok(())
}

// ===== Store service =====

#[derive(Clone)]
pub struct ChallengeStore {
    db: Database,
}

impl ChallengeStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Create a challenge. It is joinable (ACTIVE) immediately.
    pub async fn create(&self, new: NewChallenge) -> CoreResult<Challenge> {
        if new.stake <= 0 {
            return Err(CoreError::InvalidAmount("stake must be > 0".into()));
        }
        if new.end_at <= new.start_at {
            return Err(CoreError::InvalidAmount("end_at must be after start_at".into()));
        }
        if let Some(cap) = new.max_participants {
            if cap <= 0 {
                return Err(CoreError::InvalidAmount("max_participants must be > 0".into()));
            }
        }

        let ch = Challenge {
            id: Uuid::new_v4(),
            creator_id: new.creator_id,
            stake: new.stake,
            max_participants: new.max_participants,
            start_at: new.start_at,
            end_at: new.end_at,
            status: ChallengeStatus::Active,
            verification_threshold: new.verification_threshold.max(1),
            created_at: Utc::now(),
        };
        let conn = self.db.lock().await;
        conn.execute(
            "INSERT INTO challenges (id, creator_id, stake, max_participants, start_at, end_at, status, verification_threshold, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                ch.id.to_string(),
                ch.creator_id.to_string(),
                ch.stake,
                ch.max_participants,
                ch.start_at.to_rfc3339(),
                ch.end_at.to_rfc3339(),
                ch.status.as_str(),
                ch.verification_threshold,
                ch.created_at.to_rfc3339(),
            ],
        )?;
        Ok(ch)
    }

    pub async fn get(&self, id: Uuid) -> CoreResult<Challenge> {
        let conn = self.db.lock().await;
        get_challenge(&conn, id)
    }

    pub async fn participants(&self, challenge_id: Uuid) -> CoreResult<Vec<Participant>> {
        let conn = self.db.lock().await;
        participants(&conn, challenge_id)
    }

    /// Verification contract point: mark a participant COMPLETED or FAILED.
    /// Refused once the challenge is terminal; settlement has already read
    /// the statuses by then.
    pub async fn set_participant_status(
        &self,
        challenge_id: Uuid,
        user_id: Uuid,
        status: ParticipantStatus,
    ) -> CoreResult<Participant> {
        let conn = self.db.lock().await;
        let ch = get_challenge(&conn, challenge_id)?;
        if ch.status.is_terminal() {
            return Err(CoreError::StateConflict(format!(
                "challenge {challenge_id} is {}",
                ch.status.as_str()
            )));
        }
        let p = find_participant(&conn, challenge_id, user_id)?.ok_or_else(|| {
            CoreError::NotFound(format!("participant {user_id} in challenge {challenge_id}"))
        })?;
        conn.execute(
            "UPDATE participants SET status = ?1 WHERE id = ?2",
            params![status.as_str(), p.id.to_string()],
        )?;
        Ok(Participant { status, ..p })
    }

    /// ACTIVE challenges whose end instant (plus verification grace) has
    /// passed; the poller moves them to COMPLETED.
    pub async fn due_for_completion(&self, grace_secs: i64) -> CoreResult<Vec<Uuid>> {
        let cutoff = (Utc::now() - chrono::Duration::seconds(grace_secs)).to_rfc3339();
        let conn = self.db.lock().await;
        let mut stmt = conn.prepare_cached(
            "SELECT id FROM challenges WHERE status = 'ACTIVE' AND end_at <= ?1",
        )?;
        let ids = stmt
            .query_map(params![cutoff], |row| row.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?
            .into_iter()
            .filter_map(|s| Uuid::parse_str(&s).ok())
            .collect();
        Ok(ids)
    }

    pub async fn list_by_status(&self, status: ChallengeStatus) -> CoreResult<Vec<Uuid>> {
        let conn = self.db.lock().await;
        let mut stmt =
            conn.prepare_cached("SELECT id FROM challenges WHERE status = ?1")?;
        let ids = stmt
            .query_map(params![status.as_str()], |row| row.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?
            .into_iter()
            .filter_map(|s| Uuid::parse_str(&s).ok())
            .collect();
        Ok(ids)
    }

    pub async fn mark_completed(&self, id: Uuid) -> CoreResult<()> {
        let conn = self.db.lock().await;
        let ch = get_challenge(&conn, id)?;
        if ch.status != ChallengeStatus::Active {
            return Err(CoreError::StateConflict(format!(
                "challenge {id} is {}, not ACTIVE",
                ch.status.as_str()
            )));
        }
        update_status(&conn, id, ChallengeStatus::Completed)
    }
}

// ===== Per-challenge ledger view =====

/// One participant's net position inside a challenge.
#[derive(Debug, Clone, Serialize)]
pub struct ParticipantPosition {
    pub user_id: Uuid,
    pub status: ParticipantStatus,
    pub staked: i64,
    pub paid_out: i64,
    pub net: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct ChallengeLedgerView {
    pub challenge_id: Uuid,
    pub status: ChallengeStatus,
    pub pool_tokens: i64,
    pub platform_revenue: i64,
    pub totals: Vec<ParticipantPosition>,
}

/// Payout entries are tagged with deterministic external ids so the view (and
/// settlement idempotency) can find them by exact lookup.
pub fn payout_external_id(challenge_id: Uuid, user_id: Uuid) -> String {
    format!("payout_{challenge_id}_{user_id}")
}

pub fn forfeit_external_id(challenge_id: Uuid) -> String {
    format!("forfeit_{challenge_id}")
}

pub fn cancel_external_id(challenge_id: Uuid, user_id: Uuid) -> String {
    format!("cancel_{challenge_id}_{user_id}")
}

pub fn ledger_view(conn: &Connection, challenge_id: Uuid) -> CoreResult<ChallengeLedgerView> {
    let ch = get_challenge(conn, challenge_id)?;
    let parts = participants(conn, challenge_id)?;

    let mut totals = Vec::with_capacity(parts.len());
    for p in &parts {
        let staked = ch.stake;
        let paid_out = [
            payout_external_id(challenge_id, p.user_id),
            cancel_external_id(challenge_id, p.user_id),
        ]
        .iter()
        .map(|ext| {
            ledger::find_by_external_id(conn, EntryKind::Payout, ext)
                .map(|e| e.map(|e| e.amount).unwrap_or(0))
        })
        .sum::<CoreResult<i64>>()?;
        totals.push(ParticipantPosition {
            user_id: p.user_id,
            status: p.status,
            staked,
            paid_out,
            net: paid_out - staked,
        });
    }

    let platform_revenue = ledger::find_by_external_id(
        conn,
        EntryKind::Payout,
        &forfeit_external_id(challenge_id),
    )?
    .map(|e| e.amount)
    .unwrap_or(0);

    Ok(ChallengeLedgerView {
        challenge_id,
        status: ch.status,
        pool_tokens: parts.len() as i64 * ch.stake,
        platform_revenue,
        totals,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> ChallengeStore {
        ChallengeStore::new(Database::open_in_memory().unwrap())
    }

    fn new_challenge(stake: i64) -> NewChallenge {
        NewChallenge {
            creator_id: Uuid::new_v4(),
            stake,
            max_participants: None,
            start_at: Utc::now() + chrono::Duration::hours(1),
            end_at: Utc::now() + chrono::Duration::days(7),
            verification_threshold: 1,
        }
    }

    #[tokio::test]
    async fn test_create_and_get() {
        let store = store();
        let ch = store.create(new_challenge(50)).await.unwrap();
        assert_eq!(ch.status, ChallengeStatus::Active);

        let fetched = store.get(ch.id).await.unwrap();
        assert_eq!(fetched.stake, 50);

        match store.get(Uuid::new_v4()).await {
            Err(CoreError::NotFound(_)) => {}
            other => panic!("expected NotFound, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_create_validation() {
        let store = store();
        let mut bad = new_challenge(0);
        assert!(store.create(bad.clone()).await.is_err());
        bad.stake = 10;
        bad.end_at = bad.start_at;
        assert!(store.create(bad).await.is_err());
    }

    #[tokio::test]
    async fn test_due_for_completion_picks_past_end() {
        let store = store();
        let mut draft = new_challenge(10);
        draft.start_at = Utc::now() - chrono::Duration::days(2);
        draft.end_at = Utc::now() - chrono::Duration::hours(1);
        let ended = store.create(draft).await.unwrap();
        let running = store.create(new_challenge(10)).await.unwrap();

        let due = store.due_for_completion(0).await.unwrap();
        assert!(due.contains(&ended.id));
        assert!(!due.contains(&running.id));

        store.mark_completed(ended.id).await.unwrap();
        assert!(store.due_for_completion(0).await.unwrap().is_empty());
        assert_eq!(
            store.get(ended.id).await.unwrap().status,
            ChallengeStatus::Completed
        );
    }

    #[tokio::test]
    async fn test_participant_status_guarded_by_terminal() {
        let store = store();
        let ch = store.create(new_challenge(10)).await.unwrap();
        let user = Uuid::new_v4();

        {
            let conn = store.db.lock().await;
            // Stake entry stub so the FK holds.
            let entry = ledger::append(&conn, user, EntryKind::Deposit, 10, None, None).unwrap();
            let stake_entry =
                ledger::append(&conn, user, EntryKind::Stake, -10, None, None).unwrap();
            let _ = entry;
            insert_participant(&conn, ch.id, user, stake_entry).unwrap();
        }

        store
            .set_participant_status(ch.id, user, ParticipantStatus::Completed)
            .await
            .unwrap();

        {
            let conn = store.db.lock().await;
            update_status(&conn, ch.id, ChallengeStatus::Settled).unwrap();
        }
        match store
            .set_participant_status(ch.id, user, ParticipantStatus::Failed)
            .await
        {
            Err(CoreError::StateConflict(_)) => {}
            other => panic!("expected StateConflict, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_double_join_rejected_by_unique() {
        let store = store();
        let ch = store.create(new_challenge(10)).await.unwrap();
        let user = Uuid::new_v4();

        let conn = store.db.lock().await;
        let e1 = ledger::append(&conn, user, EntryKind::Stake, -10, None, None).unwrap();
        insert_participant(&conn, ch.id, user, e1).unwrap();
        let e2 = ledger::append(&conn, user, EntryKind::Stake, -10, None, None).unwrap();
        match insert_participant(&conn, ch.id, user, e2) {
            Err(CoreError::StateConflict(_)) => {}
            other => panic!("expected StateConflict, got {other:?}"),
        }
    }
}
