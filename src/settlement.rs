//! Settlement Engine
//! Mission: Collect stakes at join, split the pool at end, forfeit when nobody finishes
//!
//! Settlement holds the challenge lock plus every recipient's wallet lock at
//! once (ascending user id, so concurrent holders cannot deadlock) and commits
//! the whole payout vector as a single transaction. Integer division with the
//! remainder handed to the earliest joiners keeps the split deterministic:
//! every node and every test computes the same vector.

use crate::challenges::{self, Challenge, ChallengeStatus, Participant, ParticipantStatus};
use crate::config::Config;
use crate::db::Database;
use crate::errors::{CoreError, CoreResult};
use crate::locks::LockRegistry;
use crate::wallet::{self, CreditKind, DebitKind};
use chrono::Utc;
use rusqlite::Connection;
use serde::Serialize;
use tracing::info;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PayoutLine {
    pub user_id: Uuid,
    pub amount: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SettlementResult {
    pub challenge_id: Uuid,
    pub total_pool: i64,
    pub winner_count: i64,
    pub per_winner: i64,
    pub remainder: i64,
    /// Winners in join order with their exact credited amounts.
    pub payouts: Vec<PayoutLine>,
    pub platform_revenue: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct JoinResult {
    pub participant_id: Uuid,
    pub stake_paid: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct CancelResult {
    pub challenge_id: Uuid,
    pub refunded_participants: i64,
    pub refunded_tokens: i64,
}

#[derive(Clone)]
pub struct SettlementEngine {
    db: Database,
    user_locks: LockRegistry,
    challenge_locks: LockRegistry,
    config: Config,
}

impl SettlementEngine {
    pub fn new(
        db: Database,
        user_locks: LockRegistry,
        challenge_locks: LockRegistry,
        config: Config,
    ) -> Self {
        Self {
            db,
            user_locks,
            challenge_locks,
            config,
        }
    }

    /// Join an ACTIVE challenge, debiting the stake. All-or-nothing: the
    /// stake debit and the participant row commit together.
    pub async fn join(&self, user_id: Uuid, challenge_id: Uuid) -> CoreResult<JoinResult> {
        let _guard = self.user_locks.acquire(user_id).await?;
        let mut conn = self.db.lock().await;
        let tx = conn.transaction()?;

        let ch = challenges::get_challenge(&tx, challenge_id)?;
        if ch.status != ChallengeStatus::Active {
            return Err(CoreError::StateConflict(format!(
                "challenge is {}, not joinable",
                ch.status.as_str()
            )));
        }
        let now = Utc::now();
        let join_deadline = if self.config.allow_late_join {
            ch.end_at
        } else {
            ch.start_at
        };
        if now >= join_deadline {
            return Err(CoreError::NotJoinable("join window has closed".into()));
        }
        if let Some(cap) = ch.max_participants {
            if challenges::participant_count(&tx, challenge_id)? >= cap {
                return Err(CoreError::NotJoinable("challenge is full".into()));
            }
        }
        if challenges::find_participant(&tx, challenge_id, user_id)?.is_some() {
            return Err(CoreError::StateConflict("already joined".into()));
        }

        let stake_entry =
            wallet::apply_debit(&tx, user_id, ch.stake, DebitKind::Stake, Some("entry_stake"))?;
        let participant = challenges::insert_participant(&tx, challenge_id, user_id, stake_entry)?;
        tx.commit()?;

        info!(user = %user_id, challenge = %challenge_id, stake = ch.stake, "participant joined");
        Ok(JoinResult {
            participant_id: participant.id,
            stake_paid: ch.stake,
        })
    }

    /// Settle a COMPLETED challenge. Idempotent: settling a SETTLED challenge
    /// recomputes and returns the prior result without writing anything.
    pub async fn settle(&self, challenge_id: Uuid) -> CoreResult<SettlementResult> {
        let _challenge_guard = self.challenge_locks.acquire(challenge_id).await?;

        let (ch, parts) = {
            let conn = self.db.lock().await;
            let ch = challenges::get_challenge(&conn, challenge_id)?;
            let parts = challenges::participants(&conn, challenge_id)?;
            (ch, parts)
        };

        match ch.status {
            ChallengeStatus::Settled => {
                let conn = self.db.lock().await;
                return prior_result(&conn, &ch, &parts);
            }
            ChallengeStatus::Completed => {}
            other => {
                return Err(CoreError::StateConflict(format!(
                    "cannot settle challenge in status {}",
                    other.as_str()
                )));
            }
        }

        let winners: Vec<&Participant> = parts
            .iter()
            .filter(|p| p.status == ParticipantStatus::Completed)
            .collect();
        let total_pool = parts.len() as i64 * ch.stake;

        // Lock every recipient at once so the payout snapshot is consistent.
        let mut recipient_ids: Vec<Uuid> = winners.iter().map(|w| w.user_id).collect();
        recipient_ids.push(self.config.platform_user_id);
        let _wallet_guards = self.user_locks.acquire_many(&recipient_ids).await?;

        let result = {
            let mut conn = self.db.lock().await;
            let tx = conn.transaction()?;

            let result = if winners.is_empty() {
                if total_pool > 0 {
                    wallet::apply_credit(
                        &tx,
                        self.config.platform_user_id,
                        total_pool,
                        CreditKind::Payout,
                        Some(&challenges::forfeit_external_id(challenge_id)),
                        None,
                    )?;
                }
                SettlementResult {
                    challenge_id,
                    total_pool,
                    winner_count: 0,
                    per_winner: 0,
                    remainder: 0,
                    payouts: Vec::new(),
                    platform_revenue: total_pool,
                }
            } else {
                let n = winners.len() as i64;
                let per_winner = total_pool / n;
                let remainder = total_pool % n;

                // Winners are already in (joined_at, user_id) order; the first
                // `remainder` of them take the extra token.
                let mut payouts = Vec::with_capacity(winners.len());
                for (idx, w) in winners.iter().enumerate() {
                    let amount = per_winner + if (idx as i64) < remainder { 1 } else { 0 };
                    wallet::apply_credit(
                        &tx,
                        w.user_id,
                        amount,
                        CreditKind::Payout,
                        Some(&challenges::payout_external_id(challenge_id, w.user_id)),
                        None,
                    )?;
                    payouts.push(PayoutLine {
                        user_id: w.user_id,
                        amount,
                    });
                }
                SettlementResult {
                    challenge_id,
                    total_pool,
                    winner_count: n,
                    per_winner,
                    remainder,
                    payouts,
                    platform_revenue: 0,
                }
            };

            challenges::update_status(&tx, challenge_id, ChallengeStatus::Settled)?;
            tx.commit()?;
            result
        };

        info!(
            challenge = %challenge_id,
            pool = result.total_pool,
            winners = result.winner_count,
            platform_revenue = result.platform_revenue,
            "challenge settled"
        );
        Ok(result)
    }

    /// Operator cancellation: every participant's stake comes back as a
    /// synthetic PAYOUT (spendable but not card-refundable), and the
    /// challenge terminally cancels.
    pub async fn cancel(&self, challenge_id: Uuid) -> CoreResult<CancelResult> {
        let _challenge_guard = self.challenge_locks.acquire(challenge_id).await?;

        let (ch, parts) = {
            let conn = self.db.lock().await;
            let ch = challenges::get_challenge(&conn, challenge_id)?;
            let parts = challenges::participants(&conn, challenge_id)?;
            (ch, parts)
        };
        if ch.status.is_terminal() {
            return Err(CoreError::StateConflict(format!(
                "challenge is already {}",
                ch.status.as_str()
            )));
        }

        let user_ids: Vec<Uuid> = parts.iter().map(|p| p.user_id).collect();
        let _wallet_guards = self.user_locks.acquire_many(&user_ids).await?;

        {
            let mut conn = self.db.lock().await;
            let tx = conn.transaction()?;
            for p in &parts {
                wallet::apply_credit(
                    &tx,
                    p.user_id,
                    ch.stake,
                    CreditKind::Payout,
                    Some(&challenges::cancel_external_id(challenge_id, p.user_id)),
                    None,
                )?;
            }
            challenges::update_status(&tx, challenge_id, ChallengeStatus::Cancelled)?;
            tx.commit()?;
        }

        info!(challenge = %challenge_id, participants = parts.len(), "challenge cancelled");
        Ok(CancelResult {
            challenge_id,
            refunded_participants: parts.len() as i64,
            refunded_tokens: parts.len() as i64 * ch.stake,
        })
    }
}

/// Rebuild the result of an already-settled challenge from storage. The split
/// is deterministic, so this reproduces the original result exactly.
fn prior_result(
    conn: &Connection,
    ch: &Challenge,
    parts: &[Participant],
) -> CoreResult<SettlementResult> {
    let winners: Vec<&Participant> = parts
        .iter()
        .filter(|p| p.status == ParticipantStatus::Completed)
        .collect();
    let total_pool = parts.len() as i64 * ch.stake;

    if winners.is_empty() {
        let platform_revenue = crate::ledger::find_by_external_id(
            conn,
            crate::ledger::EntryKind::Payout,
            &challenges::forfeit_external_id(ch.id),
        )?
        .map(|e| e.amount)
        .unwrap_or(0);
        return Ok(SettlementResult {
            challenge_id: ch.id,
            total_pool,
            winner_count: 0,
            per_winner: 0,
            remainder: 0,
            payouts: Vec::new(),
            platform_revenue,
        });
    }

    let n = winners.len() as i64;
    let mut payouts = Vec::with_capacity(winners.len());
    for w in &winners {
        let amount = crate::ledger::find_by_external_id(
            conn,
            crate::ledger::EntryKind::Payout,
            &challenges::payout_external_id(ch.id, w.user_id),
        )?
        .map(|e| e.amount)
        .unwrap_or(0);
        payouts.push(PayoutLine {
            user_id: w.user_id,
            amount,
        });
    }
    Ok(SettlementResult {
        challenge_id: ch.id,
        total_pool,
        winner_count: n,
        per_winner: total_pool / n,
        remainder: total_pool % n,
        payouts,
        platform_revenue: 0,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::challenges::{ChallengeStore, NewChallenge};
    use crate::ledger;
    use crate::wallet::Wallet;
    use chrono::Duration;

    struct Fixture {
        db: Database,
        wallet: Wallet,
        store: ChallengeStore,
        engine: SettlementEngine,
    }

    fn fixture() -> Fixture {
        let db = Database::open_in_memory().unwrap();
        let user_locks = LockRegistry::new();
        let wallet = Wallet::new(db.clone(), user_locks.clone());
        let store = ChallengeStore::new(db.clone());
        let engine = SettlementEngine::new(
            db.clone(),
            user_locks,
            LockRegistry::new(),
            Config::default(),
        );
        Fixture {
            db,
            wallet,
            store,
            engine,
        }
    }

    async fn funded_user(f: &Fixture, tokens: i64) -> Uuid {
        let user = Uuid::new_v4();
        let ext = format!("pi_{user}");
        f.wallet
            .credit(user, tokens, CreditKind::Deposit, Some(&ext), Some(&ext))
            .await
            .unwrap();
        user
    }

    async fn open_challenge(f: &Fixture, stake: i64) -> Challenge {
        f.store
            .create(NewChallenge {
                creator_id: Uuid::new_v4(),
                stake,
                max_participants: None,
                start_at: Utc::now() + Duration::hours(1),
                end_at: Utc::now() + Duration::days(1),
                verification_threshold: 1,
            })
            .await
            .unwrap()
    }

    /// End the challenge so it becomes settleable.
    async fn complete(f: &Fixture, ch: Uuid) {
        let conn = f.db.lock().await;
        challenges::update_status(&conn, ch, ChallengeStatus::Completed).unwrap();
    }

    #[tokio::test]
    async fn test_join_debits_stake() {
        let f = fixture();
        let ch = open_challenge(&f, 200).await;
        let user = funded_user(&f, 1000).await;

        let joined = f.engine.join(user, ch.id).await.unwrap();
        assert_eq!(joined.stake_paid, 200);
        assert_eq!(f.wallet.balance(user).await.unwrap(), 800);

        let conn = f.db.lock().await;
        let parts = challenges::participants(&conn, ch.id).unwrap();
        assert_eq!(parts.len(), 1);
        assert_eq!(parts[0].status, ParticipantStatus::Joined);
    }

    #[tokio::test]
    async fn test_join_guards() {
        let f = fixture();
        let ch = open_challenge(&f, 100).await;
        let user = funded_user(&f, 1000).await;

        // Double join.
        f.engine.join(user, ch.id).await.unwrap();
        match f.engine.join(user, ch.id).await {
            Err(CoreError::StateConflict(_)) => {}
            other => panic!("expected StateConflict, got {other:?}"),
        }

        // Insufficient funds: balance untouched, no participant row.
        let poor = funded_user(&f, 50).await;
        match f.engine.join(poor, ch.id).await {
            Err(CoreError::Insufficient { .. }) => {}
            other => panic!("expected Insufficient, got {other:?}"),
        }
        assert_eq!(f.wallet.balance(poor).await.unwrap(), 50);
        {
            let conn = f.db.lock().await;
            assert!(challenges::find_participant(&conn, ch.id, poor)
                .unwrap()
                .is_none());
        }

        // Join window closed.
        let started = f
            .store
            .create(NewChallenge {
                creator_id: Uuid::new_v4(),
                stake: 10,
                max_participants: None,
                start_at: Utc::now() - Duration::hours(1),
                end_at: Utc::now() + Duration::days(1),
                verification_threshold: 1,
            })
            .await
            .unwrap();
        match f.engine.join(user, started.id).await {
            Err(CoreError::NotJoinable(msg)) => assert!(msg.contains("window")),
            other => panic!("expected NotJoinable, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_join_capacity() {
        let f = fixture();
        let ch = f
            .store
            .create(NewChallenge {
                creator_id: Uuid::new_v4(),
                stake: 10,
                max_participants: Some(1),
                start_at: Utc::now() + Duration::hours(1),
                end_at: Utc::now() + Duration::days(1),
                verification_threshold: 1,
            })
            .await
            .unwrap();

        let a = funded_user(&f, 100).await;
        let b = funded_user(&f, 100).await;
        f.engine.join(a, ch.id).await.unwrap();
        match f.engine.join(b, ch.id).await {
            Err(CoreError::NotJoinable(msg)) => assert!(msg.contains("full")),
            other => panic!("expected NotJoinable, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_sole_winner_takes_pool() {
        let f = fixture();
        let ch = open_challenge(&f, 200).await;
        let user = funded_user(&f, 1000).await;
        f.engine.join(user, ch.id).await.unwrap();
        f.store
            .set_participant_status(ch.id, user, ParticipantStatus::Completed)
            .await
            .unwrap();
        complete(&f, ch.id).await;

        let result = f.engine.settle(ch.id).await.unwrap();
        assert_eq!(result.total_pool, 200);
        assert_eq!(result.payouts, vec![PayoutLine { user_id: user, amount: 200 }]);
        assert_eq!(result.platform_revenue, 0);

        // Round trip: balance restored, stake lot partially consumed plus a
        // synthetic winnings lot.
        assert_eq!(f.wallet.balance(user).await.unwrap(), 1000);
        let conn = f.db.lock().await;
        let lots = wallet::allocations_for_user(&conn, user).unwrap();
        assert_eq!(lots.len(), 2);
        assert_eq!(lots[0].remaining, 800);
        assert_eq!(lots[1].remaining, 200);
        assert!(lots[1].payment_ref.is_none());
    }

    #[tokio::test]
    async fn test_remainder_goes_to_earliest_joiners() {
        let f = fixture();
        // Stake 25, 4 participants, 1 fails: pool 100 among 3 winners.
        let ch = open_challenge(&f, 25).await;
        let mut users = Vec::new();
        for _ in 0..4 {
            let u = funded_user(&f, 100).await;
            f.engine.join(u, ch.id).await.unwrap();
            users.push(u);
        }
        for u in &users[..3] {
            f.store
                .set_participant_status(ch.id, *u, ParticipantStatus::Completed)
                .await
                .unwrap();
        }
        f.store
            .set_participant_status(ch.id, users[3], ParticipantStatus::Failed)
            .await
            .unwrap();
        complete(&f, ch.id).await;

        let result = f.engine.settle(ch.id).await.unwrap();
        assert_eq!(result.total_pool, 100);
        assert_eq!(result.per_winner, 33);
        assert_eq!(result.remainder, 1);

        // Winners come back in join order; only the first gets the extra token.
        let amounts: Vec<i64> = result.payouts.iter().map(|p| p.amount).collect();
        assert_eq!(amounts, vec![34, 33, 33]);
        assert_eq!(amounts.iter().sum::<i64>(), 100);
        assert_eq!(result.platform_revenue, 0);

        // Payout order follows joined_at, which follows the join calls above.
        let winner_ids: Vec<Uuid> = result.payouts.iter().map(|p| p.user_id).collect();
        assert_eq!(winner_ids, users[..3].to_vec());
    }

    #[tokio::test]
    async fn test_zero_winners_forfeits_to_platform() {
        let f = fixture();
        let ch = open_challenge(&f, 50).await;
        let mut users = Vec::new();
        for _ in 0..5 {
            let u = funded_user(&f, 100).await;
            f.engine.join(u, ch.id).await.unwrap();
            users.push(u);
        }
        for u in &users {
            f.store
                .set_participant_status(ch.id, *u, ParticipantStatus::Failed)
                .await
                .unwrap();
        }
        complete(&f, ch.id).await;

        let result = f.engine.settle(ch.id).await.unwrap();
        assert_eq!(result.total_pool, 250);
        assert_eq!(result.platform_revenue, 250);
        assert!(result.payouts.is_empty());

        assert_eq!(
            f.wallet.balance(Config::default().platform_user_id).await.unwrap(),
            250
        );
        for u in &users {
            assert_eq!(f.wallet.balance(*u).await.unwrap(), 50);
        }
        assert_eq!(
            f.store.get(ch.id).await.unwrap().status,
            ChallengeStatus::Settled
        );
    }

    #[tokio::test]
    async fn test_settle_is_idempotent() {
        let f = fixture();
        let ch = open_challenge(&f, 30).await;
        let user = funded_user(&f, 100).await;
        f.engine.join(user, ch.id).await.unwrap();
        f.store
            .set_participant_status(ch.id, user, ParticipantStatus::Completed)
            .await
            .unwrap();
        complete(&f, ch.id).await;

        let first = f.engine.settle(ch.id).await.unwrap();
        let entries_before = {
            let conn = f.db.lock().await;
            conn.query_row("SELECT COUNT(*) FROM ledger_entries", [], |r| r.get::<_, i64>(0))
                .unwrap()
        };

        let second = f.engine.settle(ch.id).await.unwrap();
        assert_eq!(first, second);

        let entries_after = {
            let conn = f.db.lock().await;
            conn.query_row("SELECT COUNT(*) FROM ledger_entries", [], |r| r.get::<_, i64>(0))
                .unwrap()
        };
        assert_eq!(entries_before, entries_after);
    }

    #[tokio::test]
    async fn test_settle_requires_completed() {
        let f = fixture();
        let ch = open_challenge(&f, 30).await;
        match f.engine.settle(ch.id).await {
            Err(CoreError::StateConflict(_)) => {}
            other => panic!("expected StateConflict, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_cancel_returns_stakes_as_synthetic_lots() {
        let f = fixture();
        let ch = open_challenge(&f, 40).await;
        let a = funded_user(&f, 100).await;
        let b = funded_user(&f, 100).await;
        f.engine.join(a, ch.id).await.unwrap();
        f.engine.join(b, ch.id).await.unwrap();

        let result = f.engine.cancel(ch.id).await.unwrap();
        assert_eq!(result.refunded_participants, 2);
        assert_eq!(result.refunded_tokens, 80);

        for u in [a, b] {
            assert_eq!(f.wallet.balance(u).await.unwrap(), 100);
        }
        assert_eq!(
            f.store.get(ch.id).await.unwrap().status,
            ChallengeStatus::Cancelled
        );

        // Terminal: neither cancel nor settle may run again.
        assert!(f.engine.cancel(ch.id).await.is_err());
        assert!(f.engine.settle(ch.id).await.is_err());

        // The refunded stake is a synthetic lot: spendable, not refundable.
        let conn = f.db.lock().await;
        let lots = wallet::allocations_for_user(&conn, a).unwrap();
        assert!(lots.last().unwrap().payment_ref.is_none());
    }

    #[tokio::test]
    async fn test_settlement_conserves_money() {
        // Invariant 4: stakes collected = payouts + platform revenue, and the
        // sum over every wallet (platform included) matches total deposits.
        let f = fixture();
        let ch = open_challenge(&f, 17).await;
        let mut users = Vec::new();
        for _ in 0..5 {
            let u = funded_user(&f, 60).await;
            f.engine.join(u, ch.id).await.unwrap();
            users.push(u);
        }
        for u in &users[..2] {
            f.store
                .set_participant_status(ch.id, *u, ParticipantStatus::Completed)
                .await
                .unwrap();
        }
        complete(&f, ch.id).await;
        let result = f.engine.settle(ch.id).await.unwrap();

        let paid: i64 = result.payouts.iter().map(|p| p.amount).sum();
        assert_eq!(result.total_pool, paid + result.platform_revenue);

        let mut total = f
            .wallet
            .balance(Config::default().platform_user_id)
            .await
            .unwrap();
        for u in &users {
            total += f.wallet.balance(*u).await.unwrap();
        }
        assert_eq!(total, 5 * 60);

        // Per-user ledger/allocation agreement survives settlement.
        let conn = f.db.lock().await;
        for u in &users {
            assert_eq!(
                ledger::balance(&conn, *u).unwrap(),
                wallet::sum_remaining(&conn, *u).unwrap()
            );
        }
    }
}
