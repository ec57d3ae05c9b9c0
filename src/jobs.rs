//! Background Jobs
//! Mission: Close out ended challenges without operator intervention
//!
//! The poller is the scheduled path into settlement: ACTIVE challenges whose
//! end (plus verification grace) has passed move to COMPLETED, and COMPLETED
//! challenges settle. Each settle attempt runs under a 30-second timeout; a
//! timed-out or failed attempt is simply retried on the next sweep, which is
//! safe because settlement is idempotent on terminal status.

use crate::challenges::{ChallengeStatus, ChallengeStore};
use crate::config::Config;
use crate::settlement::SettlementEngine;
use std::time::Duration;
use tokio::time::{interval, timeout};
use tracing::{info, warn};

const JOB_TIMEOUT: Duration = Duration::from_secs(30);

pub fn spawn_settlement_poller(
    store: ChallengeStore,
    engine: SettlementEngine,
    config: Config,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = interval(Duration::from_secs(config.settlement_poll_secs.max(1)));
        info!(
            poll_secs = config.settlement_poll_secs,
            "settlement poller started"
        );
        loop {
            ticker.tick().await;
            sweep(&store, &engine, &config).await;
        }
    })
}

async fn sweep(store: &ChallengeStore, engine: &SettlementEngine, config: &Config) {
    // Step 1: ended ACTIVE challenges become COMPLETED once the grace window
    // for outstanding verifications has passed.
    match store.due_for_completion(config.verification_grace_secs).await {
        Ok(due) => {
            for id in due {
                if let Err(e) = store.mark_completed(id).await {
                    warn!(challenge = %id, error = %e, "failed to mark challenge completed");
                }
            }
        }
        Err(e) => warn!(error = %e, "due-for-completion scan failed"),
    }

    // Step 2: settle everything COMPLETED.
    let completed = match store.list_by_status(ChallengeStatus::Completed).await {
        Ok(ids) => ids,
        Err(e) => {
            warn!(error = %e, "completed-challenge scan failed");
            return;
        }
    };
    for id in completed {
        match timeout(JOB_TIMEOUT, engine.settle(id)).await {
            Ok(Ok(result)) => {
                info!(
                    challenge = %id,
                    pool = result.total_pool,
                    winners = result.winner_count,
                    "poller settled challenge"
                );
            }
            Ok(Err(e)) => warn!(challenge = %id, error = %e, "settlement failed, will retry"),
            Err(_) => warn!(challenge = %id, "settlement timed out, will retry"),
        }
    }
}
