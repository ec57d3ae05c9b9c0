//! Admin Endpoints
//! Mission: Operator-side settlement controls and treasury stats

use super::{ApiError, AppState};
use crate::challenges::{Participant, ParticipantStatus};
use crate::settlement::{CancelResult, SettlementResult};
use axum::{
    extract::{Path, Query, State},
    response::Json,
};
use chrono::{Duration, Utc};
use rusqlite::params;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub async fn post_settle(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<SettlementResult>, ApiError> {
    let result = state.settlement.settle(id).await?;
    Ok(Json(result))
}

pub async fn post_cancel(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<CancelResult>, ApiError> {
    let result = state.settlement.cancel(id).await?;
    Ok(Json(result))
}

#[derive(Deserialize)]
pub struct ParticipantStatusUpdate {
    status: ParticipantStatus,
}

/// Ingestion point for the external verification subsystem: flips a
/// participant to COMPLETED or FAILED ahead of settlement.
pub async fn post_participant_status(
    State(state): State<AppState>,
    Path((id, user_id)): Path<(Uuid, Uuid)>,
    Json(payload): Json<ParticipantStatusUpdate>,
) -> Result<Json<Participant>, ApiError> {
    let participant = state
        .challenges
        .set_participant_status(id, user_id, payload.status)
        .await?;
    Ok(Json(participant))
}

// ===== GET /admin/revenue =====

#[derive(Deserialize)]
pub struct RevenueQuery {
    days: Option<i64>,
}

#[derive(Serialize)]
pub struct RevenueStats {
    period_days: i64,
    total_revenue_tokens: i64,
    forfeited_challenges: i64,
}

/// Forfeited-stake revenue attributed to the platform identity over a
/// trailing window. One forfeit entry exists per settled-with-no-winners
/// challenge, so the row count is the challenge count.
pub async fn get_revenue(
    State(state): State<AppState>,
    Query(query): Query<RevenueQuery>,
) -> Result<Json<RevenueStats>, ApiError> {
    let days = query.days.unwrap_or(30).clamp(1, 3650);
    let cutoff = (Utc::now() - Duration::days(days)).to_rfc3339();

    let conn = state.db.lock().await;
    let (total, count): (i64, i64) = conn
        .query_row(
            "SELECT COALESCE(SUM(amount), 0), COUNT(*) FROM ledger_entries
             WHERE user_id = ?1 AND kind = 'PAYOUT' AND created_at >= ?2",
            params![state.config.platform_user_id.to_string(), cutoff],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .map_err(crate::errors::CoreError::from)?;

    Ok(Json(RevenueStats {
        period_days: days,
        total_revenue_tokens: total,
        forfeited_challenges: count,
    }))
}
