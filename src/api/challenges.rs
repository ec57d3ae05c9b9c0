//! Challenge Endpoints
//! Mission: Create, inspect, and join challenges

use super::{ApiError, AppState};
use crate::auth::Claims;
use crate::challenges::{self, Challenge, ChallengeLedgerView, NewChallenge};
use crate::settlement::JoinResult;
use axum::{
    extract::{Path, State},
    response::Json,
    Extension,
};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use uuid::Uuid;

fn current_user(claims: &Claims) -> Result<Uuid, ApiError> {
    claims
        .user_id()
        .ok_or_else(|| ApiError::unauthorized("token subject is not a user id"))
}

#[derive(Deserialize)]
pub struct ChallengeCreate {
    stake: i64,
    max_participants: Option<i64>,
    start_at: DateTime<Utc>,
    end_at: DateTime<Utc>,
    #[serde(default = "default_threshold")]
    verification_threshold: i64,
}

fn default_threshold() -> i64 {
    1
}

pub async fn post_challenge(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Json(payload): Json<ChallengeCreate>,
) -> Result<Json<Challenge>, ApiError> {
    let creator_id = current_user(&claims)?;
    let challenge = state
        .challenges
        .create(NewChallenge {
            creator_id,
            stake: payload.stake,
            max_participants: payload.max_participants,
            start_at: payload.start_at,
            end_at: payload.end_at,
            verification_threshold: payload.verification_threshold,
        })
        .await?;
    Ok(Json(challenge))
}

pub async fn get_challenge(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<Challenge>, ApiError> {
    let challenge = state.challenges.get(id).await?;
    Ok(Json(challenge))
}

pub async fn get_challenge_ledger(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<ChallengeLedgerView>, ApiError> {
    let conn = state.db.lock().await;
    let view = challenges::ledger_view(&conn, id)?;
    Ok(Json(view))
}

pub async fn post_join(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Path(id): Path<Uuid>,
) -> Result<Json<JoinResult>, ApiError> {
    let user_id = current_user(&claims)?;
    let result = state.settlement.join(user_id, id).await?;
    Ok(Json(result))
}
