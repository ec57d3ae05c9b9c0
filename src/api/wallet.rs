//! Wallet Endpoints
//! Mission: Balance snapshot, deposit checkout, withdrawal

use super::{ApiError, AppState};
use crate::auth::Claims;
use crate::ledger::LedgerEntry;
use crate::withdrawals::WithdrawalResult;
use axum::{
    extract::State,
    response::Json,
    Extension,
};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

fn current_user(claims: &Claims) -> Result<Uuid, ApiError> {
    claims
        .user_id()
        .ok_or_else(|| ApiError::unauthorized("token subject is not a user id"))
}

// ===== GET /wallet =====

#[derive(Serialize)]
pub struct WalletSnapshot {
    balance: i64,
    entries: Vec<LedgerEntry>,
}

pub async fn get_wallet(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
) -> Result<Json<WalletSnapshot>, ApiError> {
    let user_id = current_user(&claims)?;
    let (balance, entries) = state.wallet.snapshot(user_id).await?;
    Ok(Json(WalletSnapshot { balance, entries }))
}

// ===== POST /wallet/deposit/checkout =====

#[derive(Deserialize)]
pub struct CreateDepositRequest {
    tokens: i64,
    success_url: String,
    cancel_url: String,
}

#[derive(Serialize)]
pub struct CreateDepositResponse {
    checkout_url: String,
    session_id: String,
}

pub async fn post_deposit_checkout(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Json(payload): Json<CreateDepositRequest>,
) -> Result<Json<CreateDepositResponse>, ApiError> {
    let user_id = current_user(&claims)?;
    let session = state
        .deposits
        .begin_deposit(user_id, payload.tokens, payload.success_url, payload.cancel_url)
        .await?;
    Ok(Json(CreateDepositResponse {
        checkout_url: session.checkout_url,
        session_id: session.session_id,
    }))
}

// ===== POST /wallet/withdraw =====

#[derive(Deserialize)]
pub struct WithdrawRequest {
    tokens: i64,
}

pub async fn post_withdraw(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Json(payload): Json<WithdrawRequest>,
) -> Result<Json<WithdrawalResult>, ApiError> {
    let user_id = current_user(&claims)?;
    let result = state.withdrawals.withdraw(user_id, payload.tokens).await?;
    Ok(Json(result))
}
