//! HTTP API
//! Mission: The single translation boundary between core errors and HTTP

pub mod admin;
pub mod challenges;
pub mod wallet;
pub mod webhook;

use crate::auth::{auth_middleware, require_admin, JwtHandler};
use crate::challenges::ChallengeStore;
use crate::config::Config;
use crate::db::Database;
use crate::deposits::DepositService;
use crate::errors::CoreError;
use crate::payments::webhook::WebhookVerifier;
use crate::settlement::SettlementEngine;
use crate::wallet::Wallet;
use crate::withdrawals::WithdrawalService;
use axum::{
    http::StatusCode,
    middleware as axum_mw,
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use serde::Serialize;
use std::sync::Arc;

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub db: Database,
    pub wallet: Wallet,
    pub deposits: DepositService,
    pub withdrawals: WithdrawalService,
    pub challenges: ChallengeStore,
    pub settlement: SettlementEngine,
    pub webhook_verifier: WebhookVerifier,
    pub config: Config,
}

/// Create the API router: public routes (health, webhook), authenticated
/// wallet/challenge routes, and admin-gated settlement operations.
pub fn create_router(state: AppState, jwt: Arc<JwtHandler>) -> Router {
    let public_routes = Router::new()
        .route("/health", get(health_check))
        .route("/stripe/webhook", post(webhook::stripe_webhook))
        .with_state(state.clone());

    let protected_routes = Router::new()
        .route("/wallet", get(wallet::get_wallet))
        .route("/wallet/deposit/checkout", post(wallet::post_deposit_checkout))
        .route("/wallet/withdraw", post(wallet::post_withdraw))
        .route("/challenges", post(challenges::post_challenge))
        .route("/challenges/:id", get(challenges::get_challenge))
        .route("/challenges/:id/ledger", get(challenges::get_challenge_ledger))
        .route("/challenges/:id/join", post(challenges::post_join))
        .route_layer(axum_mw::from_fn_with_state(jwt.clone(), auth_middleware))
        .with_state(state.clone());

    let admin_routes = Router::new()
        .route("/challenges/:id/settle", post(admin::post_settle))
        .route("/challenges/:id/cancel", post(admin::post_cancel))
        .route(
            "/challenges/:id/participants/:user_id/status",
            post(admin::post_participant_status),
        )
        .route("/admin/revenue", get(admin::get_revenue))
        .route_layer(axum_mw::from_fn(require_admin))
        .route_layer(axum_mw::from_fn_with_state(jwt, auth_middleware))
        .with_state(state);

    Router::new()
        .merge(public_routes)
        .merge(protected_routes)
        .merge(admin_routes)
}

// ===== Health =====

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    version: String,
}

async fn health_check() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

// ===== Error translation =====

/// HTTP-facing error. Core error kinds map to statuses here and nowhere else;
/// storage details never leak into response bodies.
#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub detail: String,
}

#[derive(Serialize)]
struct ErrorBody {
    detail: String,
}

impl ApiError {
    pub fn new(status: StatusCode, detail: impl Into<String>) -> Self {
        Self {
            status,
            detail: detail.into(),
        }
    }

    pub fn unauthorized(detail: impl Into<String>) -> Self {
        Self::new(StatusCode::UNAUTHORIZED, detail)
    }
}

impl From<CoreError> for ApiError {
    fn from(err: CoreError) -> Self {
        let status = match &err {
            CoreError::InvalidAmount(_)
            | CoreError::DailyLimit { .. }
            | CoreError::Insufficient { .. }
            | CoreError::NoRefundableFunds
            | CoreError::NotJoinable(_)
            | CoreError::InvalidSignature(_) => StatusCode::BAD_REQUEST,
            CoreError::NotFound(_) => StatusCode::NOT_FOUND,
            CoreError::StateConflict(_) => StatusCode::CONFLICT,
            CoreError::WalletBusy | CoreError::Disabled => StatusCode::SERVICE_UNAVAILABLE,
            CoreError::Processor(_) => StatusCode::BAD_GATEWAY,
            // Duplicate is an internal idempotency signal; services translate
            // it to success before it gets here. Reaching this arm is a bug.
            CoreError::Duplicate { .. }
            | CoreError::SignViolation { .. }
            | CoreError::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let detail = if status == StatusCode::INTERNAL_SERVER_ERROR {
            tracing::error!(error = %err, "internal error");
            "internal error".to_string()
        } else {
            err.to_string()
        };
        Self { status, detail }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(ErrorBody { detail: self.detail })).into_response()
    }
}
