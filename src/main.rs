//! PeerPush Backend - Token Wallet & Challenge Settlement Service
//! Mission: Keep the money correct under concurrency, retries, and partial failure

use anyhow::{Context, Result};
use axum::middleware as axum_mw;
use peerpush_backend::{
    api::{create_router, AppState},
    auth::JwtHandler,
    challenges::ChallengeStore,
    config::Config,
    db::Database,
    deposits::DepositService,
    jobs::spawn_settlement_poller,
    locks::LockRegistry,
    middleware::logging::request_logging,
    payments::{stripe::StripeClient, webhook::WebhookVerifier, PaymentProcessor},
    settlement::SettlementEngine,
    wallet::Wallet,
    withdrawals::WithdrawalService,
};
use std::sync::Arc;
use tokio::net::TcpListener;
use tower_http::cors::CorsLayer;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,peerpush_backend=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::from_env();
    info!("🚀 PeerPush backend starting");

    let db = Database::new(&config.database_path)
        .with_context(|| format!("open database at {}", config.database_path))?;
    info!("💾 Database ready at {}", config.database_path);

    let user_locks = LockRegistry::new();
    let challenge_locks = LockRegistry::new();
    let processor: Arc<dyn PaymentProcessor> =
        Arc::new(StripeClient::new(config.stripe_secret_key.clone()));
    if config.stripe_secret_key.is_empty() {
        tracing::warn!("STRIPE_SECRET_KEY not set; processor calls will fail");
    }

    let wallet = Wallet::new(db.clone(), user_locks.clone());
    let deposits = DepositService::new(db.clone(), wallet.clone(), processor.clone(), config.clone());
    let withdrawals =
        WithdrawalService::new(db.clone(), user_locks.clone(), processor.clone(), config.clone());
    let challenges = ChallengeStore::new(db.clone());
    let settlement = SettlementEngine::new(
        db.clone(),
        user_locks.clone(),
        challenge_locks,
        config.clone(),
    );

    // Scheduled path into settlement: ended challenges settle without an operator.
    spawn_settlement_poller(challenges.clone(), settlement.clone(), config.clone());

    let jwt = Arc::new(JwtHandler::new(config.jwt_secret.clone()));
    let state = AppState {
        db,
        wallet,
        deposits,
        withdrawals,
        challenges,
        settlement,
        webhook_verifier: WebhookVerifier::new(config.stripe_webhook_secret.clone()),
        config: config.clone(),
    };

    let app = create_router(state, jwt)
        .layer(CorsLayer::permissive())
        .layer(axum_mw::from_fn(request_logging));

    let addr = format!("0.0.0.0:{}", config.api_port);
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("bind {addr}"))?;
    info!("🎯 API server listening on {}", addr);

    axum::serve(listener, app).await.context("Server error")?;
    Ok(())
}
