//! Environment Configuration
//! Mission: Single place where every recognized env var is read and defaulted

use uuid::Uuid;

/// How withdrawals leave the platform.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WithdrawMode {
    /// Refund back to the originating payment (FIFO over deposits).
    Refund,
    /// Withdrawals globally off.
    Disabled,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub database_path: String,
    pub api_port: u16,

    pub jwt_secret: String,

    pub stripe_secret_key: String,
    pub stripe_webhook_secret: String,

    /// Minor units (USD cents) per token. Default 1: 1 token = 1 cent.
    pub token_price_cents: i64,
    /// Per-user per-UTC-day deposit ceiling, in tokens.
    pub daily_deposit_cap_tokens: i64,
    /// Allocations older than this are no longer externally refundable.
    pub refund_window_days: i64,
    pub withdraw_mode: WithdrawMode,

    /// Sentinel identity that receives forfeited stakes.
    pub platform_user_id: Uuid,

    /// Seconds between settlement poller sweeps.
    pub settlement_poll_secs: u64,
    /// Seconds after end_at before a challenge is considered verification-complete.
    pub verification_grace_secs: i64,
    /// Allow joining an ACTIVE challenge after start_at (until end_at).
    pub allow_late_join: bool,
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse::<T>().ok())
        .unwrap_or(default)
}

fn env_flag(key: &str, default: bool) -> bool {
    std::env::var(key)
        .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "on" | "ON"))
        .unwrap_or(default)
}

impl Config {
    pub fn from_env() -> Self {
        dotenv::dotenv().ok();

        let withdraw_mode = match std::env::var("WITHDRAW_MODE").as_deref() {
            Ok("disabled") => WithdrawMode::Disabled,
            _ => WithdrawMode::Refund,
        };

        let platform_user_id = std::env::var("PLATFORM_USER_ID")
            .ok()
            .and_then(|v| Uuid::parse_str(&v).ok())
            .unwrap_or(Uuid::nil());

        Self {
            database_path: std::env::var("DATABASE_PATH")
                .unwrap_or_else(|_| "./peerpush.db".to_string()),
            api_port: env_parse("API_PORT", 8000),
            jwt_secret: std::env::var("JWT_SECRET")
                .unwrap_or_else(|_| "dev-secret-change-me".to_string()),
            stripe_secret_key: std::env::var("STRIPE_SECRET_KEY").unwrap_or_default(),
            stripe_webhook_secret: std::env::var("STRIPE_WEBHOOK_SECRET").unwrap_or_default(),
            token_price_cents: env_parse("TOKEN_PRICE_USD_CENTS", 1).max(1),
            daily_deposit_cap_tokens: env_parse("MAX_DEPOSIT_TOKENS_DAY", 100_000),
            refund_window_days: env_parse("REFUND_WINDOW_DAYS", 90),
            withdraw_mode,
            platform_user_id,
            settlement_poll_secs: env_parse("SETTLEMENT_POLL_SECS", 60),
            verification_grace_secs: env_parse("VERIFICATION_GRACE_SECS", 0),
            allow_late_join: env_flag("ALLOW_LATE_JOIN", false),
        }
    }
}

impl Default for Config {
    /// Test-friendly defaults; production always goes through `from_env`.
    fn default() -> Self {
        Self {
            database_path: ":memory:".to_string(),
            api_port: 8000,
            jwt_secret: "test-secret".to_string(),
            stripe_secret_key: String::new(),
            stripe_webhook_secret: "whsec_test".to_string(),
            token_price_cents: 1,
            daily_deposit_cap_tokens: 100_000,
            refund_window_days: 90,
            withdraw_mode: WithdrawMode::Refund,
            platform_user_id: Uuid::nil(),
            settlement_poll_secs: 60,
            verification_grace_secs: 0,
            allow_late_join: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_sane() {
        let cfg = Config::default();
        assert_eq!(cfg.token_price_cents, 1);
        assert_eq!(cfg.daily_deposit_cap_tokens, 100_000);
        assert_eq!(cfg.refund_window_days, 90);
        assert_eq!(cfg.withdraw_mode, WithdrawMode::Refund);
        assert!(cfg.platform_user_id.is_nil());
    }
}
