//! Core Error Type
//! Mission: One tagged error for everything below the HTTP boundary

use uuid::Uuid;

/// Error kinds for the financial core. The API layer is the only place these
/// are translated to HTTP statuses; nothing below it sees status codes.
#[derive(Debug)]
pub enum CoreError {
    /// Amount is zero, negative, or beyond a hard cap.
    InvalidAmount(String),
    /// Deposit would exceed the per-user daily cap.
    DailyLimit { remaining: i64 },
    /// Balance is below the requested debit.
    Insufficient { balance: i64, requested: i64 },
    /// Withdrawal requested but no refundable allocation is inside the window.
    NoRefundableFunds,
    /// `(kind, external_id)` already recorded. Carries the existing entry so
    /// callers can treat the collision as an idempotent no-op.
    Duplicate { entry_id: Uuid },
    /// Ledger append whose amount sign does not match its kind. Always a
    /// programming error, never a client error.
    SignViolation { kind: &'static str, amount: i64 },
    /// Webhook signature mismatch or stale timestamp.
    InvalidSignature(String),
    /// Advisory lock wait exceeded the timeout.
    WalletBusy,
    /// Feature flag is off.
    Disabled,
    /// Payment processor call failed.
    Processor(String),
    /// Join refused for timing or capacity reasons.
    NotJoinable(String),
    /// Challenge or participant does not exist.
    NotFound(String),
    /// Terminal-status violation, double join, settle on non-completed, etc.
    StateConflict(String),
    /// Storage failure. Never surfaced verbatim to clients.
    Storage(rusqlite::Error),
}

impl std::fmt::Display for CoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CoreError::InvalidAmount(msg) => write!(f, "invalid amount: {msg}"),
            CoreError::DailyLimit { remaining } => {
                write!(f, "daily deposit limit reached ({remaining} tokens remaining today)")
            }
            CoreError::Insufficient { balance, requested } => {
                write!(f, "insufficient balance: have {balance}, need {requested}")
            }
            CoreError::NoRefundableFunds => write!(f, "no refundable funds inside refund window"),
            CoreError::Duplicate { entry_id } => write!(f, "duplicate external id (entry {entry_id})"),
            CoreError::SignViolation { kind, amount } => {
                write!(f, "sign violation: {kind} entry with amount {amount}")
            }
            CoreError::InvalidSignature(msg) => write!(f, "invalid webhook signature: {msg}"),
            CoreError::WalletBusy => write!(f, "wallet busy, try again"),
            CoreError::Disabled => write!(f, "operation disabled"),
            CoreError::Processor(msg) => write!(f, "payment processor error: {msg}"),
            CoreError::NotJoinable(msg) => write!(f, "cannot join: {msg}"),
            CoreError::NotFound(what) => write!(f, "{what} not found"),
            CoreError::StateConflict(msg) => write!(f, "state conflict: {msg}"),
            CoreError::Storage(e) => write!(f, "storage error: {e}"),
        }
    }
}

impl std::error::Error for CoreError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            CoreError::Storage(e) => Some(e),
            _ => None,
        }
    }
}

impl From<rusqlite::Error> for CoreError {
    fn from(e: rusqlite::Error) -> Self {
        CoreError::Storage(e)
    }
}

pub type CoreResult<T> = Result<T, CoreError>;
