//! Error taxonomy.
//!
//! `GameError` carries the stable codes exposed on the wire; `StoreError`
//! belongs to the storage layer and maps into `GameError` at the lifecycle
//! boundary, after retries have been spent.

use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum GameError {
    #[error("caller is not authenticated")]
    Unauthorised,
    #[error("caller may not act on this bet")]
    Forbidden,
    #[error("wallet balance is below the requested amount")]
    InsufficientFunds,
    #[error("open-bet limit for this cycle reached")]
    BetLimitExceeded,
    #[error("stake is outside the allowed range")]
    StakeOutOfRange,
    #[error("auto cash-out threshold must exceed 1.00")]
    InvalidAutoThreshold,
    #[error("bet is not active")]
    NotActive,
    #[error("bet is already settled")]
    AlreadySettled,
    #[error("cycle ended before the operation completed")]
    CycleEnded,
    #[error("internal error")]
    System,
    #[error("transient failure, try again")]
    Transient,
}

impl GameError {
    /// Stable wire code for the `error` field of acks and error events.
    pub fn code(&self) -> &'static str {
        match self {
            GameError::Unauthorised => "unauthorised",
            GameError::Forbidden => "forbidden",
            GameError::InsufficientFunds => "insufficient-funds",
            GameError::BetLimitExceeded => "bet-limit-exceeded",
            GameError::StakeOutOfRange => "stake-out-of-range",
            GameError::InvalidAutoThreshold => "invalid-auto-threshold",
            GameError::NotActive => "not-active",
            GameError::AlreadySettled => "already-settled",
            GameError::CycleEnded => "cycle-ended",
            GameError::System => "system-error",
            GameError::Transient => "transient",
        }
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store lock poisoned")]
    LockPoisoned,
    #[error("insufficient funds")]
    InsufficientFunds,
    #[error("negative amount rejected")]
    NegativeAmount,
    #[error("row already settled")]
    AlreadySettled,
    #[error("row not found")]
    NotFound,
    #[error("illegal state transition: {0}")]
    IllegalTransition(&'static str),
    #[error("amount overflow")]
    Overflow,
    #[error("database error: {0}")]
    Database(String),
    #[error("database operation timed out")]
    Timeout,
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        StoreError::Database(err.to_string())
    }
}

impl From<StoreError> for GameError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::InsufficientFunds => GameError::InsufficientFunds,
            StoreError::AlreadySettled => GameError::AlreadySettled,
            StoreError::NotFound | StoreError::IllegalTransition(_) => GameError::NotActive,
            StoreError::Timeout => GameError::Transient,
            // Database errors reach this conversion only after retries
            // are exhausted.
            StoreError::Database(_) => GameError::System,
            StoreError::LockPoisoned | StoreError::Overflow | StoreError::NegativeAmount => {
                GameError::System
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_codes_are_stable() {
        assert_eq!(GameError::InsufficientFunds.code(), "insufficient-funds");
        assert_eq!(GameError::BetLimitExceeded.code(), "bet-limit-exceeded");
        assert_eq!(GameError::StakeOutOfRange.code(), "stake-out-of-range");
        assert_eq!(GameError::CycleEnded.code(), "cycle-ended");
        assert_eq!(GameError::System.code(), "system-error");
    }

    #[test]
    fn store_errors_map_to_named_domain_errors() {
        assert_eq!(
            GameError::from(StoreError::InsufficientFunds),
            GameError::InsufficientFunds
        );
        assert_eq!(GameError::from(StoreError::AlreadySettled), GameError::AlreadySettled);
        assert_eq!(GameError::from(StoreError::Timeout), GameError::Transient);
        assert_eq!(GameError::from(StoreError::Database("boom".into())), GameError::System);
    }
}
