//! Engine error types.
//!
//! Everything that can reject a bet or interrupt money movement is a named
//! variant here. Nothing money-related is ever swallowed: transfer failures
//! either retry or escalate to `PayoutFailed` for manual reconciliation.

use serde::{Deserialize, Serialize};

/// Result type for engine operations
pub type EngineResult<T> = Result<T, EngineError>;

/// Engine errors
#[derive(Debug, Clone, Serialize, Deserialize, thiserror::Error)]
pub enum EngineError {
    #[error("Round {round_id} is closed for betting")]
    RoundClosedForBetting { round_id: u64 },

    #[error("No round is currently accepting bets")]
    NoActiveRound,

    #[error("Deposit timed out for reference {reference}")]
    DepositTimeout { reference: String },

    #[error("Transfer failed (key {key}): {detail}")]
    TransferFailed { key: String, detail: String },

    #[error("Payout failed for bet {bet_id} after {attempts} attempts, manual reconciliation required")]
    PayoutFailed { bet_id: String, attempts: u32 },

    #[error("User is banned: {reason}")]
    BannedUser { reason: String },

    #[error("Bet amount {amount} outside allowed range {min}..={max}")]
    BetOutOfRange { amount: u64, min: u64, max: u64 },

    #[error("Insufficient balance: {available} < {required}")]
    InsufficientBalance { available: u64, required: u64 },

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Ledger error: {0}")]
    Ledger(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = EngineError::TransferFailed {
            key: "round:7:bet:abc".to_string(),
            detail: "connection reset".to_string(),
        };
        assert!(err.to_string().contains("round:7:bet:abc"));

        let err = EngineError::BetOutOfRange { amount: 5, min: 10, max: 100 };
        assert!(err.to_string().contains("10..=100"));
    }
}
