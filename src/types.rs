//! Core data model: rounds, bets, deposit references, bans.
//!
//! All monetary amounts are integer minor units (1 coin = 10^9 units) so
//! settlement math is exact. Floats never touch pot accounting.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Minor units per whole coin (lamport-style fixed point)
pub const MINOR_UNITS_PER_COIN: u64 = 1_000_000_000;

// ============================================================================
// SIDE
// ============================================================================

/// One of the two mutually exclusive bet outcomes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Pump,
    Dump,
}

impl Side {
    pub fn opposite(&self) -> Side {
        match self {
            Side::Pump => Side::Dump,
            Side::Dump => Side::Pump,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Side::Pump => "pump",
            Side::Dump => "dump",
        }
    }
}

impl std::fmt::Display for Side {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// ROUND
// ============================================================================

/// Round lifecycle phase
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum RoundPhase {
    /// Accepting bets
    Open,
    /// Betting closed, awaiting reveal window
    Locked,
    /// Outcome computed, payouts pending
    Revealed,
    /// Payouts dispatched
    Settled,
    /// Archived
    Closed,
}

/// One complete betting cycle with a single binary outcome.
///
/// Retained after `Closed` for audit and reconciliation. Pot totals here
/// are persisted snapshots; the live running totals during the `Open`
/// phase are kept by [`crate::pot::PotAccountant`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Round {
    pub id: u64,
    pub phase: RoundPhase,
    pub opened_at: DateTime<Utc>,
    pub locks_at: DateTime<Utc>,
    pub reveals_at: DateTime<Utc>,
    /// Set exactly once, at reveal
    pub winning_side: Option<Side>,
    /// Funded pot per side, minor units (snapshot at lock/reveal)
    pub total_pump: u64,
    pub total_dump: u64,
    pub participants: u32,
    /// sha256(fairness secret), recorded at open so the outcome can be
    /// verified once the secret is disclosed after settlement
    pub fairness_commitment: String,
    /// House profit in minor units, set at settlement
    pub house_profit: u64,
}

impl Round {
    pub fn total_pot(&self) -> u64 {
        self.total_pump + self.total_dump
    }

    pub fn side_total(&self, side: Side) -> u64 {
        match side {
            Side::Pump => self.total_pump,
            Side::Dump => self.total_dump,
        }
    }
}

// ============================================================================
// BET
// ============================================================================

/// Funding state of a bet's deposit reference
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FundingStatus {
    /// Reference issued, waiting for on-ledger balance
    PendingDeposit,
    /// Observed balance covers the declared amount; counted in the pot
    Funded,
    /// Funding never observed within the timeout; excluded from the pot
    Expired,
}

/// Payout state of a bet. Transitions at most once, by the distributor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PayoutStatus {
    Unpaid,
    Paid,
    Refunded,
    /// Transfer retries exhausted; surfaced for manual reconciliation
    PayoutFailed,
}

/// A single user's stake in a round
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Bet {
    pub id: String,
    pub user_id: String,
    pub round_id: u64,
    pub side: Side,
    /// Declared stake in minor units
    pub amount: u64,
    /// Round- and bet-scoped deposit handle, immutable once issued
    pub deposit_reference: String,
    pub funding: FundingStatus,
    pub payout: PayoutStatus,
    pub placed_at: DateTime<Utc>,
}

// ============================================================================
// FRAUD
// ============================================================================

/// Result of a single abuse check. Ephemeral: logged, never persisted.
#[derive(Debug, Clone, Serialize)]
pub struct FraudSignal {
    pub check: String,
    pub flagged: bool,
    pub reason: String,
}

impl FraudSignal {
    pub fn clean(check: &str) -> Self {
        Self {
            check: check.to_string(),
            flagged: false,
            reason: String::new(),
        }
    }

    pub fn flag(check: &str, reason: impl Into<String>) -> Self {
        Self {
            check: check.to_string(),
            flagged: true,
            reason: reason.into(),
        }
    }
}

/// Temporary ban. Expires by timestamp comparison, never actively deleted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BanRecord {
    pub user_id: String,
    pub expires_at: DateTime<Utc>,
    pub reason: String,
}

impl BanRecord {
    pub fn is_active(&self, now: DateTime<Utc>) -> bool {
        self.expires_at > now
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_side_opposite() {
        assert_eq!(Side::Pump.opposite(), Side::Dump);
        assert_eq!(Side::Dump.opposite(), Side::Pump);
    }

    #[test]
    fn test_phase_ordering() {
        assert!(RoundPhase::Open < RoundPhase::Locked);
        assert!(RoundPhase::Locked < RoundPhase::Revealed);
        assert!(RoundPhase::Revealed < RoundPhase::Settled);
        assert!(RoundPhase::Settled < RoundPhase::Closed);
    }

    #[test]
    fn test_ban_expiry() {
        let ban = BanRecord {
            user_id: "u1".to_string(),
            expires_at: Utc::now() + chrono::Duration::hours(1),
            reason: "rapid betting".to_string(),
        };
        assert!(ban.is_active(Utc::now()));
        assert!(!ban.is_active(Utc::now() + chrono::Duration::hours(2)));
    }
}
