//! Pump/Dump Round Engine
//!
//! Binary betting rounds on a coin flip: players back Pump or Dump,
//! the pot is split among the winning side after the house cut.
//!
//! ## Architecture
//!
//! - **Storage**: ReDB (ACID) + DashMap (lock-free cache)
//! - **Lifecycle**: one async task drives Open → Locked → Revealed → Settled → Closed
//! - **Fairness**: sha256-seeded outcome, commitment published at open
//! - **Money**: u64 minor units end to end, exact conservation per round

// Core modules
pub mod config;
pub mod deposit;
pub mod error;
pub mod fraud;
pub mod ledger;
pub mod lifecycle;
pub mod outcome;
pub mod payout;
pub mod pot;
pub mod storage;
pub mod types;

// ============================================================================
// PUBLIC API
// ============================================================================

// Configuration
pub use config::{EngineConfig, FairnessSecret, ZeroWinnerPolicy};

// Errors
pub use error::{EngineError, EngineResult};

// Domain types
pub use types::{
    BanRecord, Bet, FraudSignal, FundingStatus, PayoutStatus, Round, RoundPhase, Side,
    MINOR_UNITS_PER_COIN,
};

// Lifecycle
pub use lifecycle::{CurrentRoundInfo, RoundEngine, RoundEvent};

// Money movement
pub use deposit::{derive_reference, DepositAllocator};
pub use ledger::{InMemoryLedger, LedgerClient};
pub use payout::{DistributionReport, PayoutDistributor};
pub use pot::{compute_settlement, PotAccountant, RoundStats, SettlementPlan};

// Fraud
pub use fraud::{AbuseCheck, BetContext, FraudGate, NoopReputationCheck};

// Storage
pub use storage::RoundStore;
