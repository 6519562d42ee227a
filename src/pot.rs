//! Pot accounting and settlement math.
//!
//! `PotAccountant` keeps the live per-side totals for the round currently
//! accepting deposits. Totals are plain atomics so concurrent funding
//! confirmations never serialize on a lock; a bet is counted exactly once,
//! when it transitions to `Funded`, never while pending.
//!
//! Settlement works entirely in integer minor units. Every share floors and
//! the rounding remainder goes to the house, so
//! `sum(shares) + house_cut == total_pot` holds exactly, no epsilon.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use serde::Serialize;
use tracing::info;

use crate::config::ZeroWinnerPolicy;
use crate::types::{Bet, FundingStatus, Side, MINOR_UNITS_PER_COIN};

// ============================================================================
// RUNNING TOTALS
// ============================================================================

/// Live per-side pot totals for one round
#[derive(Debug, Default)]
pub struct PotAccountant {
    total_pump: AtomicU64,
    total_dump: AtomicU64,
    participants: AtomicU32,
}

impl PotAccountant {
    pub fn new() -> Self {
        Self::default()
    }

    /// Count a bet that just became `Funded`. Called at most once per bet.
    pub fn record_funded(&self, side: Side, amount: u64) {
        match side {
            Side::Pump => self.total_pump.fetch_add(amount, Ordering::Relaxed),
            Side::Dump => self.total_dump.fetch_add(amount, Ordering::Relaxed),
        };
        self.participants.fetch_add(1, Ordering::Relaxed);
        info!(side = %side, amount, "Funded bet counted in pot");
    }

    pub fn side_total(&self, side: Side) -> u64 {
        match side {
            Side::Pump => self.total_pump.load(Ordering::Relaxed),
            Side::Dump => self.total_dump.load(Ordering::Relaxed),
        }
    }

    pub fn total_pot(&self) -> u64 {
        self.side_total(Side::Pump) + self.side_total(Side::Dump)
    }

    pub fn participants(&self) -> u32 {
        self.participants.load(Ordering::Relaxed)
    }

    /// Snapshot for broadcasts and audit
    pub fn stats(&self) -> RoundStats {
        let pump = self.side_total(Side::Pump);
        let dump = self.side_total(Side::Dump);
        let total = pump + dump;
        let pct = |part: u64| {
            if total == 0 {
                0.0
            } else {
                part as f64 / total as f64 * 100.0
            }
        };
        RoundStats {
            total_pot: total,
            pump_pot: pump,
            dump_pot: dump,
            participants: self.participants(),
            pump_percentage: pct(pump),
            dump_percentage: pct(dump),
        }
    }
}

/// Per-round pot snapshot
#[derive(Debug, Clone, Serialize)]
pub struct RoundStats {
    pub total_pot: u64,
    pub pump_pot: u64,
    pub dump_pot: u64,
    pub participants: u32,
    pub pump_percentage: f64,
    pub dump_percentage: f64,
}

// ============================================================================
// SETTLEMENT
// ============================================================================

/// One outbound payment owed to a user
#[derive(Debug, Clone, Serialize)]
pub struct PayoutItem {
    pub bet_id: String,
    pub user_id: String,
    pub amount: u64,
}

/// Full distribution for a revealed round. Conserves value exactly:
/// payouts + refunds + house_cut == total_pot.
#[derive(Debug, Clone, Serialize)]
pub struct SettlementPlan {
    pub winning_side: Side,
    pub total_pot: u64,
    pub winning_pot: u64,
    /// House edge plus the share-rounding remainder
    pub house_cut: u64,
    pub payout_pot: u64,
    /// Winner shares, proportional to stake
    pub payouts: Vec<PayoutItem>,
    /// Stake returns under the refund_all zero-winner policy
    pub refunds: Vec<PayoutItem>,
}

impl SettlementPlan {
    /// Display multiplier (for stats only; payouts use integer shares)
    pub fn multiplier(&self) -> f64 {
        if self.winning_pot == 0 {
            0.0
        } else {
            self.payout_pot as f64 / self.winning_pot as f64
        }
    }
}

/// Compute the distribution for a revealed round from its funded bets.
///
/// Only `Funded` bets participate; pending and expired stakes were never
/// counted and are never paid. The zero-winner branch is driven entirely by
/// the configured policy.
pub fn compute_settlement(
    winning_side: Side,
    bets: &[Bet],
    house_edge_bps: u64,
    policy: ZeroWinnerPolicy,
) -> SettlementPlan {
    let funded: Vec<&Bet> = bets
        .iter()
        .filter(|b| b.funding == FundingStatus::Funded)
        .collect();

    let total_pot: u64 = funded.iter().map(|b| b.amount).sum();
    let winning_pot: u64 = funded
        .iter()
        .filter(|b| b.side == winning_side)
        .map(|b| b.amount)
        .sum();

    if winning_pot == 0 {
        return match policy {
            ZeroWinnerPolicy::HouseTakesAll => SettlementPlan {
                winning_side,
                total_pot,
                winning_pot: 0,
                house_cut: total_pot,
                payout_pot: 0,
                payouts: Vec::new(),
                refunds: Vec::new(),
            },
            ZeroWinnerPolicy::RefundAll => SettlementPlan {
                winning_side,
                total_pot,
                winning_pot: 0,
                house_cut: 0,
                payout_pot: 0,
                payouts: Vec::new(),
                refunds: funded
                    .iter()
                    .map(|b| PayoutItem {
                        bet_id: b.id.clone(),
                        user_id: b.user_id.clone(),
                        amount: b.amount,
                    })
                    .collect(),
            },
        };
    }

    // Integer edge: floor(total * bps / 10_000)
    let house_base = (total_pot as u128 * house_edge_bps as u128 / 10_000) as u64;
    let payout_pot = total_pot - house_base;

    let mut payouts = Vec::new();
    let mut distributed: u64 = 0;
    for bet in funded.iter().filter(|b| b.side == winning_side) {
        // share = stake * payout_pot / winning_pot, floored
        let share = (bet.amount as u128 * payout_pot as u128 / winning_pot as u128) as u64;
        distributed += share;
        payouts.push(PayoutItem {
            bet_id: bet.id.clone(),
            user_id: bet.user_id.clone(),
            amount: share,
        });
    }

    // Flooring leaves a few units undistributed; they go to the house so
    // the conservation invariant is exact.
    let remainder = payout_pot - distributed;
    let house_cut = house_base + remainder;

    SettlementPlan {
        winning_side,
        total_pot,
        winning_pot,
        house_cut,
        payout_pot,
        payouts,
        refunds: Vec::new(),
    }
}
