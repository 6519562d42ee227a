//! Payout distribution.
//!
//! Converts a settlement plan into outbound ledger transfers: one to the
//! house wallet, one per winning bet (or per refund under the refund_all
//! policy). Every transfer carries an idempotency key derived from
//! `(round_id, bet_id)` — or the fixed per-round house key — so a retried
//! dispatch after a transient failure has at most one effect.
//!
//! Partial failure leaves the round resumable: bets already `Paid` are
//! skipped on the next pass, unpaid ones are retried with bounded backoff,
//! and a bet whose retries are exhausted is marked `PayoutFailed` and
//! surfaced in the report for manual reconciliation. Never silently
//! dropped.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tracing::{error, info, warn};

use crate::error::{EngineError, EngineResult};
use crate::ledger::LedgerClient;
use crate::pot::{PayoutItem, SettlementPlan};
use crate::storage::RoundStore;
use crate::types::PayoutStatus;

pub struct PayoutDistributor {
    store: RoundStore,
    ledger: Arc<dyn LedgerClient>,
    house_wallet: String,
    escrow_wallet: String,
    max_retries: u32,
    backoff: Duration,
}

/// Outcome of one distribution pass over a round
#[derive(Debug, Clone, Serialize)]
pub struct DistributionReport {
    pub round_id: u64,
    pub paid: usize,
    pub refunded: usize,
    pub skipped_already_paid: usize,
    /// `PayoutFailed` escalations needing manual reconciliation
    pub failed: Vec<EngineError>,
    pub house_paid: bool,
    pub house_cut: u64,
}

impl DistributionReport {
    pub fn fully_settled(&self) -> bool {
        self.failed.is_empty() && self.house_paid
    }
}

impl PayoutDistributor {
    pub fn new(
        store: RoundStore,
        ledger: Arc<dyn LedgerClient>,
        house_wallet: String,
        escrow_wallet: String,
        max_retries: u32,
        backoff: Duration,
    ) -> Self {
        Self {
            store,
            ledger,
            house_wallet,
            escrow_wallet,
            max_retries,
            backoff,
        }
    }

    /// Execute (or resume) the transfers for a settled round.
    ///
    /// Idempotent: run it again after a crash and already-paid bets are
    /// skipped, the house key replays as a no-op, and only outstanding
    /// transfers are attempted.
    pub async fn distribute(
        &self,
        round_id: u64,
        plan: &SettlementPlan,
    ) -> EngineResult<DistributionReport> {
        let mut report = DistributionReport {
            round_id,
            paid: 0,
            refunded: 0,
            skipped_already_paid: 0,
            failed: Vec::new(),
            house_paid: false,
            house_cut: plan.house_cut,
        };

        // House cut first: a fixed per-round key
        let house_key = format!("round:{}:house", round_id);
        match self
            .transfer_with_retry(&self.house_wallet, plan.house_cut, &house_key)
            .await
        {
            Ok(()) => {
                report.house_paid = true;
                info!(round = round_id, amount = plan.house_cut, "House cut transferred");
            }
            Err(e) => {
                // Funds stay in escrow; surfaced, never dropped
                error!(round = round_id, error = %e, "House cut transfer exhausted retries");
            }
        }

        for item in &plan.payouts {
            let key = format!("round:{}:bet:{}", round_id, item.bet_id);
            self.dispatch_item(item, &key, PayoutStatus::Paid, &mut report)
                .await?;
        }
        for item in &plan.refunds {
            let key = format!("round:{}:refund:{}", round_id, item.bet_id);
            self.dispatch_item(item, &key, PayoutStatus::Refunded, &mut report)
                .await?;
        }

        info!(
            round = round_id,
            paid = report.paid,
            refunded = report.refunded,
            skipped = report.skipped_already_paid,
            failed = report.failed.len(),
            "Distribution pass complete"
        );
        Ok(report)
    }

    async fn dispatch_item(
        &self,
        item: &PayoutItem,
        key: &str,
        on_success: PayoutStatus,
        report: &mut DistributionReport,
    ) -> EngineResult<()> {
        let mut bet = self
            .store
            .get_bet(&item.bet_id)
            .ok_or_else(|| EngineError::Storage(format!("unknown bet {}", item.bet_id)))?;

        // Resume path: this bet was already settled in an earlier pass
        if bet.payout != PayoutStatus::Unpaid {
            report.skipped_already_paid += 1;
            return Ok(());
        }

        match self
            .transfer_with_retry(&item.user_id, item.amount, key)
            .await
        {
            Ok(()) => {
                bet.payout = on_success;
                self.store.put_bet(&bet)?;
                match on_success {
                    PayoutStatus::Refunded => report.refunded += 1,
                    _ => report.paid += 1,
                }
                info!(bet = %bet.id, user = %bet.user_id, amount = item.amount, "Share transferred");
            }
            Err(e) => {
                bet.payout = PayoutStatus::PayoutFailed;
                self.store.put_bet(&bet)?;
                error!(
                    bet = %bet.id,
                    user = %bet.user_id,
                    amount = item.amount,
                    cause = %e,
                    "Payout exhausted retries, manual reconciliation required"
                );
                report.failed.push(EngineError::PayoutFailed {
                    bet_id: bet.id.clone(),
                    attempts: self.max_retries + 1,
                });
            }
        }
        Ok(())
    }

    /// Bounded exponential backoff around one transfer
    async fn transfer_with_retry(&self, to: &str, amount: u64, key: &str) -> EngineResult<()> {
        let mut attempt = 0u32;
        loop {
            match self
                .ledger
                .transfer(&self.escrow_wallet, to, amount, key)
                .await
            {
                Ok(()) => return Ok(()),
                Err(e) if attempt < self.max_retries => {
                    attempt += 1;
                    let delay = self.backoff * 2u32.saturating_pow(attempt - 1);
                    warn!(key = %key, attempt, error = %e, "Transfer failed, retrying");
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ZeroWinnerPolicy;
    use crate::ledger::InMemoryLedger;
    use crate::pot::compute_settlement;
    use crate::types::{Bet, FundingStatus, Side};
    use chrono::Utc;
    use tempfile::tempdir;

    fn setup() -> (PayoutDistributor, Arc<InMemoryLedger>, RoundStore, tempfile::TempDir) {
        let dir = tempdir().unwrap();
        let store = RoundStore::open(dir.path().to_str().unwrap()).unwrap();
        let ledger = Arc::new(InMemoryLedger::new());
        ledger.credit("escrow", 10_000);
        let distributor = PayoutDistributor::new(
            store.clone(),
            ledger.clone(),
            "house".to_string(),
            "escrow".to_string(),
            2,
            Duration::from_millis(5),
        );
        (distributor, ledger, store, dir)
    }

    fn funded_bet(store: &RoundStore, id: &str, user: &str, side: Side, amount: u64) -> Bet {
        let bet = Bet {
            id: id.to_string(),
            user_id: user.to_string(),
            round_id: 1,
            side,
            amount,
            deposit_reference: format!("dep_{}", id),
            funding: FundingStatus::Funded,
            payout: PayoutStatus::Unpaid,
            placed_at: Utc::now(),
        };
        store.put_bet(&bet).unwrap();
        bet
    }

    #[tokio::test]
    async fn test_distribute_pays_winners_and_house() {
        let (distributor, ledger, store, _dir) = setup();
        let bets = vec![
            funded_bet(&store, "a", "alice", Side::Pump, 700),
            funded_bet(&store, "b", "bob", Side::Dump, 300),
        ];
        let plan = compute_settlement(Side::Pump, &bets, 500, ZeroWinnerPolicy::HouseTakesAll);

        let report = distributor.distribute(1, &plan).await.unwrap();
        assert!(report.fully_settled());
        assert_eq!(report.paid, 1);
        assert_eq!(ledger.balance("house"), plan.house_cut);
        assert_eq!(ledger.balance("alice"), 950);
        assert_eq!(store.get_bet("a").unwrap().payout, PayoutStatus::Paid);
        // Value conservation at the ledger level
        assert_eq!(ledger.balance("escrow"), 10_000 - 1000);
    }

    #[tokio::test]
    async fn test_rerun_skips_paid_bets() {
        let (distributor, ledger, store, _dir) = setup();
        let bets = vec![funded_bet(&store, "a", "alice", Side::Pump, 700)];
        let plan = compute_settlement(Side::Pump, &bets, 500, ZeroWinnerPolicy::HouseTakesAll);

        distributor.distribute(1, &plan).await.unwrap();
        let balance_after_first = ledger.balance("alice");

        // Crash-and-resume: a second pass must not double-pay
        let report = distributor.distribute(1, &plan).await.unwrap();
        assert_eq!(report.skipped_already_paid, 1);
        assert_eq!(report.paid, 0);
        assert_eq!(ledger.balance("alice"), balance_after_first);
    }

    #[tokio::test]
    async fn test_transient_failure_retried_to_success() {
        let (distributor, ledger, store, _dir) = setup();
        let bets = vec![funded_bet(&store, "a", "alice", Side::Pump, 100)];
        let plan = compute_settlement(Side::Pump, &bets, 0, ZeroWinnerPolicy::HouseTakesAll);

        ledger.fail_transfers("round:1:bet:a", 2);
        let report = distributor.distribute(1, &plan).await.unwrap();
        assert_eq!(report.paid, 1);
        assert!(report.failed.is_empty());
        assert_eq!(ledger.balance("alice"), 100);
    }

    #[tokio::test]
    async fn test_exhausted_retries_escalate_not_drop() {
        let (distributor, ledger, store, _dir) = setup();
        let bets = vec![
            funded_bet(&store, "a", "alice", Side::Pump, 100),
            funded_bet(&store, "b", "bob", Side::Pump, 100),
        ];
        let plan = compute_settlement(Side::Pump, &bets, 0, ZeroWinnerPolicy::HouseTakesAll);

        // More failures than max_retries allows
        ledger.fail_transfers("round:1:bet:a", 10);
        let report = distributor.distribute(1, &plan).await.unwrap();

        assert_eq!(report.failed.len(), 1);
        assert!(matches!(
            &report.failed[0],
            EngineError::PayoutFailed { bet_id, attempts } if bet_id == "a" && *attempts == 3
        ));
        assert_eq!(store.get_bet("a").unwrap().payout, PayoutStatus::PayoutFailed);
        // The other winner is unaffected by the failure
        assert_eq!(report.paid, 1);
        assert_eq!(ledger.balance("bob"), 100);
    }

    #[tokio::test]
    async fn test_refund_all_marks_refunded() {
        let (distributor, ledger, store, _dir) = setup();
        let bets = vec![funded_bet(&store, "a", "alice", Side::Dump, 250)];
        // Pump wins with no pump bets → refund policy
        let plan = compute_settlement(Side::Pump, &bets, 500, ZeroWinnerPolicy::RefundAll);

        let report = distributor.distribute(1, &plan).await.unwrap();
        assert_eq!(report.refunded, 1);
        assert_eq!(ledger.balance("alice"), 250);
        assert_eq!(store.get_bet("a").unwrap().payout, PayoutStatus::Refunded);
    }
}
