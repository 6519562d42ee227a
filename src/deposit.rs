//! Deposit reference allocation and funding observation.
//!
//! Every bet gets a deposit reference derived deterministically from
//! `(user, round, side, nonce)`, so a retried submission with the same
//! nonce maps onto the slot it already created instead of allocating a
//! duplicate. References are immutable once issued.
//!
//! Funding is observed by polling the ledger's balance at the reference.
//! Each watch is an independent task, but the actual balance queries are
//! gated by a shared semaphore so a busy round cannot overwhelm the ledger
//! client. A reference that never reaches the declared amount within the
//! timeout expires and its bet is excluded from the pot and any payout.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use sha2::{Digest, Sha256};
use tokio::sync::Semaphore;
use tokio::time::Instant;
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::{EngineError, EngineResult};
use crate::ledger::LedgerClient;
use crate::storage::RoundStore;
use crate::types::{Bet, FundingStatus, PayoutStatus, Side};

pub struct DepositAllocator {
    store: RoundStore,
    ledger: Arc<dyn LedgerClient>,
    /// Bounds concurrent balance queries across all watches
    poll_permits: Arc<Semaphore>,
    poll_interval: Duration,
    deposit_timeout: Duration,
}

/// Deterministic deposit handle: `dep_` + first 20 digest bytes as hex.
/// Same inputs always yield the same reference.
pub fn derive_reference(user_id: &str, round_id: u64, side: Side, nonce: u64) -> String {
    let mut hasher = Sha256::new();
    hasher.update(user_id.as_bytes());
    hasher.update(b":");
    hasher.update(round_id.to_string().as_bytes());
    hasher.update(b":");
    hasher.update(side.as_str().as_bytes());
    hasher.update(b":");
    hasher.update(nonce.to_string().as_bytes());
    let digest = hasher.finalize();
    format!("dep_{}", hex::encode(&digest[..20]))
}

impl DepositAllocator {
    pub fn new(
        store: RoundStore,
        ledger: Arc<dyn LedgerClient>,
        ledger_concurrency: usize,
        poll_interval: Duration,
        deposit_timeout: Duration,
    ) -> Self {
        Self {
            store,
            ledger,
            poll_permits: Arc::new(Semaphore::new(ledger_concurrency)),
            poll_interval,
            deposit_timeout,
        }
    }

    /// Allocate (or re-find) the bet slot for a submission.
    ///
    /// Idempotent: a repeat with the same `(user, round, side, nonce)`
    /// returns the existing bet without creating a second slot.
    pub fn submit(
        &self,
        user_id: &str,
        round_id: u64,
        side: Side,
        amount: u64,
        nonce: u64,
    ) -> EngineResult<Bet> {
        let reference = derive_reference(user_id, round_id, side, nonce);

        if let Some(existing) = self.store.bet_by_reference(&reference) {
            info!(bet = %existing.id, reference = %reference, "Duplicate submission, returning existing slot");
            return Ok(existing);
        }

        let bet = Bet {
            id: Uuid::new_v4().to_string(),
            user_id: user_id.to_string(),
            round_id,
            side,
            amount,
            deposit_reference: reference.clone(),
            funding: FundingStatus::PendingDeposit,
            payout: PayoutStatus::Unpaid,
            placed_at: Utc::now(),
        };
        self.store.put_bet(&bet)?;
        info!(
            bet = %bet.id,
            user = %user_id,
            round = round_id,
            side = %side,
            amount,
            reference = %reference,
            "Deposit slot allocated"
        );
        Ok(bet)
    }

    /// Poll the ledger until the reference is funded or the timeout hits.
    ///
    /// Persists the `Funded` transition and returns it, or persists
    /// `Expired` and returns `DepositTimeout`. The lifecycle owns the
    /// follow-up pot accounting.
    pub async fn await_funding(&self, bet_id: &str) -> EngineResult<FundingStatus> {
        let bet = self
            .store
            .get_bet(bet_id)
            .ok_or_else(|| EngineError::Storage(format!("unknown bet {}", bet_id)))?;
        if bet.funding != FundingStatus::PendingDeposit {
            return Ok(bet.funding);
        }

        let deadline = Instant::now() + self.deposit_timeout;
        loop {
            let observed = {
                let _permit = self
                    .poll_permits
                    .acquire()
                    .await
                    .map_err(|e| EngineError::Ledger(e.to_string()))?;
                self.ledger.get_balance(&bet.deposit_reference).await?
            };

            // Early exit: the round may have expired this bet at reveal
            // while the balance query was in flight
            let current = self
                .store
                .get_bet(bet_id)
                .ok_or_else(|| EngineError::Storage(format!("unknown bet {}", bet_id)))?;
            if current.funding != FundingStatus::PendingDeposit {
                return Ok(current.funding);
            }

            if observed >= bet.amount {
                // Conditional write: if reveal-time expiry got there first,
                // the bet stays excluded no matter when the money landed
                let status = self.store.transition_funding(&bet.id, FundingStatus::Funded)?;
                if status == FundingStatus::Funded {
                    info!(bet = %bet.id, reference = %bet.deposit_reference, observed, "Deposit funded");
                }
                return Ok(status);
            }

            if Instant::now() >= deadline {
                let status = self.store.transition_funding(&bet.id, FundingStatus::Expired)?;
                if status != FundingStatus::Expired {
                    return Ok(status);
                }
                warn!(
                    bet = %bet.id,
                    reference = %bet.deposit_reference,
                    observed,
                    required = bet.amount,
                    "Deposit timed out, bet excluded"
                );
                return Err(EngineError::DepositTimeout {
                    reference: bet.deposit_reference.clone(),
                });
            }

            tokio::time::sleep(self.poll_interval).await;
        }
    }

    /// Expire every still-pending bet of a round (called at reveal so no
    /// late deposit can slip in after the outcome exists)
    pub fn expire_pending(&self, round_id: u64) -> EngineResult<usize> {
        let mut expired = 0;
        for bet in self.store.bets_for_round(round_id) {
            if bet.funding == FundingStatus::PendingDeposit
                && self.store.transition_funding(&bet.id, FundingStatus::Expired)?
                    == FundingStatus::Expired
            {
                expired += 1;
            }
        }
        if expired > 0 {
            warn!(round = round_id, expired, "Unfunded bets expired at reveal");
        }
        Ok(expired)
    }
}
