//! Ledger client boundary.
//!
//! The engine only needs two semantic operations from the underlying
//! distributed ledger: observe the balance at a deposit reference, and move
//! funds with an idempotency key. The wire protocol, signing, and fee
//! handling all live on the other side of this trait.
//!
//! `InMemoryLedger` is a full in-process implementation used by tests and
//! local runs: lock-free balance reads via DashMap, atomic transfers, and a
//! key registry so a retried transfer has at most one effect.

use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use tracing::info;

use crate::error::{EngineError, EngineResult};

/// Semantic contract the core needs from a ledger
#[async_trait]
pub trait LedgerClient: Send + Sync {
    /// Observed balance at a deposit reference, minor units
    async fn get_balance(&self, reference: &str) -> EngineResult<u64>;

    /// Move funds. A key seen before must be a no-op success.
    async fn transfer(
        &self,
        from: &str,
        to: &str,
        amount: u64,
        idempotency_key: &str,
    ) -> EngineResult<()>;
}

// ============================================================================
// IN-MEMORY LEDGER
// ============================================================================

/// In-process ledger with idempotent transfers
#[derive(Default)]
pub struct InMemoryLedger {
    balances: DashMap<String, u64>,
    /// Keys already applied; replays short-circuit to Ok
    applied_keys: DashMap<String, ()>,
    /// Remaining injected failures per key, for retry tests
    failures: DashMap<String, AtomicU32>,
}

impl InMemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed an address with funds (simulates an external deposit landing)
    pub fn credit(&self, address: &str, amount: u64) {
        *self.balances.entry(address.to_string()).or_insert(0) += amount;
    }

    pub fn balance(&self, address: &str) -> u64 {
        self.balances.get(address).map(|v| *v).unwrap_or(0)
    }

    /// Make the next `times` transfers carrying `key` fail transiently
    pub fn fail_transfers(&self, key: &str, times: u32) {
        self.failures.insert(key.to_string(), AtomicU32::new(times));
    }

    /// Number of distinct transfers actually applied
    pub fn applied_count(&self) -> usize {
        self.applied_keys.len()
    }
}

#[async_trait]
impl LedgerClient for InMemoryLedger {
    async fn get_balance(&self, reference: &str) -> EngineResult<u64> {
        Ok(self.balance(reference))
    }

    async fn transfer(
        &self,
        from: &str,
        to: &str,
        amount: u64,
        idempotency_key: &str,
    ) -> EngineResult<()> {
        // Replay of an applied key: already happened, report success
        if self.applied_keys.contains_key(idempotency_key) {
            return Ok(());
        }

        if let Some(remaining) = self.failures.get(idempotency_key) {
            if remaining.load(Ordering::Relaxed) > 0 {
                remaining.fetch_sub(1, Ordering::Relaxed);
                return Err(EngineError::TransferFailed {
                    key: idempotency_key.to_string(),
                    detail: "injected transient failure".to_string(),
                });
            }
        }

        if amount == 0 {
            // Nothing to move, but the key is still consumed
            self.applied_keys.insert(idempotency_key.to_string(), ());
            return Ok(());
        }

        // Debit under the sender's entry lock so concurrent transfers from
        // the same address cannot overdraw
        {
            let mut from_balance = self.balances.entry(from.to_string()).or_insert(0);
            if *from_balance < amount {
                return Err(EngineError::InsufficientBalance {
                    available: *from_balance,
                    required: amount,
                });
            }
            *from_balance -= amount;
        }
        *self.balances.entry(to.to_string()).or_insert(0) += amount;

        self.applied_keys.insert(idempotency_key.to_string(), ());
        info!(from = %from, to = %to, amount, key = %idempotency_key, "Transfer applied");
        Ok(())
    }
}
