// ============================================================================
// TEST HELPERS — Shared utilities for integration tests
// ============================================================================

use std::sync::Arc;

use tokio::sync::mpsc;

use pumpdump::{
    AbuseCheck, EngineConfig, FairnessSecret, FraudGate, InMemoryLedger, RoundEngine, RoundEvent,
    RoundStore, ZeroWinnerPolicy,
};

/// Escrow float large enough that payouts never bounce in tests
pub const ESCROW_FLOAT: u64 = 1_000_000_000;

/// Tight timings so a full round completes in about two seconds
pub fn fast_config() -> EngineConfig {
    let mut cfg = EngineConfig::default();
    cfg.round_duration_s = 2;
    cfg.betting_phase_s = 1;
    cfg.reveal_phase_s = 1;
    cfg.round_pause_s = 1;
    cfg.min_bet = 1;
    cfg.max_bet = 10_000_000;
    cfg.deposit_timeout_s = 1;
    cfg.deposit_poll_interval_ms = 20;
    cfg.transfer_backoff_ms = 10;
    cfg.zero_winner_policy = ZeroWinnerPolicy::HouseTakesAll;
    cfg
}

pub struct TestRig {
    pub engine: Arc<RoundEngine>,
    pub ledger: Arc<InMemoryLedger>,
    pub store: RoundStore,
    pub events: mpsc::UnboundedReceiver<RoundEvent>,
    pub dir: tempfile::TempDir,
}

/// Engine wired to a fresh temp store and an in-memory ledger with a
/// pre-funded escrow
pub fn build_rig(cfg: EngineConfig) -> TestRig {
    let dir = tempfile::tempdir().unwrap();
    build_rig_at(cfg, dir)
}

/// Same, but reusing an existing data directory (restart scenarios)
pub fn build_rig_at(cfg: EngineConfig, dir: tempfile::TempDir) -> TestRig {
    build_rig_with_checks(cfg, dir, Vec::new())
}

/// Same, with additional abuse checks attached to the fraud gate
pub fn build_rig_with_checks(
    cfg: EngineConfig,
    dir: tempfile::TempDir,
    checks: Vec<Arc<dyn AbuseCheck>>,
) -> TestRig {
    let store = RoundStore::open(dir.path().to_str().unwrap()).unwrap();
    let ledger = Arc::new(InMemoryLedger::new());
    ledger.credit(&cfg.escrow_wallet, ESCROW_FLOAT);

    let mut fraud = FraudGate::new(&cfg, store.clone());
    for check in checks {
        fraud = fraud.with_check(check);
    }
    let engine = RoundEngine::new(
        cfg,
        FairnessSecret::new("integration-test-secret"),
        store.clone(),
        ledger.clone(),
        fraud,
    )
    .unwrap();

    let (tx, rx) = mpsc::unbounded_channel();
    engine.subscribe(Box::new(move |event| {
        let _ = tx.send(event.clone());
    }));

    TestRig {
        engine,
        ledger,
        store,
        events: rx,
        dir,
    }
}

impl TestRig {
    /// Block until the next event matching `pred` arrives
    pub async fn wait_for(&mut self, pred: impl Fn(&RoundEvent) -> bool) -> RoundEvent {
        loop {
            let event = tokio::time::timeout(std::time::Duration::from_secs(10), self.events.recv())
                .await
                .expect("timed out waiting for round event")
                .expect("event channel closed");
            if pred(&event) {
                return event;
            }
        }
    }

    pub async fn wait_for_open(&mut self) -> u64 {
        match self.wait_for(|e| matches!(e, RoundEvent::Opened { .. })).await {
            RoundEvent::Opened { round_id, .. } => round_id,
            _ => unreachable!(),
        }
    }

    pub async fn wait_for_settled(&mut self, round: u64) -> RoundEvent {
        self.wait_for(|e| matches!(e, RoundEvent::Settled { round_id, .. } if *round_id == round))
            .await
    }
}
