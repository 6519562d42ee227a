//! Round lifecycle orchestration.
//!
//! One engine task drives the phase clock:
//! `Open → Locked → Revealed → Settled → Closed`, strictly sequential and
//! time-driven. The in-memory phase flag on the active round is the single
//! authoritative synchronization point for bet admission: it is read when a
//! submission starts AND again after its slot is allocated, so an admission
//! racing the lock is still rejected if the lock won.
//!
//! Reveal and settlement run exactly once per round under a per-round
//! tokio mutex; a crash-and-restart resumes from the persisted round state
//! (existing winning side is never recomputed, paid bets are never paid
//! again). The phase-timer task itself never does blocking I/O — funding
//! watches and transfer dispatch run on their own spawned tasks.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;

use chrono::Utc;
use dashmap::DashMap;
use parking_lot::RwLock;
use tokio::sync::Mutex as TokioMutex;
use tracing::{error, info, warn};

use crate::config::{EngineConfig, FairnessSecret};
use crate::deposit::{derive_reference, DepositAllocator};
use crate::error::{EngineError, EngineResult};
use crate::fraud::{BetContext, FraudGate};
use crate::ledger::LedgerClient;
use crate::outcome;
use crate::payout::PayoutDistributor;
use crate::pot::{compute_settlement, PotAccountant, RoundStats};
use crate::storage::RoundStore;
use crate::types::{Bet, FundingStatus, PayoutStatus, Round, RoundPhase, Side};

// ============================================================================
// EVENTS
// ============================================================================

/// Broadcast to subscribers as the round progresses. Presentation layers
/// (chart animation, notifications) attach here; nothing flows back in.
#[derive(Debug, Clone)]
pub enum RoundEvent {
    Opened {
        round_id: u64,
        locks_at: chrono::DateTime<Utc>,
    },
    BetFunded {
        round_id: u64,
        stats: RoundStats,
    },
    Locked {
        round_id: u64,
        stats: RoundStats,
    },
    Revealed {
        round_id: u64,
        winning_side: Side,
    },
    Settled {
        round_id: u64,
        winning_side: Side,
        total_pot: u64,
        house_cut: u64,
        multiplier: f64,
        winners: usize,
    },
}

pub type EventSubscriber = Box<dyn Fn(&RoundEvent) + Send + Sync>;

// ============================================================================
// ACTIVE ROUND
// ============================================================================

fn phase_to_u8(phase: RoundPhase) -> u8 {
    match phase {
        RoundPhase::Open => 0,
        RoundPhase::Locked => 1,
        RoundPhase::Revealed => 2,
        RoundPhase::Settled => 3,
        RoundPhase::Closed => 4,
    }
}

fn phase_from_u8(value: u8) -> RoundPhase {
    match value {
        0 => RoundPhase::Open,
        1 => RoundPhase::Locked,
        2 => RoundPhase::Revealed,
        3 => RoundPhase::Settled,
        _ => RoundPhase::Closed,
    }
}

/// Hot state for the round currently on the clock. The phase atomic here
/// is THE flag concurrent admissions synchronize on.
pub struct ActiveRound {
    pub round_id: u64,
    phase: AtomicU8,
    pub pot: PotAccountant,
    pub locks_at: chrono::DateTime<Utc>,
}

impl ActiveRound {
    fn new(round_id: u64, locks_at: chrono::DateTime<Utc>) -> Self {
        Self {
            round_id,
            phase: AtomicU8::new(phase_to_u8(RoundPhase::Open)),
            pot: PotAccountant::new(),
            locks_at,
        }
    }

    pub fn phase(&self) -> RoundPhase {
        phase_from_u8(self.phase.load(Ordering::SeqCst))
    }

    fn set_phase(&self, phase: RoundPhase) {
        self.phase.store(phase_to_u8(phase), Ordering::SeqCst);
    }
}

/// Point-in-time view of the active round
#[derive(Debug, Clone)]
pub struct CurrentRoundInfo {
    pub round_id: u64,
    pub phase: RoundPhase,
    /// Seconds until betting locks (0 outside the open phase)
    pub seconds_remaining: u64,
    pub stats: RoundStats,
}

// ============================================================================
// ROUND ENGINE
// ============================================================================

pub struct RoundEngine {
    cfg: EngineConfig,
    secret: FairnessSecret,
    store: RoundStore,
    fraud: FraudGate,
    allocator: Arc<DepositAllocator>,
    distributor: PayoutDistributor,

    current: RwLock<Option<Arc<ActiveRound>>>,
    round_counter: AtomicU64,
    /// Exactly-once guard for reveal + settlement per round
    settlement_locks: DashMap<u64, Arc<TokioMutex<()>>>,
    /// Bet ids that already have a funding watch task
    watched: DashMap<String, ()>,
    subscribers: RwLock<Vec<EventSubscriber>>,
    running: AtomicBool,
}

impl RoundEngine {
    pub fn new(
        cfg: EngineConfig,
        secret: FairnessSecret,
        store: RoundStore,
        ledger: Arc<dyn LedgerClient>,
        fraud: FraudGate,
    ) -> EngineResult<Arc<Self>> {
        cfg.validate()?;

        let allocator = Arc::new(DepositAllocator::new(
            store.clone(),
            ledger.clone(),
            cfg.ledger_concurrency,
            std::time::Duration::from_millis(cfg.deposit_poll_interval_ms),
            cfg.deposit_timeout(),
        ));
        let distributor = PayoutDistributor::new(
            store.clone(),
            ledger,
            cfg.house_wallet.clone(),
            cfg.escrow_wallet.clone(),
            cfg.transfer_max_retries,
            std::time::Duration::from_millis(cfg.transfer_backoff_ms),
        );

        // Resume numbering where the store left off
        let round_counter = AtomicU64::new(store.last_round_id());

        Ok(Arc::new(Self {
            cfg,
            secret,
            store,
            fraud,
            allocator,
            distributor,
            current: RwLock::new(None),
            round_counter,
            settlement_locks: DashMap::new(),
            watched: DashMap::new(),
            subscribers: RwLock::new(Vec::new()),
            running: AtomicBool::new(false),
        }))
    }

    /// Attach a round-event subscriber
    pub fn subscribe(&self, subscriber: EventSubscriber) {
        self.subscribers.write().push(subscriber);
    }

    fn emit(&self, event: RoundEvent) {
        for subscriber in self.subscribers.read().iter() {
            subscriber(&event);
        }
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    // ========================================================================
    // GAME LOOP
    // ========================================================================

    /// Drive rounds back to back until [`stop`](Self::stop) is called.
    /// Finishes any rounds a previous process left behind first.
    pub async fn run(self: Arc<Self>) {
        self.running.store(true, Ordering::SeqCst);
        info!("Round engine starting");

        if let Err(e) = self.resume_incomplete().await {
            error!(error = %e, "Resume of incomplete rounds failed");
        }

        while self.running.load(Ordering::SeqCst) {
            if let Err(e) = self.run_round().await {
                error!(error = %e, "Round failed");
                tokio::time::sleep(self.cfg.round_pause()).await;
            }
            tokio::time::sleep(self.cfg.round_pause()).await;
        }
        info!("Round engine stopped");
    }

    /// Settle whatever the store says is unfinished (idempotent)
    pub async fn resume_incomplete(&self) -> EngineResult<()> {
        for round_id in self.store.incomplete_rounds() {
            warn!(round = round_id, "Resuming incomplete round");
            self.settle_round(round_id).await?;
        }
        Ok(())
    }

    /// One full round: open, lock, reveal, settle, close.
    pub async fn run_round(self: &Arc<Self>) -> EngineResult<()> {
        let round_id = self.round_counter.fetch_add(1, Ordering::SeqCst) + 1;
        let now = Utc::now();
        let locks_at = now + chrono::Duration::seconds(self.cfg.betting_phase_s as i64);
        let reveals_at = locks_at + chrono::Duration::seconds(self.cfg.reveal_phase_s as i64);

        let round = Round {
            id: round_id,
            phase: RoundPhase::Open,
            opened_at: now,
            locks_at,
            reveals_at,
            winning_side: None,
            total_pump: 0,
            total_dump: 0,
            participants: 0,
            fairness_commitment: outcome::commitment(&self.secret),
            house_profit: 0,
        };
        self.store.put_round(&round)?;

        let active = Arc::new(ActiveRound::new(round_id, locks_at));
        *self.current.write() = Some(active.clone());
        info!(round = round_id, betting_s = self.cfg.betting_phase_s, "Round opened");
        self.emit(RoundEvent::Opened { round_id, locks_at });

        tokio::time::sleep(self.cfg.betting_phase()).await;

        // The single global synchronization point: once this store hits,
        // every in-flight admission's completion check sees Locked.
        active.set_phase(RoundPhase::Locked);
        let stats = active.pot.stats();
        let mut locked = self
            .store
            .get_round(round_id)
            .ok_or_else(|| EngineError::Storage(format!("round {} vanished", round_id)))?;
        locked.phase = RoundPhase::Locked;
        locked.total_pump = stats.pump_pot;
        locked.total_dump = stats.dump_pot;
        locked.participants = stats.participants;
        self.store.put_round(&locked)?;
        info!(
            round = round_id,
            total_pot = stats.total_pot,
            pump = stats.pump_pot,
            dump = stats.dump_pot,
            players = stats.participants,
            "Betting locked"
        );
        self.emit(RoundEvent::Locked { round_id, stats });

        // Reveal window: deposits still confirming get this long to land
        tokio::time::sleep(self.cfg.reveal_phase()).await;

        let result = self.settle_round(round_id).await;
        *self.current.write() = None;
        result
    }

    // ========================================================================
    // BET ADMISSION
    // ========================================================================

    /// Submit a bet into the currently open round.
    ///
    /// Idempotent per `(user, round, side, nonce)`. Runs the fraud gate,
    /// allocates the deposit slot, re-checks the phase flag (the admission
    /// completion check), then spawns the funding watch.
    pub async fn place_bet(
        self: &Arc<Self>,
        user_id: &str,
        device_id: Option<String>,
        ip: Option<String>,
        side: Side,
        amount: u64,
        nonce: u64,
    ) -> EngineResult<Bet> {
        // Admission start: authoritative phase read
        let active = self
            .current
            .read()
            .clone()
            .ok_or(EngineError::NoActiveRound)?;
        if active.phase() != RoundPhase::Open {
            return Err(EngineError::RoundClosedForBetting {
                round_id: active.round_id,
            });
        }
        let round_id = active.round_id;

        if amount < self.cfg.min_bet || amount > self.cfg.max_bet {
            return Err(EngineError::BetOutOfRange {
                amount,
                min: self.cfg.min_bet,
                max: self.cfg.max_bet,
            });
        }

        // Retried submission: the slot already exists and was admitted when
        // it was created; return it without re-running the gate (so retries
        // do not inflate the rapid-betting counter).
        let reference = derive_reference(user_id, round_id, side, nonce);
        if let Some(existing) = self.store.bet_by_reference(&reference) {
            if existing.funding == FundingStatus::PendingDeposit {
                self.spawn_funding_watch(&active, &existing);
            }
            return Ok(existing);
        }

        let ctx = BetContext {
            user_id: user_id.to_string(),
            device_id,
            ip,
            side,
            amount,
        };
        self.fraud.evaluate(&ctx).await?;

        let bet = self.allocator.submit(user_id, round_id, side, amount, nonce)?;

        // Admission completion: if the lock won the race, the slot must not
        // stand. Expire it so it can never fund or pay.
        if active.phase() != RoundPhase::Open {
            self.store
                .transition_funding(&bet.id, FundingStatus::Expired)?;
            warn!(bet = %bet.id, round = round_id, "Admission lost the race with lock, rejected");
            return Err(EngineError::RoundClosedForBetting { round_id });
        }

        self.spawn_funding_watch(&active, &bet);
        Ok(bet)
    }

    fn spawn_funding_watch(self: &Arc<Self>, active: &Arc<ActiveRound>, bet: &Bet) {
        // One watch per bet, ever
        if self.watched.insert(bet.id.clone(), ()).is_some() {
            return;
        }
        let engine = self.clone();
        let active = active.clone();
        let bet_id = bet.id.clone();
        let side = bet.side;
        let amount = bet.amount;
        tokio::spawn(async move {
            match engine.allocator.await_funding(&bet_id).await {
                Ok(FundingStatus::Funded) => {
                    // Funding during Open or Locked counts toward the pot;
                    // reveal-time expiry means we can't get here later.
                    if active.phase() <= RoundPhase::Locked {
                        active.pot.record_funded(side, amount);
                        engine.emit(RoundEvent::BetFunded {
                            round_id: active.round_id,
                            stats: active.pot.stats(),
                        });
                    }
                }
                Ok(_) => {}
                Err(EngineError::DepositTimeout { .. }) => {
                    // Already logged and persisted by the allocator
                }
                Err(e) => warn!(bet = %bet_id, error = %e, "Funding watch failed"),
            }
        });
    }

    // ========================================================================
    // REVEAL + SETTLEMENT (exactly once, resumable)
    // ========================================================================

    /// Reveal the outcome and distribute the pot for `round_id`.
    ///
    /// Guarded by a per-round lock so concurrent observers of the same
    /// phase transition cannot double-settle. Safe to call again after a
    /// crash: a persisted winning side is reused, paid bets are skipped.
    pub async fn settle_round(&self, round_id: u64) -> EngineResult<()> {
        let lock = self
            .settlement_locks
            .entry(round_id)
            .or_insert_with(|| Arc::new(TokioMutex::new(())))
            .clone();
        let _guard = lock.lock().await;

        let mut round = self
            .store
            .get_round(round_id)
            .ok_or_else(|| EngineError::Storage(format!("unknown round {}", round_id)))?;
        if round.phase >= RoundPhase::Closed {
            return Ok(());
        }

        // Reveal exactly once: an already-persisted outcome is frozen.
        let winning_side = match round.winning_side {
            Some(side) => side,
            None => {
                // No late funding after this point
                self.allocator.expire_pending(round_id)?;

                let bucket = outcome::minute_bucket(Utc::now());
                let side = outcome::determine(round_id, &self.secret, bucket);

                // Authoritative totals come from the persisted funded bets,
                // not the in-memory accountant (which a restart loses)
                let bets = self.store.bets_for_round(round_id);
                let funded = bets.iter().filter(|b| b.funding == FundingStatus::Funded);
                let (mut pump, mut dump, mut players) = (0u64, 0u64, 0u32);
                for bet in funded {
                    match bet.side {
                        Side::Pump => pump += bet.amount,
                        Side::Dump => dump += bet.amount,
                    }
                    players += 1;
                }

                round.winning_side = Some(side);
                round.phase = RoundPhase::Revealed;
                round.total_pump = pump;
                round.total_dump = dump;
                round.participants = players;
                self.store.put_round(&round)?;
                info!(round = round_id, winner = %side, pump, dump, "Outcome revealed");
                self.emit(RoundEvent::Revealed {
                    round_id,
                    winning_side: side,
                });
                side
            }
        };

        if let Some(current) = self.current.read().clone() {
            if current.round_id == round_id {
                current.set_phase(RoundPhase::Revealed);
            }
        }

        let bets = self.store.bets_for_round(round_id);
        let plan = compute_settlement(
            winning_side,
            &bets,
            self.cfg.house_edge_bps(),
            self.cfg.zero_winner_policy,
        );
        let report = self.distributor.distribute(round_id, &plan).await?;

        round.phase = RoundPhase::Settled;
        round.house_profit = plan.house_cut;
        self.store.put_round(&round)?;
        self.emit(RoundEvent::Settled {
            round_id,
            winning_side,
            total_pot: plan.total_pot,
            house_cut: plan.house_cut,
            multiplier: plan.multiplier(),
            winners: plan.payouts.len(),
        });

        // Close only when no money is stranded; otherwise stay Settled so
        // reconciliation can find the round.
        let unresolved = self
            .store
            .bets_for_round(round_id)
            .iter()
            .any(|b| b.payout == PayoutStatus::PayoutFailed)
            || !report.house_paid;
        if unresolved {
            warn!(
                round = round_id,
                failed = report.failed.len(),
                house_paid = report.house_paid,
                "Round settled with unresolved payouts, awaiting reconciliation"
            );
        } else {
            round.phase = RoundPhase::Closed;
            self.store.put_round(&round)?;
        }

        info!(
            round = round_id,
            winner = %winning_side,
            total_pot = plan.total_pot,
            house_cut = plan.house_cut,
            multiplier = plan.multiplier(),
            winners = plan.payouts.len(),
            "Round settled"
        );
        Ok(())
    }

    // ========================================================================
    // QUERIES
    // ========================================================================

    /// Snapshot of the round currently on the clock
    pub fn current_round_info(&self) -> Option<CurrentRoundInfo> {
        let active = self.current.read().clone()?;
        let phase = active.phase();
        let seconds_remaining = if phase == RoundPhase::Open {
            (active.locks_at - Utc::now()).num_seconds().max(0) as u64
        } else {
            0
        };
        Some(CurrentRoundInfo {
            round_id: active.round_id,
            phase,
            seconds_remaining,
            stats: active.pot.stats(),
        })
    }

    /// Recently settled rounds, newest first
    pub fn recent_rounds(&self, limit: usize) -> Vec<Round> {
        self.store.recent_rounds(limit)
    }
}
