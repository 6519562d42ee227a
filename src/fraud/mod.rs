//! Fraud gate: admission checks run before a bet enters a round.
//!
//! A user with an active ban is rejected before anything else runs. For
//! everyone else, a fixed set of independent checks all run to completion
//! (no short-circuit) so every flag gets logged even when an earlier check
//! already disqualified the bet. One flag is logged and admitted; two or
//! more trigger a temporary ban and reject the current bet.
//!
//! Built-in checks (rapid betting, multi-account) run against the expiring
//! counter store in [`counters`]. Reputation-style checks (IP/VPN, bet
//! pattern abuse) are external collaborators plugged in as [`AbuseCheck`]
//! trait objects; they are fanned out on the runtime and joined before the
//! single admission decision.

pub mod counters;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tracing::{info, warn};

use crate::config::EngineConfig;
use crate::error::{EngineError, EngineResult};
use crate::storage::RoundStore;
use crate::types::{BanRecord, FraudSignal, Side};
use counters::{ExpiringCounters, ExpiringSets};

/// Device→user associations are remembered this long
const DEVICE_SET_TTL: Duration = Duration::from_secs(3600);

/// Everything the checks are allowed to see about a submission
#[derive(Debug, Clone)]
pub struct BetContext {
    pub user_id: String,
    pub device_id: Option<String>,
    pub ip: Option<String>,
    pub side: Side,
    pub amount: u64,
}

/// Pluggable external abuse check (IP/VPN reputation, bet-pattern abuse)
#[async_trait]
pub trait AbuseCheck: Send + Sync {
    fn name(&self) -> &'static str;
    async fn evaluate(&self, ctx: &BetContext) -> FraudSignal;
}

// ============================================================================
// FRAUD GATE
// ============================================================================

pub struct FraudGate {
    store: RoundStore,
    counters: ExpiringCounters,
    device_sets: ExpiringSets,
    plugins: Vec<Arc<dyn AbuseCheck>>,
    rapid_window: Duration,
    rapid_threshold: u32,
    multi_account_threshold: usize,
    ban_duration: chrono::Duration,
}

impl FraudGate {
    pub fn new(cfg: &EngineConfig, store: RoundStore) -> Self {
        Self {
            store,
            counters: ExpiringCounters::new(),
            device_sets: ExpiringSets::new(),
            plugins: Vec::new(),
            rapid_window: Duration::from_secs(cfg.rapid_bet_window_s),
            rapid_threshold: cfg.rapid_bet_threshold,
            multi_account_threshold: cfg.multi_account_threshold,
            ban_duration: cfg.ban_duration(),
        }
    }

    /// Attach an external check. All attached checks run on every admission.
    pub fn with_check(mut self, check: Arc<dyn AbuseCheck>) -> Self {
        self.plugins.push(check);
        self
    }

    /// Admit or reject one bet attempt.
    ///
    /// `Ok(())` admits; `Err(BannedUser)` rejects either because a previous
    /// ban is still active or because this attempt just earned one.
    pub async fn evaluate(&self, ctx: &BetContext) -> EngineResult<()> {
        let now = Utc::now();

        // Active ban rejects before any check runs (and before the rapid
        // counter ticks, so banned retries do not extend their own window).
        if let Some(ban) = self.store.active_ban(&ctx.user_id, now) {
            return Err(EngineError::BannedUser { reason: ban.reason });
        }

        let mut signals = vec![self.check_rapid_betting(ctx), self.check_multi_account(ctx)];

        // External checks fan out concurrently and all run to completion
        let mut handles = Vec::with_capacity(self.plugins.len());
        for plugin in &self.plugins {
            let plugin = plugin.clone();
            let ctx = ctx.clone();
            handles.push(tokio::spawn(async move { plugin.evaluate(&ctx).await }));
        }
        for handle in handles {
            match handle.await {
                Ok(signal) => signals.push(signal),
                Err(e) => warn!(user = %ctx.user_id, error = %e, "Abuse check task failed"),
            }
        }

        let flags: Vec<&FraudSignal> = signals.iter().filter(|s| s.flagged).collect();
        for flag in &flags {
            warn!(
                user = %ctx.user_id,
                check = %flag.check,
                reason = %flag.reason,
                "Fraud flag raised"
            );
        }

        if flags.len() >= 2 {
            let reason = flags
                .iter()
                .map(|f| f.check.as_str())
                .collect::<Vec<_>>()
                .join(", ");
            let reason = format!("multiple fraud flags: {}", reason);
            let ban = BanRecord {
                user_id: ctx.user_id.clone(),
                expires_at: now + self.ban_duration,
                reason: reason.clone(),
            };
            self.store.put_ban(&ban)?;
            warn!(user = %ctx.user_id, until = %ban.expires_at, "User temporarily banned");
            return Err(EngineError::BannedUser { reason });
        }

        info!(user = %ctx.user_id, checks = signals.len(), flags = flags.len(), "Bet admitted by fraud gate");
        Ok(())
    }

    fn check_rapid_betting(&self, ctx: &BetContext) -> FraudSignal {
        let key = format!("rapid:{}", ctx.user_id);
        let count = self.counters.increment(&key, self.rapid_window);
        if count > self.rapid_threshold {
            FraudSignal::flag(
                "rapid_betting",
                format!(
                    "{} bets in {}s window (limit {})",
                    count,
                    self.rapid_window.as_secs(),
                    self.rapid_threshold
                ),
            )
        } else {
            FraudSignal::clean("rapid_betting")
        }
    }

    fn check_multi_account(&self, ctx: &BetContext) -> FraudSignal {
        let Some(device_id) = &ctx.device_id else {
            return FraudSignal::clean("multi_account");
        };
        let key = format!("device:{}", device_id);
        let distinct = self
            .device_sets
            .add_member(&key, &ctx.user_id, DEVICE_SET_TTL);
        if distinct > self.multi_account_threshold {
            FraudSignal::flag(
                "multi_account",
                format!("{} users on device {}", distinct, device_id),
            )
        } else {
            FraudSignal::clean("multi_account")
        }
    }
}

// ============================================================================
// BUILT-IN PLUGIN STUBS
// ============================================================================

/// Always-clean stand-in for an IP/VPN reputation provider
pub struct NoopReputationCheck;

#[async_trait]
impl AbuseCheck for NoopReputationCheck {
    fn name(&self) -> &'static str {
        "ip_reputation"
    }

    async fn evaluate(&self, _ctx: &BetContext) -> FraudSignal {
        FraudSignal::clean(self.name())
    }
}

/// Fixed-verdict check, used to exercise the multi-flag ban policy
pub struct StaticCheck {
    pub check_name: &'static str,
    pub flagged: bool,
    pub reason: &'static str,
}

#[async_trait]
impl AbuseCheck for StaticCheck {
    fn name(&self) -> &'static str {
        self.check_name
    }

    async fn evaluate(&self, _ctx: &BetContext) -> FraudSignal {
        if self.flagged {
            FraudSignal::flag(self.check_name, self.reason)
        } else {
            FraudSignal::clean(self.check_name)
        }
    }
}
