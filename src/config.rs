//! Engine configuration, loaded from environment variables.
//!
//! Every knob has a sane default except the fairness secret and the zero
//! winner policy: the former must always be provided, the latter must be an
//! explicit operator choice when loaded from the environment. Validation
//! failures are fatal at startup, the engine refuses to run on a bad house
//! edge or threshold.

use std::env;
use std::time::Duration;

use crate::error::{EngineError, EngineResult};
use crate::types::MINOR_UNITS_PER_COIN;

// ============================================================================
// FAIRNESS SECRET
// ============================================================================

/// Process-wide fairness secret. Rotated only between rounds, never logged.
#[derive(Clone)]
pub struct FairnessSecret(String);

impl FairnessSecret {
    pub fn new(secret: impl Into<String>) -> Self {
        Self(secret.into())
    }

    pub fn from_env() -> EngineResult<Self> {
        let secret = env::var("FAIRNESS_SECRET")
            .map_err(|_| EngineError::Configuration("FAIRNESS_SECRET is not set".to_string()))?;
        if secret.is_empty() {
            return Err(EngineError::Configuration("FAIRNESS_SECRET is empty".to_string()));
        }
        Ok(Self(secret))
    }

    /// Raw secret bytes for seed construction. Callers must not log them.
    pub(crate) fn expose(&self) -> &[u8] {
        self.0.as_bytes()
    }
}

// Redacted: the secret must never reach logs, even via {:?}
impl std::fmt::Debug for FairnessSecret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("FairnessSecret(<redacted>)")
    }
}

// ============================================================================
// ZERO WINNER POLICY
// ============================================================================

/// What happens when nobody bet on the winning side
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ZeroWinnerPolicy {
    /// House keeps the entire pot
    HouseTakesAll,
    /// Every funded bet is refunded its stake
    RefundAll,
}

impl ZeroWinnerPolicy {
    fn parse(value: &str) -> EngineResult<Self> {
        match value {
            "house_takes_all" => Ok(ZeroWinnerPolicy::HouseTakesAll),
            "refund_all" => Ok(ZeroWinnerPolicy::RefundAll),
            other => Err(EngineError::Configuration(format!(
                "ZERO_WINNER_POLICY must be house_takes_all or refund_all, got '{}'",
                other
            ))),
        }
    }
}

// ============================================================================
// ENGINE CONFIG
// ============================================================================

/// All recognized engine options
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Total round length. Must equal betting phase plus reveal phase.
    pub round_duration_s: u64,
    /// Betting phase length (round is accepting bets)
    pub betting_phase_s: u64,
    /// Locked/reveal wait before the outcome is computed
    pub reveal_phase_s: u64,
    /// Pause between rounds before the next one opens
    pub round_pause_s: u64,

    /// Fraction of the total pot retained by the house, in [0, 1)
    pub house_edge: f64,
    pub zero_winner_policy: ZeroWinnerPolicy,

    /// Bet size limits, minor units
    pub min_bet: u64,
    pub max_bet: u64,

    /// Rapid-betting check
    pub rapid_bet_window_s: u64,
    pub rapid_bet_threshold: u32,
    /// Multi-account check: distinct users per device before flagging
    pub multi_account_threshold: usize,
    pub ban_duration_s: u64,

    /// Deposit funding observation
    pub deposit_timeout_s: u64,
    pub deposit_poll_interval_ms: u64,
    /// Max concurrent ledger polls / transfers
    pub ledger_concurrency: usize,

    /// Outbound transfer retry policy
    pub transfer_max_retries: u32,
    pub transfer_backoff_ms: u64,

    /// House wallet receiving the cut
    pub house_wallet: String,
    /// Escrow wallet payouts are drawn from
    pub escrow_wallet: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            round_duration_s: 60,
            betting_phase_s: 30,
            reveal_phase_s: 30,
            round_pause_s: 3,
            house_edge: 0.05,
            zero_winner_policy: ZeroWinnerPolicy::HouseTakesAll,
            min_bet: MINOR_UNITS_PER_COIN / 100, // 0.01
            max_bet: MINOR_UNITS_PER_COIN * 10,  // 10.0
            rapid_bet_window_s: 10,
            rapid_bet_threshold: 5,
            multi_account_threshold: 3,
            ban_duration_s: 3600,
            deposit_timeout_s: 25,
            deposit_poll_interval_ms: 500,
            ledger_concurrency: 16,
            transfer_max_retries: 3,
            transfer_backoff_ms: 250,
            house_wallet: "house".to_string(),
            escrow_wallet: "escrow".to_string(),
        }
    }
}

impl EngineConfig {
    /// Load configuration from the environment (after `dotenv().ok()`).
    ///
    /// `ZERO_WINNER_POLICY` is required: the zero-winner outcome is a money
    /// decision and must not be silently defaulted in deployment.
    pub fn from_env() -> EngineResult<Self> {
        let defaults = Self::default();

        let policy = env::var("ZERO_WINNER_POLICY")
            .map_err(|_| EngineError::Configuration("ZERO_WINNER_POLICY is not set".to_string()))
            .and_then(|v| ZeroWinnerPolicy::parse(&v))?;

        let cfg = Self {
            round_duration_s: parse_env("ROUND_DURATION_S", defaults.round_duration_s)?,
            betting_phase_s: parse_env("BETTING_PHASE_S", defaults.betting_phase_s)?,
            reveal_phase_s: parse_env("REVEAL_PHASE_S", defaults.reveal_phase_s)?,
            round_pause_s: parse_env("ROUND_PAUSE_S", defaults.round_pause_s)?,
            house_edge: parse_env("HOUSE_EDGE", defaults.house_edge)?,
            zero_winner_policy: policy,
            min_bet: parse_env("MIN_BET_UNITS", defaults.min_bet)?,
            max_bet: parse_env("MAX_BET_UNITS", defaults.max_bet)?,
            rapid_bet_window_s: parse_env("RAPID_BET_WINDOW_S", defaults.rapid_bet_window_s)?,
            rapid_bet_threshold: parse_env("RAPID_BET_THRESHOLD", defaults.rapid_bet_threshold)?,
            multi_account_threshold: parse_env("MULTI_ACCOUNT_THRESHOLD", defaults.multi_account_threshold)?,
            ban_duration_s: parse_env("BAN_DURATION_S", defaults.ban_duration_s)?,
            deposit_timeout_s: parse_env("DEPOSIT_TIMEOUT_S", defaults.deposit_timeout_s)?,
            deposit_poll_interval_ms: parse_env("DEPOSIT_POLL_INTERVAL_MS", defaults.deposit_poll_interval_ms)?,
            ledger_concurrency: parse_env("LEDGER_CONCURRENCY", defaults.ledger_concurrency)?,
            transfer_max_retries: parse_env("TRANSFER_MAX_RETRIES", defaults.transfer_max_retries)?,
            transfer_backoff_ms: parse_env("TRANSFER_BACKOFF_MS", defaults.transfer_backoff_ms)?,
            house_wallet: env::var("HOUSE_WALLET").unwrap_or(defaults.house_wallet),
            escrow_wallet: env::var("ESCROW_WALLET").unwrap_or(defaults.escrow_wallet),
        };

        cfg.validate()?;
        Ok(cfg)
    }

    /// Reject configurations the engine must not run with.
    pub fn validate(&self) -> EngineResult<()> {
        if !(0.0..1.0).contains(&self.house_edge) || !self.house_edge.is_finite() {
            return Err(EngineError::Configuration(format!(
                "house_edge must be in [0, 1), got {}",
                self.house_edge
            )));
        }
        if self.min_bet == 0 || self.min_bet > self.max_bet {
            return Err(EngineError::Configuration(format!(
                "bet range invalid: min {} max {}",
                self.min_bet, self.max_bet
            )));
        }
        if self.rapid_bet_threshold == 0 || self.multi_account_threshold == 0 {
            return Err(EngineError::Configuration(
                "fraud thresholds must be positive".to_string(),
            ));
        }
        if self.betting_phase_s == 0 || self.reveal_phase_s == 0 {
            return Err(EngineError::Configuration(
                "phase durations must be positive".to_string(),
            ));
        }
        if self.betting_phase_s + self.reveal_phase_s != self.round_duration_s {
            return Err(EngineError::Configuration(format!(
                "round_duration_s {} does not match betting {} + reveal {}",
                self.round_duration_s, self.betting_phase_s, self.reveal_phase_s
            )));
        }
        if self.ledger_concurrency == 0 {
            return Err(EngineError::Configuration(
                "ledger_concurrency must be positive".to_string(),
            ));
        }
        Ok(())
    }

    /// House edge in basis points, the form settlement math actually uses
    pub fn house_edge_bps(&self) -> u64 {
        (self.house_edge * 10_000.0).round() as u64
    }

    pub fn betting_phase(&self) -> Duration {
        Duration::from_secs(self.betting_phase_s)
    }

    pub fn reveal_phase(&self) -> Duration {
        Duration::from_secs(self.reveal_phase_s)
    }

    pub fn round_pause(&self) -> Duration {
        Duration::from_secs(self.round_pause_s)
    }

    pub fn deposit_timeout(&self) -> Duration {
        Duration::from_secs(self.deposit_timeout_s)
    }

    pub fn ban_duration(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.ban_duration_s as i64)
    }
}

fn parse_env<T: std::str::FromStr>(key: &str, default: T) -> EngineResult<T> {
    match env::var(key) {
        Ok(raw) => raw.parse::<T>().map_err(|_| {
            EngineError::Configuration(format!("{} has invalid value '{}'", key, raw))
        }),
        Err(_) => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        assert!(EngineConfig::default().validate().is_ok());
    }

    #[test]
    fn test_house_edge_range() {
        let mut cfg = EngineConfig::default();
        cfg.house_edge = 1.0;
        assert!(cfg.validate().is_err());
        cfg.house_edge = -0.01;
        assert!(cfg.validate().is_err());
        cfg.house_edge = 0.0;
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_round_duration_must_match_phases() {
        let mut cfg = EngineConfig::default();
        cfg.round_duration_s = 45;
        assert!(cfg.validate().is_err());
        cfg.betting_phase_s = 20;
        cfg.reveal_phase_s = 25;
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_edge_bps() {
        let cfg = EngineConfig::default();
        assert_eq!(cfg.house_edge_bps(), 500);
    }

    #[test]
    fn test_secret_debug_redacted() {
        let secret = FairnessSecret::new("hunter2");
        assert_eq!(format!("{:?}", secret), "FairnessSecret(<redacted>)");
    }

    #[test]
    fn test_zero_winner_policy_parse() {
        assert_eq!(
            ZeroWinnerPolicy::parse("refund_all").unwrap(),
            ZeroWinnerPolicy::RefundAll
        );
        assert!(ZeroWinnerPolicy::parse("keep_it").is_err());
    }
}
