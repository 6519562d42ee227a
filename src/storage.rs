//! Persistent round store.
//!
//! ReDB for durability (ACID, MVCC) with a DashMap cache in front for
//! lock-free hot reads. Writes go through a ReDB write transaction first
//! and only update the cache after a successful commit, so the cache never
//! gets ahead of disk. Read-your-writes within the process is what the
//! settlement resume path relies on: a crash between reveal and payout
//! finds the persisted winning side and the per-bet payout statuses and
//! skips everything already done.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use redb::{Database, ReadableTable, TableDefinition};
use tracing::info;

use crate::error::{EngineError, EngineResult};
use crate::types::{BanRecord, Bet, FundingStatus, Round, RoundPhase};

/// Rounds: round id → serialized Round
const ROUNDS: TableDefinition<u64, &[u8]> = TableDefinition::new("rounds");

/// Bets: bet id → serialized Bet
const BETS: TableDefinition<&str, &[u8]> = TableDefinition::new("bets");

/// Bans: user id → serialized BanRecord (latest ban wins)
const BANS: TableDefinition<&str, &[u8]> = TableDefinition::new("bans");

fn storage_err<E: std::fmt::Display>(e: E) -> EngineError {
    EngineError::Storage(e.to_string())
}

/// Durable store for rounds, bets and bans
#[derive(Clone)]
pub struct RoundStore {
    db: Arc<Database>,
    rounds: Arc<DashMap<u64, Round>>,
    bets: Arc<DashMap<String, Bet>>,
    /// deposit_reference → bet id, for idempotent submission lookups
    reference_index: Arc<DashMap<String, String>>,
    bans: Arc<DashMap<String, BanRecord>>,
}

impl RoundStore {
    /// Create or open the store at `path` and warm the caches from disk
    pub fn open(path: &str) -> EngineResult<Self> {
        std::fs::create_dir_all(path).map_err(storage_err)?;
        let db = Database::create(format!("{}/rounds.redb", path)).map_err(storage_err)?;

        let write_txn = db.begin_write().map_err(storage_err)?;
        {
            let _ = write_txn.open_table(ROUNDS).map_err(storage_err)?;
            let _ = write_txn.open_table(BETS).map_err(storage_err)?;
            let _ = write_txn.open_table(BANS).map_err(storage_err)?;
        }
        write_txn.commit().map_err(storage_err)?;

        let rounds = Arc::new(DashMap::new());
        let bets = Arc::new(DashMap::new());
        let reference_index = Arc::new(DashMap::new());
        let bans = Arc::new(DashMap::new());

        {
            let read_txn = db.begin_read().map_err(storage_err)?;

            let table = read_txn.open_table(ROUNDS).map_err(storage_err)?;
            let mut iter = table.iter().map_err(storage_err)?;
            while let Some(row) = iter.next() {
                let (key, value) = row.map_err(storage_err)?;
                let round: Round = serde_json::from_slice(value.value()).map_err(storage_err)?;
                rounds.insert(key.value(), round);
            }

            let table = read_txn.open_table(BETS).map_err(storage_err)?;
            let mut iter = table.iter().map_err(storage_err)?;
            while let Some(row) = iter.next() {
                let (key, value) = row.map_err(storage_err)?;
                let bet: Bet = serde_json::from_slice(value.value()).map_err(storage_err)?;
                reference_index.insert(bet.deposit_reference.clone(), bet.id.clone());
                bets.insert(key.value().to_string(), bet);
            }

            let table = read_txn.open_table(BANS).map_err(storage_err)?;
            let mut iter = table.iter().map_err(storage_err)?;
            while let Some(row) = iter.next() {
                let (key, value) = row.map_err(storage_err)?;
                let ban: BanRecord = serde_json::from_slice(value.value()).map_err(storage_err)?;
                bans.insert(key.value().to_string(), ban);
            }
        }

        info!(
            path = %path,
            rounds = rounds.len(),
            bets = bets.len(),
            "Round store opened"
        );

        Ok(Self {
            db: Arc::new(db),
            rounds,
            bets,
            reference_index,
            bans,
        })
    }

    // ========================================================================
    // ROUNDS
    // ========================================================================

    pub fn put_round(&self, round: &Round) -> EngineResult<()> {
        let encoded = serde_json::to_vec(round).map_err(storage_err)?;
        let write_txn = self.db.begin_write().map_err(storage_err)?;
        {
            let mut table = write_txn.open_table(ROUNDS).map_err(storage_err)?;
            table.insert(round.id, encoded.as_slice()).map_err(storage_err)?;
        }
        write_txn.commit().map_err(storage_err)?;
        self.rounds.insert(round.id, round.clone());
        Ok(())
    }

    pub fn get_round(&self, round_id: u64) -> Option<Round> {
        self.rounds.get(&round_id).map(|r| r.clone())
    }

    /// Highest round id seen, for resuming the counter after restart
    pub fn last_round_id(&self) -> u64 {
        self.rounds.iter().map(|r| *r.key()).max().unwrap_or(0)
    }

    /// Rounds a previous process left unfinished, oldest first
    pub fn incomplete_rounds(&self) -> Vec<u64> {
        let mut ids: Vec<u64> = self
            .rounds
            .iter()
            .filter(|r| r.phase < RoundPhase::Closed)
            .map(|r| *r.key())
            .collect();
        ids.sort_unstable();
        ids
    }

    /// Recently closed rounds, newest first
    pub fn recent_rounds(&self, limit: usize) -> Vec<Round> {
        let mut closed: Vec<Round> = self
            .rounds
            .iter()
            .filter(|r| r.phase >= RoundPhase::Settled)
            .map(|r| r.clone())
            .collect();
        closed.sort_by(|a, b| b.id.cmp(&a.id));
        closed.truncate(limit);
        closed
    }

    // ========================================================================
    // BETS
    // ========================================================================

    pub fn put_bet(&self, bet: &Bet) -> EngineResult<()> {
        let encoded = serde_json::to_vec(bet).map_err(storage_err)?;
        let write_txn = self.db.begin_write().map_err(storage_err)?;
        {
            let mut table = write_txn.open_table(BETS).map_err(storage_err)?;
            table.insert(bet.id.as_str(), encoded.as_slice()).map_err(storage_err)?;
        }
        write_txn.commit().map_err(storage_err)?;
        self.reference_index.insert(bet.deposit_reference.clone(), bet.id.clone());
        self.bets.insert(bet.id.clone(), bet.clone());
        Ok(())
    }

    pub fn get_bet(&self, bet_id: &str) -> Option<Bet> {
        self.bets.get(bet_id).map(|b| b.clone())
    }

    /// Persist a funding transition only while the bet is still
    /// `PendingDeposit`, and return the status after the call, so a caller
    /// that lost a race sees what it lost to. Check and write happen under
    /// the bet's cache entry lock; two racing transitions cannot both apply,
    /// which is what makes `Funded` and `Expired` terminal states.
    pub fn transition_funding(
        &self,
        bet_id: &str,
        to: FundingStatus,
    ) -> EngineResult<FundingStatus> {
        let mut entry = self
            .bets
            .get_mut(bet_id)
            .ok_or_else(|| EngineError::Storage(format!("unknown bet {}", bet_id)))?;
        if entry.funding != FundingStatus::PendingDeposit {
            return Ok(entry.funding);
        }

        let mut updated = (*entry).clone();
        updated.funding = to;
        let encoded = serde_json::to_vec(&updated).map_err(storage_err)?;
        let write_txn = self.db.begin_write().map_err(storage_err)?;
        {
            let mut table = write_txn.open_table(BETS).map_err(storage_err)?;
            table.insert(bet_id, encoded.as_slice()).map_err(storage_err)?;
        }
        write_txn.commit().map_err(storage_err)?;
        entry.funding = to;
        Ok(to)
    }

    /// Existing bet for a deposit reference, if the same submission was
    /// seen before (idempotent retry)
    pub fn bet_by_reference(&self, reference: &str) -> Option<Bet> {
        let bet_id = self.reference_index.get(reference)?.clone();
        self.get_bet(&bet_id)
    }

    pub fn bets_for_round(&self, round_id: u64) -> Vec<Bet> {
        self.bets
            .iter()
            .filter(|b| b.round_id == round_id)
            .map(|b| b.clone())
            .collect()
    }

    // ========================================================================
    // BANS
    // ========================================================================

    pub fn put_ban(&self, ban: &BanRecord) -> EngineResult<()> {
        let encoded = serde_json::to_vec(ban).map_err(storage_err)?;
        let write_txn = self.db.begin_write().map_err(storage_err)?;
        {
            let mut table = write_txn.open_table(BANS).map_err(storage_err)?;
            table
                .insert(ban.user_id.as_str(), encoded.as_slice())
                .map_err(storage_err)?;
        }
        write_txn.commit().map_err(storage_err)?;
        self.bans.insert(ban.user_id.clone(), ban.clone());
        Ok(())
    }

    /// Active ban for a user, if any. Expired records stay on disk but are
    /// filtered here.
    pub fn active_ban(&self, user_id: &str, now: DateTime<Utc>) -> Option<BanRecord> {
        self.bans
            .get(user_id)
            .filter(|b| b.is_active(now))
            .map(|b| b.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{FundingStatus, PayoutStatus, Side};
    use tempfile::tempdir;

    fn sample_round(id: u64) -> Round {
        Round {
            id,
            phase: RoundPhase::Open,
            opened_at: Utc::now(),
            locks_at: Utc::now(),
            reveals_at: Utc::now(),
            winning_side: None,
            total_pump: 0,
            total_dump: 0,
            participants: 0,
            fairness_commitment: "c".repeat(64),
            house_profit: 0,
        }
    }

    fn sample_bet(id: &str, round_id: u64) -> Bet {
        Bet {
            id: id.to_string(),
            user_id: "alice".to_string(),
            round_id,
            side: Side::Pump,
            amount: 100,
            deposit_reference: format!("dep_{}", id),
            funding: FundingStatus::PendingDeposit,
            payout: PayoutStatus::Unpaid,
            placed_at: Utc::now(),
        }
    }

    #[test]
    fn test_round_roundtrip_and_counter() {
        let dir = tempdir().unwrap();
        let store = RoundStore::open(dir.path().to_str().unwrap()).unwrap();

        assert_eq!(store.last_round_id(), 0);
        store.put_round(&sample_round(3)).unwrap();
        store.put_round(&sample_round(7)).unwrap();
        assert_eq!(store.last_round_id(), 7);
        assert_eq!(store.get_round(3).unwrap().id, 3);
    }

    #[test]
    fn test_reopen_reloads_state() {
        let dir = tempdir().unwrap();
        let path = dir.path().to_str().unwrap();
        {
            let store = RoundStore::open(path).unwrap();
            store.put_round(&sample_round(1)).unwrap();
            store.put_bet(&sample_bet("b1", 1)).unwrap();
        }
        let store = RoundStore::open(path).unwrap();
        assert_eq!(store.last_round_id(), 1);
        let bet = store.bet_by_reference("dep_b1").unwrap();
        assert_eq!(bet.id, "b1");
        assert_eq!(store.bets_for_round(1).len(), 1);
    }

    #[test]
    fn test_funding_transition_is_single_shot() {
        let dir = tempdir().unwrap();
        let path = dir.path().to_str().unwrap();
        let store = RoundStore::open(path).unwrap();

        store.put_bet(&sample_bet("b1", 1)).unwrap();
        assert_eq!(
            store.transition_funding("b1", FundingStatus::Expired).unwrap(),
            FundingStatus::Expired
        );
        // A late funding observation cannot resurrect the expired bet
        assert_eq!(
            store.transition_funding("b1", FundingStatus::Funded).unwrap(),
            FundingStatus::Expired
        );
        assert_eq!(store.get_bet("b1").unwrap().funding, FundingStatus::Expired);

        // And the reverse direction: a funded bet cannot be expired
        store.put_bet(&sample_bet("b2", 1)).unwrap();
        assert_eq!(
            store.transition_funding("b2", FundingStatus::Funded).unwrap(),
            FundingStatus::Funded
        );
        assert_eq!(
            store.transition_funding("b2", FundingStatus::Expired).unwrap(),
            FundingStatus::Funded
        );

        // The winning transition is the one on disk
        drop(store);
        let store = RoundStore::open(path).unwrap();
        assert_eq!(store.get_bet("b1").unwrap().funding, FundingStatus::Expired);
        assert_eq!(store.get_bet("b2").unwrap().funding, FundingStatus::Funded);
    }

    #[test]
    fn test_ban_expiry_filtered() {
        let dir = tempdir().unwrap();
        let store = RoundStore::open(dir.path().to_str().unwrap()).unwrap();

        let ban = BanRecord {
            user_id: "mallory".to_string(),
            expires_at: Utc::now() + chrono::Duration::hours(1),
            reason: "multiple fraud flags".to_string(),
        };
        store.put_ban(&ban).unwrap();

        assert!(store.active_ban("mallory", Utc::now()).is_some());
        assert!(store
            .active_ban("mallory", Utc::now() + chrono::Duration::hours(2))
            .is_none());
        assert!(store.active_ban("alice", Utc::now()).is_none());
    }

    #[test]
    fn test_recent_rounds_are_settled_newest_first() {
        let dir = tempdir().unwrap();
        let store = RoundStore::open(dir.path().to_str().unwrap()).unwrap();

        for id in 1..=5u64 {
            let mut round = sample_round(id);
            round.phase = if id <= 3 { RoundPhase::Closed } else { RoundPhase::Open };
            store.put_round(&round).unwrap();
        }
        let recent = store.recent_rounds(2);
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].id, 3);
        assert_eq!(recent[1].id, 2);
    }
}
