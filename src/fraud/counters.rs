//! Expiring counter store backing the fraud checks.
//!
//! The rapid-betting check needs "increment and set expiry if newly
//! created" as ONE operation: a separate set-expiry call after the
//! increment can be lost on crash and leave a counter that never resets,
//! permanently flagging the user. DashMap's `entry()` holds the shard lock
//! across the whole read-modify-write, which gives exactly that atomic
//! compound primitive.

use std::collections::HashSet;
use std::time::{Duration, Instant};

use dashmap::DashMap;

struct CounterEntry {
    count: u32,
    expires_at: Instant,
}

/// Per-key rolling-window counters
#[derive(Default)]
pub struct ExpiringCounters {
    entries: DashMap<String, CounterEntry>,
}

impl ExpiringCounters {
    pub fn new() -> Self {
        Self::default()
    }

    /// Atomically increment `key` and return the new count. A fresh or
    /// expired entry restarts at 1 with a new window.
    pub fn increment(&self, key: &str, window: Duration) -> u32 {
        let now = Instant::now();
        let mut entry = self
            .entries
            .entry(key.to_string())
            .or_insert_with(|| CounterEntry {
                count: 0,
                expires_at: now + window,
            });
        if entry.expires_at <= now {
            entry.count = 0;
            entry.expires_at = now + window;
        }
        entry.count += 1;
        entry.count
    }

    /// Current count without incrementing (0 if absent or expired)
    pub fn get(&self, key: &str) -> u32 {
        match self.entries.get(key) {
            Some(entry) if entry.expires_at > Instant::now() => entry.count,
            _ => 0,
        }
    }
}

struct SetEntry {
    members: HashSet<String>,
    expires_at: Instant,
}

/// Per-key expiring membership sets (device id → user ids)
#[derive(Default)]
pub struct ExpiringSets {
    entries: DashMap<String, SetEntry>,
}

impl ExpiringSets {
    pub fn new() -> Self {
        Self::default()
    }

    /// Atomically add `member` under `key` and return the set size. An
    /// expired set restarts empty with a new TTL.
    pub fn add_member(&self, key: &str, member: &str, ttl: Duration) -> usize {
        let now = Instant::now();
        let mut entry = self.entries.entry(key.to_string()).or_insert_with(|| SetEntry {
            members: HashSet::new(),
            expires_at: now + ttl,
        });
        if entry.expires_at <= now {
            entry.members.clear();
            entry.expires_at = now + ttl;
        }
        entry.members.insert(member.to_string());
        entry.members.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_increment_counts_within_window() {
        let counters = ExpiringCounters::new();
        let window = Duration::from_secs(10);
        for expected in 1..=5 {
            assert_eq!(counters.increment("rapid:alice", window), expected);
        }
        assert_eq!(counters.get("rapid:alice"), 5);
        assert_eq!(counters.get("rapid:bob"), 0);
    }

    #[test]
    fn test_expired_window_resets() {
        let counters = ExpiringCounters::new();
        let window = Duration::from_millis(20);
        counters.increment("k", window);
        counters.increment("k", window);
        std::thread::sleep(Duration::from_millis(30));
        // Window elapsed: count restarts at 1
        assert_eq!(counters.increment("k", window), 1);
    }

    #[test]
    fn test_concurrent_increments_are_not_lost() {
        let counters = Arc::new(ExpiringCounters::new());
        let window = Duration::from_secs(60);
        let mut handles = Vec::new();
        for _ in 0..8 {
            let counters = counters.clone();
            handles.push(std::thread::spawn(move || {
                for _ in 0..100 {
                    counters.increment("hot", window);
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(counters.get("hot"), 800);
    }

    #[test]
    fn test_set_membership_dedupes() {
        let sets = ExpiringSets::new();
        let ttl = Duration::from_secs(60);
        assert_eq!(sets.add_member("device:d1", "alice", ttl), 1);
        assert_eq!(sets.add_member("device:d1", "alice", ttl), 1);
        assert_eq!(sets.add_member("device:d1", "bob", ttl), 2);
        assert_eq!(sets.add_member("device:d2", "carol", ttl), 1);
    }
}
