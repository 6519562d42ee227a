//! Seeded outcome determination.
//!
//! The winning side is a pure function of `(round_id, secret, minute
//! bucket)`: the three inputs are concatenated into a seed, SHA-256 hashed,
//! and the first 4 bytes normalized to [0, 1). Strictly above 0.5 is pump,
//! everything else is dump. Identical inputs always reproduce the identical
//! side, which is what makes a settled round auditable.
//!
//! The scheme is reproducible, not publicly verifiable: the secret is held
//! by the process, so an observer cannot recompute the result until the
//! secret is disclosed. The commitment hash recorded on each round at open
//! (see [`commitment`]) is the hardening hook for that: publish it before
//! betting opens, reveal the secret after settlement, and anyone can check
//! both that the secret matches the commitment and that it yields the
//! announced side.

use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};

use crate::config::FairnessSecret;
use crate::types::Side;

/// Integer minute bucket for a reveal timestamp.
///
/// Injected into [`determine`] separately so tests can pin it.
pub fn minute_bucket(at: DateTime<Utc>) -> i64 {
    at.timestamp() / 60
}

/// Compute the winning side for a round.
///
/// Seed layout: `round_id || secret || bucket`, each component in its ASCII
/// decimal / raw-byte form with `:` separators so adjacent fields cannot
/// collide across different splits.
pub fn determine(round_id: u64, secret: &FairnessSecret, bucket: i64) -> Side {
    let mut hasher = Sha256::new();
    hasher.update(round_id.to_string().as_bytes());
    hasher.update(b":");
    hasher.update(secret.expose());
    hasher.update(b":");
    hasher.update(bucket.to_string().as_bytes());
    let digest = hasher.finalize();

    let word = u32::from_be_bytes([digest[0], digest[1], digest[2], digest[3]]);
    let value = word as f64 / 4294967296.0; // 2^32, value in [0, 1)

    if value > 0.5 {
        Side::Pump
    } else {
        Side::Dump
    }
}

/// Hex sha256 of the fairness secret, recorded on the round at open.
pub fn commitment(secret: &FairnessSecret) -> String {
    let mut hasher = Sha256::new();
    hasher.update(secret.expose());
    hex::encode(hasher.finalize())
}
