//! Fraud gate behavior through the public betting API
//!
//! Thresholds are tightened so a handful of submissions is enough to
//! trip the rapid-betting and multi-account checks. Nonces differ per
//! submission so each one is a genuinely new slot and actually passes
//! through the gate (idempotent retries of the same slot bypass it).

mod test_helpers;

use pumpdump::{EngineError, Side};
use test_helpers::{build_rig, fast_config};

#[tokio::test]
async fn test_two_flags_ban_and_reject() {
    let mut cfg = fast_config();
    cfg.rapid_bet_threshold = 1;
    cfg.multi_account_threshold = 1;
    let mut rig = build_rig(cfg);
    let runner = rig.engine.clone();
    let handle = tokio::spawn(async move { runner.run().await });
    rig.wait_for_open().await;

    let device = Some("device-1".to_string());

    // First account on the device: clean
    rig.engine
        .place_bet("a1", device.clone(), None, Side::Pump, 10_000, 1)
        .await
        .unwrap();

    // Second account, first bet: only the multi-account flag, admitted
    rig.engine
        .place_bet("a2", device.clone(), None, Side::Dump, 10_000, 1)
        .await
        .unwrap();

    // Second account, second bet inside the window: rapid flag joins the
    // multi-account flag, two flags ban on the spot
    let err = rig
        .engine
        .place_bet("a2", device.clone(), None, Side::Dump, 10_000, 2)
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::BannedUser { .. }));

    // Banned: rejected before any check runs
    let err = rig
        .engine
        .place_bet("a2", None, None, Side::Pump, 10_000, 3)
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::BannedUser { .. }));

    // Other players are unaffected
    rig.engine
        .place_bet("bystander", None, None, Side::Pump, 10_000, 1)
        .await
        .unwrap();

    rig.engine.stop();
    handle.abort();
}

#[tokio::test]
async fn test_ban_survives_restart_via_store() {
    let mut cfg = fast_config();
    cfg.rapid_bet_threshold = 1;
    cfg.multi_account_threshold = 1;
    let mut rig = build_rig(cfg);
    let runner = rig.engine.clone();
    let handle = tokio::spawn(async move { runner.run().await });
    rig.wait_for_open().await;

    let device = Some("device-9".to_string());
    rig.engine
        .place_bet("m1", device.clone(), None, Side::Pump, 10_000, 1)
        .await
        .unwrap();
    rig.engine
        .place_bet("m2", device.clone(), None, Side::Pump, 10_000, 1)
        .await
        .unwrap();
    let err = rig
        .engine
        .place_bet("m2", device.clone(), None, Side::Pump, 10_000, 2)
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::BannedUser { .. }));

    rig.engine.stop();
    handle.abort();

    // The ban record is in the store, not just in a process-local cache
    let ban = rig
        .store
        .active_ban("m2", chrono::Utc::now())
        .expect("ban should be persisted");
    assert!(ban.expires_at > chrono::Utc::now());
}

#[tokio::test]
async fn test_single_flag_admits() {
    let mut cfg = fast_config();
    cfg.rapid_bet_threshold = 1;
    let mut rig = build_rig(cfg);
    let runner = rig.engine.clone();
    let handle = tokio::spawn(async move { runner.run().await });
    rig.wait_for_open().await;

    // Rapid flag alone (no shared device, no reputation check) never bans
    for nonce in 1..=4u64 {
        rig.engine
            .place_bet("solo", None, None, Side::Pump, 10_000, nonce)
            .await
            .unwrap();
    }

    rig.engine.stop();
    handle.abort();
}
