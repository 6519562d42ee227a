// ============================================================================
// PUMP/DUMP ROUND ENGINE
// ============================================================================
//
// Continuous binary betting rounds:
//   1. OPEN:    players back Pump or Dump, deposits confirm concurrently
//   2. LOCKED:  no new bets, late deposits get the reveal window to land
//   3. REVEAL:  sha256-seeded coin flip, commitment published at open
//   4. SETTLE:  house cut, pro-rata winner shares, exact conservation
//
// Storage: ReDB (ACID, MVCC) + DashMap cache
// Run:  FAIRNESS_SECRET=... ZERO_WINNER_POLICY=house_takes_all cargo run

use std::sync::Arc;

use tokio::signal;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use pumpdump::{
    EngineConfig, FairnessSecret, FraudGate, InMemoryLedger, NoopReputationCheck, RoundEngine,
    RoundEvent, RoundStore,
};

const ROUND_DATA_PATH: &str = "./round_data";

// ============================================================================
// GRACEFUL SHUTDOWN
// ============================================================================

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c().await.expect("Failed to install Ctrl+C handler");
    };
    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install signal handler")
            .recv()
            .await;
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    warn!("🛑 Shutdown signal received");
}

// ============================================================================
// MAIN
// ============================================================================

#[tokio::main]
async fn main() {
    dotenv::dotenv().ok();

    // 1. Logging
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,pumpdump=debug")))
        .with(tracing_subscriber::fmt::layer().with_target(true).with_level(true))
        .init();

    // 2. Configuration (fatal on bad values, money knobs are not guessed)
    let cfg = match EngineConfig::from_env() {
        Ok(cfg) => cfg,
        Err(e) => {
            error!("❌ FATAL: {}", e);
            std::process::exit(1);
        }
    };
    let secret = match FairnessSecret::from_env() {
        Ok(secret) => secret,
        Err(e) => {
            error!("❌ FATAL: {}", e);
            std::process::exit(1);
        }
    };

    info!("╔══════════════════════════════════════════════════════╗");
    info!("║             PUMP/DUMP ROUND ENGINE                   ║");
    info!("╠══════════════════════════════════════════════════════╣");
    info!("║  Phases:   {}s betting + {}s reveal                 ║", cfg.betting_phase_s, cfg.reveal_phase_s);
    info!("║  Edge:     {} bps                                  ║", cfg.house_edge_bps());
    info!("║  Storage:  ReDB + DashMap                            ║");
    info!("╚══════════════════════════════════════════════════════╝");

    // 3. Storage (ReDB)
    let store = match RoundStore::open(ROUND_DATA_PATH) {
        Ok(store) => {
            info!("✅ Round store initialized at {}", ROUND_DATA_PATH);
            store
        }
        Err(e) => {
            error!("❌ FATAL: storage init failed: {}", e);
            std::process::exit(1);
        }
    };

    // 4. Ledger. In-memory here; production swaps in a real client behind
    //    the same trait.
    let ledger = Arc::new(InMemoryLedger::new());

    // 5. Fraud gate + engine. The reputation slot ships as a no-op;
    //    deployments swap in a real provider through the same trait.
    let fraud = FraudGate::new(&cfg, store.clone()).with_check(Arc::new(NoopReputationCheck));
    let engine = match RoundEngine::new(cfg, secret, store, ledger, fraud) {
        Ok(engine) => engine,
        Err(e) => {
            error!("❌ FATAL: {}", e);
            std::process::exit(1);
        }
    };

    engine.subscribe(Box::new(|event| {
        if let RoundEvent::Settled {
            round_id,
            winning_side,
            total_pot,
            multiplier,
            winners,
            ..
        } = event
        {
            info!(
                round = round_id,
                winner = %winning_side,
                total_pot,
                multiplier = format!("{:.2}x", multiplier),
                winners,
                "🎰 Round complete"
            );
        }
    }));

    // 6. Run until shutdown
    let runner = engine.clone();
    let handle = tokio::spawn(async move { runner.run().await });

    shutdown_signal().await;
    engine.stop();
    let _ = handle.await;

    info!("✅ Engine shutdown complete");
}
