//! Run Command
//!
//! The main trading loop: paper by default, live only on explicit opt-in
//! with an abort window. Crash recovery comes from the durable store; the
//! engine reconciles all non-terminal orders before trading resumes.

use anyhow::{Context, Result};
use std::time::Duration;
use tokio::time::sleep;
use tracing::{info, warn};

use spot_trader::config::Config;
use spot_trader::engine::{EngineExit, TradingEngine};

pub fn run(config_path: String, live: bool, state_dir: Option<String>) -> Result<i32> {
    dotenv::dotenv().ok();

    let mut config = Config::from_file(&config_path)
        .with_context(|| format!("Failed to load config from {config_path}"))?;

    if live {
        config.trading.paper_trading_mode = false;
    }
    if let Some(dir) = state_dir {
        config.trading.state_dir = dir;
    }

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed to build tokio runtime")?;

    runtime.block_on(run_async(config))
}

async fn run_async(config: Config) -> Result<i32> {
    let mode_str = if config.trading.paper_trading_mode {
        "PAPER"
    } else {
        "LIVE"
    };

    info!("╔══════════════════════════════════════════════════════════════╗");
    info!("║            SPOT TRADER - {} MODE                          ║", mode_str);
    info!("╠══════════════════════════════════════════════════════════════╣");
    info!("║ Strategy: {:<50} ║", config.strategies.active);
    info!("║ Granularity: {:<47} ║", config.trading.granularity);
    info!("║ Max products: {:<46} ║", config.trading.max_products);
    info!("║ Cycle interval: {} seconds{:<35} ║", config.trading.loop_sleep_seconds, "");
    info!("╚══════════════════════════════════════════════════════════════╝");

    if !config.trading.paper_trading_mode {
        warn!("⚠️  ════════════════════════════════════════════════════════ ⚠️");
        warn!("⚠️  LIVE TRADING MODE - REAL MONEY AT RISK!                  ⚠️");
        warn!("⚠️  Press Ctrl+C within 10 seconds to abort...               ⚠️");
        warn!("⚠️  ════════════════════════════════════════════════════════ ⚠️");

        for i in (1..=10).rev() {
            info!("Starting in {} seconds...", i);
            sleep(Duration::from_secs(1)).await;
        }
    }

    let mut engine = TradingEngine::new(config).await?;

    match engine.run().await? {
        EngineExit::Clean => Ok(0),
        EngineExit::DrawdownHalt => {
            warn!("Session ended while drawdown-halted");
            Ok(2)
        }
    }
}
