//! Scan Command
//!
//! One-shot strategy evaluation over the full tradable universe, printed
//! as a ranked list. Useful for eyeballing what the configured strategy
//! would do right now without starting the loop.

use std::sync::Arc;

use anyhow::{Context, Result};
use itertools::Itertools;
use tokio::sync::Semaphore;
use tracing::{info, warn};

use spot_trader::config::Config;
use spot_trader::gateway::{Credentials, ExchangeGateway};
use spot_trader::indicators::enrich;
use spot_trader::strategies::create_strategy;
use spot_trader::types::{Money, Signal, SignalAction};

pub fn run(config_path: String, top: usize) -> Result<()> {
    dotenv::dotenv().ok();

    let config = Config::from_file(&config_path)
        .with_context(|| format!("Failed to load config from {config_path}"))?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed to build tokio runtime")?;

    runtime.block_on(scan_async(config, top))
}

async fn scan_async(config: Config, top: usize) -> Result<()> {
    let credentials = Credentials::new(
        config.exchange.api_key.clone().unwrap_or_default(),
        config.exchange.api_secret.clone().unwrap_or_default(),
    );
    let gateway = Arc::new(ExchangeGateway::new(credentials, &config));
    let strategy = create_strategy(&config.strategies)?;
    let config = Arc::new(config);

    let floor = Money::from_f64(config.risk.min_quote_trade);
    let products = gateway.tradable_products(floor).await?;
    info!(count = products.len(), strategy = strategy.name(), "Scanning tradable universe");

    let semaphore = Arc::new(Semaphore::new(config.trading.analysis_workers));
    let mut handles = Vec::with_capacity(products.len());

    for (product, volume) in products {
        let permit = Arc::clone(&semaphore);
        let gateway = Arc::clone(&gateway);
        let strategy = Arc::clone(&strategy);
        let config = Arc::clone(&config);

        handles.push(tokio::spawn(async move {
            let _permit = permit.acquire().await.expect("semaphore closed");
            let candles = match gateway
                .get_candles(
                    &product.id,
                    &config.trading.granularity,
                    config.trading.candle_history,
                )
                .await
            {
                Ok(candles) => candles,
                Err(e) => {
                    warn!(product = %product.id, error = %e, "Candle fetch failed");
                    return None;
                }
            };
            let series = enrich(&candles);
            let signal = strategy.analyze(&series, &product.id);
            Some((product.id, volume, signal))
        }));
    }

    let mut results: Vec<(spot_trader::types::ProductId, Money, Signal)> = Vec::new();
    for handle in handles {
        if let Ok(Some(result)) = handle.await {
            results.push(result);
        }
    }

    // BUY first by confidence, then SELL, then the quiet rest by volume.
    let ranked = results
        .into_iter()
        .sorted_by(|a, b| {
            let rank = |s: &Signal| match s.action {
                SignalAction::Buy => 0,
                SignalAction::Sell => 1,
                SignalAction::Hold => 2,
            };
            rank(&a.2)
                .cmp(&rank(&b.2))
                .then(b.2.confidence.partial_cmp(&a.2.confidence).unwrap_or(std::cmp::Ordering::Equal))
                .then(b.1.cmp(&a.1))
        })
        .take(top)
        .collect::<Vec<_>>();

    println!("{:<14} {:<6} {:<6} {:>16}  REASONS", "PRODUCT", "ACTION", "CONF", "24H VOLUME");
    println!("{}", "-".repeat(80));
    for (product, volume, signal) in ranked {
        println!(
            "{:<14} {:<6} {:<6.2} {:>16}  {}",
            product.as_str(),
            signal.action.to_string(),
            signal.confidence,
            volume.to_string(),
            signal.reasons.iter().take(2).join("; "),
        );
    }

    Ok(())
}
