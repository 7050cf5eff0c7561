//! Convert Command
//!
//! Thin wrapper over the gateway's convert endpoints: quote a currency
//! conversion and optionally commit it.

use anyhow::{Context, Result};
use tracing::info;

use spot_trader::config::Config;
use spot_trader::gateway::{Credentials, ExchangeGateway};

pub fn run(
    config_path: String,
    from: String,
    to: String,
    amount: String,
    commit: bool,
) -> Result<()> {
    dotenv::dotenv().ok();

    let config = Config::from_file(&config_path)
        .with_context(|| format!("Failed to load config from {config_path}"))?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed to build tokio runtime")?;

    runtime.block_on(convert_async(config, from, to, amount, commit))
}

async fn convert_async(
    config: Config,
    from: String,
    to: String,
    amount: String,
    commit: bool,
) -> Result<()> {
    let credentials = Credentials::new(
        config.exchange.api_key.clone().unwrap_or_default(),
        config.exchange.api_secret.clone().unwrap_or_default(),
    );
    let gateway = ExchangeGateway::new(credentials, &config);

    let quote = gateway
        .create_convert_quote(&from, &to, &amount)
        .await
        .context("Failed to create convert quote")?;

    info!(
        quote_id = %quote.quote_id,
        rate = %quote.conversion_rate,
        fee = %quote.fee,
        "Convert quote: {} {} -> {}",
        amount,
        from,
        to
    );

    if commit {
        let trade = gateway
            .commit_convert_trade(&quote.quote_id)
            .await
            .context("Failed to commit convert trade")?;
        info!(trade_id = %trade.trade_id, status = %trade.status, "Conversion committed");
    } else {
        info!("Dry run: pass --commit to execute this conversion");
    }

    Ok(())
}
