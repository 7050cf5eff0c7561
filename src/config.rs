//! Configuration management
//!
//! Handles loading and parsing of JSON configuration files with environment
//! variable support for API credentials. Configuration is immutable after
//! start and is threaded through components inside `AppContext`.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub exchange: ExchangeConfig,
    #[serde(default)]
    pub trading: TradingConfig,
    #[serde(default)]
    pub risk: RiskConfig,
    #[serde(default)]
    pub exit: ExitConfig,
    #[serde(default)]
    pub strategies: StrategiesConfig,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            exchange: ExchangeConfig::default(),
            trading: TradingConfig::default(),
            risk: RiskConfig::default(),
            exit: ExitConfig::default(),
            strategies: StrategiesConfig::default(),
        }
    }
}

impl Config {
    /// Load configuration from JSON file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let contents = fs::read_to_string(path.as_ref()).context("Failed to read config file")?;
        let mut config: Config =
            serde_json::from_str(&contents).context("Failed to parse config JSON")?;

        // Load API credentials from environment if not set
        if let Ok(api_key) = std::env::var("EXCHANGE_API_KEY") {
            config.exchange.api_key = Some(api_key);
        }
        if let Ok(api_secret) = std::env::var("EXCHANGE_API_SECRET") {
            config.exchange.api_secret = Some(api_secret);
        }

        Ok(config)
    }
}

/// Exchange connection configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExchangeConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_secret: Option<String>,
    pub maker_fee: f64,
    pub taker_fee: f64,
    /// Requests per second for the private endpoint class
    pub private_rate_limit: usize,
    /// Requests per second for the public endpoint class
    pub public_rate_limit: usize,
    /// REST request timeout in seconds
    pub request_timeout_secs: u64,
}

impl Default for ExchangeConfig {
    fn default() -> Self {
        ExchangeConfig {
            api_key: None,
            api_secret: None,
            maker_fee: 0.004,
            taker_fee: 0.006,
            private_rate_limit: 10,
            public_rate_limit: 10,
            request_timeout_secs: 10,
        }
    }
}

/// Trading loop configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TradingConfig {
    /// When true, order placement is simulated inside the gateway;
    /// nothing else in the system branches on this flag.
    pub paper_trading_mode: bool,
    pub granularity: String,
    pub candle_history: usize,
    pub loop_sleep_seconds: u64,
    pub max_products: usize,
    pub min_signal_confidence: f64,
    /// Bounded worker pool size for per-candidate analysis
    pub analysis_workers: usize,
    /// Seconds to wait for an entry limit order to fill
    pub fill_timeout_seconds: u64,
    /// Seconds to wait for an exit market order to fill
    pub sell_fill_timeout_seconds: u64,
    /// Seconds allowed to verify a cancellation before escalating
    pub cancel_verify_seconds: u64,
    /// Minimum filled fraction accepted at entry timeout
    pub min_fill_fraction: f64,
    /// Reconciler age ceiling for unattended orders, in seconds
    pub order_max_age_seconds: u64,
    /// Streaming price staleness window before REST fallback, in seconds
    pub max_price_staleness_seconds: u64,
    pub state_dir: String,
    /// Quote currency the account is valued in
    pub quote_currency: String,
    /// Starting cash for paper-mode equity accounting
    pub paper_starting_cash: f64,
}

impl Default for TradingConfig {
    fn default() -> Self {
        TradingConfig {
            paper_trading_mode: true,
            granularity: "FIFTEEN_MINUTE".to_string(),
            candle_history: 200,
            loop_sleep_seconds: 60,
            max_products: 20,
            min_signal_confidence: 0.50,
            analysis_workers: 3,
            fill_timeout_seconds: 30,
            sell_fill_timeout_seconds: 10,
            cancel_verify_seconds: 10,
            min_fill_fraction: 1.0,
            order_max_age_seconds: 300,
            max_price_staleness_seconds: 30,
            state_dir: "state".to_string(),
            quote_currency: "USD".to_string(),
            paper_starting_cash: 10_000.0,
        }
    }
}

/// Portfolio risk limits
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RiskConfig {
    pub risk_per_trade: f64,
    pub max_position_size: f64,
    pub max_total_exposure: f64,
    pub default_stop_loss: f64,
    pub default_take_profit: f64,
    pub max_drawdown: f64,
    /// Equity must recover to this fraction of peak before the halt lifts
    pub drawdown_release: f64,
    pub max_concurrent: usize,
    pub max_spread_pct: f64,
    pub min_buy_pressure: f64,
    pub max_fee_pct: f64,
    pub max_slippage_pct: f64,
    pub min_quote_trade: f64,
}

impl Default for RiskConfig {
    fn default() -> Self {
        RiskConfig {
            risk_per_trade: 0.01,
            max_position_size: 0.10,
            max_total_exposure: 0.50,
            default_stop_loss: 0.015,
            default_take_profit: 0.03,
            max_drawdown: 0.15,
            drawdown_release: 0.95,
            max_concurrent: 5,
            max_spread_pct: 0.005,
            min_buy_pressure: 0.45,
            max_fee_pct: 0.01,
            max_slippage_pct: 0.005,
            min_quote_trade: 10.0,
        }
    }
}

/// Signal-confirmed exit thresholds
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExitConfig {
    pub profit_exit_pct: f64,
    pub loss_exit_pct: f64,
    pub loss_exit_confidence: f64,
}

impl Default for ExitConfig {
    fn default() -> Self {
        ExitConfig {
            profit_exit_pct: 0.05,
            loss_exit_pct: -0.02,
            loss_exit_confidence: 0.60,
        }
    }
}

/// Strategy selection and per-strategy parameter blocks
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StrategiesConfig {
    /// One of "momentum", "mean_reversion", "breakout", "hybrid"
    pub active: String,
    #[serde(default)]
    pub momentum: MomentumConfig,
    #[serde(default)]
    pub mean_reversion: MeanReversionConfig,
    #[serde(default)]
    pub breakout: BreakoutConfig,
    #[serde(default)]
    pub hybrid: HybridConfig,
}

impl Default for StrategiesConfig {
    fn default() -> Self {
        StrategiesConfig {
            active: "momentum".to_string(),
            momentum: MomentumConfig::default(),
            mean_reversion: MeanReversionConfig::default(),
            breakout: BreakoutConfig::default(),
            hybrid: HybridConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MomentumConfig {
    pub adx_threshold: f64,
    pub rsi_buy_floor: f64,
    pub rsi_buy_ceiling: f64,
    pub rsi_overbought: f64,
    /// Maximum distance from the middle band that counts as a pullback
    pub pullback_pct: f64,
    /// Volume spike multiple over the 20-bar average
    pub volume_spike_mult: f64,
    pub signal_threshold: f64,
}

impl Default for MomentumConfig {
    fn default() -> Self {
        MomentumConfig {
            adx_threshold: 25.0,
            rsi_buy_floor: 50.0,
            rsi_buy_ceiling: 70.0,
            rsi_overbought: 75.0,
            pullback_pct: 0.015,
            volume_spike_mult: 2.5,
            signal_threshold: 3.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MeanReversionConfig {
    pub rsi_oversold: f64,
    pub rsi_overbought: f64,
    pub stoch_oversold: f64,
    pub stoch_overbought: f64,
    /// Z-score distance from the 20-period SMA that scores a point
    pub sma_zscore: f64,
    pub signal_threshold: f64,
}

impl Default for MeanReversionConfig {
    fn default() -> Self {
        MeanReversionConfig {
            rsi_oversold: 20.0,
            rsi_overbought: 80.0,
            stoch_oversold: 20.0,
            stoch_overbought: 80.0,
            sma_zscore: 2.0,
            signal_threshold: 3.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BreakoutConfig {
    /// ADX must be below this on the bar before the breakout
    pub adx_consolidation: f64,
    /// Bollinger width under this fraction of price counts as a squeeze
    pub squeeze_width_pct: f64,
    /// Volume multiple over average on the breakout bar
    pub breakout_volume_mult: f64,
    /// Bars of declining volume required before the spike
    pub dry_up_bars: usize,
    pub signal_threshold: f64,
}

impl Default for BreakoutConfig {
    fn default() -> Self {
        BreakoutConfig {
            adx_consolidation: 20.0,
            squeeze_width_pct: 0.04,
            breakout_volume_mult: 3.0,
            dry_up_bars: 10,
            signal_threshold: 3.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HybridConfig {
    /// Minimum number of sub-strategies that must agree on BUY
    pub k: usize,
}

impl Default for HybridConfig {
    fn default() -> Self {
        HybridConfig { k: 2 }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_documented_values() {
        let config = Config::default();
        assert!(config.trading.paper_trading_mode);
        assert_eq!(config.trading.granularity, "FIFTEEN_MINUTE");
        assert_eq!(config.trading.candle_history, 200);
        assert_eq!(config.trading.loop_sleep_seconds, 60);
        assert_eq!(config.risk.risk_per_trade, 0.01);
        assert_eq!(config.risk.max_drawdown, 0.15);
        assert_eq!(config.risk.max_concurrent, 5);
        assert_eq!(config.exit.profit_exit_pct, 0.05);
        assert_eq!(config.exit.loss_exit_pct, -0.02);
        assert_eq!(config.strategies.hybrid.k, 2);
    }

    #[test]
    fn test_partial_config_fills_defaults() {
        let json = r#"{
            "trading": {
                "paper_trading_mode": false,
                "granularity": "ONE_HOUR",
                "candle_history": 300,
                "loop_sleep_seconds": 120,
                "max_products": 5,
                "min_signal_confidence": 0.6,
                "analysis_workers": 2,
                "fill_timeout_seconds": 30,
                "sell_fill_timeout_seconds": 10,
                "cancel_verify_seconds": 10,
                "min_fill_fraction": 1.0,
                "order_max_age_seconds": 300,
                "max_price_staleness_seconds": 30,
                "state_dir": "state"
            }
        }"#;
        let config: Config = serde_json::from_str(json).unwrap();
        assert!(!config.trading.paper_trading_mode);
        assert_eq!(config.trading.max_products, 5);
        // Untouched sections come from defaults
        assert_eq!(config.risk.max_concurrent, 5);
        assert_eq!(config.strategies.active, "momentum");
    }
}
