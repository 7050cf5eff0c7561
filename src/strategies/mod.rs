//! Trading Strategies Module
//!
//! Contains all available trading strategies and common abstractions.
//! Every evaluator shares the same scoring pattern: weighted buy/sell
//! rules accumulate into a score card, a trend-regime precondition gates
//! the evaluation, and the winning score maps to a confidence.

pub mod breakout;
pub mod hybrid;
pub mod mean_reversion;
pub mod momentum;

use std::sync::Arc;

use anyhow::{bail, Result};

use crate::config::StrategiesConfig;
use crate::indicators::EnrichedSeries;
use crate::types::{ProductId, Signal, SignalAction};

pub use breakout::BreakoutStrategy;
pub use hybrid::HybridStrategy;
pub use mean_reversion::MeanReversionStrategy;
pub use momentum::MomentumStrategy;

/// Trading strategy trait
///
/// `analyze` is a pure function of the enriched series: byte-equal inputs
/// must produce byte-equal signals (modulo the produced_at stamp).
pub trait Strategy: Send + Sync {
    fn name(&self) -> &'static str;

    /// Generate a trading signal for the given enriched candle data
    fn analyze(&self, series: &EnrichedSeries, product: &ProductId) -> Signal;
}

/// Build the active strategy from config.
pub fn create_strategy(config: &StrategiesConfig) -> Result<Arc<dyn Strategy>> {
    match config.active.as_str() {
        "momentum" => Ok(Arc::new(MomentumStrategy::new(config.momentum.clone()))),
        "mean_reversion" => Ok(Arc::new(MeanReversionStrategy::new(
            config.mean_reversion.clone(),
        ))),
        "breakout" => Ok(Arc::new(BreakoutStrategy::new(config.breakout.clone()))),
        "hybrid" => Ok(Arc::new(HybridStrategy::new(config.clone()))),
        other => bail!(
            "unknown strategy '{other}' (expected momentum, mean_reversion, breakout, or hybrid)"
        ),
    }
}

/// Weighted rule accumulator shared by all evaluators.
pub(crate) struct ScoreCard {
    max_score: f64,
    buy_score: f64,
    sell_score: f64,
    buy_reasons: Vec<String>,
    sell_reasons: Vec<String>,
}

impl ScoreCard {
    pub fn new(max_score: f64) -> Self {
        Self {
            max_score,
            buy_score: 0.0,
            sell_score: 0.0,
            buy_reasons: Vec::new(),
            sell_reasons: Vec::new(),
        }
    }

    pub fn buy(&mut self, weight: f64, reason: impl Into<String>) {
        self.buy_score += weight;
        self.buy_reasons.push(reason.into());
    }

    pub fn sell(&mut self, weight: f64, reason: impl Into<String>) {
        self.sell_score += weight;
        self.sell_reasons.push(reason.into());
    }

    pub fn penalize_buy(&mut self, weight: f64, reason: impl Into<String>) {
        self.buy_score -= weight;
        self.buy_reasons.push(reason.into());
    }

    pub fn buy_score(&self) -> f64 {
        self.buy_score
    }

    /// Map the winning score to `{action, confidence}`; HOLD when neither
    /// side clears the threshold.
    pub fn into_signal(self, threshold: f64) -> Signal {
        if self.buy_score >= threshold && self.buy_score > self.sell_score {
            let confidence = (self.buy_score / self.max_score).min(1.0);
            Signal::new(SignalAction::Buy, confidence, self.buy_reasons)
        } else if self.sell_score >= threshold && self.sell_score > self.buy_score {
            let confidence = (self.sell_score / self.max_score).min(1.0);
            Signal::new(SignalAction::Sell, confidence, self.sell_reasons)
        } else {
            Signal::hold(format!(
                "no score above threshold (buy {:.1}, sell {:.1}, need {:.1})",
                self.buy_score, self.sell_score, threshold
            ))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StrategiesConfig;

    #[test]
    fn test_scorecard_buy_wins() {
        let mut card = ScoreCard::new(8.0);
        card.buy(2.0, "bullish trend");
        card.buy(2.0, "macd cross up");
        card.sell(1.0, "volume spike");

        let signal = card.into_signal(3.0);
        assert_eq!(signal.action, SignalAction::Buy);
        assert!((signal.confidence - 0.5).abs() < 1e-9);
        assert_eq!(signal.reasons.len(), 2);
    }

    #[test]
    fn test_scorecard_below_threshold_holds() {
        let mut card = ScoreCard::new(8.0);
        card.buy(2.0, "bullish trend");

        let signal = card.into_signal(3.0);
        assert_eq!(signal.action, SignalAction::Hold);
        assert!(!signal.reasons.is_empty());
    }

    #[test]
    fn test_scorecard_confidence_capped_at_one() {
        let mut card = ScoreCard::new(4.0);
        card.sell(6.0, "everything is wrong");
        let signal = card.into_signal(3.0);
        assert_eq!(signal.action, SignalAction::Sell);
        assert!((signal.confidence - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_factory_resolves_all_strategies() {
        let mut config = StrategiesConfig::default();
        for name in ["momentum", "mean_reversion", "breakout", "hybrid"] {
            config.active = name.to_string();
            let strategy = create_strategy(&config).unwrap();
            assert_eq!(strategy.name(), name);
        }

        config.active = "nonsense".to_string();
        assert!(create_strategy(&config).is_err());
    }
}
