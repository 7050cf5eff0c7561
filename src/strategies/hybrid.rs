//! Hybrid strategy
//!
//! Runs momentum, mean-reversion, and breakout side by side and only acts
//! when at least K of them agree. Confidence is the agreement-weighted
//! average of the concurring sub-signals.

use super::{
    BreakoutStrategy, MeanReversionStrategy, MomentumStrategy, Strategy,
};
use crate::config::StrategiesConfig;
use crate::indicators::EnrichedSeries;
use crate::types::{ProductId, Signal, SignalAction};

pub struct HybridStrategy {
    k: usize,
    momentum: MomentumStrategy,
    mean_reversion: MeanReversionStrategy,
    breakout: BreakoutStrategy,
}

impl HybridStrategy {
    pub fn new(config: StrategiesConfig) -> Self {
        Self {
            k: config.hybrid.k,
            momentum: MomentumStrategy::new(config.momentum),
            mean_reversion: MeanReversionStrategy::new(config.mean_reversion),
            breakout: BreakoutStrategy::new(config.breakout),
        }
    }

    fn combine(&self, action: SignalAction, votes: Vec<(&'static str, Signal)>) -> Option<Signal> {
        let concurring: Vec<(&'static str, Signal)> = votes
            .into_iter()
            .filter(|(_, s)| s.action == action)
            .collect();

        if concurring.len() < self.k {
            return None;
        }

        // Weight each vote by its own confidence so a strong signal is not
        // dragged down by a barely-over-threshold one.
        let weight_sum: f64 = concurring.iter().map(|(_, s)| s.confidence).sum();
        let confidence = if weight_sum > 0.0 {
            concurring
                .iter()
                .map(|(_, s)| s.confidence * s.confidence)
                .sum::<f64>()
                / weight_sum
        } else {
            0.0
        };

        let mut reasons = vec![format!(
            "{}/{} strategies agree on {}",
            concurring.len(),
            3,
            action
        )];
        for (name, signal) in &concurring {
            for reason in &signal.reasons {
                reasons.push(format!("[{}] {}", name, reason));
            }
        }

        Some(Signal::new(action, confidence, reasons))
    }
}

impl Strategy for HybridStrategy {
    fn name(&self) -> &'static str {
        "hybrid"
    }

    fn analyze(&self, series: &EnrichedSeries, product: &ProductId) -> Signal {
        let votes = vec![
            ("momentum", self.momentum.analyze(series, product)),
            ("mean_reversion", self.mean_reversion.analyze(series, product)),
            ("breakout", self.breakout.analyze(series, product)),
        ];

        if let Some(signal) = self.combine(SignalAction::Buy, votes.clone()) {
            return signal;
        }
        if let Some(signal) = self.combine(SignalAction::Sell, votes) {
            return signal;
        }

        Signal::hold(format!("fewer than {} strategies agree", self.k))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::indicators::enrich;
    use crate::types::Candle;
    use chrono::{Duration, Utc};

    fn flat_series(count: usize) -> EnrichedSeries {
        let start = Utc::now() - Duration::minutes(15 * count as i64);
        let candles: Vec<Candle> = (0..count)
            .map(|i| Candle {
                start_time: start + Duration::minutes(15 * i as i64),
                open: 100.0,
                high: 100.2,
                low: 99.8,
                close: 100.0,
                volume: 1000.0,
            })
            .collect();
        enrich(&candles)
    }

    #[test]
    fn test_flat_market_holds() {
        let strategy = HybridStrategy::new(StrategiesConfig::default());
        let series = flat_series(250);
        let signal = strategy.analyze(&series, &ProductId::new("BTC-USD"));
        assert_eq!(signal.action, SignalAction::Hold);
        assert!(!signal.reasons.is_empty());
    }

    #[test]
    fn test_combine_requires_k_agreement() {
        let strategy = HybridStrategy::new(StrategiesConfig::default());

        let one_buy = vec![
            ("momentum", Signal::new(SignalAction::Buy, 0.8, vec!["up".into()])),
            ("mean_reversion", Signal::hold("quiet")),
            ("breakout", Signal::hold("quiet")),
        ];
        assert!(strategy.combine(SignalAction::Buy, one_buy).is_none());

        let two_buys = vec![
            ("momentum", Signal::new(SignalAction::Buy, 0.8, vec!["up".into()])),
            ("mean_reversion", Signal::new(SignalAction::Buy, 0.4, vec!["dip".into()])),
            ("breakout", Signal::hold("quiet")),
        ];
        let signal = strategy.combine(SignalAction::Buy, two_buys).unwrap();
        assert_eq!(signal.action, SignalAction::Buy);
        // (0.64 + 0.16) / 1.2 = 0.666...
        assert!((signal.confidence - 0.6667).abs() < 1e-3);
        assert!(signal.reasons.iter().any(|r| r.contains("[momentum]")));
    }

    #[test]
    fn test_k_of_one_accepts_single_vote() {
        let mut config = StrategiesConfig::default();
        config.hybrid.k = 1;
        let strategy = HybridStrategy::new(config);

        let one_sell = vec![
            ("momentum", Signal::new(SignalAction::Sell, 0.9, vec!["down".into()])),
            ("mean_reversion", Signal::hold("quiet")),
            ("breakout", Signal::hold("quiet")),
        ];
        let signal = strategy.combine(SignalAction::Sell, one_sell).unwrap();
        assert_eq!(signal.action, SignalAction::Sell);
        assert!((signal.confidence - 0.9).abs() < 1e-9);
    }
}
