//! Momentum strategy
//!
//! Trend-following entries on an established EMA stack, confirmed by MACD
//! crossovers and volume. Requires ADX ≥ threshold (trend present). Buys
//! only happen on a pullback toward the middle Bollinger band; buying
//! above the upper band is disallowed outright.

use super::{ScoreCard, Strategy};
use crate::config::MomentumConfig;
use crate::indicators::EnrichedSeries;
use crate::types::{ProductId, Signal, SignalAction};

const MAX_SCORE: f64 = 8.0;
const MIN_BARS: usize = 200;

pub struct MomentumStrategy {
    config: MomentumConfig,
}

impl MomentumStrategy {
    pub fn new(config: MomentumConfig) -> Self {
        Self { config }
    }
}

impl Strategy for MomentumStrategy {
    fn name(&self) -> &'static str {
        "momentum"
    }

    fn analyze(&self, series: &EnrichedSeries, _product: &ProductId) -> Signal {
        if series.len() < MIN_BARS {
            return Signal::hold(format!(
                "insufficient history ({} bars, need {})",
                series.len(),
                MIN_BARS
            ));
        }

        let i = series.last_index();
        let at = EnrichedSeries::at;

        let (Some(adx), Some(ema_20), Some(ema_50), Some(ema_200)) = (
            at(&series.adx_14, i),
            at(&series.ema_20, i),
            at(&series.ema_50, i),
            at(&series.ema_200, i),
        ) else {
            return Signal::hold("indicators still warming up");
        };

        // Trend-regime precondition
        if adx < self.config.adx_threshold {
            return Signal::hold(format!(
                "no trend regime (ADX {:.1} < {:.1})",
                adx, self.config.adx_threshold
            ));
        }

        let close = series.close(i).unwrap_or(0.0);
        let bullish = ema_20 > ema_50 && ema_50 > ema_200;
        let bearish = ema_20 < ema_50 && ema_50 < ema_200;

        let macd_now = at(&series.macd_line, i);
        let macd_prev = at(&series.macd_line, i.saturating_sub(1));
        let signal_now = at(&series.macd_signal, i);
        let signal_prev = at(&series.macd_signal, i.saturating_sub(1));
        let crossed_up = matches!(
            (macd_prev, signal_prev, macd_now, signal_now),
            (Some(mp), Some(sp), Some(m), Some(s)) if mp <= sp && m > s
        );
        let crossed_down = matches!(
            (macd_prev, signal_prev, macd_now, signal_now),
            (Some(mp), Some(sp), Some(m), Some(s)) if mp >= sp && m < s
        );

        let rsi = at(&series.rsi_14, i);
        let bb_middle = at(&series.bb_middle, i);
        let bb_upper = at(&series.bb_upper, i);

        let pullback_ok = matches!(
            bb_middle,
            Some(mid) if mid > 0.0 && ((close - mid) / mid).abs() <= self.config.pullback_pct
        );
        let above_upper_band = matches!(bb_upper, Some(up) if close > up);

        let volume_spike = match (series.volume(i), series.avg_volume(i, 20)) {
            (Some(v), Some(avg)) if avg > 0.0 => v >= self.config.volume_spike_mult * avg,
            _ => false,
        };

        let mut card = ScoreCard::new(MAX_SCORE);

        if bullish {
            card.buy(2.0, "bullish EMA stack (20 > 50 > 200)");
            if crossed_up {
                card.buy(2.0, "MACD crossed above signal");
            }
            if let Some(rsi) = rsi {
                if rsi >= self.config.rsi_buy_floor && rsi <= self.config.rsi_buy_ceiling {
                    card.buy(1.0, format!("RSI {:.1} in momentum band", rsi));
                }
            }
            if pullback_ok {
                card.buy(2.0, "pullback to middle Bollinger band");
            }
            if volume_spike {
                card.buy(1.0, "volume spike above 20-bar average");
            }
        }

        if bearish {
            card.sell(2.0, "bearish EMA stack (20 < 50 < 200)");
            if crossed_down {
                card.sell(2.0, "MACD crossed below signal");
            }
            if let Some(rsi) = rsi {
                if rsi > self.config.rsi_overbought {
                    card.sell(1.0, format!("RSI {:.1} overbought", rsi));
                }
            }
            if matches!(bb_middle, Some(mid) if close < mid) {
                card.sell(2.0, "break below middle band in downtrend");
            }
            if volume_spike {
                card.sell(1.0, "volume spike above 20-bar average");
            }
        }

        let signal = card.into_signal(self.config.signal_threshold);

        // The pullback clause is mandatory for entries: a buy that chased
        // price above the upper band is never allowed through.
        if signal.action == SignalAction::Buy && (!pullback_ok || above_upper_band) {
            return Signal::hold("buy rejected: no pullback to middle band");
        }

        signal
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::indicators::enrich;
    use crate::types::Candle;
    use chrono::{Duration, Utc};

    fn candles_from_closes(closes: &[f64], volume: f64) -> Vec<Candle> {
        let start = Utc::now() - Duration::minutes(15 * closes.len() as i64);
        closes
            .iter()
            .enumerate()
            .map(|(i, &close)| Candle {
                start_time: start + Duration::minutes(15 * i as i64),
                open: close * 0.999,
                high: close * 1.002,
                low: close * 0.998,
                close,
                volume,
            })
            .collect()
    }

    #[test]
    fn test_insufficient_history_holds() {
        let strategy = MomentumStrategy::new(MomentumConfig::default());
        let candles = candles_from_closes(&vec![100.0; 50], 1000.0);
        let series = enrich(&candles);
        let signal = strategy.analyze(&series, &ProductId::new("BTC-USD"));
        assert_eq!(signal.action, SignalAction::Hold);
        assert!(signal.reasons[0].contains("insufficient history"));
    }

    #[test]
    fn test_flat_market_has_no_trend_regime() {
        let strategy = MomentumStrategy::new(MomentumConfig::default());
        let candles = candles_from_closes(&vec![100.0; 250], 1000.0);
        let series = enrich(&candles);
        let signal = strategy.analyze(&series, &ProductId::new("BTC-USD"));
        assert_eq!(signal.action, SignalAction::Hold);
    }

    #[test]
    fn test_analyze_is_deterministic() {
        let strategy = MomentumStrategy::new(MomentumConfig::default());
        let closes: Vec<f64> = (0..250).map(|i| 100.0 + i as f64 * 0.5).collect();
        let candles = candles_from_closes(&closes, 1000.0);
        let series = enrich(&candles);
        let product = ProductId::new("ETH-USD");

        let a = strategy.analyze(&series, &product);
        let b = strategy.analyze(&series, &product);
        assert_eq!(a.action, b.action);
        assert_eq!(a.confidence, b.confidence);
        assert_eq!(a.reasons, b.reasons);
    }

    #[test]
    fn test_steady_uptrend_never_buys_above_upper_band() {
        // A relentless uptrend keeps price pressed against the upper band,
        // far from the middle: the mandatory pullback clause must block it.
        let strategy = MomentumStrategy::new(MomentumConfig::default());
        let closes: Vec<f64> = (0..250).map(|i| 100.0 * 1.01f64.powi(i)).collect();
        let candles = candles_from_closes(&closes, 1000.0);
        let series = enrich(&candles);
        let signal = strategy.analyze(&series, &ProductId::new("BTC-USD"));
        assert_ne!(signal.action, SignalAction::Buy);
    }

    #[test]
    fn test_signals_always_carry_reasons() {
        let strategy = MomentumStrategy::new(MomentumConfig::default());
        for len in [10usize, 100, 250] {
            let closes: Vec<f64> = (0..len).map(|i| 100.0 + (i % 7) as f64).collect();
            let candles = candles_from_closes(&closes, 500.0);
            let series = enrich(&candles);
            let signal = strategy.analyze(&series, &ProductId::new("XRP-USD"));
            assert!(!signal.reasons.is_empty());
        }
    }
}
