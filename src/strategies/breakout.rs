//! Breakout strategy
//!
//! Hunts range expansions out of consolidation: a close through the 50-bar
//! rolling high after a Bollinger squeeze, with volume drying up and then
//! spiking on the breakout bar. The precondition is the inverse of the
//! momentum strategy's: ADX must be *low* before the breakout bar.

use super::{ScoreCard, Strategy};
use crate::config::BreakoutConfig;
use crate::indicators::EnrichedSeries;
use crate::types::{ProductId, Signal};

const MAX_SCORE: f64 = 6.0;
const MIN_BARS: usize = 60;

pub struct BreakoutStrategy {
    config: BreakoutConfig,
}

impl BreakoutStrategy {
    pub fn new(config: BreakoutConfig) -> Self {
        Self { config }
    }

    /// Volume declining over the prior `dry_up_bars`, then ≥ mult× average
    /// on the current bar.
    fn volume_dry_up_then_spike(&self, series: &EnrichedSeries, i: usize) -> bool {
        let n = self.config.dry_up_bars;
        if i < 2 * n {
            return false;
        }

        let recent: f64 = series.candles[i - n..i].iter().map(|c| c.volume).sum::<f64>() / n as f64;
        let earlier: f64 =
            series.candles[i - 2 * n..i - n].iter().map(|c| c.volume).sum::<f64>() / n as f64;
        let dried_up = recent < earlier;

        let spiked = match (series.volume(i), series.avg_volume(i, 20)) {
            (Some(v), Some(avg)) if avg > 0.0 => v >= self.config.breakout_volume_mult * avg,
            _ => false,
        };

        dried_up && spiked
    }

    /// ATR on the previous bar at (or within a hair of) its 20-bar minimum.
    fn atr_compressed(&self, series: &EnrichedSeries, i: usize) -> bool {
        if i < 21 {
            return false;
        }
        let Some(prev_atr) = EnrichedSeries::at(&series.atr_14, i - 1) else {
            return false;
        };
        let window_min = (i - 21..i)
            .filter_map(|j| EnrichedSeries::at(&series.atr_14, j))
            .fold(f64::MAX, f64::min);
        window_min != f64::MAX && prev_atr <= window_min * 1.001
    }
}

impl Strategy for BreakoutStrategy {
    fn name(&self) -> &'static str {
        "breakout"
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

        // Consolidation precondition: ADX below threshold *before* the
        // breakout bar; a breakout from an existing trend is just trend.
        let Some(prev_adx) = at(&series.adx_14, i.saturating_sub(1)) else {
            return Signal::hold("indicators still warming up");
        };
        if prev_adx >= self.config.adx_consolidation {
            return Signal::hold(format!(
                "already trending (prior ADX {:.1} >= {:.1})",
                prev_adx, self.config.adx_consolidation
            ));
        }

        let close = series.close(i).unwrap_or(0.0);
        let high_break = matches!(at(&series.rolling_high_50, i), Some(h) if close > h);
        let low_break = matches!(at(&series.rolling_low_50, i), Some(l) if close < l);

        let squeeze = matches!(
            at(&series.bb_width, i),
            Some(w) if w < self.config.squeeze_width_pct
        );
        let volume_pattern = self.volume_dry_up_then_spike(series, i);
        let compressed = self.atr_compressed(series, i);

        let mut card = ScoreCard::new(MAX_SCORE);

        if high_break {
            card.buy(2.0, "close above 50-bar rolling high");
            if squeeze {
                card.buy(1.0, "Bollinger squeeze before breakout");
            }
            if volume_pattern {
                card.buy(2.0, "volume dry-up then breakout spike");
            }
            if compressed {
                card.buy(1.0, "ATR compressed to local minimum");
            }
        }

        if low_break {
            card.sell(2.0, "close below 50-bar rolling low");
            if squeeze {
                card.sell(1.0, "Bollinger squeeze before breakdown");
            }
            if volume_pattern {
                card.sell(2.0, "volume dry-up then breakdown spike");
            }
            if compressed {
                card.sell(1.0, "ATR compressed to local minimum");
            }
        }

        card.into_signal(self.config.signal_threshold)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::indicators::enrich;
    use crate::types::{Candle, SignalAction};
    use chrono::{Duration, Utc};

    fn candle(start: chrono::DateTime<Utc>, close: f64, volume: f64) -> Candle {
        Candle {
            start_time: start,
            open: close * 0.999,
            high: close * 1.001,
            low: close * 0.999,
            close,
            volume,
        }
    }

    fn consolidation_then_breakout(break_volume: f64) -> Vec<Candle> {
        let start = Utc::now() - Duration::minutes(15 * 120);
        let mut candles = Vec::new();
        // Tight range with gently declining volume
        for i in 0..99 {
            let close = 100.0 + ((i * 7) % 5) as f64 * 0.05;
            let volume = 1500.0 - i as f64 * 10.0;
            candles.push(candle(start + Duration::minutes(15 * i as i64), close, volume));
        }
        // Breakout bar well above the range on huge volume
        candles.push(candle(
            start + Duration::minutes(15 * 99),
            103.0,
            break_volume,
        ));
        candles
    }

    #[test]
    fn test_insufficient_history_holds() {
        let strategy = BreakoutStrategy::new(BreakoutConfig::default());
        let candles = consolidation_then_breakout(9000.0)[..30].to_vec();
        let series = enrich(&candles);
        let signal = strategy.analyze(&series, &ProductId::new("BTC-USD"));
        assert_eq!(signal.action, SignalAction::Hold);
    }

    #[test]
    fn test_breakout_from_consolidation_buys() {
        let strategy = BreakoutStrategy::new(BreakoutConfig::default());
        let candles = consolidation_then_breakout(9000.0);
        let series = enrich(&candles);
        let signal = strategy.analyze(&series, &ProductId::new("BTC-USD"));
        assert_eq!(signal.action, SignalAction::Buy, "reasons: {:?}", signal.reasons);
        assert!(signal
            .reasons
            .iter()
            .any(|r| r.contains("50-bar rolling high")));
    }

    #[test]
    fn test_quiet_range_holds() {
        let strategy = BreakoutStrategy::new(BreakoutConfig::default());
        let mut candles = consolidation_then_breakout(9000.0);
        candles.pop(); // drop the breakout bar
        let series = enrich(&candles);
        let signal = strategy.analyze(&series, &ProductId::new("BTC-USD"));
        assert_eq!(signal.action, SignalAction::Hold);
    }

    #[test]
    fn test_analyze_is_deterministic() {
        let strategy = BreakoutStrategy::new(BreakoutConfig::default());
        let candles = consolidation_then_breakout(9000.0);
        let series = enrich(&candles);
        let product = ProductId::new("DOGE-USD");
        let a = strategy.analyze(&series, &product);
        let b = strategy.analyze(&series, &product);
        assert_eq!(a.action, b.action);
        assert_eq!(a.confidence, b.confidence);
        assert_eq!(a.reasons, b.reasons);
    }
}
