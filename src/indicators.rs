//! Technical indicators
//!
//! Implementation of common technical indicators used in trading strategies,
//! plus `enrich`, which decorates a candle series with every column the
//! strategy set references. All functions are deterministic and return
//! `None` inside their warm-up window instead of NaN.

use crate::types::Candle;

/// Calculate Simple Moving Average
pub fn sma(values: &[f64], period: usize) -> Vec<Option<f64>> {
    let mut result = Vec::with_capacity(values.len());

    for i in 0..values.len() {
        if i + 1 < period {
            result.push(None);
        } else {
            let sum: f64 = values[i + 1 - period..=i].iter().sum();
            result.push(Some(sum / period as f64));
        }
    }

    result
}

/// Calculate Exponential Moving Average
pub fn ema(values: &[f64], period: usize) -> Vec<Option<f64>> {
    let mut result = Vec::with_capacity(values.len());

    if values.is_empty() || period == 0 {
        return result;
    }

    let multiplier = 2.0 / (period as f64 + 1.0);
    let mut ema_value: Option<f64> = None;

    for (i, &value) in values.iter().enumerate() {
        if i + 1 < period {
            result.push(None);
        } else if i + 1 == period {
            // Initialize with SMA
            let sum: f64 = values[0..period].iter().sum();
            ema_value = Some(sum / period as f64);
            result.push(ema_value);
        } else if let Some(prev_ema) = ema_value {
            let new_ema = (value - prev_ema) * multiplier + prev_ema;
            ema_value = Some(new_ema);
            result.push(Some(new_ema));
        }
    }

    result
}

/// Calculate Relative Strength Index (Wilder smoothing)
pub fn rsi(values: &[f64], period: usize) -> Vec<Option<f64>> {
    let mut result = vec![None; values.len()];
    if values.len() <= period || period == 0 {
        return result;
    }

    let mut avg_gain = 0.0;
    let mut avg_loss = 0.0;

    for i in 1..=period {
        let change = values[i] - values[i - 1];
        if change > 0.0 {
            avg_gain += change;
        } else {
            avg_loss -= change;
        }
    }
    avg_gain /= period as f64;
    avg_loss /= period as f64;

    result[period] = Some(rsi_from_averages(avg_gain, avg_loss));

    for i in (period + 1)..values.len() {
        let change = values[i] - values[i - 1];
        let (gain, loss) = if change > 0.0 {
            (change, 0.0)
        } else {
            (0.0, -change)
        };
        avg_gain = (avg_gain * (period as f64 - 1.0) + gain) / period as f64;
        avg_loss = (avg_loss * (period as f64 - 1.0) + loss) / period as f64;
        result[i] = Some(rsi_from_averages(avg_gain, avg_loss));
    }

    result
}

fn rsi_from_averages(avg_gain: f64, avg_loss: f64) -> f64 {
    if avg_loss == 0.0 {
        return 100.0;
    }
    let rs = avg_gain / avg_loss;
    100.0 - 100.0 / (1.0 + rs)
}

/// MACD output columns
#[derive(Debug, Clone)]
pub struct MacdOutput {
    pub line: Vec<Option<f64>>,
    pub signal: Vec<Option<f64>>,
    pub histogram: Vec<Option<f64>>,
}

/// Calculate MACD (fast EMA − slow EMA) with signal and histogram
pub fn macd(values: &[f64], fast: usize, slow: usize, signal_period: usize) -> MacdOutput {
    let fast_ema = ema(values, fast);
    let slow_ema = ema(values, slow);

    let line: Vec<Option<f64>> = fast_ema
        .iter()
        .zip(slow_ema.iter())
        .map(|(f, s)| match (f, s) {
            (Some(f), Some(s)) => Some(f - s),
            _ => None,
        })
        .collect();

    // Signal line: EMA over the valid segment of the MACD line
    let first_valid = line.iter().position(|v| v.is_some()).unwrap_or(line.len());
    let valid: Vec<f64> = line[first_valid..].iter().filter_map(|&v| v).collect();
    let signal_valid = ema(&valid, signal_period);

    let mut signal = vec![None; values.len()];
    for (offset, value) in signal_valid.into_iter().enumerate() {
        signal[first_valid + offset] = value;
    }

    let histogram: Vec<Option<f64>> = line
        .iter()
        .zip(signal.iter())
        .map(|(l, s)| match (l, s) {
            (Some(l), Some(s)) => Some(l - s),
            _ => None,
        })
        .collect();

    MacdOutput {
        line,
        signal,
        histogram,
    }
}

/// Bollinger Bands output columns
#[derive(Debug, Clone)]
pub struct BollingerOutput {
    pub upper: Vec<Option<f64>>,
    pub middle: Vec<Option<f64>>,
    pub lower: Vec<Option<f64>>,
    /// Band width as a fraction of the middle band
    pub width: Vec<Option<f64>>,
}

/// Calculate Bollinger Bands (SMA ± mult·σ)
pub fn bollinger(values: &[f64], period: usize, mult: f64) -> BollingerOutput {
    let middle = sma(values, period);
    let mut upper = vec![None; values.len()];
    let mut lower = vec![None; values.len()];
    let mut width = vec![None; values.len()];

    for i in 0..values.len() {
        let Some(mean) = middle[i] else { continue };
        let window = &values[i + 1 - period..=i];
        let variance: f64 =
            window.iter().map(|v| (v - mean) * (v - mean)).sum::<f64>() / period as f64;
        let std_dev = variance.sqrt();

        let up = mean + mult * std_dev;
        let low = mean - mult * std_dev;
        upper[i] = Some(up);
        lower[i] = Some(low);
        width[i] = if mean != 0.0 {
            Some((up - low) / mean)
        } else {
            None
        };
    }

    BollingerOutput {
        upper,
        middle,
        lower,
        width,
    }
}

/// Calculate True Range
pub fn true_range(high: &[f64], low: &[f64], close: &[f64]) -> Vec<f64> {
    let mut tr = Vec::with_capacity(high.len());

    for i in 0..high.len() {
        let tr_value = if i == 0 {
            high[i] - low[i]
        } else {
            let hl = high[i] - low[i];
            let hc = (high[i] - close[i - 1]).abs();
            let lc = (low[i] - close[i - 1]).abs();
            hl.max(hc).max(lc)
        };
        tr.push(tr_value);
    }

    tr
}

/// Calculate Average True Range (ATR)
pub fn atr(high: &[f64], low: &[f64], close: &[f64], period: usize) -> Vec<Option<f64>> {
    let tr = true_range(high, low, close);
    ema(&tr, period)
}

/// ADX output columns
#[derive(Debug, Clone)]
pub struct AdxOutput {
    pub adx: Vec<Option<f64>>,
    pub plus_di: Vec<Option<f64>>,
    pub minus_di: Vec<Option<f64>>,
}

/// Calculate Average Directional Index with +DI / −DI
pub fn adx(high: &[f64], low: &[f64], close: &[f64], period: usize) -> AdxOutput {
    let mut plus_dm = vec![0.0; high.len()];
    let mut minus_dm = vec![0.0; high.len()];

    for i in 1..high.len() {
        let up_move = high[i] - high[i - 1];
        let down_move = low[i - 1] - low[i];

        if up_move > down_move && up_move > 0.0 {
            plus_dm[i] = up_move;
        }
        if down_move > up_move && down_move > 0.0 {
            minus_dm[i] = down_move;
        }
    }

    let plus_smooth = ema(&plus_dm, period);
    let minus_smooth = ema(&minus_dm, period);
    let atr_values = atr(high, low, close, period);

    let mut plus_di = vec![None; high.len()];
    let mut minus_di = vec![None; high.len()];
    let mut dx = vec![0.0; high.len()];

    for i in 0..high.len() {
        if let (Some(p), Some(m), Some(atr_val)) = (plus_smooth[i], minus_smooth[i], atr_values[i])
        {
            if atr_val > 0.0 {
                let pdi = p / atr_val * 100.0;
                let mdi = m / atr_val * 100.0;
                plus_di[i] = Some(pdi);
                minus_di[i] = Some(mdi);

                let sum = pdi + mdi;
                if sum > 0.0 {
                    dx[i] = (pdi - mdi).abs() / sum * 100.0;
                }
            }
        }
    }

    AdxOutput {
        adx: ema(&dx, period),
        plus_di,
        minus_di,
    }
}

/// Stochastic oscillator output columns
#[derive(Debug, Clone)]
pub struct StochasticOutput {
    pub k: Vec<Option<f64>>,
    pub d: Vec<Option<f64>>,
}

/// Calculate Stochastic oscillator (%K over `k_period`, %D = SMA over `d_period`)
pub fn stochastic(
    high: &[f64],
    low: &[f64],
    close: &[f64],
    k_period: usize,
    d_period: usize,
) -> StochasticOutput {
    let mut k = vec![None; close.len()];

    for i in 0..close.len() {
        if i + 1 < k_period {
            continue;
        }
        let window_high = high[i + 1 - k_period..=i]
            .iter()
            .fold(f64::MIN, |a, &b| a.max(b));
        let window_low = low[i + 1 - k_period..=i]
            .iter()
            .fold(f64::MAX, |a, &b| a.min(b));
        let range = window_high - window_low;
        k[i] = if range > 0.0 {
            Some((close[i] - window_low) / range * 100.0)
        } else {
            Some(50.0)
        };
    }

    // %D: SMA over the valid segment of %K
    let first_valid = k.iter().position(|v| v.is_some()).unwrap_or(k.len());
    let valid: Vec<f64> = k[first_valid..].iter().filter_map(|&v| v).collect();
    let d_valid = sma(&valid, d_period);

    let mut d = vec![None; close.len()];
    for (offset, value) in d_valid.into_iter().enumerate() {
        d[first_valid + offset] = value;
    }

    StochasticOutput { k, d }
}

/// Highest high of the preceding `period` bars (excluding the current bar).
///
/// The breakout strategy compares the current close against this; including
/// the current bar would make a breakout impossible by construction.
pub fn rolling_high(high: &[f64], period: usize) -> Vec<Option<f64>> {
    let mut result = vec![None; high.len()];
    for i in period..high.len() {
        let window_max = high[i - period..i].iter().fold(f64::MIN, |a, &b| a.max(b));
        result[i] = Some(window_max);
    }
    result
}

/// Lowest low of the preceding `period` bars (excluding the current bar).
pub fn rolling_low(low: &[f64], period: usize) -> Vec<Option<f64>> {
    let mut result = vec![None; low.len()];
    for i in period..low.len() {
        let window_min = low[i - period..i].iter().fold(f64::MAX, |a, &b| a.min(b));
        result[i] = Some(window_min);
    }
    result
}

// =============================================================================
// Enriched series
// =============================================================================

/// A candle series decorated with every indicator column the strategies
/// reference. Column names are stable identifiers.
#[derive(Debug, Clone)]
pub struct EnrichedSeries {
    pub candles: Vec<Candle>,
    pub ema_20: Vec<Option<f64>>,
    pub ema_50: Vec<Option<f64>>,
    pub ema_200: Vec<Option<f64>>,
    pub rsi_14: Vec<Option<f64>>,
    pub macd_line: Vec<Option<f64>>,
    pub macd_signal: Vec<Option<f64>>,
    pub macd_histogram: Vec<Option<f64>>,
    pub bb_upper: Vec<Option<f64>>,
    pub bb_middle: Vec<Option<f64>>,
    pub bb_lower: Vec<Option<f64>>,
    pub bb_width: Vec<Option<f64>>,
    pub adx_14: Vec<Option<f64>>,
    pub plus_di: Vec<Option<f64>>,
    pub minus_di: Vec<Option<f64>>,
    pub stoch_k: Vec<Option<f64>>,
    pub stoch_d: Vec<Option<f64>>,
    pub atr_14: Vec<Option<f64>>,
    pub rolling_high_50: Vec<Option<f64>>,
    pub rolling_low_50: Vec<Option<f64>>,
}

impl EnrichedSeries {
    pub fn len(&self) -> usize {
        self.candles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.candles.is_empty()
    }

    /// Index of the most recent bar.
    pub fn last_index(&self) -> usize {
        self.candles.len().saturating_sub(1)
    }

    pub fn close(&self, i: usize) -> Option<f64> {
        self.candles.get(i).map(|c| c.close)
    }

    pub fn volume(&self, i: usize) -> Option<f64> {
        self.candles.get(i).map(|c| c.volume)
    }

    /// Value of a column at an index, flattening the warm-up None.
    pub fn at(column: &[Option<f64>], i: usize) -> Option<f64> {
        column.get(i).copied().flatten()
    }

    /// Average volume over the trailing `period` bars ending at `i`.
    pub fn avg_volume(&self, i: usize, period: usize) -> Option<f64> {
        if i + 1 < period {
            return None;
        }
        let sum: f64 = self.candles[i + 1 - period..=i].iter().map(|c| c.volume).sum();
        Some(sum / period as f64)
    }
}

/// Decorate a candle series with the configured indicator set.
///
/// Deterministic: byte-equal inputs produce byte-equal outputs.
pub fn enrich(candles: &[Candle]) -> EnrichedSeries {
    let close: Vec<f64> = candles.iter().map(|c| c.close).collect();
    let high: Vec<f64> = candles.iter().map(|c| c.high).collect();
    let low: Vec<f64> = candles.iter().map(|c| c.low).collect();

    let macd_out = macd(&close, 12, 26, 9);
    let bb = bollinger(&close, 20, 2.0);
    let adx_out = adx(&high, &low, &close, 14);
    let stoch = stochastic(&high, &low, &close, 14, 3);

    EnrichedSeries {
        candles: candles.to_vec(),
        ema_20: ema(&close, 20),
        ema_50: ema(&close, 50),
        ema_200: ema(&close, 200),
        rsi_14: rsi(&close, 14),
        macd_line: macd_out.line,
        macd_signal: macd_out.signal,
        macd_histogram: macd_out.histogram,
        bb_upper: bb.upper,
        bb_middle: bb.middle,
        bb_lower: bb.lower,
        bb_width: bb.width,
        adx_14: adx_out.adx,
        plus_di: adx_out.plus_di,
        minus_di: adx_out.minus_di,
        stoch_k: stoch.k,
        stoch_d: stoch.d,
        atr_14: atr(&high, &low, &close, 14),
        rolling_high_50: rolling_high(&high, 50),
        rolling_low_50: rolling_low(&low, 50),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use chrono::{Duration, Utc};

    fn flat_candles(count: usize, price: f64) -> Vec<Candle> {
        let start = Utc::now() - Duration::minutes(15 * count as i64);
        (0..count)
            .map(|i| Candle {
                start_time: start + Duration::minutes(15 * i as i64),
                open: price,
                high: price * 1.001,
                low: price * 0.999,
                close: price,
                volume: 1000.0,
            })
            .collect()
    }

    #[test]
    fn test_sma_basic() {
        let values = vec![1.0, 2.0, 3.0, 4.0, 5.0];
        let result = sma(&values, 3);
        assert_eq!(result[0], None);
        assert_eq!(result[1], None);
        assert_relative_eq!(result[2].unwrap(), 2.0);
        assert_relative_eq!(result[3].unwrap(), 3.0);
        assert_relative_eq!(result[4].unwrap(), 4.0);
    }

    #[test]
    fn test_ema_warmup_and_seed() {
        let values = vec![1.0, 2.0, 3.0, 4.0, 5.0];
        let result = ema(&values, 3);
        assert_eq!(result[0], None);
        assert_eq!(result[1], None);
        // Seeded with SMA of the first 3
        assert_relative_eq!(result[2].unwrap(), 2.0);
        // (4 - 2) * 0.5 + 2 = 3
        assert_relative_eq!(result[3].unwrap(), 3.0);
    }

    #[test]
    fn test_rsi_all_gains_is_100() {
        let values: Vec<f64> = (1..=30).map(|i| i as f64).collect();
        let result = rsi(&values, 14);
        assert_eq!(result[13], None);
        assert_relative_eq!(result[14].unwrap(), 100.0);
        assert_relative_eq!(result[29].unwrap(), 100.0);
    }

    #[test]
    fn test_rsi_flat_series() {
        let values = vec![10.0; 30];
        let result = rsi(&values, 14);
        // No losses at all: RSI pegs at 100 by convention
        assert_relative_eq!(result[20].unwrap(), 100.0);
    }

    #[test]
    fn test_macd_warmup() {
        let values: Vec<f64> = (0..60).map(|i| 100.0 + (i as f64 * 0.1)).collect();
        let out = macd(&values, 12, 26, 9);
        assert_eq!(out.line[24], None);
        assert!(out.line[25].is_some());
        // Signal needs 9 valid MACD values
        assert_eq!(out.signal[32], None);
        assert!(out.signal[33].is_some());
        assert!(out.histogram[33].is_some());
    }

    #[test]
    fn test_bollinger_flat_series_has_zero_width() {
        let values = vec![50.0; 30];
        let out = bollinger(&values, 20, 2.0);
        assert_eq!(out.middle[18], None);
        assert_relative_eq!(out.middle[19].unwrap(), 50.0);
        assert_relative_eq!(out.upper[19].unwrap(), 50.0);
        assert_relative_eq!(out.lower[19].unwrap(), 50.0);
        assert_relative_eq!(out.width[25].unwrap(), 0.0);
    }

    #[test]
    fn test_stochastic_at_top_of_range() {
        // Monotonically rising closes finish at the top of their range
        let close: Vec<f64> = (1..=30).map(|i| i as f64).collect();
        let high: Vec<f64> = close.iter().map(|c| c + 0.5).collect();
        let low: Vec<f64> = close.iter().map(|c| c - 0.5).collect();
        let out = stochastic(&high, &low, &close, 14, 3);
        let k = out.k[29].unwrap();
        assert!(k > 90.0, "k = {}", k);
        assert!(out.d[29].is_some());
    }

    #[test]
    fn test_rolling_high_excludes_current_bar() {
        let high = vec![1.0, 2.0, 3.0, 10.0, 4.0];
        let result = rolling_high(&high, 3);
        assert_eq!(result[2], None);
        assert_relative_eq!(result[3].unwrap(), 3.0); // bars 0..3
        assert_relative_eq!(result[4].unwrap(), 10.0); // bars 1..4
    }

    #[test]
    fn test_enrich_no_values_past_warmup() {
        let candles = flat_candles(250, 100.0);
        let series = enrich(&candles);
        let i = series.last_index();

        assert!(EnrichedSeries::at(&series.ema_200, i).is_some());
        assert!(EnrichedSeries::at(&series.rsi_14, i).is_some());
        assert!(EnrichedSeries::at(&series.macd_signal, i).is_some());
        assert!(EnrichedSeries::at(&series.bb_width, i).is_some());
        assert!(EnrichedSeries::at(&series.adx_14, i).is_some());
        assert!(EnrichedSeries::at(&series.stoch_d, i).is_some());
        assert!(EnrichedSeries::at(&series.atr_14, i).is_some());
        assert!(EnrichedSeries::at(&series.rolling_high_50, i).is_some());
        assert!(series.avg_volume(i, 20).is_some());
    }

    #[test]
    fn test_enrich_is_deterministic() {
        let candles = flat_candles(100, 42.0);
        let a = enrich(&candles);
        let b = enrich(&candles);
        assert_eq!(a.ema_20, b.ema_20);
        assert_eq!(a.adx_14, b.adx_14);
        assert_eq!(a.stoch_k, b.stoch_k);
    }
}
