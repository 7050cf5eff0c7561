//! Position Monitor
//!
//! Each cycle, every open position is re-valued against a freshly
//! recomputed fee-inclusive cost basis and the live signal from the
//! active strategy. Exits are signal-confirmed: a price trigger alone is
//! never enough. All sells go through the Order Manager's exit path;
//! the monitor never touches the exchange directly.

use std::sync::Arc;

use anyhow::Result;
use tracing::{debug, info, warn};

use crate::config::{Config, ExitConfig};
use crate::indicators::enrich;
use crate::oms::OrderManager;
use crate::strategies::Strategy;
use crate::types::{ExitReason, Position, Signal, SignalAction};

/// What the decision table concluded for one position
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitDecision {
    Sell(ExitReason),
    /// In profit past the exit level, but the strategy still says BUY:
    /// let the winner run.
    ProfitHold,
    /// Losing past the warning level without a confident sell signal.
    LossWarning,
    Hold,
}

/// The signal-confirmed exit decision table.
///
/// | pnl_pct          | signal           | action                    |
/// |------------------|------------------|---------------------------|
/// | ≥ profit_exit    | HOLD or SELL     | sell (signal_profit_exit) |
/// | ≥ profit_exit    | BUY              | hold, winner runs         |
/// | ≤ loss_exit      | SELL, conf ≥ min | sell (signal_loss_exit)   |
/// | ≤ loss_exit      | anything else    | hold, loss warning        |
/// | otherwise        | any              | no-op (brackets in force) |
///
/// Unprotected positions (failed bracket install) exit on any adverse
/// signal regardless of the loss threshold.
pub fn evaluate_exit(
    pnl_pct: f64,
    signal: &Signal,
    config: &ExitConfig,
    unprotected: bool,
) -> ExitDecision {
    if pnl_pct >= config.profit_exit_pct {
        return if signal.action == SignalAction::Buy {
            ExitDecision::ProfitHold
        } else {
            ExitDecision::Sell(ExitReason::SignalProfitExit)
        };
    }

    if unprotected && signal.action == SignalAction::Sell {
        return ExitDecision::Sell(ExitReason::SignalLossExit);
    }

    if pnl_pct <= config.loss_exit_pct {
        if signal.action == SignalAction::Sell && signal.confidence >= config.loss_exit_confidence
        {
            return ExitDecision::Sell(ExitReason::SignalLossExit);
        }
        return ExitDecision::LossWarning;
    }

    ExitDecision::Hold
}

pub struct PositionMonitor {
    manager: Arc<OrderManager>,
    strategy: Arc<dyn Strategy>,
    config: Arc<Config>,
}

impl PositionMonitor {
    pub fn new(manager: Arc<OrderManager>, strategy: Arc<dyn Strategy>, config: Arc<Config>) -> Self {
        Self {
            manager,
            strategy,
            config,
        }
    }

    /// Evaluate every open position. Per-position failures are logged and
    /// skipped so one product cannot stall the sweep.
    pub async fn sweep(&self) -> Result<()> {
        let positions = self.manager.store().list_open_positions()?;
        for position in positions {
            if let Err(e) = self.check_position(&position).await {
                warn!(
                    product = %position.product,
                    position_id = position.id,
                    error = %e,
                    "Position check failed"
                );
            }
        }
        Ok(())
    }

    async fn check_position(&self, position: &Position) -> Result<()> {
        // Cost basis is always re-aggregated from fills; a cached entry
        // price would go stale on partial fills and fee adjustments.
        let basis = position.cost_basis();
        let size = position.size();
        if basis.is_zero() || size.is_zero() {
            debug!(
                position_id = position.id,
                "Position has no entry fills yet, skipping"
            );
            return Ok(());
        }

        let last_price = self.manager.gateway().last_price(&position.product).await?;
        let pnl_pct = ((last_price - basis) / basis).to_f64();

        // Same candle pipeline as entries
        let candles = self
            .manager
            .gateway()
            .get_candles(
                &position.product,
                &self.config.trading.granularity,
                self.config.trading.candle_history,
            )
            .await?;
        let series = enrich(&candles);
        let signal = self.strategy.analyze(&series, &position.product);

        debug!(
            product = %position.product,
            basis = %basis,
            last = %last_price,
            pnl = format!("{:+.2}%", pnl_pct * 100.0),
            signal = %signal.action,
            confidence = format!("{:.2}", signal.confidence),
            "Position evaluated"
        );

        match evaluate_exit(pnl_pct, &signal, &self.config.exit, position.unprotected) {
            ExitDecision::Sell(reason) => {
                info!(
                    product = %position.product,
                    pnl = format!("{:+.2}%", pnl_pct * 100.0),
                    reason = %reason,
                    signal_reasons = ?signal.reasons,
                    "Exit triggered"
                );
                self.manager.execute_exit(position, reason).await?;
            }
            ExitDecision::ProfitHold => {
                info!(
                    product = %position.product,
                    pnl = format!("{:+.2}%", pnl_pct * 100.0),
                    confidence = format!("{:.2}", signal.confidence),
                    "[PROFIT HOLD] strategy still bullish, letting winner run"
                );
            }
            ExitDecision::LossWarning => {
                warn!(
                    product = %position.product,
                    pnl = format!("{:+.2}%", pnl_pct * 100.0),
                    signal = %signal.action,
                    confidence = format!("{:.2}", signal.confidence),
                    "[LOSS WARNING] losing position without confident sell signal"
                );
            }
            ExitDecision::Hold => {}
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Signal;

    fn config() -> ExitConfig {
        ExitConfig::default()
    }

    fn signal(action: SignalAction, confidence: f64) -> Signal {
        Signal::new(action, confidence, vec!["test".to_string()])
    }

    #[test]
    fn test_profit_exit_on_hold_signal() {
        // cost basis 0.007167, last 0.007526 → +5.0%
        let pnl = (0.007526 - 0.007167) / 0.007167;
        let decision = evaluate_exit(pnl, &signal(SignalAction::Hold, 0.3), &config(), false);
        assert_eq!(decision, ExitDecision::Sell(ExitReason::SignalProfitExit));
    }

    #[test]
    fn test_no_exit_below_profit_level() {
        // +3.04% is under the 5% exit level
        let pnl = (0.007385 - 0.007167) / 0.007167;
        let decision = evaluate_exit(pnl, &signal(SignalAction::Hold, 0.3), &config(), false);
        assert_eq!(decision, ExitDecision::Hold);
    }

    #[test]
    fn test_winner_runs_on_buy_signal() {
        let pnl = (0.007600 - 0.007167) / 0.007167; // ≈ +6%
        let decision = evaluate_exit(pnl, &signal(SignalAction::Buy, 0.72), &config(), false);
        assert_eq!(decision, ExitDecision::ProfitHold);
    }

    #[test]
    fn test_confident_loss_cut() {
        let pnl = (97.90 - 100.00) / 100.00; // −2.1%
        let decision = evaluate_exit(pnl, &signal(SignalAction::Sell, 0.68), &config(), false);
        assert_eq!(decision, ExitDecision::Sell(ExitReason::SignalLossExit));
    }

    #[test]
    fn test_shallow_loss_without_strong_sell_warns() {
        let pnl = (97.90 - 100.00) / 100.00;
        let decision = evaluate_exit(pnl, &signal(SignalAction::Hold, 0.55), &config(), false);
        assert_eq!(decision, ExitDecision::LossWarning);

        // A sell below the confidence floor also only warns
        let decision = evaluate_exit(pnl, &signal(SignalAction::Sell, 0.40), &config(), false);
        assert_eq!(decision, ExitDecision::LossWarning);
    }

    #[test]
    fn test_small_moves_are_noops() {
        let decision = evaluate_exit(0.01, &signal(SignalAction::Sell, 0.9), &config(), false);
        assert_eq!(decision, ExitDecision::Hold);

        let decision = evaluate_exit(-0.01, &signal(SignalAction::Sell, 0.3), &config(), false);
        assert_eq!(decision, ExitDecision::Hold);
    }

    #[test]
    fn test_unprotected_position_exits_on_any_adverse_signal() {
        // Small loss, weak sell signal: a protected position warns at most,
        // an unprotected one exits.
        let decision = evaluate_exit(-0.005, &signal(SignalAction::Sell, 0.30), &config(), true);
        assert_eq!(decision, ExitDecision::Sell(ExitReason::SignalLossExit));

        let decision = evaluate_exit(-0.005, &signal(SignalAction::Hold, 0.30), &config(), true);
        assert_eq!(decision, ExitDecision::Hold);
    }

    #[test]
    fn test_unprotected_winner_still_runs_on_buy() {
        let decision = evaluate_exit(0.06, &signal(SignalAction::Buy, 0.8), &config(), true);
        assert_eq!(decision, ExitDecision::ProfitHold);
    }
}
