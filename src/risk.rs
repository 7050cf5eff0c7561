//! Risk management framework
//!
//! Stateless decisions over a snapshot of equity and open positions:
//! position sizing from stop distance, entry admission against portfolio
//! invariants, and the drawdown halt. Expected rejections are value
//! returns, never errors, so the orchestrator's skip-on-reject path for a
//! candidate is total.

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::config::RiskConfig;
use crate::types::{Money, Product, ProductId};

/// Outcome of a sizing request
#[derive(Debug, Clone, PartialEq)]
pub enum SizeDecision {
    Approved(Money),
    Rejected(String),
}

/// Outcome of an entry admission check
#[derive(Debug, Clone, PartialEq)]
pub enum EntryDecision {
    Approved,
    Rejected(String),
}

impl EntryDecision {
    pub fn is_approved(&self) -> bool {
        matches!(self, EntryDecision::Approved)
    }
}

/// What `update_drawdown` observed this cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrawdownEvent {
    None,
    Halted,
    Released,
}

/// Peak-equity tracking state, persisted through the bot_state table so a
/// restart resumes the same halt posture.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DrawdownState {
    pub peak_equity: Money,
    pub halted: bool,
}

impl DrawdownState {
    pub fn new(equity: Money) -> Self {
        Self {
            peak_equity: equity,
            halted: false,
        }
    }

    pub fn current_drawdown(&self, equity: Money) -> f64 {
        if self.peak_equity.is_zero() {
            return 0.0;
        }
        1.0 - (equity / self.peak_equity).to_f64()
    }
}

/// Minimal view of the portfolio an admission check needs
#[derive(Debug, Clone)]
pub struct PortfolioSnapshot {
    pub equity: Money,
    pub open_products: Vec<ProductId>,
    /// Current quote value of all open positions
    pub total_exposure: Money,
    pub halted: bool,
}

#[derive(Debug, Clone)]
pub struct RiskManager {
    config: RiskConfig,
}

impl RiskManager {
    pub fn new(config: RiskConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &RiskConfig {
        &self.config
    }

    /// Size a position from the stop distance.
    ///
    /// `size = (equity · risk_per_trade) / |entry − stop|`, clamped by
    /// the max position value and the product's base increment. Rejected
    /// when the clamped size falls under the exchange minimums.
    pub fn position_size(
        &self,
        equity: Money,
        entry: Money,
        stop_loss: Money,
        product: &Product,
    ) -> SizeDecision {
        if !entry.is_positive() {
            return SizeDecision::Rejected("entry price must be positive".to_string());
        }

        let stop_distance = (entry - stop_loss).abs();
        if stop_distance.is_zero() {
            return SizeDecision::Rejected("stop distance is zero".to_string());
        }

        let risk_amount = equity * Money::from_f64(self.config.risk_per_trade);
        let mut size = risk_amount / stop_distance;

        let max_value = equity * Money::from_f64(self.config.max_position_size);
        if size * entry > max_value {
            size = max_value / entry;
        }

        let size = size.quantize(product.base_increment);

        if size < product.min_base {
            return SizeDecision::Rejected(format!(
                "size {} below product minimum {}",
                size, product.min_base
            ));
        }
        let min_size_for_quote = product.min_quote / entry;
        if size < min_size_for_quote {
            return SizeDecision::Rejected(format!(
                "order value {} below minimum quote {}",
                size * entry,
                product.min_quote
            ));
        }
        let min_trade = Money::from_f64(self.config.min_quote_trade);
        if size * entry < min_trade {
            return SizeDecision::Rejected(format!(
                "order value {} below configured floor {}",
                size * entry,
                min_trade
            ));
        }

        SizeDecision::Approved(size)
    }

    /// Gate a new entry on the portfolio invariants.
    pub fn can_open(
        &self,
        product: &ProductId,
        intended_quote_value: Money,
        snapshot: &PortfolioSnapshot,
    ) -> EntryDecision {
        if snapshot.halted {
            return EntryDecision::Rejected("drawdown halt active".to_string());
        }

        if snapshot.open_products.contains(product) {
            return EntryDecision::Rejected(format!("position already open for {product}"));
        }

        if snapshot.open_products.len() >= self.config.max_concurrent {
            return EntryDecision::Rejected(format!(
                "concurrent position cap reached ({})",
                self.config.max_concurrent
            ));
        }

        let max_exposure = snapshot.equity * Money::from_f64(self.config.max_total_exposure);
        if snapshot.total_exposure + intended_quote_value > max_exposure {
            return EntryDecision::Rejected(format!(
                "exposure {} + {} would exceed cap {}",
                snapshot.total_exposure, intended_quote_value, max_exposure
            ));
        }

        EntryDecision::Approved
    }

    /// Track the equity peak; halt when drawdown crosses the limit,
    /// release once equity recovers above the configured fraction of peak.
    pub fn update_drawdown(&self, state: &mut DrawdownState, equity: Money) -> DrawdownEvent {
        if equity > state.peak_equity {
            state.peak_equity = equity;
        }

        let drawdown = state.current_drawdown(equity);

        if !state.halted && drawdown >= self.config.max_drawdown {
            state.halted = true;
            warn!(
                drawdown = format!("{:.1}%", drawdown * 100.0),
                peak = %state.peak_equity,
                equity = %equity,
                "Drawdown limit breached: halting new entries"
            );
            return DrawdownEvent::Halted;
        }

        if state.halted {
            let release_level =
                state.peak_equity * Money::from_f64(self.config.drawdown_release);
            if equity >= release_level {
                state.halted = false;
                info!(
                    equity = %equity,
                    release_level = %release_level,
                    "Equity recovered: drawdown halt released"
                );
                return DrawdownEvent::Released;
            }
        }

        DrawdownEvent::None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn product(base_increment: &str, min_base: &str, min_quote: &str) -> Product {
        Product {
            id: ProductId::new("BTC-USD"),
            base: "BTC".to_string(),
            quote: "USD".to_string(),
            base_increment: Money::parse(base_increment).unwrap(),
            quote_increment: Money::parse("0.01").unwrap(),
            min_base: Money::parse(min_base).unwrap(),
            min_quote: Money::parse(min_quote).unwrap(),
            view_only: false,
            trading_disabled: false,
        }
    }

    fn manager() -> RiskManager {
        RiskManager::new(RiskConfig::default())
    }

    #[test]
    fn test_position_size_from_stop_distance() {
        let rm = manager();
        let p = product("0.00000001", "0.000001", "1");

        // equity 10_000, risk 1% = 100; entry 100, stop 95 → distance 5 → size 20
        // value = 2000 > max 10% (1000) → clamp to 10
        let decision = rm.position_size(
            Money::from_i64(10_000),
            Money::from_i64(100),
            Money::from_i64(95),
            &p,
        );
        match decision {
            SizeDecision::Approved(size) => assert_eq!(size, Money::from_i64(10)),
            SizeDecision::Rejected(reason) => panic!("unexpected rejection: {reason}"),
        }
    }

    #[test]
    fn test_position_size_unclamped_when_within_cap() {
        let rm = manager();
        let p = product("0.00000001", "0.000001", "1");

        // equity 10_000, risk 100; entry 100, stop 80 → distance 20 → size 5
        // value 500 < cap 1000 → unchanged
        let decision = rm.position_size(
            Money::from_i64(10_000),
            Money::from_i64(100),
            Money::from_i64(80),
            &p,
        );
        assert_eq!(decision, SizeDecision::Approved(Money::from_i64(5)));
    }

    #[test]
    fn test_position_size_rejects_below_minimums() {
        let rm = manager();
        // min_base of 1 whole unit with a tiny account
        let p = product("1", "1", "10");
        let decision = rm.position_size(
            Money::from_i64(100),
            Money::from_i64(500),
            Money::from_i64(490),
            &p,
        );
        assert!(matches!(decision, SizeDecision::Rejected(_)));
    }

    #[test]
    fn test_position_size_quantized_to_increment() {
        let rm = manager();
        let p = product("0.1", "0.1", "1");
        let decision = rm.position_size(
            Money::from_i64(10_000),
            Money::from_i64(30),
            Money::parse("29.1").unwrap(),
            &p,
        );
        match decision {
            SizeDecision::Approved(size) => {
                // raw = 100 / 0.9 = 111.11 → clamped by value cap 1000/30 = 33.33 → 33.3
                assert_eq!(size, Money::parse("33.3").unwrap());
            }
            SizeDecision::Rejected(reason) => panic!("unexpected rejection: {reason}"),
        }
    }

    #[test]
    fn test_can_open_rejects_duplicate_product() {
        let rm = manager();
        let btc = ProductId::new("BTC-USD");
        let snapshot = PortfolioSnapshot {
            equity: Money::from_i64(10_000),
            open_products: vec![btc.clone()],
            total_exposure: Money::from_i64(1_000),
            halted: false,
        };
        let decision = rm.can_open(&btc, Money::from_i64(100), &snapshot);
        assert!(matches!(decision, EntryDecision::Rejected(r) if r.contains("already open")));
    }

    #[test]
    fn test_can_open_rejects_at_concurrent_cap() {
        let rm = manager();
        let snapshot = PortfolioSnapshot {
            equity: Money::from_i64(10_000),
            open_products: (0..5).map(|i| ProductId::new(format!("P{i}-USD"))).collect(),
            total_exposure: Money::from_i64(1_000),
            halted: false,
        };
        let decision = rm.can_open(
            &ProductId::new("NEW-USD"),
            Money::from_i64(100),
            &snapshot,
        );
        assert!(matches!(decision, EntryDecision::Rejected(r) if r.contains("cap")));
    }

    #[test]
    fn test_can_open_rejects_excess_exposure() {
        let rm = manager();
        let snapshot = PortfolioSnapshot {
            equity: Money::from_i64(10_000),
            open_products: vec![ProductId::new("ETH-USD")],
            total_exposure: Money::from_i64(4_900),
            halted: false,
        };
        // cap = 50% of 10k = 5000; 4900 + 200 > 5000
        let decision = rm.can_open(
            &ProductId::new("BTC-USD"),
            Money::from_i64(200),
            &snapshot,
        );
        assert!(matches!(decision, EntryDecision::Rejected(r) if r.contains("exposure")));
    }

    #[test]
    fn test_can_open_rejects_during_halt() {
        let rm = manager();
        let snapshot = PortfolioSnapshot {
            equity: Money::from_i64(10_000),
            open_products: vec![],
            total_exposure: Money::ZERO,
            halted: true,
        };
        let decision = rm.can_open(&ProductId::new("BTC-USD"), Money::from_i64(100), &snapshot);
        assert!(matches!(decision, EntryDecision::Rejected(r) if r.contains("halt")));
    }

    #[test]
    fn test_drawdown_halt_and_release() {
        let rm = manager();
        let mut state = DrawdownState::new(Money::from_i64(10_000));

        assert_eq!(
            rm.update_drawdown(&mut state, Money::from_i64(9_500)),
            DrawdownEvent::None
        );
        assert_eq!(
            rm.update_drawdown(&mut state, Money::from_i64(8_800)),
            DrawdownEvent::None
        );
        // 8400 / 10000 → 16% drawdown ≥ 15%
        assert_eq!(
            rm.update_drawdown(&mut state, Money::from_i64(8_400)),
            DrawdownEvent::Halted
        );
        assert!(state.halted);

        // Still under the 95% release level
        assert_eq!(
            rm.update_drawdown(&mut state, Money::from_i64(9_000)),
            DrawdownEvent::None
        );
        assert!(state.halted);

        // 9600 ≥ 9500 → released
        assert_eq!(
            rm.update_drawdown(&mut state, Money::from_i64(9_600)),
            DrawdownEvent::Released
        );
        assert!(!state.halted);
    }

    #[test]
    fn test_drawdown_peak_tracks_new_highs() {
        let rm = manager();
        let mut state = DrawdownState::new(Money::from_i64(10_000));
        rm.update_drawdown(&mut state, Money::from_i64(12_000));
        assert_eq!(state.peak_equity, Money::from_i64(12_000));
        // 16% down from the new peak triggers the halt
        assert_eq!(
            rm.update_drawdown(&mut state, Money::from_i64(10_000)),
            DrawdownEvent::Halted
        );
    }
}
