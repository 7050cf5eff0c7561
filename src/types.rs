//! Core data types used across the trading system

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Validation errors for candle data
#[derive(Debug, Error)]
pub enum CandleValidationError {
    #[error("high ({high}) must be >= low ({low})")]
    HighLessThanLow { high: f64, low: f64 },

    #[error("volume ({0}) must be >= 0")]
    NegativeVolume(f64),

    #[error("open ({open}) must be between low ({low}) and high ({high})")]
    OpenOutOfRange { open: f64, low: f64, high: f64 },

    #[error("close ({close}) must be between low ({low}) and high ({high})")]
    CloseOutOfRange { close: f64, low: f64, high: f64 },

    #[error("prices must be positive: open={open}, high={high}, low={low}, close={close}")]
    NonPositivePrice {
        open: f64,
        high: f64,
        low: f64,
        close: f64,
    },
}

/// OHLCV candlestick data
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Candle {
    pub start_time: DateTime<Utc>,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

impl Candle {
    /// Create a new candle with validation
    pub fn new(
        start_time: DateTime<Utc>,
        open: f64,
        high: f64,
        low: f64,
        close: f64,
        volume: f64,
    ) -> Result<Self, CandleValidationError> {
        let candle = Self {
            start_time,
            open,
            high,
            low,
            close,
            volume,
        };
        candle.validate()?;
        Ok(candle)
    }

    /// Validate the candle data
    pub fn validate(&self) -> Result<(), CandleValidationError> {
        if self.open <= 0.0 || self.high <= 0.0 || self.low <= 0.0 || self.close <= 0.0 {
            return Err(CandleValidationError::NonPositivePrice {
                open: self.open,
                high: self.high,
                low: self.low,
                close: self.close,
            });
        }

        if self.high < self.low {
            return Err(CandleValidationError::HighLessThanLow {
                high: self.high,
                low: self.low,
            });
        }

        if self.volume < 0.0 {
            return Err(CandleValidationError::NegativeVolume(self.volume));
        }

        if self.open < self.low || self.open > self.high {
            return Err(CandleValidationError::OpenOutOfRange {
                open: self.open,
                low: self.low,
                high: self.high,
            });
        }

        if self.close < self.low || self.close > self.high {
            return Err(CandleValidationError::CloseOutOfRange {
                close: self.close,
                low: self.low,
                high: self.high,
            });
        }

        Ok(())
    }

    pub fn is_valid(&self) -> bool {
        self.validate().is_ok()
    }
}

/// Product identifier (e.g. "BTC-USD") using Arc<str> for cheap cloning
///
/// Product ids are cloned on every order, fill, and position they touch.
/// Arc<str> keeps those clones at O(1) instead of re-allocating the string.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProductId(#[serde(with = "arc_str_serde")] std::sync::Arc<str>);

/// Custom serde for Arc<str>
mod arc_str_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::sync::Arc;

    pub fn serialize<S>(value: &Arc<str>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(value)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Arc<str>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Ok(Arc::from(s.as_str()))
    }
}

impl ProductId {
    pub fn new(s: impl AsRef<str>) -> Self {
        ProductId(std::sync::Arc::from(s.as_ref()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ProductId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Tradable product metadata, refreshed once at startup
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Product {
    pub id: ProductId,
    pub base: String,
    pub quote: String,
    pub base_increment: Money,
    pub quote_increment: Money,
    pub min_base: Money,
    pub min_quote: Money,
    pub view_only: bool,
    pub trading_disabled: bool,
}

impl Product {
    /// A product is tradable iff it is not view-only, not disabled, and
    /// its minimum order value fits under the configured floor.
    pub fn is_tradable(&self, min_quote_floor: Money) -> bool {
        !self.view_only && !self.trading_disabled && self.min_quote <= min_quote_floor
    }

    /// One price tick for this product.
    pub fn one_tick(&self) -> Money {
        self.quote_increment
    }
}

/// Trade direction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    pub fn as_str(&self) -> &'static str {
        match self {
            Side::Buy => "BUY",
            Side::Sell => "SELL",
        }
    }
}

/// What a strategy wants done about a product right now
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SignalAction {
    Buy,
    Sell,
    Hold,
}

impl std::fmt::Display for SignalAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SignalAction::Buy => write!(f, "BUY"),
            SignalAction::Sell => write!(f, "SELL"),
            SignalAction::Hold => write!(f, "HOLD"),
        }
    }
}

/// Confidence-scored strategy output. Pure value; never persisted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Signal {
    pub action: SignalAction,
    pub confidence: f64,
    pub reasons: Vec<String>,
    pub produced_at: DateTime<Utc>,
}

impl Signal {
    pub fn hold(reason: impl Into<String>) -> Self {
        Signal {
            action: SignalAction::Hold,
            confidence: 0.0,
            reasons: vec![reason.into()],
            produced_at: Utc::now(),
        }
    }

    pub fn new(action: SignalAction, confidence: f64, reasons: Vec<String>) -> Self {
        Signal {
            action,
            confidence: confidence.clamp(0.0, 1.0),
            reasons,
            produced_at: Utc::now(),
        }
    }
}

/// Order kinds supported by the exchange
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderKind {
    /// Limit GTC with post-only flag; rests on the book for the maker rebate
    LimitGtcPostOnly,
    /// Market order, crosses the book
    Market,
    /// Stop-limit sell protecting a position
    StopLimit,
    /// Take-profit limit sell
    TakeProfitLimit,
}

impl OrderKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderKind::LimitGtcPostOnly => "limit_gtc_post_only",
            OrderKind::Market => "market",
            OrderKind::StopLimit => "stop_limit",
            OrderKind::TakeProfitLimit => "take_profit_limit",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "limit_gtc_post_only" => Some(OrderKind::LimitGtcPostOnly),
            "market" => Some(OrderKind::Market),
            "stop_limit" => Some(OrderKind::StopLimit),
            "take_profit_limit" => Some(OrderKind::TakeProfitLimit),
            _ => None,
        }
    }
}

/// Order state machine
///
/// `Cancelling` is the one non-terminal state the reconciler owns: a cancel
/// was issued but never verified, so the order must not be considered gone.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderStatus {
    Submitted,
    Open,
    PartiallyFilled,
    Cancelling,
    Filled,
    Cancelled,
    Expired,
    Rejected,
}

impl OrderStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            OrderStatus::Filled
                | OrderStatus::Cancelled
                | OrderStatus::Expired
                | OrderStatus::Rejected
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            OrderStatus::Submitted => "submitted",
            OrderStatus::Open => "open",
            OrderStatus::PartiallyFilled => "partially_filled",
            OrderStatus::Cancelling => "cancelling",
            OrderStatus::Filled => "filled",
            OrderStatus::Cancelled => "cancelled",
            OrderStatus::Expired => "expired",
            OrderStatus::Rejected => "rejected",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "submitted" => Some(OrderStatus::Submitted),
            "open" => Some(OrderStatus::Open),
            "partially_filled" => Some(OrderStatus::PartiallyFilled),
            "cancelling" => Some(OrderStatus::Cancelling),
            "filled" => Some(OrderStatus::Filled),
            "cancelled" => Some(OrderStatus::Cancelled),
            "expired" => Some(OrderStatus::Expired),
            "rejected" => Some(OrderStatus::Rejected),
            _ => None,
        }
    }
}

/// Role an order plays relative to a position
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderRole {
    Entry,
    Exit,
    Stop,
    TakeProfit,
}

impl OrderRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderRole::Entry => "entry",
            OrderRole::Exit => "exit",
            OrderRole::Stop => "stop",
            OrderRole::TakeProfit => "take_profit",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "entry" => Some(OrderRole::Entry),
            "exit" => Some(OrderRole::Exit),
            "stop" => Some(OrderRole::Stop),
            "take_profit" => Some(OrderRole::TakeProfit),
            _ => None,
        }
    }
}

/// Locally tracked order. The `client_id` is generated before anything is
/// sent to the exchange and is the idempotency key on both sides.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Order {
    pub client_id: Uuid,
    pub exchange_id: Option<String>,
    pub product: ProductId,
    pub side: Side,
    pub kind: OrderKind,
    pub role: OrderRole,
    pub requested_price: Option<Money>,
    pub requested_size: Money,
    pub stop_price: Option<Money>,
    pub limit_price: Option<Money>,
    pub status: OrderStatus,
    pub filled_size: Money,
    pub avg_fill_price: Money,
    pub submitted_at: DateTime<Utc>,
    pub terminal_at: Option<DateTime<Utc>>,
    pub position_id: Option<i64>,
    pub metadata: serde_json::Value,
}

impl Order {
    /// Create a freshly submitted order with a new client id.
    pub fn new(
        product: ProductId,
        side: Side,
        kind: OrderKind,
        role: OrderRole,
        requested_size: Money,
    ) -> Self {
        Order {
            client_id: Uuid::new_v4(),
            exchange_id: None,
            product,
            side,
            kind,
            role,
            requested_price: None,
            requested_size,
            stop_price: None,
            limit_price: None,
            status: OrderStatus::Submitted,
            filled_size: Money::ZERO,
            avg_fill_price: Money::ZERO,
            submitted_at: Utc::now(),
            terminal_at: None,
            position_id: None,
            metadata: serde_json::Value::Null,
        }
    }

    pub fn with_limit_price(mut self, price: Money) -> Self {
        self.requested_price = Some(price);
        self.limit_price = Some(price);
        self
    }

    pub fn with_stop(mut self, stop: Money, limit: Money) -> Self {
        self.stop_price = Some(stop);
        self.limit_price = Some(limit);
        self
    }

    pub fn with_position(mut self, position_id: i64) -> Self {
        self.position_id = Some(position_id);
        self
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    pub fn age(&self, now: DateTime<Utc>) -> chrono::Duration {
        now - self.submitted_at
    }
}

/// Individual fill, append-only per order. `fill_id` is the exchange's
/// identifier and is authoritative for ordering.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Fill {
    pub fill_id: String,
    pub order_client_id: Uuid,
    pub price: Money,
    pub size: Money,
    pub fee: Money,
    pub liquidity: Liquidity,
    pub time: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Liquidity {
    Maker,
    Taker,
}

impl Liquidity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Liquidity::Maker => "MAKER",
            Liquidity::Taker => "TAKER",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "MAKER" | "M" | "maker" => Liquidity::Maker,
            _ => Liquidity::Taker,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PositionStatus {
    Open,
    Closed,
}

impl PositionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PositionStatus::Open => "open",
            PositionStatus::Closed => "closed",
        }
    }
}

/// An open or closed long position, assembled by the store from its
/// orders and fills. Bracket orders are referenced by client id, never by
/// direct object reference.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Position {
    pub id: i64,
    pub product: ProductId,
    pub status: PositionStatus,
    pub opened_at: DateTime<Utc>,
    pub closed_at: Option<DateTime<Utc>>,
    pub entry_fills: Vec<Fill>,
    pub exit_fills: Vec<Fill>,
    pub stop_order_id: Option<Uuid>,
    pub take_profit_order_id: Option<Uuid>,
    /// Set when bracket installation failed; the monitor treats these as
    /// urgent exit candidates on any adverse signal.
    pub unprotected: bool,
}

impl Position {
    /// Total base size acquired by entry fills.
    pub fn size(&self) -> Money {
        self.entry_fills.iter().map(|f| f.size).sum()
    }

    /// Fee-inclusive average entry price over entry fills only:
    /// `(Σ(price·size) + Σfee) / Σsize`.
    ///
    /// Always recomputed from fills: partial fills and fees must be
    /// re-aggregated before any exit decision.
    pub fn cost_basis(&self) -> Money {
        let size: Money = self.entry_fills.iter().map(|f| f.size).sum();
        if size.is_zero() {
            return Money::ZERO;
        }
        let notional: Money = self.entry_fills.iter().map(|f| f.price * f.size).sum();
        let fees: Money = self.entry_fills.iter().map(|f| f.fee).sum();
        (notional + fees) / size
    }

    pub fn total_entry_fees(&self) -> Money {
        self.entry_fills.iter().map(|f| f.fee).sum()
    }
}

/// Reason a position was exited
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExitReason {
    SignalProfitExit,
    SignalLossExit,
    StopTriggered,
    TpTriggered,
    Manual,
}

impl ExitReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExitReason::SignalProfitExit => "signal_profit_exit",
            ExitReason::SignalLossExit => "signal_loss_exit",
            ExitReason::StopTriggered => "stop_triggered",
            ExitReason::TpTriggered => "tp_triggered",
            ExitReason::Manual => "manual",
        }
    }
}

impl std::fmt::Display for ExitReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Completed round trip, materialized when a position closes
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradeRecord {
    pub id: Option<i64>,
    pub product: ProductId,
    pub entry_time: DateTime<Utc>,
    pub exit_time: DateTime<Utc>,
    pub avg_entry: Money,
    pub avg_exit: Money,
    pub size: Money,
    pub gross_pnl: Money,
    pub fees: Money,
    pub net_pnl: Money,
    pub pnl_pct: f64,
    pub strategy: String,
    pub exit_reason: String,
}

/// Periodic account valuation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EquitySnapshot {
    pub time: DateTime<Utc>,
    pub cash_quote: Money,
    pub positions_value_quote: Money,
    pub total_quote: Money,
    pub open_positions_count: usize,
}

// ============================================================================
// Money Type - Precise Decimal Arithmetic for Monetary Values
// ============================================================================

use rust_decimal::Decimal;
use std::cmp::Ordering;
use std::fmt;
use std::ops::{Add, AddAssign, Div, Mul, Neg, Sub, SubAssign};

/// Money type for precise decimal arithmetic in monetary calculations.
///
/// Wraps `rust_decimal::Decimal` to prevent floating-point drift in PnL
/// tracking. Use this type for all monetary values: prices, sizes, fees,
/// balances.
///
/// # Why Money instead of f64?
/// `0.1 + 0.2 != 0.3` in f64. Over thousands of trades, PnL tracking will
/// drift from exchange balances, causing reconciliation failures.
#[derive(Debug, Clone, Copy, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Money(#[serde(with = "rust_decimal::serde::str")] Decimal);

impl Money {
    pub const ZERO: Money = Money(Decimal::ZERO);
    pub const ONE: Money = Money(Decimal::ONE);

    /// Create from f64 (indicator outputs, config fractions)
    /// Note: conversion may lose precision for values with many decimal places
    pub fn from_f64(value: f64) -> Self {
        Money(Decimal::try_from(value).unwrap_or_else(|_| {
            if value.is_nan() || value.is_infinite() {
                Decimal::ZERO
            } else {
                Decimal::from_f64_retain(value).unwrap_or(Decimal::ZERO)
            }
        }))
    }

    /// Convert to f64 (for indicator calculations that require f64)
    pub fn to_f64(self) -> f64 {
        use rust_decimal::prelude::ToPrimitive;
        self.0.to_f64().unwrap_or(0.0)
    }

    pub fn from_i64(value: i64) -> Self {
        Money(Decimal::from(value))
    }

    /// Parse from an exchange decimal string
    pub fn parse(s: &str) -> Option<Self> {
        s.parse::<Decimal>().ok().map(Money)
    }

    pub fn abs(self) -> Self {
        Money(self.0.abs())
    }

    pub fn is_zero(self) -> bool {
        self.0.is_zero()
    }

    pub fn is_positive(self) -> bool {
        self.0.is_sign_positive() && !self.0.is_zero()
    }

    pub fn is_negative(self) -> bool {
        self.0.is_sign_negative()
    }

    pub fn max(self, other: Self) -> Self {
        Money(self.0.max(other.0))
    }

    pub fn min(self, other: Self) -> Self {
        Money(self.0.min(other.0))
    }

    /// Round to specified decimal places (banker's rounding)
    pub fn round_dp(self, dp: u32) -> Self {
        Money(self.0.round_dp(dp))
    }

    /// Clamp a value down to a whole multiple of `increment`.
    ///
    /// This is the single conversion point at the exchange boundary: every
    /// price goes through `quantize(quote_increment)` and every size through
    /// `quantize(base_increment)` before it is sent.
    pub fn quantize(self, increment: Money) -> Self {
        if increment.0.is_zero() {
            return self;
        }
        let steps = (self.0 / increment.0).trunc();
        Money(steps * increment.0)
    }

    pub fn inner(self) -> Decimal {
        self.0
    }
}

impl Default for Money {
    fn default() -> Self {
        Self::ZERO
    }
}

impl fmt::Display for Money {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl PartialEq for Money {
    fn eq(&self, other: &Self) -> bool {
        self.0 == other.0
    }
}

impl PartialOrd for Money {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Money {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0.cmp(&other.0)
    }
}

impl std::hash::Hash for Money {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.0.hash(state);
    }
}

impl Add for Money {
    type Output = Self;
    fn add(self, rhs: Self) -> Self::Output {
        Money(self.0 + rhs.0)
    }
}

impl AddAssign for Money {
    fn add_assign(&mut self, rhs: Self) {
        self.0 += rhs.0;
    }
}

impl Sub for Money {
    type Output = Self;
    fn sub(self, rhs: Self) -> Self::Output {
        Money(self.0 - rhs.0)
    }
}

impl SubAssign for Money {
    fn sub_assign(&mut self, rhs: Self) {
        self.0 -= rhs.0;
    }
}

impl Mul for Money {
    type Output = Self;
    fn mul(self, rhs: Self) -> Self::Output {
        Money(self.0 * rhs.0)
    }
}

impl Div for Money {
    type Output = Self;
    fn div(self, rhs: Self) -> Self::Output {
        if rhs.0.is_zero() {
            Money::ZERO
        } else {
            Money(self.0 / rhs.0)
        }
    }
}

impl Neg for Money {
    type Output = Self;
    fn neg(self) -> Self::Output {
        Money(-self.0)
    }
}

impl From<f64> for Money {
    fn from(value: f64) -> Self {
        Money::from_f64(value)
    }
}

impl From<Money> for f64 {
    fn from(value: Money) -> Self {
        value.to_f64()
    }
}

impl From<i64> for Money {
    fn from(value: i64) -> Self {
        Money::from_i64(value)
    }
}

impl std::iter::Sum for Money {
    fn sum<I: Iterator<Item = Self>>(iter: I) -> Self {
        iter.fold(Money::ZERO, |acc, x| acc + x)
    }
}

impl<'a> std::iter::Sum<&'a Money> for Money {
    fn sum<I: Iterator<Item = &'a Self>>(iter: I) -> Self {
        iter.fold(Money::ZERO, |acc, x| acc + *x)
    }
}
