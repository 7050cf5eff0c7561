//! Exchange wire types
//!
//! DTOs for the REST and WebSocket planes. Prices and sizes arrive as
//! decimal strings and are converted to `Money` at this boundary.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::{Money, Product, ProductId};

/// Error taxonomy for every gateway call.
///
/// Transient and RateLimited are retried with jittered backoff up to a cap;
/// the rest surface immediately.
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("transient exchange error: {0}")]
    Transient(String),

    #[error("rate limited by exchange: {0}")]
    RateLimited(String),

    #[error("authentication failed: {0}")]
    Auth(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("not found: {0}")]
    NotFound(String),
}

impl GatewayError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, GatewayError::Transient(_) | GatewayError::RateLimited(_))
    }
}

/// Account balance for one currency
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Account {
    pub currency: String,
    pub available_balance: AmountField,
    pub hold: AmountField,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AmountField {
    pub value: String,
    pub currency: String,
}

impl Account {
    pub fn available(&self) -> Money {
        Money::parse(&self.available_balance.value).unwrap_or(Money::ZERO)
    }
}

/// Product metadata as the exchange reports it
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProductWire {
    pub product_id: String,
    pub base_currency_id: String,
    pub quote_currency_id: String,
    pub base_increment: String,
    pub quote_increment: String,
    pub base_min_size: String,
    pub min_market_funds: String,
    #[serde(default)]
    pub view_only: bool,
    #[serde(default)]
    pub trading_disabled: bool,
    #[serde(default)]
    pub price: Option<String>,
    #[serde(default)]
    pub approximate_quote_24h_volume: Option<String>,
}

impl ProductWire {
    pub fn into_product(self) -> Product {
        Product {
            id: ProductId::new(&self.product_id),
            base: self.base_currency_id,
            quote: self.quote_currency_id,
            base_increment: Money::parse(&self.base_increment).unwrap_or(Money::ZERO),
            quote_increment: Money::parse(&self.quote_increment).unwrap_or(Money::ZERO),
            min_base: Money::parse(&self.base_min_size).unwrap_or(Money::ZERO),
            min_quote: Money::parse(&self.min_market_funds).unwrap_or(Money::ZERO),
            view_only: self.view_only,
            trading_disabled: self.trading_disabled,
        }
    }

    pub fn quote_volume_24h(&self) -> Money {
        self.approximate_quote_24h_volume
            .as_deref()
            .and_then(Money::parse)
            .unwrap_or(Money::ZERO)
    }
}

/// One OHLCV bar on the wire: start is a unix timestamp in seconds
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CandleWire {
    pub start: String,
    pub low: String,
    pub high: String,
    pub open: String,
    pub close: String,
    pub volume: String,
}

/// Best bid/ask for a product
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BidAsk {
    pub product_id: String,
    pub bid: String,
    pub ask: String,
}

impl BidAsk {
    pub fn bid_money(&self) -> Money {
        Money::parse(&self.bid).unwrap_or(Money::ZERO)
    }

    pub fn ask_money(&self) -> Money {
        Money::parse(&self.ask).unwrap_or(Money::ZERO)
    }

    /// `(ask - bid) / mid`, the pre-trade gate quantity.
    pub fn spread_pct(&self) -> f64 {
        let bid = self.bid_money().to_f64();
        let ask = self.ask_money().to_f64();
        let mid = (bid + ask) / 2.0;
        if mid <= 0.0 {
            return f64::MAX;
        }
        (ask - bid) / mid
    }
}

/// Public market trade, used for volume-flow analysis
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarketTrade {
    pub trade_id: String,
    pub product_id: String,
    pub price: String,
    pub size: String,
    /// Aggressor side: "BUY" means the taker bought
    pub side: String,
    pub time: String,
}

/// Pre-trade cost estimate
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderPreview {
    pub order_total: String,
    pub commission_total: String,
    pub slippage: String,
}

impl OrderPreview {
    pub fn fee_pct(&self) -> f64 {
        let total = Money::parse(&self.order_total)
            .unwrap_or(Money::ZERO)
            .to_f64();
        let fee = Money::parse(&self.commission_total)
            .unwrap_or(Money::ZERO)
            .to_f64();
        if total <= 0.0 {
            return 0.0;
        }
        fee / total
    }

    pub fn slippage_pct(&self) -> f64 {
        Money::parse(&self.slippage).unwrap_or(Money::ZERO).to_f64()
    }
}

/// Request body for order placement
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlaceOrderRequest {
    pub client_order_id: String,
    pub product_id: String,
    pub side: String,
    pub order_configuration: OrderConfiguration,
}

/// Exchange order configuration variants
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderConfiguration {
    LimitLimitGtc {
        base_size: String,
        limit_price: String,
        post_only: bool,
    },
    MarketMarketIoc {
        base_size: String,
    },
    StopLimitStopLimitGtc {
        base_size: String,
        limit_price: String,
        stop_price: String,
        stop_direction: String,
    },
}

/// Acknowledgement returned by order placement
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderAck {
    pub order_id: String,
    pub client_order_id: String,
}

/// Current order state as the exchange reports it
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderStatusWire {
    pub order_id: String,
    pub client_order_id: String,
    /// OPEN | FILLED | CANCELLED | EXPIRED | FAILED | PENDING
    pub status: String,
    pub filled_size: String,
    pub average_filled_price: String,
}

impl OrderStatusWire {
    pub fn filled(&self) -> Money {
        Money::parse(&self.filled_size).unwrap_or(Money::ZERO)
    }
}

/// One fill as reported by the fills endpoint or the user channel
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FillWire {
    pub entry_id: String,
    pub order_id: String,
    pub price: String,
    pub size: String,
    pub commission: String,
    /// "MAKER" or "TAKER"
    pub liquidity_indicator: String,
    pub trade_time: String,
}

/// Fee tier summary
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransactionSummary {
    pub maker_fee_rate: String,
    pub taker_fee_rate: String,
}

/// API key capability report
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeyPermissions {
    pub can_view: bool,
    pub can_trade: bool,
}

/// Quote for a currency conversion
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConvertQuote {
    pub quote_id: String,
    pub from_currency: String,
    pub to_currency: String,
    pub amount: String,
    pub conversion_rate: String,
    pub fee: String,
}

/// Result of committing a conversion
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConvertTrade {
    pub trade_id: String,
    pub status: String,
}

// ---------------------------------------------------------------------------
// WebSocket messages
// ---------------------------------------------------------------------------

/// Outbound channel subscription
#[derive(Debug, Clone, Serialize)]
pub struct SubscribeMessage {
    #[serde(rename = "type")]
    pub msg_type: String,
    pub channel: String,
    pub product_ids: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub signature: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<String>,
}

/// Inbound WebSocket envelope
#[derive(Debug, Clone, Deserialize)]
pub struct WsEnvelope {
    #[serde(default)]
    pub channel: String,
    #[serde(default)]
    pub events: Vec<serde_json::Value>,
}

/// Ticker event payload
#[derive(Debug, Clone, Deserialize)]
pub struct TickerEvent {
    pub product_id: String,
    pub price: String,
}

/// Order update from the user channel
#[derive(Debug, Clone, Deserialize)]
pub struct UserOrderEvent {
    pub order_id: String,
    #[serde(default)]
    pub client_order_id: String,
    pub status: String,
    #[serde(default)]
    pub cumulative_quantity: String,
    #[serde(default)]
    pub avg_price: String,
}
