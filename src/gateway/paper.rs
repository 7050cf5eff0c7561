//! Paper-trading order simulator
//!
//! When paper mode is on, the gateway routes order endpoints here instead
//! of the exchange. Fills are synthesized at the requested limit price
//! (or the latest streamed price for market orders) after a short delay,
//! so the fill-wait and reconciliation paths exercise exactly the same
//! code as live trading. No other component branches on paper mode.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use parking_lot::Mutex;
use tracing::info;
use uuid::Uuid;

use super::stream::PriceCache;
use super::types::{
    FillWire, GatewayError, OrderAck, OrderConfiguration, OrderPreview, OrderStatusWire,
    PlaceOrderRequest,
};
use crate::types::{Money, ProductId};

/// Delay before a simulated order fills
const FILL_DELAY: Duration = Duration::from_secs(2);

struct PaperOrder {
    request: PlaceOrderRequest,
    placed_at: Instant,
    cancelled: bool,
}

impl PaperOrder {
    fn base_size(&self) -> Money {
        let size = match &self.request.order_configuration {
            OrderConfiguration::LimitLimitGtc { base_size, .. } => base_size,
            OrderConfiguration::MarketMarketIoc { base_size } => base_size,
            OrderConfiguration::StopLimitStopLimitGtc { base_size, .. } => base_size,
        };
        Money::parse(size).unwrap_or(Money::ZERO)
    }

    fn limit_price(&self) -> Option<Money> {
        match &self.request.order_configuration {
            OrderConfiguration::LimitLimitGtc { limit_price, .. } => Money::parse(limit_price),
            OrderConfiguration::StopLimitStopLimitGtc { limit_price, .. } => {
                Money::parse(limit_price)
            }
            OrderConfiguration::MarketMarketIoc { .. } => None,
        }
    }

    fn is_market(&self) -> bool {
        matches!(
            self.request.order_configuration,
            OrderConfiguration::MarketMarketIoc { .. }
        )
    }

    /// Bracket-style orders rest until their trigger and never self-fill
    /// in the simulator: stop-limits, and sell limits (take-profits).
    /// The monitor exits positions before that matters.
    fn is_resting(&self) -> bool {
        match &self.request.order_configuration {
            OrderConfiguration::StopLimitStopLimitGtc { .. } => true,
            OrderConfiguration::LimitLimitGtc { .. } => {
                self.request.side.eq_ignore_ascii_case("SELL")
            }
            OrderConfiguration::MarketMarketIoc { .. } => false,
        }
    }

    fn is_filled(&self) -> bool {
        !self.cancelled && !self.is_resting() && self.placed_at.elapsed() >= FILL_DELAY
    }
}

pub struct PaperEngine {
    orders: Mutex<HashMap<String, PaperOrder>>,
    price_cache: Arc<PriceCache>,
    maker_fee: Money,
    taker_fee: Money,
}

impl PaperEngine {
    pub fn new(price_cache: Arc<PriceCache>, maker_fee: f64, taker_fee: f64) -> Self {
        Self {
            orders: Mutex::new(HashMap::new()),
            price_cache,
            maker_fee: Money::from_f64(maker_fee),
            taker_fee: Money::from_f64(taker_fee),
        }
    }

    pub fn place_order(&self, request: &PlaceOrderRequest) -> Result<OrderAck, GatewayError> {
        let exchange_id = format!("paper-{}", Uuid::new_v4());
        let ack = OrderAck {
            order_id: exchange_id.clone(),
            client_order_id: request.client_order_id.clone(),
        };

        info!(
            product = %request.product_id,
            side = %request.side,
            exchange_id = %exchange_id,
            "[PAPER] order accepted"
        );

        self.orders.lock().insert(
            exchange_id,
            PaperOrder {
                request: request.clone(),
                placed_at: Instant::now(),
                cancelled: false,
            },
        );
        Ok(ack)
    }

    pub fn preview_order(&self, request: &PlaceOrderRequest) -> OrderPreview {
        let paper = PaperOrder {
            request: request.clone(),
            placed_at: Instant::now(),
            cancelled: false,
        };
        let price = self.fill_price(&paper).unwrap_or(Money::ZERO);
        let total = price * paper.base_size();
        let rate = if paper.is_market() {
            self.taker_fee
        } else {
            self.maker_fee
        };

        OrderPreview {
            order_total: total.to_string(),
            commission_total: (total * rate).to_string(),
            slippage: "0".to_string(),
        }
    }

    pub fn get_order(&self, exchange_id: &str) -> Result<OrderStatusWire, GatewayError> {
        let orders = self.orders.lock();
        let order = orders
            .get(exchange_id)
            .ok_or_else(|| GatewayError::NotFound(format!("paper order {exchange_id}")))?;

        let (status, filled, avg) = if order.cancelled {
            ("CANCELLED", Money::ZERO, Money::ZERO)
        } else if order.is_filled() {
            let price = self.fill_price(order).unwrap_or(Money::ZERO);
            ("FILLED", order.base_size(), price)
        } else {
            ("OPEN", Money::ZERO, Money::ZERO)
        };

        Ok(OrderStatusWire {
            order_id: exchange_id.to_string(),
            client_order_id: order.request.client_order_id.clone(),
            status: status.to_string(),
            filled_size: filled.to_string(),
            average_filled_price: avg.to_string(),
        })
    }

    pub fn cancel_order(&self, exchange_id: &str) -> Result<(), GatewayError> {
        let mut orders = self.orders.lock();
        let order = orders
            .get_mut(exchange_id)
            .ok_or_else(|| GatewayError::NotFound(format!("paper order {exchange_id}")))?;

        if order.is_filled() {
            return Err(GatewayError::InvalidRequest(format!(
                "paper order {exchange_id} already filled"
            )));
        }
        order.cancelled = true;
        info!(exchange_id = %exchange_id, "[PAPER] order cancelled");
        Ok(())
    }

    pub fn get_fills(&self, exchange_id: &str) -> Result<Vec<FillWire>, GatewayError> {
        let orders = self.orders.lock();
        let order = orders
            .get(exchange_id)
            .ok_or_else(|| GatewayError::NotFound(format!("paper order {exchange_id}")))?;

        if !order.is_filled() {
            return Ok(Vec::new());
        }

        let price = self.fill_price(order).unwrap_or(Money::ZERO);
        let size = order.base_size();
        let rate = if order.is_market() {
            self.taker_fee
        } else {
            self.maker_fee
        };
        let fee = price * size * rate;
        let liquidity = if order.is_market() { "TAKER" } else { "MAKER" };

        Ok(vec![FillWire {
            entry_id: format!("{exchange_id}-fill"),
            order_id: exchange_id.to_string(),
            price: price.to_string(),
            size: size.to_string(),
            commission: fee.to_string(),
            liquidity_indicator: liquidity.to_string(),
            trade_time: Utc::now().to_rfc3339(),
        }])
    }

    fn fill_price(&self, order: &PaperOrder) -> Option<Money> {
        if let Some(limit) = order.limit_price() {
            return Some(limit);
        }
        let product = ProductId::new(&order.request.product_id);
        self.price_cache.get(&product).map(|tick| tick.price)
    }
}
