//! Exchange Gateway
//!
//! Typed wrapper over the exchange REST + WebSocket APIs. The facade owns
//! the single paper/live switch: when paper mode is on, order endpoints
//! are simulated by `PaperEngine` while market data stays real, and no
//! other component in the system branches on the mode.

pub mod auth;
pub mod limits;
pub mod paper;
pub mod rest;
pub mod stream;
pub mod types;

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::config::Config;
use crate::types::{Candle, Money, Product, ProductId};

pub use auth::Credentials;
pub use limits::{EndpointClass, RateBudget};
pub use paper::PaperEngine;
pub use rest::{RestClient, RestConfig};
pub use stream::{MarketStream, OrderUpdate, PriceCache, PriceTick, StreamEvent};
pub use types::*;

/// Aggregated aggressor-side volume over recent trades
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VolumeFlow {
    pub buy_volume: f64,
    pub sell_volume: f64,
    /// Share of quote volume on the aggressor-buy side, in [0, 1]
    pub buy_pressure: f64,
    pub net_pressure: NetPressure,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NetPressure {
    StrongBuy,
    ModerateBuy,
    Neutral,
    ModerateSell,
    StrongSell,
}

impl NetPressure {
    fn from_pressure(p: f64) -> Self {
        if p >= 0.60 {
            NetPressure::StrongBuy
        } else if p >= 0.52 {
            NetPressure::ModerateBuy
        } else if p > 0.48 {
            NetPressure::Neutral
        } else if p > 0.40 {
            NetPressure::ModerateSell
        } else {
            NetPressure::StrongSell
        }
    }
}

/// Facade over the REST plane, the streaming plane, and the paper switch.
pub struct ExchangeGateway {
    rest: RestClient,
    credentials: Credentials,
    paper: Option<PaperEngine>,
    price_cache: Arc<PriceCache>,
    max_price_staleness_seconds: i64,
}

impl ExchangeGateway {
    pub fn new(credentials: Credentials, config: &Config) -> Self {
        let rest_config = RestConfig {
            timeout: Duration::from_secs(config.exchange.request_timeout_secs),
            public_rate_limit: config.exchange.public_rate_limit,
            private_rate_limit: config.exchange.private_rate_limit,
            ..RestConfig::default()
        };
        let rest = RestClient::new(credentials.clone(), rest_config);
        let price_cache = Arc::new(PriceCache::new());

        let paper = if config.trading.paper_trading_mode {
            info!("Paper trading mode: order placement will be simulated");
            Some(PaperEngine::new(
                Arc::clone(&price_cache),
                config.exchange.maker_fee,
                config.exchange.taker_fee,
            ))
        } else {
            None
        };

        Self {
            rest,
            credentials,
            paper,
            price_cache,
            max_price_staleness_seconds: config.trading.max_price_staleness_seconds as i64,
        }
    }

    pub fn is_paper(&self) -> bool {
        self.paper.is_some()
    }

    pub fn price_cache(&self) -> Arc<PriceCache> {
        Arc::clone(&self.price_cache)
    }

    /// Spawn the streaming task for the given products. Returns the event
    /// receiver (order updates + reconnect notifications) and the task
    /// handle for shutdown joining.
    pub fn spawn_stream(
        &self,
        products: Vec<ProductId>,
        shutdown: watch::Receiver<bool>,
    ) -> (mpsc::Receiver<StreamEvent>, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(256);
        let stream = MarketStream::new(
            self.credentials.clone(),
            products,
            Arc::clone(&self.price_cache),
            tx,
        );
        let handle = tokio::spawn(stream.run(shutdown));
        (rx, handle)
    }

    // ==================== MARKET DATA (always real) ====================

    pub async fn get_accounts(&self) -> Result<Vec<Account>, GatewayError> {
        self.rest.get_accounts().await
    }

    pub async fn list_products(&self) -> Result<Vec<ProductWire>, GatewayError> {
        self.rest.list_products().await
    }

    /// Tradable products converted to the domain type.
    pub async fn tradable_products(
        &self,
        min_quote_floor: Money,
    ) -> Result<Vec<(Product, Money)>, GatewayError> {
        let wires = self.rest.list_products().await?;
        Ok(wires
            .into_iter()
            .map(|w| {
                let volume = w.quote_volume_24h();
                (w.into_product(), volume)
            })
            .filter(|(p, _)| p.is_tradable(min_quote_floor))
            .collect())
    }

    pub async fn get_candles(
        &self,
        product: &ProductId,
        granularity: &str,
        limit: usize,
    ) -> Result<Vec<Candle>, GatewayError> {
        self.rest
            .get_candles(product, granularity, None, None, limit)
            .await
    }

    pub async fn get_best_bid_ask(
        &self,
        products: &[ProductId],
    ) -> Result<Vec<BidAsk>, GatewayError> {
        self.rest.get_best_bid_ask(products).await
    }

    pub async fn best_bid_ask(&self, product: &ProductId) -> Result<BidAsk, GatewayError> {
        let quotes = self
            .rest
            .get_best_bid_ask(std::slice::from_ref(product))
            .await?;
        quotes
            .into_iter()
            .find(|q| q.product_id == product.as_str())
            .ok_or_else(|| GatewayError::NotFound(format!("no pricebook for {product}")))
    }

    pub async fn get_recent_trades(
        &self,
        product: &ProductId,
        limit: usize,
    ) -> Result<Vec<MarketTrade>, GatewayError> {
        self.rest.get_recent_trades(product, limit).await
    }

    /// Best-effort last trade price: the streaming cache while fresh,
    /// falling back to a REST bid/ask midpoint past the staleness window.
    pub async fn last_price(&self, product: &ProductId) -> Result<Money, GatewayError> {
        if let Some(price) = self
            .price_cache
            .get_fresh(product, self.max_price_staleness_seconds)
        {
            return Ok(price);
        }

        debug!(product = %product, "Streaming price stale, falling back to REST");
        let quote = self.best_bid_ask(product).await?;
        let mid = (quote.bid_money() + quote.ask_money()) / Money::from_i64(2);
        Ok(mid)
    }

    /// Classify recent aggressor-side volume into a pressure bucket.
    pub async fn analyze_volume_flow(
        &self,
        product: &ProductId,
        lookback: usize,
    ) -> Result<VolumeFlow, GatewayError> {
        let trades = self.rest.get_recent_trades(product, lookback).await?;

        let mut buy_volume = 0.0;
        let mut sell_volume = 0.0;
        for trade in &trades {
            let price: f64 = trade.price.parse().unwrap_or(0.0);
            let size: f64 = trade.size.parse().unwrap_or(0.0);
            let notional = price * size;
            if trade.side.eq_ignore_ascii_case("BUY") {
                buy_volume += notional;
            } else {
                sell_volume += notional;
            }
        }

        let total = buy_volume + sell_volume;
        let buy_pressure = if total > 0.0 {
            buy_volume / total
        } else {
            0.5
        };

        Ok(VolumeFlow {
            buy_volume,
            sell_volume,
            buy_pressure,
            net_pressure: NetPressure::from_pressure(buy_pressure),
        })
    }

    // ==================== ORDERS (paper switch lives here) ====================

    pub async fn preview_order(
        &self,
        request: &PlaceOrderRequest,
    ) -> Result<OrderPreview, GatewayError> {
        match &self.paper {
            Some(paper) => Ok(paper.preview_order(request)),
            None => self.rest.preview_order(request).await,
        }
    }

    pub async fn place_order(
        &self,
        request: &PlaceOrderRequest,
    ) -> Result<OrderAck, GatewayError> {
        match &self.paper {
            Some(paper) => paper.place_order(request),
            None => self.rest.place_order(request).await,
        }
    }

    pub async fn cancel_order(&self, exchange_id: &str) -> Result<(), GatewayError> {
        match &self.paper {
            Some(paper) => paper.cancel_order(exchange_id),
            None => self.rest.cancel_order(exchange_id).await,
        }
    }

    pub async fn get_order(&self, exchange_id: &str) -> Result<OrderStatusWire, GatewayError> {
        match &self.paper {
            Some(paper) => paper.get_order(exchange_id),
            None => self.rest.get_order(exchange_id).await,
        }
    }

    pub async fn get_fills(
        &self,
        exchange_order_id: &str,
    ) -> Result<Vec<FillWire>, GatewayError> {
        match &self.paper {
            Some(paper) => paper.get_fills(exchange_order_id),
            None => self.rest.get_fills(Some(exchange_order_id), None).await,
        }
    }

    // ==================== ACCOUNT META & CONVERT ====================

    pub async fn get_transaction_summary(&self) -> Result<TransactionSummary, GatewayError> {
        self.rest.get_transaction_summary().await
    }

    pub async fn check_permissions(&self) -> Result<KeyPermissions, GatewayError> {
        self.rest.check_permissions().await
    }

    pub async fn create_convert_quote(
        &self,
        from: &str,
        to: &str,
        amount: &str,
    ) -> Result<ConvertQuote, GatewayError> {
        self.rest.create_convert_quote(from, to, amount).await
    }

    pub async fn commit_convert_trade(
        &self,
        quote_id: &str,
    ) -> Result<ConvertTrade, GatewayError> {
        self.rest.commit_convert_trade(quote_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pressure_buckets() {
        assert_eq!(NetPressure::from_pressure(0.65), NetPressure::StrongBuy);
        assert_eq!(NetPressure::from_pressure(0.60), NetPressure::StrongBuy);
        assert_eq!(NetPressure::from_pressure(0.55), NetPressure::ModerateBuy);
        assert_eq!(NetPressure::from_pressure(0.52), NetPressure::ModerateBuy);
        assert_eq!(NetPressure::from_pressure(0.50), NetPressure::Neutral);
        assert_eq!(NetPressure::from_pressure(0.48), NetPressure::ModerateSell);
        assert_eq!(NetPressure::from_pressure(0.41), NetPressure::ModerateSell);
        assert_eq!(NetPressure::from_pressure(0.40), NetPressure::StrongSell);
        assert_eq!(NetPressure::from_pressure(0.10), NetPressure::StrongSell);
    }
}
