//! Streaming market data and user-channel events
//!
//! Maintains a thread-safe last-price cache fed by the `ticker_batch`
//! channel and fans `user` channel order updates out to the reconciler.
//! The reader hands work off to a bounded queue immediately so the
//! WebSocket heartbeats are never starved.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures_util::{SinkExt, StreamExt};
use parking_lot::RwLock;
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::auth::{sign_subscription, Credentials};
use super::types::{SubscribeMessage, TickerEvent, UserOrderEvent, WsEnvelope};
use crate::common::Backoff;
use crate::types::{Money, ProductId};

/// Base URL for the exchange WebSocket feed
pub const WS_BASE_URL: &str = "wss://ws.exchange.example.com";

/// Last observed price with its arrival time
#[derive(Debug, Clone, Copy)]
pub struct PriceTick {
    pub price: Money,
    pub updated_at: DateTime<Utc>,
}

/// Single-writer (stream reader), many-reader price cache.
#[derive(Debug, Default)]
pub struct PriceCache {
    inner: RwLock<HashMap<ProductId, PriceTick>>,
}

impl PriceCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&self, product: ProductId, price: Money) {
        self.inner.write().insert(
            product,
            PriceTick {
                price,
                updated_at: Utc::now(),
            },
        );
    }

    pub fn get(&self, product: &ProductId) -> Option<PriceTick> {
        self.inner.read().get(product).copied()
    }

    /// Price only if it is newer than `max_age_seconds`.
    pub fn get_fresh(&self, product: &ProductId, max_age_seconds: i64) -> Option<Money> {
        let tick = self.get(product)?;
        let age = Utc::now() - tick.updated_at;
        if age.num_seconds() <= max_age_seconds {
            Some(tick.price)
        } else {
            None
        }
    }
}

/// Order update delivered over the user channel
#[derive(Debug, Clone)]
pub struct OrderUpdate {
    pub exchange_id: String,
    pub client_id: Option<Uuid>,
    pub status: String,
    pub cumulative_filled_size: Money,
    pub avg_price: Money,
}

/// Events the stream hands to the trading loop
#[derive(Debug, Clone)]
pub enum StreamEvent {
    /// Connection (re)established; all non-terminal orders must be
    /// re-reconciled because updates may have been missed.
    Reconnected,
    OrderUpdate(OrderUpdate),
}

/// Long-lived WebSocket task: subscribes to ticker_batch for the watched
/// products plus the authenticated user channel, reconnecting with
/// jittered backoff (250 ms → 30 s) on any failure.
pub struct MarketStream {
    ws_url: String,
    credentials: Credentials,
    products: Vec<ProductId>,
    price_cache: Arc<PriceCache>,
    events_tx: mpsc::Sender<StreamEvent>,
}

impl MarketStream {
    pub fn new(
        credentials: Credentials,
        products: Vec<ProductId>,
        price_cache: Arc<PriceCache>,
        events_tx: mpsc::Sender<StreamEvent>,
    ) -> Self {
        Self {
            ws_url: WS_BASE_URL.to_string(),
            credentials,
            products,
            price_cache,
            events_tx,
        }
    }

    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.ws_url = url.into();
        self
    }

    /// Run until shutdown is signalled. Each connection failure triggers a
    /// backoff delay and a fresh connect + resubscribe.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut backoff = Backoff::for_stream();

        loop {
            if *shutdown.borrow() {
                break;
            }

            match self.run_connection(&mut shutdown).await {
                Ok(()) => {
                    info!("WebSocket stream closed cleanly");
                    break;
                }
                Err(e) => {
                    let delay = backoff.next_delay();
                    warn!(
                        error = %e,
                        reconnect_in_ms = delay.as_millis() as u64,
                        "WebSocket stream failed, reconnecting"
                    );
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = shutdown.changed() => break,
                    }
                }
            }
        }

        info!("Market stream stopped");
    }

    async fn run_connection(&self, shutdown: &mut watch::Receiver<bool>) -> anyhow::Result<()> {
        info!(url = %self.ws_url, products = self.products.len(), "Connecting to WebSocket feed");
        let (ws_stream, _response) = connect_async(&self.ws_url).await?;
        let (mut write, mut read) = ws_stream.split();

        let product_ids: Vec<String> = self.products.iter().map(|p| p.as_str().to_string()).collect();

        for channel in ["ticker_batch", "user"] {
            let timestamp = Utc::now().timestamp().to_string();
            let signature =
                sign_subscription(self.credentials.api_secret(), &timestamp, channel, &product_ids);
            let msg = SubscribeMessage {
                msg_type: "subscribe".to_string(),
                channel: channel.to_string(),
                product_ids: product_ids.clone(),
                signature: Some(signature),
                api_key: Some(self.credentials.api_key().to_string()),
                timestamp: Some(timestamp),
            };
            write
                .send(Message::Text(serde_json::to_string(&msg)?))
                .await?;
        }

        info!("WebSocket subscribed; notifying reconciler");
        // Missed updates between connections are recovered by a full
        // reconcile pass; dropping the event is not acceptable here.
        self.events_tx.send(StreamEvent::Reconnected).await.ok();

        loop {
            tokio::select! {
                msg = read.next() => {
                    match msg {
                        Some(Ok(Message::Text(text))) => {
                            if let Err(e) = self.handle_message(&text) {
                                warn!(error = %e, "Failed to handle WebSocket message");
                            }
                        }
                        Some(Ok(Message::Ping(payload))) => {
                            write.send(Message::Pong(payload)).await?;
                        }
                        Some(Ok(Message::Close(_))) | None => {
                            anyhow::bail!("WebSocket stream ended");
                        }
                        Some(Ok(_)) => {}
                        Some(Err(e)) => {
                            error!(error = %e, "WebSocket read error");
                            return Err(e.into());
                        }
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        let _ = write.send(Message::Close(None)).await;
                        return Ok(());
                    }
                }
            }
        }
    }

    fn handle_message(&self, text: &str) -> anyhow::Result<()> {
        let envelope: WsEnvelope = serde_json::from_str(text)?;

        match envelope.channel.as_str() {
            "ticker" | "ticker_batch" => {
                for event in envelope.events {
                    let tickers = event
                        .get("tickers")
                        .and_then(|t| t.as_array())
                        .cloned()
                        .unwrap_or_default();
                    for ticker in tickers {
                        if let Ok(tick) = serde_json::from_value::<TickerEvent>(ticker) {
                            if let Some(price) = Money::parse(&tick.price) {
                                self.price_cache
                                    .update(ProductId::new(&tick.product_id), price);
                            }
                        }
                    }
                }
            }
            "user" => {
                for event in envelope.events {
                    let orders = event
                        .get("orders")
                        .and_then(|o| o.as_array())
                        .cloned()
                        .unwrap_or_default();
                    for order in orders {
                        if let Ok(update) = serde_json::from_value::<UserOrderEvent>(order) {
                            let update = OrderUpdate {
                                exchange_id: update.order_id,
                                client_id: Uuid::parse_str(&update.client_order_id).ok(),
                                status: update.status,
                                cumulative_filled_size: Money::parse(&update.cumulative_quantity)
                                    .unwrap_or(Money::ZERO),
                                avg_price: Money::parse(&update.avg_price).unwrap_or(Money::ZERO),
                            };
                            // try_send: the reader must never block behind a
                            // slow consumer; polling is the backstop.
                            if let Err(e) =
                                self.events_tx.try_send(StreamEvent::OrderUpdate(update))
                            {
                                warn!(error = %e, "Order update queue full, dropping event");
                            }
                        }
                    }
                }
            }
            other => {
                debug!(channel = other, "Ignoring message on unhandled channel");
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_price_cache_roundtrip() {
        let cache = PriceCache::new();
        let btc = ProductId::new("BTC-USD");

        assert!(cache.get(&btc).is_none());

        cache.update(btc.clone(), Money::parse("50000").unwrap());
        let tick = cache.get(&btc).unwrap();
        assert_eq!(tick.price, Money::parse("50000").unwrap());

        assert_eq!(
            cache.get_fresh(&btc, 30),
            Some(Money::parse("50000").unwrap())
        );
    }

    #[test]
    fn test_price_cache_staleness() {
        let cache = PriceCache::new();
        let eth = ProductId::new("ETH-USD");

        cache.inner.write().insert(
            eth.clone(),
            PriceTick {
                price: Money::parse("3000").unwrap(),
                updated_at: Utc::now() - chrono::Duration::seconds(60),
            },
        );

        assert!(cache.get_fresh(&eth, 30).is_none());
        assert!(cache.get(&eth).is_some());
    }
}
