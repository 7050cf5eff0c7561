//! Order lifecycle manager
//!
//! Every public operation here is crash-safe: the order row is written
//! before anything is sent to the exchange, and the reconciler converges
//! state correctly on restart no matter where the process died.
//!
//! Order state transitions for a product are serialized behind a
//! per-product mutex (read order → mutate → persist is linearizable).

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use tokio::sync::{watch, Mutex};
use tokio::time::sleep;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::Config;
use crate::gateway::{
    ExchangeGateway, FillWire, GatewayError, OrderConfiguration, OrderStatusWire,
    PlaceOrderRequest,
};
use crate::risk::{EntryDecision, PortfolioSnapshot, RiskManager, SizeDecision};
use crate::store::Store;
use crate::types::{
    ExitReason, Fill, Liquidity, Money, Order, OrderKind, OrderRole, OrderStatus, Position,
    Product, ProductId, Side,
};

/// Result of an entry attempt. Business rejections are values, not errors.
#[derive(Debug)]
pub enum EntryOutcome {
    Entered { position_id: i64, client_id: Uuid },
    Skipped(String),
}

/// Result of an exit attempt.
#[derive(Debug)]
pub enum ExitOutcome {
    Closed { position_id: i64 },
    /// A bracket had already filled; the position was closed from its fills
    /// instead of placing a duplicate sell.
    ClosedByBracket { position_id: i64 },
}

pub struct OrderManager {
    gateway: Arc<ExchangeGateway>,
    store: Arc<Store>,
    risk: RiskManager,
    config: Arc<Config>,
    products: parking_lot::RwLock<HashMap<ProductId, Product>>,
    product_locks: parking_lot::Mutex<HashMap<ProductId, Arc<Mutex<()>>>>,
    shutdown: watch::Receiver<bool>,
    strategy_name: String,
}

impl OrderManager {
    pub fn new(
        gateway: Arc<ExchangeGateway>,
        store: Arc<Store>,
        risk: RiskManager,
        config: Arc<Config>,
        shutdown: watch::Receiver<bool>,
        strategy_name: String,
    ) -> Self {
        Self {
            gateway,
            store,
            risk,
            config,
            products: parking_lot::RwLock::new(HashMap::new()),
            product_locks: parking_lot::Mutex::new(HashMap::new()),
            shutdown,
            strategy_name,
        }
    }

    /// Refresh the product metadata map (called once at startup).
    pub fn set_products(&self, products: Vec<Product>) {
        let mut map = self.products.write();
        map.clear();
        for product in products {
            map.insert(product.id.clone(), product);
        }
    }

    pub fn product(&self, id: &ProductId) -> Option<Product> {
        self.products.read().get(id).cloned()
    }

    pub(crate) fn product_lock(&self, product: &ProductId) -> Arc<Mutex<()>> {
        self.product_locks
            .lock()
            .entry(product.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    fn cancelled_requested(&self) -> bool {
        *self.shutdown.borrow()
    }

    // =========================================================================
    // Buy path (§ signal-confirmed entry)
    // =========================================================================

    /// Full entry path: pre-trade gates, sizing, then the crash-safe
    /// submit/fill/bracket sequence.
    pub async fn execute_entry(
        &self,
        product_id: &ProductId,
        confidence: f64,
        snapshot: &PortfolioSnapshot,
    ) -> Result<EntryOutcome> {
        let product = self
            .product(product_id)
            .ok_or_else(|| anyhow!("unknown product {product_id}"))?;

        // A product with an unverifiable cancellation is off-limits until
        // the reconciler resolves it.
        let open_orders = self.store.list_open_orders()?;
        if open_orders
            .iter()
            .any(|o| o.product == *product_id && o.status == OrderStatus::Cancelling)
        {
            return Ok(EntryOutcome::Skipped(format!(
                "{product_id} blocked by unresolved cancellation"
            )));
        }

        // Gates 1–2: spread and volume flow
        let quote = self.gateway.best_bid_ask(product_id).await?;
        let flow = self.gateway.analyze_volume_flow(product_id, 100).await?;
        if let Some(reason) = pre_trade_gate(&quote, &flow, self.risk.config()) {
            return Ok(EntryOutcome::Skipped(reason));
        }

        // Sizing off one tick inside the ask (maker placement)
        let entry_price = (quote.ask_money() - product.one_tick()).quantize(product.quote_increment);
        if !entry_price.is_positive() {
            return Ok(EntryOutcome::Skipped("no usable ask price".to_string()));
        }
        let stop_loss = (entry_price
            * Money::from_f64(1.0 - self.risk.config().default_stop_loss))
        .quantize(product.quote_increment);

        let size = match self
            .risk
            .position_size(snapshot.equity, entry_price, stop_loss, &product)
        {
            SizeDecision::Approved(size) => size,
            SizeDecision::Rejected(reason) => return Ok(EntryOutcome::Skipped(reason)),
        };

        let intended_value = size * entry_price;
        if let EntryDecision::Rejected(reason) =
            self.risk.can_open(product_id, intended_value, snapshot)
        {
            return Ok(EntryOutcome::Skipped(reason));
        }

        // Gate 3: preview fee and slippage ceilings
        let request = limit_buy_request(&product, entry_price, size);
        let preview = self.gateway.preview_order(&request).await?;
        if preview.fee_pct() > self.risk.config().max_fee_pct {
            return Ok(EntryOutcome::Skipped(format!(
                "fee_too_high ({:.3}% > {:.3}%)",
                preview.fee_pct() * 100.0,
                self.risk.config().max_fee_pct * 100.0
            )));
        }
        if preview.slippage_pct() > self.risk.config().max_slippage_pct {
            return Ok(EntryOutcome::Skipped(format!(
                "slippage_too_high ({:.3}% > {:.3}%)",
                preview.slippage_pct() * 100.0,
                self.risk.config().max_slippage_pct * 100.0
            )));
        }

        info!(
            product = %product_id,
            entry = %entry_price,
            size = %size,
            confidence = format!("{:.2}", confidence),
            buy_pressure = format!("{:.2}", flow.buy_pressure),
            "Entry gates passed, submitting limit buy"
        );

        self.place_entry_order(&product, entry_price, size).await
    }

    /// Crash-safe entry sequence: persist first, send second, then wait for
    /// the fill and install brackets. Public so the recovery paths and
    /// tests can drive it without the market-data gates.
    pub async fn place_entry_order(
        &self,
        product: &Product,
        entry_price: Money,
        size: Money,
    ) -> Result<EntryOutcome> {
        let lock = self.product_lock(&product.id);
        let _guard = lock.lock().await;

        // Write before send: if we die after this line the reconciler
        // finds the row and converges it.
        let order = Order::new(
            product.id.clone(),
            Side::Buy,
            OrderKind::LimitGtcPostOnly,
            OrderRole::Entry,
            size,
        )
        .with_limit_price(entry_price);
        let client_id = order.client_id;
        self.store.upsert_order(&order)?;

        let request = limit_buy_request_with_id(product, entry_price, size, client_id);
        let ack = match self.gateway.place_order(&request).await {
            Ok(ack) => ack,
            Err(e) => {
                self.store
                    .update_order_status(client_id, OrderStatus::Rejected)
                    .context("marking failed order rejected")?;
                return Err(anyhow!(e).context("order placement failed"));
            }
        };

        self.store.set_order_exchange_id(client_id, &ack.order_id)?;
        self.store
            .update_order_status(client_id, OrderStatus::Open)?;

        // Fill wait at 1 Hz up to the configured timeout
        let timeout = Duration::from_secs(self.config.trading.fill_timeout_seconds);
        let status = self.wait_for_fill(client_id, &ack.order_id, timeout).await?;

        let filled = self.adopt_fills(client_id, &ack.order_id).await?;
        let fraction = if size.is_zero() {
            0.0
        } else {
            (filled / size).to_f64()
        };

        if status_is_filled(&status) || fraction >= self.config.trading.min_fill_fraction {
            let position_id = self.open_position_with_brackets(product, client_id).await?;
            return Ok(EntryOutcome::Entered {
                position_id,
                client_id,
            });
        }

        // Timeout: cancel the remainder and verify it actually died.
        info!(
            product = %product.id,
            client_id = %client_id,
            filled = %filled,
            "Fill timeout, cancelling entry order"
        );
        self.cancel_and_verify(client_id, &ack.order_id).await?;

        if filled.is_positive() {
            // Partial below the acceptance fraction: the fills stay recorded
            // on the order, but no position is opened.
            warn!(
                product = %product.id,
                client_id = %client_id,
                filled = %filled,
                fraction = format!("{:.2}", fraction),
                "Partial fill below min_fill_fraction rejected"
            );
            return Ok(EntryOutcome::Skipped(format!(
                "partial fill {:.2} below min fraction",
                fraction
            )));
        }

        Ok(EntryOutcome::Skipped("entry order timed out unfilled".to_string()))
    }

    /// Open the position for a filled entry order and install the bracket.
    pub async fn open_position_with_brackets(
        &self,
        product: &Product,
        entry_client_id: Uuid,
    ) -> Result<i64> {
        let position_id = self.store.open_position(&product.id, entry_client_id)?;

        let position = self
            .store
            .get_position(position_id)?
            .ok_or_else(|| anyhow!("position {position_id} vanished after open"))?;
        let basis = position.cost_basis();

        match self.install_brackets(product, position_id, basis).await {
            Ok((stop_id, tp_id)) => {
                self.store
                    .set_position_brackets(position_id, Some(stop_id), Some(tp_id), false)?;
                info!(
                    product = %product.id,
                    position_id,
                    stop = %stop_id,
                    take_profit = %tp_id,
                    "Brackets installed"
                );
            }
            Err(e) => {
                // CRITICAL: the position trades naked until the monitor
                // exits it or an operator intervenes.
                error!(
                    product = %product.id,
                    position_id,
                    error = %e,
                    "CRITICAL: bracket installation failed, position unprotected"
                );
                self.store
                    .set_position_brackets(position_id, None, None, true)?;
            }
        }

        Ok(position_id)
    }

    /// Place the stop-loss and take-profit sells, each retried up to 3×.
    async fn install_brackets(
        &self,
        product: &Product,
        position_id: i64,
        basis: Money,
    ) -> Result<(Uuid, Uuid)> {
        let position = self
            .store
            .get_position(position_id)?
            .ok_or_else(|| anyhow!("unknown position {position_id}"))?;
        let size = position.size();

        let stop_price = (basis * Money::from_f64(1.0 - self.risk.config().default_stop_loss))
            .quantize(product.quote_increment);
        // Stop-limit floor a couple ticks under the trigger
        let stop_limit = (stop_price - product.one_tick() - product.one_tick())
            .quantize(product.quote_increment);
        let take_profit = (basis * Money::from_f64(1.0 + self.risk.config().default_take_profit))
            .quantize(product.quote_increment);

        let stop_id = self
            .place_bracket_order(product, position_id, OrderRole::Stop, size, move |p, s, cid| {
                PlaceOrderRequest {
                    client_order_id: cid.to_string(),
                    product_id: p.id.as_str().to_string(),
                    side: "SELL".to_string(),
                    order_configuration: OrderConfiguration::StopLimitStopLimitGtc {
                        base_size: s.to_string(),
                        limit_price: stop_limit.to_string(),
                        stop_price: stop_price.to_string(),
                        stop_direction: "STOP_DIRECTION_STOP_DOWN".to_string(),
                    },
                }
            })
            .await?;

        let tp_id = self
            .place_bracket_order(
                product,
                position_id,
                OrderRole::TakeProfit,
                size,
                move |p, s, cid| PlaceOrderRequest {
                    client_order_id: cid.to_string(),
                    product_id: p.id.as_str().to_string(),
                    side: "SELL".to_string(),
                    order_configuration: OrderConfiguration::LimitLimitGtc {
                        base_size: s.to_string(),
                        limit_price: take_profit.to_string(),
                        post_only: false,
                    },
                },
            )
            .await?;

        Ok((stop_id, tp_id))
    }

    async fn place_bracket_order(
        &self,
        product: &Product,
        position_id: i64,
        role: OrderRole,
        size: Money,
        build: impl Fn(&Product, Money, Uuid) -> PlaceOrderRequest,
    ) -> Result<Uuid> {
        let kind = match role {
            OrderRole::Stop => OrderKind::StopLimit,
            _ => OrderKind::TakeProfitLimit,
        };

        let mut last_error = None;
        for attempt in 0..3u32 {
            if attempt > 0 {
                sleep(Duration::from_millis(500 * 2u64.pow(attempt - 1))).await;
            }

            let order = Order::new(product.id.clone(), Side::Sell, kind, role, size)
                .with_position(position_id);
            let client_id = order.client_id;
            self.store.upsert_order(&order)?;

            let request = build(product, size, client_id);
            match self.gateway.place_order(&request).await {
                Ok(ack) => {
                    self.store.set_order_exchange_id(client_id, &ack.order_id)?;
                    self.store
                        .update_order_status(client_id, OrderStatus::Open)?;
                    return Ok(client_id);
                }
                Err(e) => {
                    warn!(
                        product = %product.id,
                        role = role.as_str(),
                        attempt = attempt + 1,
                        error = %e,
                        "Bracket placement attempt failed"
                    );
                    self.store
                        .update_order_status(client_id, OrderStatus::Rejected)?;
                    last_error = Some(e);
                }
            }
        }

        Err(anyhow!(last_error.unwrap_or(GatewayError::Transient(
            "bracket placement failed".to_string()
        ))))
    }

    // =========================================================================
    // Sell path (§ exits)
    // =========================================================================

    /// Exit a position: cancel live brackets first, then market-sell the
    /// full size and close the position record.
    pub async fn execute_exit(
        &self,
        position: &Position,
        reason: ExitReason,
    ) -> Result<ExitOutcome> {
        let product = self
            .product(&position.product)
            .ok_or_else(|| anyhow!("unknown product {}", position.product))?;

        let lock = self.product_lock(&position.product);
        let _guard = lock.lock().await;

        // Cancel brackets; if one already filled, the position is already
        // flat on the exchange and a market sell would double-sell.
        for bracket_id in [position.stop_order_id, position.take_profit_order_id]
            .into_iter()
            .flatten()
        {
            if let Some(filled_reason) = self.cancel_bracket(bracket_id).await? {
                info!(
                    position_id = position.id,
                    bracket = %bracket_id,
                    "Bracket already filled, closing from its fills"
                );
                self.store
                    .close_position(position.id, filled_reason, &self.strategy_name)?;
                return Ok(ExitOutcome::ClosedByBracket {
                    position_id: position.id,
                });
            }
        }

        // Market sell, write-before-send like every order
        let size = position.size();
        let order = Order::new(
            position.product.clone(),
            Side::Sell,
            OrderKind::Market,
            OrderRole::Exit,
            size,
        )
        .with_position(position.id);
        let client_id = order.client_id;
        self.store.upsert_order(&order)?;

        let request = PlaceOrderRequest {
            client_order_id: client_id.to_string(),
            product_id: product.id.as_str().to_string(),
            side: "SELL".to_string(),
            order_configuration: OrderConfiguration::MarketMarketIoc {
                base_size: size.to_string(),
            },
        };

        let ack = match self.gateway.place_order(&request).await {
            Ok(ack) => ack,
            Err(e) => {
                self.store
                    .update_order_status(client_id, OrderStatus::Rejected)?;
                return Err(anyhow!(e).context("market sell placement failed"));
            }
        };
        self.store.set_order_exchange_id(client_id, &ack.order_id)?;
        self.store
            .update_order_status(client_id, OrderStatus::Open)?;

        let timeout = Duration::from_secs(self.config.trading.sell_fill_timeout_seconds);
        self.wait_for_fill(client_id, &ack.order_id, timeout).await?;
        self.adopt_fills(client_id, &ack.order_id).await?;

        let trade = self
            .store
            .close_position(position.id, reason, &self.strategy_name)?;

        info!(
            product = %position.product,
            position_id = position.id,
            net_pnl = %trade.net_pnl,
            reason = %reason,
            "Position exited"
        );

        Ok(ExitOutcome::Closed {
            position_id: position.id,
        })
    }

    /// Cancel one bracket order. Returns the matching exit reason when the
    /// bracket turns out to be already filled.
    async fn cancel_bracket(&self, bracket_id: Uuid) -> Result<Option<ExitReason>> {
        let Some(order) = self.store.get_order(bracket_id)? else {
            return Ok(None);
        };

        if order.status.is_terminal() {
            if order.status == OrderStatus::Filled {
                return Ok(Some(bracket_exit_reason(order.role)));
            }
            return Ok(None);
        }

        let Some(exchange_id) = order.exchange_id.clone() else {
            self.store
                .update_order_status(bracket_id, OrderStatus::Cancelled)?;
            return Ok(None);
        };

        // Check for a fill race before cancelling
        if let Ok(status) = self.gateway.get_order(&exchange_id).await {
            if status_is_filled(&status) {
                self.adopt_fills(bracket_id, &exchange_id).await?;
                return Ok(Some(bracket_exit_reason(order.role)));
            }
        }

        self.cancel_and_verify(bracket_id, &exchange_id).await?;

        // The cancel may have lost a race with the fill
        let refreshed = self.store.get_order(bracket_id)?;
        if matches!(refreshed, Some(o) if o.status == OrderStatus::Filled) {
            return Ok(Some(bracket_exit_reason(order.role)));
        }
        Ok(None)
    }

    // =========================================================================
    // Shared primitives
    // =========================================================================

    /// Poll order status at 1 Hz until terminal, the deadline passes, or
    /// shutdown is requested. Cancellation is observed at least once per
    /// second.
    pub async fn wait_for_fill(
        &self,
        client_id: Uuid,
        exchange_id: &str,
        timeout: Duration,
    ) -> Result<OrderStatusWire> {
        let deadline = tokio::time::Instant::now() + timeout;
        let mut last_status: Option<OrderStatusWire> = None;

        loop {
            if self.cancelled_requested() {
                debug!(client_id = %client_id, "Fill wait interrupted by shutdown");
                break;
            }

            match self.gateway.get_order(exchange_id).await {
                Ok(status) => {
                    let filled = status_is_filled(&status);
                    last_status = Some(status);
                    if filled {
                        break;
                    }
                }
                Err(e) if !e.is_retryable() => return Err(anyhow!(e)),
                Err(e) => warn!(client_id = %client_id, error = %e, "Status poll failed"),
            }

            if tokio::time::Instant::now() >= deadline {
                break;
            }
            sleep(Duration::from_secs(1)).await;
        }

        last_status.ok_or_else(|| anyhow!("order {client_id} status never observed"))
    }

    /// Cancel an order and verify the cancellation actually happened.
    ///
    /// If verification cannot be obtained in time the order is left in
    /// `cancelling` and a CRITICAL error is raised; the reconciler keeps
    /// retrying indefinitely and entries for the product stay blocked.
    pub async fn cancel_and_verify(&self, client_id: Uuid, exchange_id: &str) -> Result<()> {
        let verify_deadline = tokio::time::Instant::now()
            + Duration::from_secs(self.config.trading.cancel_verify_seconds);

        match self.gateway.cancel_order(exchange_id).await {
            Ok(()) => {}
            // InvalidRequest usually means "already terminal"; fall
            // through to verification, which reads the truth.
            Err(GatewayError::InvalidRequest(_)) | Err(GatewayError::NotFound(_)) => {}
            Err(e) => warn!(client_id = %client_id, error = %e, "Cancel request failed"),
        }

        for _ in 0..3 {
            match self.gateway.get_order(exchange_id).await {
                Ok(status) => {
                    if status_is_filled(&status) {
                        self.adopt_fills(client_id, exchange_id).await?;
                        return Ok(());
                    }
                    match status.status.as_str() {
                        "CANCELLED" => {
                            self.store
                                .update_order_status(client_id, OrderStatus::Cancelled)?;
                            return Ok(());
                        }
                        "EXPIRED" => {
                            self.store
                                .update_order_status(client_id, OrderStatus::Expired)?;
                            return Ok(());
                        }
                        _ => {}
                    }
                }
                Err(e) => warn!(client_id = %client_id, error = %e, "Cancel verification poll failed"),
            }

            if tokio::time::Instant::now() >= verify_deadline {
                break;
            }
            sleep(Duration::from_secs(1)).await;
        }

        error!(
            client_id = %client_id,
            exchange_id = %exchange_id,
            "CRITICAL: cancellation could not be verified, order left in cancelling"
        );
        self.store
            .update_order_status(client_id, OrderStatus::Cancelling)?;
        Err(anyhow!(
            "cancellation of {client_id} unverified; reconciler will keep trying"
        ))
    }

    /// Pull fills from the exchange and fold them into the store.
    /// Returns the cumulative filled size. Idempotent.
    pub async fn adopt_fills(&self, client_id: Uuid, exchange_id: &str) -> Result<Money> {
        let fills = self.gateway.get_fills(exchange_id).await?;
        for wire in fills {
            let fill = wire_to_fill(client_id, &wire);
            self.store.record_fill(&fill)?;
        }

        let order = self
            .store
            .get_order(client_id)?
            .ok_or_else(|| anyhow!("order {client_id} missing after fill adoption"))?;
        Ok(order.filled_size)
    }

    pub fn store(&self) -> &Arc<Store> {
        &self.store
    }

    pub fn order_max_age_seconds(&self) -> i64 {
        self.config.trading.order_max_age_seconds as i64
    }

    pub fn gateway(&self) -> &Arc<ExchangeGateway> {
        &self.gateway
    }

    pub fn strategy_name(&self) -> &str {
        &self.strategy_name
    }
}

/// Pre-trade entry gate: reject wide spreads and weak buy-side flow
/// before any order is constructed. Returns the rejection reason.
pub fn pre_trade_gate(
    quote: &crate::gateway::BidAsk,
    flow: &crate::gateway::VolumeFlow,
    config: &crate::config::RiskConfig,
) -> Option<String> {
    let spread = quote.spread_pct();
    if spread > config.max_spread_pct {
        return Some(format!(
            "spread_too_wide ({:.3}% > {:.3}%)",
            spread * 100.0,
            config.max_spread_pct * 100.0
        ));
    }
    if flow.buy_pressure < config.min_buy_pressure {
        return Some(format!(
            "weak_buy_pressure ({:.2} < {:.2})",
            flow.buy_pressure, config.min_buy_pressure
        ));
    }
    None
}

fn bracket_exit_reason(role: OrderRole) -> ExitReason {
    match role {
        OrderRole::Stop => ExitReason::StopTriggered,
        _ => ExitReason::TpTriggered,
    }
}

pub(crate) fn status_is_filled(status: &OrderStatusWire) -> bool {
    status.status.eq_ignore_ascii_case("FILLED")
}

pub(crate) fn wire_to_fill(client_id: Uuid, wire: &FillWire) -> Fill {
    Fill {
        fill_id: wire.entry_id.clone(),
        order_client_id: client_id,
        price: Money::parse(&wire.price).unwrap_or(Money::ZERO),
        size: Money::parse(&wire.size).unwrap_or(Money::ZERO),
        fee: Money::parse(&wire.commission).unwrap_or(Money::ZERO),
        liquidity: Liquidity::parse(&wire.liquidity_indicator),
        time: chrono::DateTime::parse_from_rfc3339(&wire.trade_time)
            .map(|t| t.with_timezone(&chrono::Utc))
            .unwrap_or_else(|_| chrono::Utc::now()),
    }
}

fn limit_buy_request(product: &Product, price: Money, size: Money) -> PlaceOrderRequest {
    limit_buy_request_with_id(product, price, size, Uuid::new_v4())
}

fn limit_buy_request_with_id(
    product: &Product,
    price: Money,
    size: Money,
    client_id: Uuid,
) -> PlaceOrderRequest {
    PlaceOrderRequest {
        client_order_id: client_id.to_string(),
        product_id: product.id.as_str().to_string(),
        side: "BUY".to_string(),
        order_configuration: OrderConfiguration::LimitLimitGtc {
            base_size: size.to_string(),
            limit_price: price.to_string(),
            post_only: true,
        },
    }
}
