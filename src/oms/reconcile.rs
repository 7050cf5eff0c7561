//! Order reconciler: ghost-order prevention
//!
//! Runs every main-loop tick and reacts to user-channel events. For every
//! non-terminal order in the store it converges local state with the
//! exchange: adopting fills, finishing interrupted cancellations, and
//! opening positions for entry orders that filled while the process was
//! down. The sweep is idempotent: running it twice with no exchange
//! changes leaves the store unchanged.

use std::sync::Arc;

use anyhow::Result;
use chrono::{Duration, Utc};
use tracing::{debug, info, warn};

use super::manager::{status_is_filled, OrderManager};
use crate::gateway::{GatewayError, OrderUpdate, StreamEvent};
use crate::types::{Order, OrderRole, OrderStatus};

/// Grace period before an order that never received an exchange id is
/// presumed to have died before the send.
const UNACKED_GRACE_SECONDS: i64 = 60;

pub struct Reconciler {
    manager: Arc<OrderManager>,
}

impl Reconciler {
    pub fn new(manager: Arc<OrderManager>) -> Self {
        Self { manager }
    }

    /// One full pass over every non-terminal order. Per-order failures are
    /// logged and skipped; one bad order must not stall the rest.
    pub async fn sweep(&self) -> Result<()> {
        let open_orders = self.manager.store().list_open_orders()?;
        if !open_orders.is_empty() {
            debug!(count = open_orders.len(), "Reconciler sweep");
        }

        for order in open_orders {
            let client_id = order.client_id;
            if let Err(e) = self.reconcile_order(order).await {
                warn!(client_id = %client_id, error = %e, "Order reconciliation failed");
            }
        }
        Ok(())
    }

    /// Fast path for streaming events. Order updates re-read authoritative
    /// state through the same transition as polling, so out-of-order or
    /// duplicated events are harmless; a reconnect forces a full sweep.
    pub async fn handle_event(&self, event: StreamEvent) -> Result<()> {
        match event {
            StreamEvent::Reconnected => {
                info!("Stream reconnected, re-reconciling all non-terminal orders");
                self.sweep().await
            }
            StreamEvent::OrderUpdate(update) => self.handle_update(update).await,
        }
    }

    async fn handle_update(&self, update: OrderUpdate) -> Result<()> {
        let store = self.manager.store();

        // Locate by client_id first; exchange_id is the fallback.
        let order = match update.client_id.and_then(|id| store.get_order(id).transpose()) {
            Some(order) => Some(order?),
            None => store.get_order_by_exchange_id(&update.exchange_id)?,
        };

        match order {
            Some(order) if !order.is_terminal() => {
                debug!(
                    client_id = %order.client_id,
                    status = %update.status,
                    "User-channel update"
                );
                self.reconcile_order(order).await
            }
            Some(_) => Ok(()),
            None => {
                // An exchange order we have no row for is the inverse ghost;
                // it is surfaced but never auto-cancelled.
                warn!(
                    exchange_id = %update.exchange_id,
                    "Order update for unknown order (manual order or lost row?)"
                );
                Ok(())
            }
        }
    }

    async fn reconcile_order(&self, order: Order) -> Result<()> {
        let lock = self.manager.product_lock(&order.product);
        let _guard = lock.lock().await;

        // Re-read under the lock; a concurrent path may have advanced it.
        let Some(order) = self.manager.store().get_order(order.client_id)? else {
            return Ok(());
        };
        if order.is_terminal() {
            return Ok(());
        }

        let Some(exchange_id) = order.exchange_id.clone() else {
            return self.resolve_unacked(&order).await;
        };

        // An interrupted cancellation retries until verified.
        if order.status == OrderStatus::Cancelling {
            return match self
                .manager
                .cancel_and_verify(order.client_id, &exchange_id)
                .await
            {
                Ok(()) => {
                    info!(client_id = %order.client_id, "Pending cancellation resolved");
                    Ok(())
                }
                Err(e) => {
                    warn!(client_id = %order.client_id, error = %e, "Cancellation still unverified");
                    Ok(())
                }
            };
        }

        // Safety-net: stale working orders are cancelled. Bracket orders
        // rest by design and are exempt.
        let age = order.age(Utc::now());
        let max_age = Duration::seconds(self.manager_config_order_max_age());
        let is_bracket = matches!(order.role, OrderRole::Stop | OrderRole::TakeProfit);
        if !is_bracket && age > max_age {
            info!(
                client_id = %order.client_id,
                age_secs = age.num_seconds(),
                "Order exceeded max age, cancelling"
            );
            return match self
                .manager
                .cancel_and_verify(order.client_id, &exchange_id)
                .await
            {
                Ok(()) => Ok(()),
                Err(e) => {
                    warn!(client_id = %order.client_id, error = %e, "Age-out cancel unverified");
                    Ok(())
                }
            };
        }

        // Normal path: ask the exchange and apply the transition.
        let status = match self.manager.gateway().get_order(&exchange_id).await {
            Ok(status) => status,
            Err(GatewayError::NotFound(_)) => {
                warn!(
                    client_id = %order.client_id,
                    "Order unknown to exchange, marking rejected"
                );
                self.manager
                    .store()
                    .update_order_status(order.client_id, OrderStatus::Rejected)?;
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        };

        if status_is_filled(&status) {
            self.manager
                .adopt_fills(order.client_id, &exchange_id)
                .await?;

            // An entry that filled while we were down still needs its
            // position and brackets.
            if order.role == OrderRole::Entry && order.position_id.is_none() {
                let has_open = self
                    .manager
                    .store()
                    .get_open_position(&order.product)?
                    .is_some();
                if !has_open {
                    if let Some(product) = self.manager.product(&order.product) {
                        info!(
                            client_id = %order.client_id,
                            product = %order.product,
                            "Adopting orphaned filled entry into a position"
                        );
                        self.manager
                            .open_position_with_brackets(&product, order.client_id)
                            .await?;
                    } else {
                        warn!(
                            product = %order.product,
                            "Filled entry for unknown product, cannot open position"
                        );
                    }
                }
            }
            return Ok(());
        }

        match status.status.as_str() {
            "CANCELLED" => {
                self.manager
                    .store()
                    .update_order_status(order.client_id, OrderStatus::Cancelled)?;
            }
            "EXPIRED" => {
                self.manager
                    .store()
                    .update_order_status(order.client_id, OrderStatus::Expired)?;
            }
            "FAILED" | "REJECTED" => {
                self.manager
                    .store()
                    .update_order_status(order.client_id, OrderStatus::Rejected)?;
            }
            _ => {
                // OPEN / PENDING: adopt any partial fills, nothing else.
                if status.filled().is_positive() {
                    self.manager
                        .adopt_fills(order.client_id, &exchange_id)
                        .await?;
                }
            }
        }

        Ok(())
    }

    /// An order with no exchange id either died before the send or died
    /// between the send and persisting the ack. Cancel by client id (the
    /// exchange's idempotency key) so both cases converge safely.
    async fn resolve_unacked(&self, order: &Order) -> Result<()> {
        let age = order.age(Utc::now());
        if age.num_seconds() < UNACKED_GRACE_SECONDS {
            return Ok(());
        }

        match self
            .manager
            .gateway()
            .cancel_order(&order.client_id.to_string())
            .await
        {
            Ok(()) => {
                info!(
                    client_id = %order.client_id,
                    "Unacked order cancelled on exchange by client id"
                );
                self.manager
                    .store()
                    .update_order_status(order.client_id, OrderStatus::Cancelled)?;
            }
            Err(GatewayError::NotFound(_)) => {
                // Never reached the exchange.
                self.manager
                    .store()
                    .update_order_status(order.client_id, OrderStatus::Rejected)?;
            }
            Err(GatewayError::InvalidRequest(_)) => {
                // Already terminal on the exchange; the next poll by
                // exchange id is impossible, so mark cancelled.
                self.manager
                    .store()
                    .update_order_status(order.client_id, OrderStatus::Cancelled)?;
            }
            Err(e) => {
                warn!(client_id = %order.client_id, error = %e, "Unacked order cancel failed");
            }
        }
        Ok(())
    }

    fn manager_config_order_max_age(&self) -> i64 {
        self.manager.order_max_age_seconds()
    }
}
