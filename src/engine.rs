//! Trading engine orchestrator
//!
//! The single top-level loop: each tick runs the reconciler, the position
//! monitor, candidate selection, bounded-parallel strategy analysis, and
//! the equity snapshot with drawdown tracking. A failure evaluating one
//! product never crashes the loop; fatal errors unwind to shutdown.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use chrono::Utc;
use itertools::Itertools;
use tokio::sync::{watch, Semaphore};
use tokio::time::interval;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::gateway::{Credentials, ExchangeGateway};
use crate::indicators::enrich;
use crate::monitor::PositionMonitor;
use crate::oms::{EntryOutcome, OrderManager, Reconciler};
use crate::risk::{DrawdownEvent, DrawdownState, PortfolioSnapshot, RiskManager};
use crate::store::Store;
use crate::strategies::{create_strategy, Strategy};
use crate::types::{EquitySnapshot, Money, Position, Product, ProductId, SignalAction};

/// bot_state keys shared with the CLI startup report
pub const STATE_PEAK_EQUITY: &str = "peak_equity";
pub const STATE_DRAWDOWN_HALTED: &str = "drawdown_halted";
pub const STATE_HALT_REASON: &str = "halt_reason";
pub const STATE_ACTIVE_STRATEGY: &str = "active_strategy";

/// How the engine's run ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineExit {
    Clean,
    /// Shut down while the drawdown halt was still active
    DrawdownHalt,
}

pub struct TradingEngine {
    config: Arc<Config>,
    gateway: Arc<ExchangeGateway>,
    store: Arc<Store>,
    manager: Arc<OrderManager>,
    reconciler: Arc<Reconciler>,
    monitor: PositionMonitor,
    strategy: Arc<dyn Strategy>,
    risk: RiskManager,
    drawdown: DrawdownState,
    products: Vec<(Product, Money)>,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
    cycle_count: u64,
}

impl TradingEngine {
    pub async fn new(config: Config) -> Result<Self> {
        let config = Arc::new(config);

        let credentials = Credentials::new(
            config.exchange.api_key.clone().unwrap_or_default(),
            config.exchange.api_secret.clone().unwrap_or_default(),
        );
        let gateway = Arc::new(ExchangeGateway::new(credentials, &config));

        // Auth problems are fatal at startup, not at the first order.
        if !config.trading.paper_trading_mode {
            let permissions = gateway
                .check_permissions()
                .await
                .context("API key permission check failed (bad credentials?)")?;
            if !permissions.can_view || !permissions.can_trade {
                bail!(
                    "API key lacks required permissions (view: {}, trade: {})",
                    permissions.can_view,
                    permissions.can_trade
                );
            }
        }

        let state_dir = std::path::Path::new(&config.trading.state_dir);
        let store = Arc::new(Store::new(state_dir.join("trading.db")).context(
            "failed to open the durable store (unreadable state directory?)",
        )?);

        let strategy = create_strategy(&config.strategies)?;
        let risk = RiskManager::new(config.risk.clone());

        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let manager = Arc::new(OrderManager::new(
            Arc::clone(&gateway),
            Arc::clone(&store),
            risk.clone(),
            Arc::clone(&config),
            shutdown_rx.clone(),
            strategy.name().to_string(),
        ));
        let reconciler = Arc::new(Reconciler::new(Arc::clone(&manager)));
        let monitor = PositionMonitor::new(
            Arc::clone(&manager),
            Arc::clone(&strategy),
            Arc::clone(&config),
        );

        // Report the previous session's halt, if any.
        if let Some(reason) = store.get_state(STATE_HALT_REASON)? {
            if let Some(snapshot) = store.latest_equity_snapshot()? {
                warn!(
                    halt_reason = %reason,
                    last_equity = %snapshot.total_quote,
                    "Previous session ended halted"
                );
            } else {
                warn!(halt_reason = %reason, "Previous session ended halted");
            }
        }

        // Warn when the active strategy changed across restarts.
        if let Some(previous) = store.get_state(STATE_ACTIVE_STRATEGY)? {
            if previous != strategy.name() {
                warn!(
                    previous = %previous,
                    current = strategy.name(),
                    "Active strategy changed since last run"
                );
            }
        }
        store.put_state(STATE_ACTIVE_STRATEGY, strategy.name())?;

        // Resume the drawdown posture from the last session.
        let peak = store
            .get_state(STATE_PEAK_EQUITY)?
            .and_then(|s| Money::parse(&s))
            .unwrap_or(Money::ZERO);
        let halted = store
            .get_state(STATE_DRAWDOWN_HALTED)?
            .map(|s| s == "true")
            .unwrap_or(false);
        let drawdown = DrawdownState {
            peak_equity: peak,
            halted,
        };

        Ok(Self {
            config,
            gateway,
            store,
            manager,
            reconciler,
            monitor,
            strategy,
            risk,
            drawdown,
            products: Vec::new(),
            shutdown_tx,
            shutdown_rx,
            cycle_count: 0,
        })
    }

    pub fn shutdown_handle(&self) -> watch::Sender<bool> {
        self.shutdown_tx.clone()
    }

    pub fn store(&self) -> Arc<Store> {
        Arc::clone(&self.store)
    }

    /// Main loop. Returns how the session ended; the CLI maps that to an
    /// exit code.
    pub async fn run(&mut self) -> Result<EngineExit> {
        self.refresh_products().await?;

        let watched = self.watched_products();
        let (mut events_rx, stream_handle) = self
            .gateway
            .spawn_stream(watched, self.shutdown_rx.clone());

        // Streaming fast path: user-channel events drive the reconciler
        // without waiting for the next tick.
        let reconciler = Arc::clone(&self.reconciler);
        let mut event_shutdown = self.shutdown_rx.clone();
        let events_handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    event = events_rx.recv() => {
                        match event {
                            Some(event) => {
                                if let Err(e) = reconciler.handle_event(event).await {
                                    warn!(error = %e, "Stream event handling failed");
                                }
                            }
                            None => break,
                        }
                    }
                    _ = event_shutdown.changed() => {
                        if *event_shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
        });

        // Ctrl+C flips the shared shutdown flag every in-flight deadline
        // is watching.
        let signal_tx = self.shutdown_tx.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("Shutdown signal received, finishing in-flight work");
                let _ = signal_tx.send(true);
            }
        });

        info!(
            strategy = self.strategy.name(),
            products = self.products.len(),
            paper = self.gateway.is_paper(),
            interval_secs = self.config.trading.loop_sleep_seconds,
            "Trading loop started"
        );

        let mut tick = interval(Duration::from_secs(self.config.trading.loop_sleep_seconds));
        let mut shutdown_rx = self.shutdown_rx.clone();

        loop {
            tokio::select! {
                _ = tick.tick() => {
                    if *shutdown_rx.borrow() {
                        break;
                    }
                    if let Err(e) = self.run_cycle().await {
                        // Per-cycle errors are contained; the loop survives.
                        error!(error = %e, "Trading cycle failed");
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        break;
                    }
                }
            }
        }

        // Graceful shutdown: no new entries past this point; flush state,
        // close the stream, report.
        let _ = self.shutdown_tx.send(true);
        let exit = self.finalize().await?;

        let _ = events_handle.await;
        let _ = stream_handle.await;

        info!("Trading session ended");
        Ok(exit)
    }

    /// One orchestrator tick.
    async fn run_cycle(&mut self) -> Result<()> {
        self.cycle_count += 1;
        info!(cycle = self.cycle_count, "━━━ Trading cycle ━━━");

        // 1. Reconciler sweep: converge every non-terminal order first so
        //    the rest of the cycle sees truthful state.
        self.reconciler.sweep().await?;

        // 2. Position monitor sweep.
        self.monitor.sweep().await?;

        // 3–4. Candidate selection and analysis, skipped under halt.
        if self.drawdown.halted {
            warn!("Drawdown halt active: skipping entry scanning");
        } else {
            self.scan_candidates().await?;
        }

        // 5. Equity snapshot and drawdown update.
        let positions = self.store.list_open_positions()?;
        let (cash, positions_value) = self.compute_equity(&positions).await?;
        let total = cash + positions_value;

        let snapshot = EquitySnapshot {
            time: Utc::now(),
            cash_quote: cash,
            positions_value_quote: positions_value,
            total_quote: total,
            open_positions_count: positions.len(),
        };
        self.store.snapshot_equity(&snapshot)?;

        match self.risk.update_drawdown(&mut self.drawdown, total) {
            DrawdownEvent::Halted => {
                self.store.put_state(STATE_DRAWDOWN_HALTED, "true")?;
                self.store.put_state(
                    STATE_HALT_REASON,
                    &format!(
                        "drawdown {:.1}% exceeded limit",
                        self.drawdown.current_drawdown(total) * 100.0
                    ),
                )?;
            }
            DrawdownEvent::Released => {
                self.store.put_state(STATE_DRAWDOWN_HALTED, "false")?;
            }
            DrawdownEvent::None => {}
        }
        self.store
            .put_state(STATE_PEAK_EQUITY, &self.drawdown.peak_equity.to_string())?;

        info!(
            cycle = self.cycle_count,
            equity = %total,
            cash = %cash,
            positions = positions.len(),
            drawdown = format!("{:.2}%", self.drawdown.current_drawdown(total) * 100.0),
            "Cycle complete"
        );

        Ok(())
    }

    /// Steps 3–4: choose candidates and analyze them on the bounded pool.
    async fn scan_candidates(&self) -> Result<()> {
        let positions = self.store.list_open_positions()?;
        let (cash, positions_value) = self.compute_equity(&positions).await?;
        let snapshot = PortfolioSnapshot {
            equity: cash + positions_value,
            open_products: positions.iter().map(|p| p.product.clone()).collect(),
            total_exposure: positions_value,
            halted: self.drawdown.halted,
        };

        let candidates = self.select_candidates(&positions);
        debug!(count = candidates.len(), "Candidates selected");

        let semaphore = Arc::new(Semaphore::new(self.config.trading.analysis_workers));
        let mut handles = Vec::with_capacity(candidates.len());

        for product_id in candidates {
            let permit = Arc::clone(&semaphore);
            let gateway = Arc::clone(&self.gateway);
            let manager = Arc::clone(&self.manager);
            let strategy = Arc::clone(&self.strategy);
            let config = Arc::clone(&self.config);
            let snapshot = snapshot.clone();
            let shutdown = self.shutdown_rx.clone();

            handles.push(tokio::spawn(async move {
                let _permit = permit.acquire().await.expect("semaphore closed");
                if *shutdown.borrow() {
                    return;
                }

                let result: Result<()> = async {
                    let candles = gateway
                        .get_candles(
                            &product_id,
                            &config.trading.granularity,
                            config.trading.candle_history,
                        )
                        .await?;
                    let series = enrich(&candles);
                    let signal = strategy.analyze(&series, &product_id);

                    debug!(
                        product = %product_id,
                        action = %signal.action,
                        confidence = format!("{:.2}", signal.confidence),
                        "Candidate analyzed"
                    );

                    if signal.action == SignalAction::Buy
                        && signal.confidence >= config.trading.min_signal_confidence
                    {
                        info!(
                            product = %product_id,
                            confidence = format!("{:.2}", signal.confidence),
                            reasons = ?signal.reasons,
                            "BUY signal, attempting entry"
                        );
                        match manager
                            .execute_entry(&product_id, signal.confidence, &snapshot)
                            .await?
                        {
                            EntryOutcome::Entered { position_id, .. } => {
                                info!(product = %product_id, position_id, "Entry complete");
                            }
                            EntryOutcome::Skipped(reason) => {
                                info!(product = %product_id, reason = %reason, "Entry skipped");
                            }
                        }
                    }
                    Ok(())
                }
                .await;

                if let Err(e) = result {
                    // One product failing must not take the cycle down.
                    warn!(product = %product_id, error = %e, "Candidate evaluation failed");
                }
            }));
        }

        for handle in handles {
            let _ = handle.await;
        }
        Ok(())
    }

    /// Products with open positions always stay under watch; the rest of
    /// the budget goes to the highest 24 h quote volume.
    fn select_candidates(&self, positions: &[Position]) -> Vec<ProductId> {
        let position_products: HashSet<ProductId> =
            positions.iter().map(|p| p.product.clone()).collect();

        let mut selected: Vec<ProductId> = position_products.iter().cloned().collect();
        let remaining = self.config.trading.max_products.saturating_sub(selected.len());

        selected.extend(
            self.products
                .iter()
                .filter(|(p, _)| !position_products.contains(&p.id))
                .sorted_by(|a, b| b.1.cmp(&a.1))
                .take(remaining)
                .map(|(p, _)| p.id.clone()),
        );

        selected
    }

    async fn refresh_products(&mut self) -> Result<()> {
        let floor = Money::from_f64(self.risk.config().min_quote_trade);
        self.products = self
            .gateway
            .tradable_products(floor)
            .await
            .context("failed to list tradable products")?;
        self.manager
            .set_products(self.products.iter().map(|(p, _)| p.clone()).collect());
        info!(count = self.products.len(), "Tradable products loaded");
        Ok(())
    }

    fn watched_products(&self) -> Vec<ProductId> {
        self.products
            .iter()
            .sorted_by(|a, b| b.1.cmp(&a.1))
            .take(self.config.trading.max_products)
            .map(|(p, _)| p.id.clone())
            .collect()
    }

    /// Equity valuation. Live mode reads the account balance; paper mode
    /// derives cash from the starting balance, realized PnL, and the cost
    /// of whatever is currently held.
    async fn compute_equity(&self, positions: &[Position]) -> Result<(Money, Money)> {
        let mut positions_value = Money::ZERO;
        for position in positions {
            let size = position.size();
            if size.is_zero() {
                continue;
            }
            match self.gateway.last_price(&position.product).await {
                Ok(price) => positions_value += size * price,
                Err(e) => {
                    // Value at cost when no price is available.
                    warn!(product = %position.product, error = %e, "No live price, valuing at cost");
                    positions_value += position.cost_basis() * size;
                }
            }
        }

        let cash = if self.gateway.is_paper() {
            let starting = Money::from_f64(self.config.trading.paper_starting_cash);
            let realized = self.store.total_realized_pnl()?;
            let held: Money = positions
                .iter()
                .map(|p| p.cost_basis() * p.size())
                .sum();
            starting + realized - held
        } else {
            let accounts = self.gateway.get_accounts().await?;
            accounts
                .iter()
                .filter(|a| a.currency == self.config.trading.quote_currency)
                .map(|a| a.available())
                .sum()
        };

        Ok((cash, positions_value))
    }

    /// Shutdown path: flush state and report the final posture.
    async fn finalize(&mut self) -> Result<EngineExit> {
        let positions = self.store.list_open_positions()?;
        let (cash, positions_value) = self.compute_equity(&positions).await.unwrap_or((
            Money::ZERO,
            Money::ZERO,
        ));
        let total = cash + positions_value;

        let snapshot = EquitySnapshot {
            time: Utc::now(),
            cash_quote: cash,
            positions_value_quote: positions_value,
            total_quote: total,
            open_positions_count: positions.len(),
        };
        self.store.snapshot_equity(&snapshot)?;
        self.store.export_json()?;

        info!(
            equity = %total,
            open_positions = positions.len(),
            halted = self.drawdown.halted,
            "Final state flushed"
        );

        if self.drawdown.halted {
            Ok(EngineExit::DrawdownHalt)
        } else {
            Ok(EngineExit::Clean)
        }
    }
}
