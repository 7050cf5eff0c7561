//! Integration tests for the spot-trader system
//!
//! These tests verify that the order manager, reconciler, store, and
//! monitor work together correctly. Order endpoints run against the
//! paper engine, so the crash-safe entry/exit/reconcile sequences are
//! exercised end to end without touching the network.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::watch;
use uuid::Uuid;

use spot_trader::config::Config;
use spot_trader::gateway::{BidAsk, Credentials, ExchangeGateway, NetPressure, VolumeFlow};
use spot_trader::monitor::{evaluate_exit, ExitDecision};
use spot_trader::oms::{pre_trade_gate, EntryOutcome, ExitOutcome, OrderManager, Reconciler};
use spot_trader::risk::{DrawdownEvent, DrawdownState, EntryDecision, PortfolioSnapshot, RiskManager};
use spot_trader::store::Store;
use spot_trader::types::{
    ExitReason, Fill, Liquidity, Money, Order, OrderStatus, Position, PositionStatus, Product,
    ProductId, Signal, SignalAction,
};

// =============================================================================
// Test Utilities
// =============================================================================

fn test_config() -> Config {
    let mut config = Config::default();
    // Paper fills synthesize after ~2 s; keep waits tight but sufficient.
    config.trading.fill_timeout_seconds = 5;
    config.trading.sell_fill_timeout_seconds = 8;
    config.trading.cancel_verify_seconds = 3;
    config
}

fn test_product(id: &str) -> Product {
    Product {
        id: ProductId::new(id),
        base: id.split('-').next().unwrap_or("BTC").to_string(),
        quote: "USD".to_string(),
        base_increment: Money::parse("0.0001").unwrap(),
        quote_increment: Money::parse("0.01").unwrap(),
        min_base: Money::parse("0.0001").unwrap(),
        min_quote: Money::parse("1").unwrap(),
        view_only: false,
        trading_disabled: false,
    }
}

struct Harness {
    manager: Arc<OrderManager>,
    store: Arc<Store>,
    gateway: Arc<ExchangeGateway>,
    _shutdown_tx: watch::Sender<bool>,
}

fn harness(config: Config) -> Harness {
    let config = Arc::new(config);
    let gateway = Arc::new(ExchangeGateway::new(
        Credentials::new("test", "test"),
        &config,
    ));
    let store = Arc::new(Store::in_memory().unwrap());
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let manager = Arc::new(OrderManager::new(
        Arc::clone(&gateway),
        Arc::clone(&store),
        RiskManager::new(config.risk.clone()),
        Arc::clone(&config),
        shutdown_rx,
        "momentum".to_string(),
    ));
    manager.set_products(vec![
        test_product("BTC-USD"),
        test_product("ETH-USD"),
        test_product("DOGE-USD"),
    ]);

    Harness {
        manager,
        store,
        gateway,
        _shutdown_tx: shutdown_tx,
    }
}

fn fill(order_client_id: Uuid, id: &str, price: &str, size: &str, fee: &str) -> Fill {
    Fill {
        fill_id: id.to_string(),
        order_client_id,
        price: Money::parse(price).unwrap(),
        size: Money::parse(size).unwrap(),
        fee: Money::parse(fee).unwrap(),
        liquidity: Liquidity::Maker,
        time: Utc::now(),
    }
}

// =============================================================================
// Entry, fill, brackets, exit (paper end-to-end)
// =============================================================================

#[tokio::test(flavor = "multi_thread")]
async fn test_entry_fills_opens_position_and_installs_brackets() {
    let h = harness(test_config());
    let product = test_product("BTC-USD");

    let outcome = h
        .manager
        .place_entry_order(
            &product,
            Money::parse("50000.00").unwrap(),
            Money::parse("0.0100").unwrap(),
        )
        .await
        .unwrap();

    let position_id = match outcome {
        EntryOutcome::Entered { position_id, .. } => position_id,
        EntryOutcome::Skipped(reason) => panic!("entry skipped: {reason}"),
    };

    let position = h.store.get_position(position_id).unwrap().unwrap();
    assert_eq!(position.status, PositionStatus::Open);
    assert_eq!(position.entry_fills.len(), 1);
    assert!(!position.unprotected);
    assert!(position.stop_order_id.is_some());
    assert!(position.take_profit_order_id.is_some());

    // Entry fill landed at the limit price with the maker fee
    let entry_fill = &position.entry_fills[0];
    assert_eq!(entry_fill.price, Money::parse("50000.00").unwrap());
    assert_eq!(entry_fill.size, Money::parse("0.0100").unwrap());
    assert_eq!(entry_fill.liquidity, Liquidity::Maker);

    // Cost basis is fee-inclusive
    let naive =
        (entry_fill.price * entry_fill.size + entry_fill.fee) / entry_fill.size;
    assert_eq!(position.cost_basis(), naive);

    // Brackets are live orders in the store
    let stop = h
        .store
        .get_order(position.stop_order_id.unwrap())
        .unwrap()
        .unwrap();
    assert_eq!(stop.status, OrderStatus::Open);
    assert!(stop.exchange_id.is_some());
}

#[tokio::test(flavor = "multi_thread")]
async fn test_exit_cancels_brackets_sells_and_records_trade() {
    let h = harness(test_config());
    let product = test_product("ETH-USD");

    let outcome = h
        .manager
        .place_entry_order(
            &product,
            Money::parse("3000.00").unwrap(),
            Money::parse("0.1000").unwrap(),
        )
        .await
        .unwrap();
    let position_id = match outcome {
        EntryOutcome::Entered { position_id, .. } => position_id,
        EntryOutcome::Skipped(reason) => panic!("entry skipped: {reason}"),
    };

    // The paper market sell fills at the cached stream price
    h.gateway
        .price_cache()
        .update(product.id.clone(), Money::parse("3150.00").unwrap());

    let position = h.store.get_position(position_id).unwrap().unwrap();
    let exit = h
        .manager
        .execute_exit(&position, ExitReason::SignalProfitExit)
        .await
        .unwrap();
    assert!(matches!(exit, ExitOutcome::Closed { .. }));

    let closed = h.store.get_position(position_id).unwrap().unwrap();
    assert_eq!(closed.status, PositionStatus::Closed);
    assert_eq!(closed.exit_fills.len(), 1);

    // Brackets ended terminal, not left dangling on the exchange
    let stop = h
        .store
        .get_order(position.stop_order_id.unwrap())
        .unwrap()
        .unwrap();
    assert!(stop.is_terminal());

    let trades = h.store.trade_history(10).unwrap();
    assert_eq!(trades.len(), 1);
    let trade = &trades[0];
    assert_eq!(trade.exit_reason, "signal_profit_exit");
    assert_eq!(trade.strategy, "momentum");
    // 0.1 * (3150 - 3000) = 15 gross
    assert_eq!(trade.gross_pnl, Money::parse("15").unwrap());
    assert!(trade.net_pnl < trade.gross_pnl); // fees came out
    assert!(trade.net_pnl.is_positive());

    // No duplicate open position remains
    assert!(h.store.get_open_position(&product.id).unwrap().is_none());
}

// =============================================================================
// S5: Ghost-order prevention
// =============================================================================

#[tokio::test(flavor = "multi_thread")]
async fn test_unfilled_entry_times_out_and_cancels() {
    let mut config = test_config();
    config.trading.fill_timeout_seconds = 0; // force immediate timeout
    let h = harness(config);
    let product = test_product("BTC-USD");

    let outcome = h
        .manager
        .place_entry_order(
            &product,
            Money::parse("50000.00").unwrap(),
            Money::parse("0.0100").unwrap(),
        )
        .await
        .unwrap();

    match outcome {
        EntryOutcome::Skipped(reason) => assert!(reason.contains("timed out"), "{reason}"),
        EntryOutcome::Entered { .. } => panic!("order should not have filled"),
    }

    // The order row converged to cancelled; no position was ever created.
    let orders = h.store.list_open_orders().unwrap();
    assert!(orders.is_empty(), "no working orders should remain");
    assert!(h.store.get_open_position(&product.id).unwrap().is_none());
    assert!(h.store.list_open_positions().unwrap().is_empty());
}

#[tokio::test(flavor = "multi_thread")]
async fn test_crash_between_cancel_and_verify_converges_on_restart() {
    let h = harness(test_config());
    let product = test_product("BTC-USD");

    // Place a real (paper) resting order, then simulate a crash that left
    // the row in `cancelling` before verification completed.
    let order = Order::new(
        product.id.clone(),
        spot_trader::types::Side::Sell,
        spot_trader::types::OrderKind::StopLimit,
        spot_trader::types::OrderRole::Stop,
        Money::parse("0.0100").unwrap(),
    )
    .with_stop(
        Money::parse("49000.00").unwrap(),
        Money::parse("48990.00").unwrap(),
    );
    h.store.upsert_order(&order).unwrap();

    let ack = h
        .gateway
        .place_order(&spot_trader::gateway::PlaceOrderRequest {
            client_order_id: order.client_id.to_string(),
            product_id: product.id.as_str().to_string(),
            side: "SELL".to_string(),
            order_configuration: spot_trader::gateway::OrderConfiguration::StopLimitStopLimitGtc {
                base_size: "0.0100".to_string(),
                limit_price: "48990.00".to_string(),
                stop_price: "49000.00".to_string(),
                stop_direction: "STOP_DIRECTION_STOP_DOWN".to_string(),
            },
        })
        .await
        .unwrap();
    h.store
        .set_order_exchange_id(order.client_id, &ack.order_id)
        .unwrap();
    h.store
        .update_order_status(order.client_id, OrderStatus::Cancelling)
        .unwrap();

    // "Restart": the reconciler picks the cancelling order up and finishes
    // the verification loop.
    let reconciler = Reconciler::new(Arc::clone(&h.manager));
    reconciler.sweep().await.unwrap();

    let converged = h.store.get_order(order.client_id).unwrap().unwrap();
    assert_eq!(converged.status, OrderStatus::Cancelled);
    assert!(h.store.get_open_position(&product.id).unwrap().is_none());
}

#[tokio::test(flavor = "multi_thread")]
async fn test_reconciler_is_idempotent() {
    let h = harness(test_config());
    let product = test_product("DOGE-USD");

    // A working paper order the reconciler has nothing to do about
    let order = Order::new(
        product.id.clone(),
        spot_trader::types::Side::Buy,
        spot_trader::types::OrderKind::LimitGtcPostOnly,
        spot_trader::types::OrderRole::Entry,
        Money::parse("1000").unwrap(),
    )
    .with_limit_price(Money::parse("0.0070").unwrap());
    h.store.upsert_order(&order).unwrap();
    let ack = h
        .gateway
        .place_order(&spot_trader::gateway::PlaceOrderRequest {
            client_order_id: order.client_id.to_string(),
            product_id: product.id.as_str().to_string(),
            side: "BUY".to_string(),
            order_configuration: spot_trader::gateway::OrderConfiguration::LimitLimitGtc {
                base_size: "1000".to_string(),
                limit_price: "0.0070".to_string(),
                post_only: true,
            },
        })
        .await
        .unwrap();
    h.store
        .set_order_exchange_id(order.client_id, &ack.order_id)
        .unwrap();
    h.store
        .update_order_status(order.client_id, OrderStatus::Open)
        .unwrap();

    let reconciler = Reconciler::new(Arc::clone(&h.manager));
    reconciler.sweep().await.unwrap();
    let after_first: Vec<(Uuid, OrderStatus)> = h
        .store
        .list_open_orders()
        .unwrap()
        .iter()
        .map(|o| (o.client_id, o.status))
        .collect();

    reconciler.sweep().await.unwrap();
    let after_second: Vec<(Uuid, OrderStatus)> = h
        .store
        .list_open_orders()
        .unwrap()
        .iter()
        .map(|o| (o.client_id, o.status))
        .collect();

    assert_eq!(after_first, after_second);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_reconciler_adopts_orphaned_filled_entry() {
    // Simulate a crash after the entry filled but before the position was
    // opened: on restart the reconciler must create the position and
    // install brackets.
    let h = harness(test_config());
    let product = test_product("ETH-USD");

    let order = Order::new(
        product.id.clone(),
        spot_trader::types::Side::Buy,
        spot_trader::types::OrderKind::LimitGtcPostOnly,
        spot_trader::types::OrderRole::Entry,
        Money::parse("0.1000").unwrap(),
    )
    .with_limit_price(Money::parse("3000.00").unwrap());
    h.store.upsert_order(&order).unwrap();

    let ack = h
        .gateway
        .place_order(&spot_trader::gateway::PlaceOrderRequest {
            client_order_id: order.client_id.to_string(),
            product_id: product.id.as_str().to_string(),
            side: "BUY".to_string(),
            order_configuration: spot_trader::gateway::OrderConfiguration::LimitLimitGtc {
                base_size: "0.1000".to_string(),
                limit_price: "3000.00".to_string(),
                post_only: true,
            },
        })
        .await
        .unwrap();
    h.store
        .set_order_exchange_id(order.client_id, &ack.order_id)
        .unwrap();
    h.store
        .update_order_status(order.client_id, OrderStatus::Open)
        .unwrap();

    // Let the paper order fill, then "restart" into a sweep.
    tokio::time::sleep(std::time::Duration::from_millis(2300)).await;
    let reconciler = Reconciler::new(Arc::clone(&h.manager));
    reconciler.sweep().await.unwrap();

    let position = h
        .store
        .get_open_position(&product.id)
        .unwrap()
        .expect("reconciler should have opened the position");
    assert_eq!(position.entry_fills.len(), 1);
    assert!(position.stop_order_id.is_some());

    // A second sweep changes nothing: still exactly one open position.
    reconciler.sweep().await.unwrap();
    assert_eq!(h.store.list_open_positions().unwrap().len(), 1);
}

// =============================================================================
// S6: Entry guard
// =============================================================================

#[test]
fn test_wide_spread_rejected_before_any_order() {
    let config = Config::default();
    let quote = BidAsk {
        product_id: "BTC-USD".to_string(),
        bid: "100.00".to_string(),
        ask: "100.80".to_string(),
    };
    let flow = VolumeFlow {
        buy_volume: 600.0,
        sell_volume: 400.0,
        buy_pressure: 0.6,
        net_pressure: NetPressure::StrongBuy,
    };

    let rejection = pre_trade_gate(&quote, &flow, &config.risk).expect("gate should reject");
    assert!(rejection.contains("spread_too_wide"), "{rejection}");
}

#[test]
fn test_weak_buy_pressure_rejected() {
    let config = Config::default();
    let quote = BidAsk {
        product_id: "BTC-USD".to_string(),
        bid: "100.00".to_string(),
        ask: "100.05".to_string(),
    };
    let flow = VolumeFlow {
        buy_volume: 300.0,
        sell_volume: 700.0,
        buy_pressure: 0.3,
        net_pressure: NetPressure::StrongSell,
    };

    let rejection = pre_trade_gate(&quote, &flow, &config.risk).expect("gate should reject");
    assert!(rejection.contains("weak_buy_pressure"), "{rejection}");
}

#[test]
fn test_tight_spread_and_strong_flow_pass() {
    let config = Config::default();
    let quote = BidAsk {
        product_id: "BTC-USD".to_string(),
        bid: "100.00".to_string(),
        ask: "100.05".to_string(),
    };
    let flow = VolumeFlow {
        buy_volume: 550.0,
        sell_volume: 450.0,
        buy_pressure: 0.55,
        net_pressure: NetPressure::ModerateBuy,
    };
    assert!(pre_trade_gate(&quote, &flow, &config.risk).is_none());
}

// =============================================================================
// S1-S4: Signal-confirmed exits against a literal cost basis
// =============================================================================

fn seeded_position() -> Position {
    let order_id = Uuid::new_v4();
    Position {
        id: 1,
        product: ProductId::new("DOGE-USD"),
        status: PositionStatus::Open,
        opened_at: Utc::now(),
        closed_at: None,
        entry_fills: vec![
            fill(order_id, "f1", "0.007000", "1000", "0.05"),
            fill(order_id, "f2", "0.008000", "500", "0.03"),
            fill(order_id, "f3", "0.006900", "1500", "0.07"),
        ],
        exit_fills: vec![],
        stop_order_id: None,
        take_profit_order_id: None,
        unprotected: false,
    }
}

#[test]
fn test_s1_profit_exit_requires_five_percent() {
    let config = Config::default();
    let position = seeded_position();
    let basis = position.cost_basis().to_f64();
    assert!((basis - 0.007167).abs() < 1e-6, "basis = {basis}");

    let hold_signal = Signal::new(SignalAction::Hold, 0.3, vec!["quiet".to_string()]);

    // +3.04%: no exit
    let pnl = (0.007385 - basis) / basis;
    assert_eq!(
        evaluate_exit(pnl, &hold_signal, &config.exit, false),
        ExitDecision::Hold
    );

    // +5.0%: sell on HOLD
    let pnl = (0.007526 - basis) / basis;
    assert_eq!(
        evaluate_exit(pnl, &hold_signal, &config.exit, false),
        ExitDecision::Sell(ExitReason::SignalProfitExit)
    );
}

#[test]
fn test_s2_winner_runs_on_buy_signal() {
    let config = Config::default();
    let position = seeded_position();
    let basis = position.cost_basis().to_f64();

    let buy_signal = Signal::new(SignalAction::Buy, 0.72, vec!["still trending".to_string()]);
    let pnl = (0.007600 - basis) / basis;
    assert_eq!(
        evaluate_exit(pnl, &buy_signal, &config.exit, false),
        ExitDecision::ProfitHold
    );
}

#[test]
fn test_s3_confident_loss_cut() {
    let config = Config::default();
    let sell_signal = Signal::new(SignalAction::Sell, 0.68, vec!["breaking down".to_string()]);
    let pnl = (97.90 - 100.00) / 100.00;
    assert_eq!(
        evaluate_exit(pnl, &sell_signal, &config.exit, false),
        ExitDecision::Sell(ExitReason::SignalLossExit)
    );
}

#[test]
fn test_s4_shallow_loss_without_strong_sell_warns() {
    let config = Config::default();
    let hold_signal = Signal::new(SignalAction::Hold, 0.55, vec!["unclear".to_string()]);
    let pnl = (97.90 - 100.00) / 100.00;
    assert_eq!(
        evaluate_exit(pnl, &hold_signal, &config.exit, false),
        ExitDecision::LossWarning
    );
}

// =============================================================================
// S7: Drawdown halt and release, wired through the risk gate
// =============================================================================

#[test]
fn test_s7_drawdown_halt_blocks_entries_until_release() {
    let config = Config::default();
    let risk = RiskManager::new(config.risk.clone());
    let mut state = DrawdownState::new(Money::from_i64(10_000));

    assert_eq!(
        risk.update_drawdown(&mut state, Money::from_i64(9_500)),
        DrawdownEvent::None
    );
    assert_eq!(
        risk.update_drawdown(&mut state, Money::from_i64(8_800)),
        DrawdownEvent::None
    );
    assert_eq!(
        risk.update_drawdown(&mut state, Money::from_i64(8_400)),
        DrawdownEvent::Halted
    );

    // While halted, no entry gets through the admission gate.
    let snapshot = PortfolioSnapshot {
        equity: Money::from_i64(8_400),
        open_products: vec![],
        total_exposure: Money::ZERO,
        halted: state.halted,
    };
    let decision = risk.can_open(&ProductId::new("BTC-USD"), Money::from_i64(100), &snapshot);
    assert!(matches!(decision, EntryDecision::Rejected(r) if r.contains("halt")));

    // Recovery above 95% of peak releases the halt and entries resume.
    assert_eq!(
        risk.update_drawdown(&mut state, Money::from_i64(9_600)),
        DrawdownEvent::Released
    );
    let snapshot = PortfolioSnapshot {
        equity: Money::from_i64(9_600),
        open_products: vec![],
        total_exposure: Money::ZERO,
        halted: state.halted,
    };
    assert!(risk
        .can_open(&ProductId::new("BTC-USD"), Money::from_i64(100), &snapshot)
        .is_approved());
}

// =============================================================================
// Universal invariants
// =============================================================================

#[test]
fn test_client_ids_never_collide() {
    let product = ProductId::new("BTC-USD");
    let mut seen = HashSet::new();
    for _ in 0..1000 {
        let order = Order::new(
            product.clone(),
            spot_trader::types::Side::Buy,
            spot_trader::types::OrderKind::Market,
            spot_trader::types::OrderRole::Entry,
            Money::ONE,
        );
        assert!(seen.insert(order.client_id), "duplicate client_id generated");
    }
}

#[test]
fn test_monetary_roundtrip_avg_price_within_one_increment() {
    let store = Store::in_memory().unwrap();
    let order = Order::new(
        ProductId::new("DOGE-USD"),
        spot_trader::types::Side::Buy,
        spot_trader::types::OrderKind::LimitGtcPostOnly,
        spot_trader::types::OrderRole::Entry,
        Money::parse("3000").unwrap(),
    )
    .with_limit_price(Money::parse("0.008").unwrap());
    store.upsert_order(&order).unwrap();

    let fills = [
        ("0.007000", "1000"),
        ("0.008000", "500"),
        ("0.006900", "1500"),
    ];
    for (i, (price, size)) in fills.iter().enumerate() {
        store
            .record_fill(&fill(order.client_id, &format!("f{i}"), price, size, "0"))
            .unwrap();
    }

    let persisted = store.get_order(order.client_id).unwrap().unwrap();

    // Naive recomputation: Σ(price·size) / Σsize
    let notional = 0.007 * 1000.0 + 0.008 * 500.0 + 0.0069 * 1500.0;
    let naive = notional / 3000.0;
    let diff = (persisted.avg_fill_price.to_f64() - naive).abs();
    let quote_increment = 0.000001;
    assert!(diff <= quote_increment, "avg drifted by {diff}");
    assert_eq!(persisted.filled_size, Money::parse("3000").unwrap());
    assert_eq!(persisted.status, OrderStatus::Filled);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_one_open_position_per_product_end_to_end() {
    let h = harness(test_config());
    let product = test_product("BTC-USD");

    let first = h
        .manager
        .place_entry_order(
            &product,
            Money::parse("50000.00").unwrap(),
            Money::parse("0.0100").unwrap(),
        )
        .await
        .unwrap();
    assert!(matches!(first, EntryOutcome::Entered { .. }));

    // A second fill for the same product must refuse to open a duplicate.
    let second = h
        .manager
        .place_entry_order(
            &product,
            Money::parse("49000.00").unwrap(),
            Money::parse("0.0100").unwrap(),
        )
        .await;
    assert!(second.is_err(), "duplicate position open must fail loudly");

    assert_eq!(h.store.list_open_positions().unwrap().len(), 1);
}
