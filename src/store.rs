// Durable Store for Live Trading
// SQLite-based persistence with JSON backup
//
// Single-writer, multi-reader store behind a transactional interface.
// Orders become visible here before anything is sent to the exchange;
// that ordering is the anchor of ghost-order prevention.

use anyhow::{Context, Result};
use chrono::{DateTime, Duration, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tracing::{debug, info};
use uuid::Uuid;

use crate::types::{
    EquitySnapshot, ExitReason, Fill, Liquidity, Money, Order, OrderKind, OrderRole, OrderStatus,
    Position, PositionStatus, ProductId, Side, TradeRecord,
};

/// Invariant violations the store refuses to perform.
///
/// Consistency errors are logged at the caller and never silently
/// corrected.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("order {client_id} is terminal ({status}) and cannot be reopened")]
    TerminalOrderReopened { client_id: Uuid, status: String },

    #[error("a position is already open for {product}")]
    DuplicateOpenPosition { product: ProductId },

    #[error("unknown order {0}")]
    UnknownOrder(Uuid),

    #[error("unknown position {0}")]
    UnknownPosition(i64),

    #[error("position {0} is already closed")]
    PositionAlreadyClosed(i64),
}

pub struct Store {
    conn: Arc<Mutex<Connection>>,
    json_backup_path: Option<PathBuf>,
}

impl Store {
    pub fn new<P: AsRef<Path>>(db_path: P) -> Result<Self> {
        let db_path = db_path.as_ref();

        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(db_path)
            .with_context(|| format!("Failed to open database: {}", db_path.display()))?;

        // WAL for concurrency; synchronous=FULL so a commit survives a crash
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "FULL")?;
        conn.pragma_update(None, "foreign_keys", "ON")?;

        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
            json_backup_path: db_path.parent().map(|p| p.join("trading_state.json")),
        };

        store.create_tables()?;
        info!("Durable store initialized at {}", db_path.display());

        Ok(store)
    }

    /// In-memory store for tests.
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
            json_backup_path: None,
        };
        store.create_tables()?;
        Ok(store)
    }

    fn create_tables(&self) -> Result<()> {
        let conn = self.conn.lock().unwrap();

        conn.execute(
            "CREATE TABLE IF NOT EXISTS orders (
                client_id TEXT PRIMARY KEY,
                exchange_id TEXT,
                product TEXT NOT NULL,
                side TEXT NOT NULL,
                kind TEXT NOT NULL,
                role TEXT NOT NULL,
                requested_price TEXT,
                requested_size TEXT NOT NULL,
                stop_price TEXT,
                limit_price TEXT,
                status TEXT NOT NULL,
                filled_size TEXT NOT NULL DEFAULT '0',
                avg_fill_price TEXT NOT NULL DEFAULT '0',
                submitted_at TEXT NOT NULL,
                terminal_at TEXT,
                position_id INTEGER,
                metadata TEXT DEFAULT 'null',
                updated_at TEXT DEFAULT CURRENT_TIMESTAMP
            )",
            [],
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS fills (
                fill_id TEXT PRIMARY KEY,
                order_client_id TEXT NOT NULL REFERENCES orders(client_id),
                price TEXT NOT NULL,
                size TEXT NOT NULL,
                fee TEXT NOT NULL,
                liquidity TEXT NOT NULL,
                time TEXT NOT NULL
            )",
            [],
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS positions (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                product TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'open',
                opened_at TEXT NOT NULL,
                closed_at TEXT,
                stop_order_id TEXT,
                take_profit_order_id TEXT,
                unprotected INTEGER NOT NULL DEFAULT 0
            )",
            [],
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS trades (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                product TEXT NOT NULL,
                entry_time TEXT NOT NULL,
                exit_time TEXT NOT NULL,
                avg_entry TEXT NOT NULL,
                avg_exit TEXT NOT NULL,
                size TEXT NOT NULL,
                gross_pnl TEXT NOT NULL,
                fees TEXT NOT NULL,
                net_pnl TEXT NOT NULL,
                pnl_pct REAL NOT NULL,
                strategy TEXT NOT NULL,
                exit_reason TEXT NOT NULL,
                created_at TEXT DEFAULT CURRENT_TIMESTAMP
            )",
            [],
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS equity_snapshots (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                time TEXT NOT NULL,
                cash_quote TEXT NOT NULL,
                positions_value_quote TEXT NOT NULL,
                total_quote TEXT NOT NULL,
                open_positions_count INTEGER NOT NULL
            )",
            [],
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS bot_state (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL,
                updated_at TEXT DEFAULT CURRENT_TIMESTAMP
            )",
            [],
        )?;

        // The store-level guarantee behind "one open position per product"
        conn.execute(
            "CREATE UNIQUE INDEX IF NOT EXISTS idx_positions_one_open
             ON positions(product) WHERE status = 'open'",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_orders_status ON orders(status)",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_orders_exchange_id ON orders(exchange_id)",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_fills_order ON fills(order_client_id)",
            [],
        )?;

        debug!("Database schema created/verified");
        Ok(())
    }

    // =========================================================================
    // Orders
    // =========================================================================

    /// Atomic insert-or-update by client id.
    ///
    /// Refuses to move an order out of a terminal state.
    pub fn upsert_order(&self, order: &Order) -> Result<()> {
        let conn = self.conn.lock().unwrap();

        let existing: Option<String> = conn
            .query_row(
                "SELECT status FROM orders WHERE client_id = ?1",
                params![order.client_id.to_string()],
                |row| row.get(0),
            )
            .optional()?;

        if let Some(status_str) = existing {
            let existing_status = OrderStatus::parse(&status_str);
            if existing_status.map(|s| s.is_terminal()).unwrap_or(false)
                && !order.status.is_terminal()
            {
                return Err(StoreError::TerminalOrderReopened {
                    client_id: order.client_id,
                    status: status_str,
                }
                .into());
            }
        }

        conn.execute(
            "INSERT OR REPLACE INTO orders
             (client_id, exchange_id, product, side, kind, role, requested_price,
              requested_size, stop_price, limit_price, status, filled_size,
              avg_fill_price, submitted_at, terminal_at, position_id, metadata, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, CURRENT_TIMESTAMP)",
            params![
                order.client_id.to_string(),
                order.exchange_id,
                order.product.as_str(),
                order.side.as_str(),
                order.kind.as_str(),
                order.role.as_str(),
                order.requested_price.map(|p| p.to_string()),
                order.requested_size.to_string(),
                order.stop_price.map(|p| p.to_string()),
                order.limit_price.map(|p| p.to_string()),
                order.status.as_str(),
                order.filled_size.to_string(),
                order.avg_fill_price.to_string(),
                order.submitted_at.to_rfc3339(),
                order.terminal_at.map(|t| t.to_rfc3339()),
                order.position_id,
                serde_json::to_string(&order.metadata)?,
            ],
        )?;

        debug!(
            client_id = %order.client_id,
            product = %order.product,
            status = order.status.as_str(),
            "Order persisted"
        );
        Ok(())
    }

    /// Record the exchange's acknowledgement id for an order.
    pub fn set_order_exchange_id(&self, client_id: Uuid, exchange_id: &str) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        let n = conn.execute(
            "UPDATE orders SET exchange_id = ?2, updated_at = CURRENT_TIMESTAMP
             WHERE client_id = ?1",
            params![client_id.to_string(), exchange_id],
        )?;
        if n == 0 {
            return Err(StoreError::UnknownOrder(client_id).into());
        }
        Ok(())
    }

    /// Transition an order's status, enforcing terminal monotonicity.
    pub fn update_order_status(&self, client_id: Uuid, status: OrderStatus) -> Result<()> {
        let conn = self.conn.lock().unwrap();

        let current: Option<String> = conn
            .query_row(
                "SELECT status FROM orders WHERE client_id = ?1",
                params![client_id.to_string()],
                |row| row.get(0),
            )
            .optional()?;

        let current = current.ok_or(StoreError::UnknownOrder(client_id))?;
        let current_status = OrderStatus::parse(&current);

        if current_status.map(|s| s.is_terminal()).unwrap_or(false) {
            if current == status.as_str() {
                return Ok(()); // idempotent re-apply of the same terminal state
            }
            return Err(StoreError::TerminalOrderReopened {
                client_id,
                status: current,
            }
            .into());
        }

        let terminal_at = if status.is_terminal() {
            Some(Utc::now().to_rfc3339())
        } else {
            None
        };

        conn.execute(
            "UPDATE orders SET status = ?2, terminal_at = COALESCE(?3, terminal_at),
             updated_at = CURRENT_TIMESTAMP WHERE client_id = ?1",
            params![client_id.to_string(), status.as_str(), terminal_at],
        )?;

        debug!(client_id = %client_id, status = status.as_str(), "Order status updated");
        Ok(())
    }

    pub fn get_order(&self, client_id: Uuid) -> Result<Option<Order>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM orders WHERE client_id = ?1",
            ORDER_COLUMNS
        ))?;
        let order = stmt
            .query_row(params![client_id.to_string()], row_to_order)
            .optional()?;
        Ok(order)
    }

    pub fn get_order_by_exchange_id(&self, exchange_id: &str) -> Result<Option<Order>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM orders WHERE exchange_id = ?1",
            ORDER_COLUMNS
        ))?;
        let order = stmt.query_row(params![exchange_id], row_to_order).optional()?;
        Ok(order)
    }

    /// All orders not yet in a terminal state.
    pub fn list_open_orders(&self) -> Result<Vec<Order>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM orders
             WHERE status NOT IN ('filled', 'cancelled', 'expired', 'rejected')
             ORDER BY submitted_at",
            ORDER_COLUMNS
        ))?;
        let orders = stmt
            .query_map([], row_to_order)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(orders)
    }

    /// Non-terminal orders submitted more than `age` ago.
    pub fn list_orders_older_than(&self, age: Duration) -> Result<Vec<Order>> {
        let cutoff = (Utc::now() - age).to_rfc3339();
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM orders
             WHERE status NOT IN ('filled', 'cancelled', 'expired', 'rejected')
               AND submitted_at < ?1
             ORDER BY submitted_at",
            ORDER_COLUMNS
        ))?;
        let orders = stmt
            .query_map(params![cutoff], row_to_order)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(orders)
    }

    // =========================================================================
    // Fills
    // =========================================================================

    /// Append a fill and fold it into the parent order in one transaction.
    ///
    /// Idempotent on fill_id: replayed user-channel events are no-ops.
    /// Promotes the order to `filled` when cumulative size reaches the
    /// requested size.
    pub fn record_fill(&self, fill: &Fill) -> Result<()> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;

        let inserted = tx.execute(
            "INSERT OR IGNORE INTO fills (fill_id, order_client_id, price, size, fee, liquidity, time)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                fill.fill_id,
                fill.order_client_id.to_string(),
                fill.price.to_string(),
                fill.size.to_string(),
                fill.fee.to_string(),
                fill.liquidity.as_str(),
                fill.time.to_rfc3339(),
            ],
        )?;

        if inserted == 0 {
            // Fill already known; nothing to re-aggregate.
            tx.commit()?;
            return Ok(());
        }

        // Re-aggregate from fills ordered by (time, fill_id); out-of-order
        // user-channel events land correctly because fill_id is authoritative.
        let (filled_size, notional): (Money, Money) = {
            let mut stmt = tx.prepare(
                "SELECT price, size FROM fills WHERE order_client_id = ?1
                 ORDER BY time, fill_id",
            )?;
            let rows = stmt.query_map(params![fill.order_client_id.to_string()], |row| {
                let price: String = row.get(0)?;
                let size: String = row.get(1)?;
                Ok((price, size))
            })?;
            let mut total = Money::ZERO;
            let mut notional = Money::ZERO;
            for row in rows {
                let (price, size) = row?;
                let price = Money::parse(&price).unwrap_or(Money::ZERO);
                let size = Money::parse(&size).unwrap_or(Money::ZERO);
                total += size;
                notional += price * size;
            }
            (total, notional)
        };

        let avg = if filled_size.is_zero() {
            Money::ZERO
        } else {
            notional / filled_size
        };

        let (requested_size, status): (String, String) = tx.query_row(
            "SELECT requested_size, status FROM orders WHERE client_id = ?1",
            params![fill.order_client_id.to_string()],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )?;
        let requested = Money::parse(&requested_size).unwrap_or(Money::ZERO);
        let current = OrderStatus::parse(&status);

        let new_status = if filled_size >= requested && !requested.is_zero() {
            OrderStatus::Filled
        } else if matches!(current, Some(s) if s.is_terminal()) {
            // Late fill for an already-terminal order: keep the terminal state.
            current.unwrap()
        } else {
            OrderStatus::PartiallyFilled
        };

        let terminal_at = if new_status.is_terminal() {
            Some(Utc::now().to_rfc3339())
        } else {
            None
        };

        tx.execute(
            "UPDATE orders SET filled_size = ?2, avg_fill_price = ?3, status = ?4,
             terminal_at = COALESCE(?5, terminal_at), updated_at = CURRENT_TIMESTAMP
             WHERE client_id = ?1",
            params![
                fill.order_client_id.to_string(),
                filled_size.to_string(),
                avg.to_string(),
                new_status.as_str(),
                terminal_at,
            ],
        )?;

        tx.commit()?;

        debug!(
            order = %fill.order_client_id,
            fill_id = %fill.fill_id,
            filled = %filled_size,
            "Fill recorded"
        );
        Ok(())
    }

    pub fn fills_for_order(&self, client_id: Uuid) -> Result<Vec<Fill>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT fill_id, order_client_id, price, size, fee, liquidity, time
             FROM fills WHERE order_client_id = ?1 ORDER BY time, fill_id",
        )?;
        let fills = stmt
            .query_map(params![client_id.to_string()], row_to_fill)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(fills)
    }

    // =========================================================================
    // Positions
    // =========================================================================

    /// Open a position backed by a filled entry order.
    ///
    /// Fails if another position is open for the same product (both a
    /// pre-check and the partial unique index enforce this).
    pub fn open_position(&self, product: &ProductId, entry_client_id: Uuid) -> Result<i64> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;

        let already_open: Option<i64> = tx
            .query_row(
                "SELECT id FROM positions WHERE product = ?1 AND status = 'open'",
                params![product.as_str()],
                |row| row.get(0),
            )
            .optional()?;
        if already_open.is_some() {
            return Err(StoreError::DuplicateOpenPosition {
                product: product.clone(),
            }
            .into());
        }

        tx.execute(
            "INSERT INTO positions (product, status, opened_at) VALUES (?1, 'open', ?2)",
            params![product.as_str(), Utc::now().to_rfc3339()],
        )?;
        let position_id = tx.last_insert_rowid();

        let n = tx.execute(
            "UPDATE orders SET position_id = ?2, updated_at = CURRENT_TIMESTAMP
             WHERE client_id = ?1",
            params![entry_client_id.to_string(), position_id],
        )?;
        if n == 0 {
            return Err(StoreError::UnknownOrder(entry_client_id).into());
        }

        tx.commit()?;
        info!(product = %product, position_id, "Position opened");
        Ok(position_id)
    }

    /// Attach bracket order ids (or mark unprotected when installation failed).
    pub fn set_position_brackets(
        &self,
        position_id: i64,
        stop_order_id: Option<Uuid>,
        take_profit_order_id: Option<Uuid>,
        unprotected: bool,
    ) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        let n = conn.execute(
            "UPDATE positions SET stop_order_id = ?2, take_profit_order_id = ?3, unprotected = ?4
             WHERE id = ?1",
            params![
                position_id,
                stop_order_id.map(|u| u.to_string()),
                take_profit_order_id.map(|u| u.to_string()),
                unprotected as i64,
            ],
        )?;
        if n == 0 {
            return Err(StoreError::UnknownPosition(position_id).into());
        }
        Ok(())
    }

    pub fn get_position(&self, position_id: i64) -> Result<Option<Position>> {
        let conn = self.conn.lock().unwrap();
        let header = conn
            .query_row(
                "SELECT id, product, status, opened_at, closed_at, stop_order_id,
                        take_profit_order_id, unprotected
                 FROM positions WHERE id = ?1",
                params![position_id],
                row_to_position_header,
            )
            .optional()?;
        drop(conn);

        match header {
            Some(mut pos) => {
                self.load_position_fills(&mut pos)?;
                Ok(Some(pos))
            }
            None => Ok(None),
        }
    }

    pub fn get_open_position(&self, product: &ProductId) -> Result<Option<Position>> {
        let conn = self.conn.lock().unwrap();
        let header = conn
            .query_row(
                "SELECT id, product, status, opened_at, closed_at, stop_order_id,
                        take_profit_order_id, unprotected
                 FROM positions WHERE product = ?1 AND status = 'open'",
                params![product.as_str()],
                row_to_position_header,
            )
            .optional()?;
        drop(conn);

        match header {
            Some(mut pos) => {
                self.load_position_fills(&mut pos)?;
                Ok(Some(pos))
            }
            None => Ok(None),
        }
    }

    pub fn list_open_positions(&self) -> Result<Vec<Position>> {
        let headers = {
            let conn = self.conn.lock().unwrap();
            let mut stmt = conn.prepare(
                "SELECT id, product, status, opened_at, closed_at, stop_order_id,
                        take_profit_order_id, unprotected
                 FROM positions WHERE status = 'open' ORDER BY opened_at",
            )?;
            let rows = stmt
                .query_map([], row_to_position_header)?
                .collect::<Result<Vec<_>, _>>()?;
            rows
        };

        let mut positions = Vec::with_capacity(headers.len());
        for mut pos in headers {
            self.load_position_fills(&mut pos)?;
            positions.push(pos);
        }
        Ok(positions)
    }

    fn load_position_fills(&self, position: &mut Position) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT f.fill_id, f.order_client_id, f.price, f.size, f.fee, f.liquidity, f.time,
                    o.role
             FROM fills f JOIN orders o ON o.client_id = f.order_client_id
             WHERE o.position_id = ?1
             ORDER BY f.time, f.fill_id",
        )?;
        let rows = stmt.query_map(params![position.id], |row| {
            let fill = row_to_fill(row)?;
            let role: String = row.get(7)?;
            Ok((fill, role))
        })?;

        position.entry_fills.clear();
        position.exit_fills.clear();
        for row in rows {
            let (fill, role) = row?;
            match OrderRole::parse(&role) {
                Some(OrderRole::Entry) => position.entry_fills.push(fill),
                // Stop and take-profit fills are exits too.
                Some(_) => position.exit_fills.push(fill),
                None => {}
            }
        }
        Ok(())
    }

    /// Close a position: derive realized PnL from entry and exit fills, emit
    /// the trade record, and flip status, all in one transaction.
    pub fn close_position(
        &self,
        position_id: i64,
        exit_reason: ExitReason,
        strategy: &str,
    ) -> Result<TradeRecord> {
        let position = self
            .get_position(position_id)?
            .ok_or(StoreError::UnknownPosition(position_id))?;
        if position.status == PositionStatus::Closed {
            return Err(StoreError::PositionAlreadyClosed(position_id).into());
        }

        let entry_size: Money = position.entry_fills.iter().map(|f| f.size).sum();
        let entry_notional: Money = position.entry_fills.iter().map(|f| f.price * f.size).sum();
        let exit_size: Money = position.exit_fills.iter().map(|f| f.size).sum();
        let exit_notional: Money = position.exit_fills.iter().map(|f| f.price * f.size).sum();
        let fees: Money = position
            .entry_fills
            .iter()
            .chain(position.exit_fills.iter())
            .map(|f| f.fee)
            .sum();

        let avg_entry = if entry_size.is_zero() {
            Money::ZERO
        } else {
            entry_notional / entry_size
        };
        let avg_exit = if exit_size.is_zero() {
            Money::ZERO
        } else {
            exit_notional / exit_size
        };

        let gross_pnl = exit_notional - entry_notional;
        let net_pnl = gross_pnl - fees;
        let basis_value = position.cost_basis() * entry_size;
        let pnl_pct = if basis_value.is_zero() {
            0.0
        } else {
            (net_pnl / basis_value).to_f64()
        };

        let closed_at = Utc::now();
        let trade = TradeRecord {
            id: None,
            product: position.product.clone(),
            entry_time: position.opened_at,
            exit_time: closed_at,
            avg_entry,
            avg_exit,
            size: entry_size,
            gross_pnl,
            fees,
            net_pnl,
            pnl_pct,
            strategy: strategy.to_string(),
            exit_reason: exit_reason.as_str().to_string(),
        };

        {
            let mut conn = self.conn.lock().unwrap();
            let tx = conn.transaction()?;

            tx.execute(
                "UPDATE positions SET status = 'closed', closed_at = ?2 WHERE id = ?1",
                params![position_id, closed_at.to_rfc3339()],
            )?;

            tx.execute(
                "INSERT INTO trades
                 (product, entry_time, exit_time, avg_entry, avg_exit, size,
                  gross_pnl, fees, net_pnl, pnl_pct, strategy, exit_reason)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
                params![
                    trade.product.as_str(),
                    trade.entry_time.to_rfc3339(),
                    trade.exit_time.to_rfc3339(),
                    trade.avg_entry.to_string(),
                    trade.avg_exit.to_string(),
                    trade.size.to_string(),
                    trade.gross_pnl.to_string(),
                    trade.fees.to_string(),
                    trade.net_pnl.to_string(),
                    trade.pnl_pct,
                    trade.strategy,
                    trade.exit_reason,
                ],
            )?;

            tx.commit()?;
        }

        let result = if net_pnl.is_positive() { "WIN" } else { "LOSS" };
        info!(
            product = %trade.product,
            size = %trade.size,
            avg_entry = %trade.avg_entry,
            avg_exit = %trade.avg_exit,
            net_pnl = %trade.net_pnl,
            pnl_pct = format!("{:+.2}%", trade.pnl_pct * 100.0),
            exit_reason = %trade.exit_reason,
            result,
            "Trade recorded"
        );

        self.export_json().ok();
        Ok(trade)
    }

    /// Recent closed trades, newest first.
    pub fn trade_history(&self, limit: usize) -> Result<Vec<TradeRecord>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT id, product, entry_time, exit_time, avg_entry, avg_exit, size,
                    gross_pnl, fees, net_pnl, pnl_pct, strategy, exit_reason
             FROM trades ORDER BY id DESC LIMIT ?1",
        )?;
        let trades = stmt
            .query_map(params![limit as i64], |row| {
                Ok(TradeRecord {
                    id: Some(row.get(0)?),
                    product: ProductId::new(row.get::<_, String>(1)?),
                    entry_time: parse_ts(row.get::<_, String>(2)?),
                    exit_time: parse_ts(row.get::<_, String>(3)?),
                    avg_entry: parse_money(row.get::<_, String>(4)?),
                    avg_exit: parse_money(row.get::<_, String>(5)?),
                    size: parse_money(row.get::<_, String>(6)?),
                    gross_pnl: parse_money(row.get::<_, String>(7)?),
                    fees: parse_money(row.get::<_, String>(8)?),
                    net_pnl: parse_money(row.get::<_, String>(9)?),
                    pnl_pct: row.get(10)?,
                    strategy: row.get(11)?,
                    exit_reason: row.get(12)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(trades)
    }

    /// Fee-inclusive cost basis of the open position for a product,
    /// recomputed from its entry fills. None when nothing is open.
    pub fn cost_basis(&self, product: &ProductId) -> Result<Option<Money>> {
        let position = self.get_open_position(product)?;
        Ok(position.map(|p| p.cost_basis()))
    }

    /// Sum of net PnL over all closed trades.
    pub fn total_realized_pnl(&self) -> Result<Money> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare("SELECT net_pnl FROM trades")?;
        let values = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(values.into_iter().map(parse_money).sum())
    }

    // =========================================================================
    // Equity + key/value state
    // =========================================================================

    pub fn snapshot_equity(&self, snapshot: &EquitySnapshot) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO equity_snapshots
             (time, cash_quote, positions_value_quote, total_quote, open_positions_count)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                snapshot.time.to_rfc3339(),
                snapshot.cash_quote.to_string(),
                snapshot.positions_value_quote.to_string(),
                snapshot.total_quote.to_string(),
                snapshot.open_positions_count as i64,
            ],
        )?;
        debug!(total = %snapshot.total_quote, "Equity snapshot saved");
        Ok(())
    }

    pub fn latest_equity_snapshot(&self) -> Result<Option<EquitySnapshot>> {
        let conn = self.conn.lock().unwrap();
        let snapshot = conn
            .query_row(
                "SELECT time, cash_quote, positions_value_quote, total_quote, open_positions_count
                 FROM equity_snapshots ORDER BY id DESC LIMIT 1",
                [],
                |row| {
                    Ok(EquitySnapshot {
                        time: parse_ts(row.get::<_, String>(0)?),
                        cash_quote: parse_money(row.get::<_, String>(1)?),
                        positions_value_quote: parse_money(row.get::<_, String>(2)?),
                        total_quote: parse_money(row.get::<_, String>(3)?),
                        open_positions_count: row.get::<_, i64>(4)? as usize,
                    })
                },
            )
            .optional()?;
        Ok(snapshot)
    }

    pub fn put_state(&self, key: &str, value: &str) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT OR REPLACE INTO bot_state (key, value, updated_at)
             VALUES (?1, ?2, CURRENT_TIMESTAMP)",
            params![key, value],
        )?;
        Ok(())
    }

    pub fn get_state(&self, key: &str) -> Result<Option<String>> {
        let conn = self.conn.lock().unwrap();
        let value = conn
            .query_row(
                "SELECT value FROM bot_state WHERE key = ?1",
                params![key],
                |row| row.get(0),
            )
            .optional()?;
        Ok(value)
    }

    /// Export open positions and the latest snapshot to a JSON sidecar file.
    pub fn export_json(&self) -> Result<()> {
        let Some(path) = &self.json_backup_path else {
            return Ok(());
        };

        let positions = self.list_open_positions()?;
        let snapshot = self.latest_equity_snapshot()?;

        let state = serde_json::json!({
            "exported_at": Utc::now().to_rfc3339(),
            "open_positions": positions,
            "latest_equity": snapshot,
        });

        std::fs::write(path, serde_json::to_string_pretty(&state)?)?;
        debug!("State exported to: {}", path.display());
        Ok(())
    }
}

// =============================================================================
// Row mapping helpers
// =============================================================================

const ORDER_COLUMNS: &str = "client_id, exchange_id, product, side, kind, role, requested_price,
    requested_size, stop_price, limit_price, status, filled_size, avg_fill_price,
    submitted_at, terminal_at, position_id, metadata";

fn parse_money(s: String) -> Money {
    Money::parse(&s).unwrap_or(Money::ZERO)
}

fn parse_ts(s: String) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(&s)
        .map(|t| t.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

fn row_to_order(row: &rusqlite::Row<'_>) -> rusqlite::Result<Order> {
    let client_id: String = row.get(0)?;
    let side: String = row.get(3)?;
    let kind: String = row.get(4)?;
    let role: String = row.get(5)?;
    let status: String = row.get(10)?;
    let metadata: String = row.get(16)?;

    Ok(Order {
        client_id: Uuid::parse_str(&client_id).unwrap_or_else(|_| Uuid::nil()),
        exchange_id: row.get(1)?,
        product: ProductId::new(row.get::<_, String>(2)?),
        side: if side == "SELL" { Side::Sell } else { Side::Buy },
        kind: OrderKind::parse(&kind).unwrap_or(OrderKind::Market),
        role: OrderRole::parse(&role).unwrap_or(OrderRole::Entry),
        requested_price: row.get::<_, Option<String>>(6)?.map(parse_money),
        requested_size: parse_money(row.get::<_, String>(7)?),
        stop_price: row.get::<_, Option<String>>(8)?.map(parse_money),
        limit_price: row.get::<_, Option<String>>(9)?.map(parse_money),
        status: OrderStatus::parse(&status).unwrap_or(OrderStatus::Submitted),
        filled_size: parse_money(row.get::<_, String>(11)?),
        avg_fill_price: parse_money(row.get::<_, String>(12)?),
        submitted_at: parse_ts(row.get::<_, String>(13)?),
        terminal_at: row.get::<_, Option<String>>(14)?.map(parse_ts),
        position_id: row.get(15)?,
        metadata: serde_json::from_str(&metadata).unwrap_or(serde_json::Value::Null),
    })
}

fn row_to_fill(row: &rusqlite::Row<'_>) -> rusqlite::Result<Fill> {
    let order_client_id: String = row.get(1)?;
    let liquidity: String = row.get(5)?;
    Ok(Fill {
        fill_id: row.get(0)?,
        order_client_id: Uuid::parse_str(&order_client_id).unwrap_or_else(|_| Uuid::nil()),
        price: parse_money(row.get::<_, String>(2)?),
        size: parse_money(row.get::<_, String>(3)?),
        fee: parse_money(row.get::<_, String>(4)?),
        liquidity: Liquidity::parse(&liquidity),
        time: parse_ts(row.get::<_, String>(6)?),
    })
}

fn row_to_position_header(row: &rusqlite::Row<'_>) -> rusqlite::Result<Position> {
    let status: String = row.get(2)?;
    let stop: Option<String> = row.get(5)?;
    let tp: Option<String> = row.get(6)?;
    Ok(Position {
        id: row.get(0)?,
        product: ProductId::new(row.get::<_, String>(1)?),
        status: if status == "closed" {
            PositionStatus::Closed
        } else {
            PositionStatus::Open
        },
        opened_at: parse_ts(row.get::<_, String>(3)?),
        closed_at: row.get::<_, Option<String>>(4)?.map(parse_ts),
        entry_fills: Vec::new(),
        exit_fills: Vec::new(),
        stop_order_id: stop.and_then(|s| Uuid::parse_str(&s).ok()),
        take_profit_order_id: tp.and_then(|s| Uuid::parse_str(&s).ok()),
        unprotected: row.get::<_, i64>(7)? != 0,
    })
}
