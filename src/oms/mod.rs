//! Order Management System
//!
//! Crash-safe order lifecycle handling: entries with pre-trade gates and
//! write-before-send persistence, bracket installation, signal exits, and
//! the reconciler that converges local state with the exchange after any
//! failure.

pub mod manager;
pub mod reconcile;

pub use manager::{pre_trade_gate, EntryOutcome, ExitOutcome, OrderManager};
pub use reconcile::Reconciler;
