//! Spot Trader
//!
//! An automated spot-market trading engine for a single exchange:
//! confidence-scored strategy signals, strict risk gating, maker-rebate
//! entries with bracket exits, and a durable store that guarantees no
//! order is ever lost across restarts.

pub mod common;
pub mod config;
pub mod engine;
pub mod gateway;
pub mod indicators;
pub mod monitor;
pub mod oms;
pub mod risk;
pub mod store;
pub mod strategies;
pub mod types;

pub use config::Config;
pub use types::*;
