//! Oracle module - order book valuation and liquidation detection
//!
//! Both sides of a currency/XRP book are fetched per cycle, normalized into
//! price levels and walked to the depth a position needs.

pub mod book;
pub mod poller;

pub use book::{BookSnapshot, LiquidityOracle, LiquidityWalk, Needed, PriceLevel, Side};
pub use poller::{valuate, LiquidationPoller, Valuation};
