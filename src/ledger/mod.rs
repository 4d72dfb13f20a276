//! Ledger module - XRP Ledger connectivity and ingestion
//!
//! This module provides:
//! - A WebSocket JSON client with request correlation and URL failover
//! - Typed wire structures for the reads and writes the engine performs
//! - The ledger-close watcher that ingests confirmed escrow transactions

pub mod client;
pub mod listener;
pub mod types;

pub use client::XrplClient;
pub use listener::LedgerWatcher;
pub use types::{
    BookOffer, BookOffersResponse, EngineCode, Issue, LedgerAmount, LedgerClosed,
    LedgerTransaction, ResultClass, SubmitResponse, TrustLine, ValidatedLedger,
};

use crate::error::EngineResult;

use async_trait::async_trait;
use tokio::sync::broadcast;

/// Reads and writes against the external ledger
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Ledger: Send + Sync {
    /// Offers where the taker receives `taker_gets` and pays `taker_pays`
    async fn book_offers(
        &self,
        taker: &str,
        taker_gets: Issue,
        taker_pays: Issue,
        limit: u32,
    ) -> EngineResult<BookOffersResponse>;

    /// Next sequence number of an account in the current ledger
    async fn account_sequence(&self, account: &str) -> EngineResult<u32>;

    /// Validated ledger with expanded transactions
    async fn validated_ledger(&self, ledger_index: u32) -> EngineResult<ValidatedLedger>;

    async fn account_lines(&self, account: &str) -> EngineResult<Vec<TrustLine>>;

    /// Submit a signed transaction blob
    async fn submit(&self, tx_blob: &str) -> EngineResult<SubmitResponse>;

    /// Stream of ledger-close notifications
    fn subscribe_ledger_closes(&self) -> broadcast::Receiver<LedgerClosed>;

    /// Drop the current connection and move to the next endpoint
    async fn reset(&self) -> EngineResult<()>;

    async fn health_check(&self) -> bool;
}
