//! State management with PostgreSQL persistence
//!
//! Handles:
//! - Condition/fulfillment pairs, written before any ledger action uses them
//! - Escrow records ingested from validated ledgers
//! - Completion records with optimistic versioning for cancel/finish retries

mod manager;
#[cfg(test)]
pub(crate) mod memory;
pub mod records;

pub use manager::StateManager;
pub use records::{Completion, CompletionWrite, ConditionPair, Escrow, EscrowStats, LoanTerms};

use crate::error::EngineResult;

use async_trait::async_trait;

/// Persisted-record boundary used by the lifecycle components
#[async_trait]
pub trait Store: Send + Sync {
    async fn insert_condition(&self, pair: &ConditionPair) -> EngineResult<()>;

    /// Fulfillment paired with `escrow_condition`, if the engine generated it
    async fn fulfillment(&self, escrow_condition: &str) -> EngineResult<Option<String>>;

    /// Insert an escrow; returns false when the condition is already recorded
    async fn insert_escrow(&self, escrow: &Escrow) -> EngineResult<bool>;

    async fn escrow_by_condition(&self, escrow_condition: &str) -> EngineResult<Option<Escrow>>;

    async fn escrow_by_sequence(&self, owner: &str, sequence: u32)
        -> EngineResult<Option<Escrow>>;

    async fn completion(&self, owner: &str, sequence: u32) -> EngineResult<Option<Completion>>;

    /// Write an attempt only if the stored version still equals `expected_version`
    /// (`None` meaning no row yet). Returns the new version, or `Conflict`.
    async fn upsert_completion(
        &self,
        record: &CompletionWrite,
        expected_version: Option<i64>,
    ) -> EngineResult<i64>;

    /// Record a ledger-confirmed outcome regardless of version; attempts are kept
    async fn confirm_completion(&self, record: &CompletionWrite) -> EngineResult<Completion>;

    /// Escrows past `cancel_after` without a terminal completion
    async fn expired_escrows(&self, now_ledger: i64) -> EngineResult<Vec<Escrow>>;

    /// Distinct (currency, issuer) pairs with at least one open escrow
    async fn open_books(&self) -> EngineResult<Vec<(String, String)>>;

    async fn open_escrows_for_book(&self, currency: &str, issuer: &str)
        -> EngineResult<Vec<Escrow>>;

    /// Open escrows where the account is borrower or lender
    async fn open_escrows_for_account(&self, account: &str) -> EngineResult<Vec<Escrow>>;

    async fn stats(&self) -> EngineResult<EscrowStats>;

    async fn health_check(&self) -> EngineResult<()>;
}
