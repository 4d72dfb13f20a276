//! Named-field records persisted by the engine

use crate::ledger::types::EngineCode;
use crate::tx::codec::TransactionType;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// A confirmed escrow created by a borrower through this engine
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Escrow {
    /// Hash-lock condition, uppercase hex; unique
    pub escrow_condition: String,
    /// Hash of the EscrowCreate transaction
    pub hash: String,
    /// Borrower
    pub account: String,
    /// Lender
    pub destination: String,
    pub currency: String,
    pub issuer: String,
    pub amount: Decimal,
    pub collateral: Decimal,
    /// Collateral valuation rate quoted at creation
    pub rate: Decimal,
    pub destination_tag: Option<u32>,
    pub source_tag: Option<u32>,
    /// Ledger index the create was validated in
    pub ledger: u32,
    pub created: DateTime<Utc>,
    /// Ledger seconds
    pub cancel_after: Option<i64>,
    /// Ledger seconds
    pub finish_after: Option<i64>,
    /// Sequence of the EscrowCreate; the escrow's OfferSequence
    pub sequence: u32,
}

impl Escrow {
    /// Loan amount plus collateral
    pub fn total(&self) -> Decimal {
        self.amount + self.collateral
    }

    /// Whether the escrow may be finished at `now_ledger`
    pub fn finishable_at(&self, now_ledger: i64) -> bool {
        self.finish_after.map_or(true, |after| now_ledger >= after)
    }

    pub fn expired_at(&self, now_ledger: i64) -> bool {
        self.cancel_after.map_or(false, |after| now_ledger >= after)
    }
}

/// Per-escrow submission bookkeeping, one row per (owner, sequence)
#[derive(Debug, Clone, PartialEq)]
pub struct Completion {
    pub hash: Option<String>,
    pub escrow_condition: String,
    pub engine_result: EngineCode,
    pub created: DateTime<Utc>,
    pub owner: String,
    /// Drops paid on the last attempt
    pub fee: u64,
    pub sequence: u32,
    pub transaction_type: TransactionType,
    /// Submissions of `transaction_type` so far
    pub attempts: u32,
    /// Optimistic concurrency token
    pub version: i64,
}

impl Completion {
    pub fn is_terminal(&self) -> bool {
        self.engine_result.is_terminal()
    }
}

/// Values written for one submission attempt
#[derive(Debug, Clone, PartialEq)]
pub struct CompletionWrite {
    pub hash: Option<String>,
    pub escrow_condition: String,
    pub engine_result: EngineCode,
    pub owner: String,
    pub fee: u64,
    pub sequence: u32,
    pub transaction_type: TransactionType,
    pub attempts: u32,
}

/// Hash-lock commitment and its secret fulfillment, both uppercase hex
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConditionPair {
    pub escrow_condition: String,
    pub fulfillment: String,
}

/// Loan terms carried in the EscrowCreate memo
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoanTerms {
    pub collateral: Decimal,
    pub rate: Decimal,
    pub amount: Decimal,
    pub currency: String,
    pub issuer: String,
    pub app: String,
    pub version: String,
}

/// Counts served on `/stats`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct EscrowStats {
    /// No completion recorded yet
    pub open: u64,
    /// Terminal completion recorded
    pub settled: u64,
    /// Non-terminal completion recorded
    pub pending_retry: u64,
}
