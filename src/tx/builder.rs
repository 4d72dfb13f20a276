//! Builders for the escrow transactions the engine submits or proposes

use super::codec::{Transaction, TransactionType};
use crate::error::{EngineError, EngineResult};
use crate::ledger::types::{MemoEntry, DROPS_PER_XRP};
use crate::state::{ConditionPair, Escrow, LoanTerms};

use rust_decimal::prelude::ToPrimitive;
use rust_decimal::{Decimal, RoundingStrategy};
use serde::Serialize;

/// Market context recorded on a liquidation finish
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FinishRates {
    pub last_price: Decimal,
    pub liquidation_call: Decimal,
    pub liquidation_base: Decimal,
    pub ledger: u32,
}

/// Inputs for a borrower-signed EscrowCreate
#[derive(Debug, Clone)]
pub struct CreateParams<'a> {
    pub account: &'a str,
    pub destination: &'a str,
    pub drops: u64,
    pub condition: &'a str,
    /// Ledger seconds
    pub finish_after: i64,
    /// Ledger seconds
    pub cancel_after: i64,
    pub destination_tag: Option<u32>,
    pub source_tag: Option<u32>,
    pub terms: &'a LoanTerms,
}

/// Native amount in drops, rounded half away from zero
pub fn drops_for(total: Decimal, rate: Decimal) -> EngineResult<u64> {
    (total * rate * Decimal::from(DROPS_PER_XRP))
        .round_dp_with_strategy(0, RoundingStrategy::MidpointAwayFromZero)
        .to_u64()
        .ok_or_else(|| EngineError::Internal(format!("amount {} x rate {} not representable in drops", total, rate)))
}

fn ledger_seconds(field: &str, value: i64) -> EngineResult<u32> {
    u32::try_from(value)
        .map_err(|_| EngineError::Validation(format!("{} out of ledger range: {}", field, value)))
}

/// EscrowCancel signed by the custody account
pub fn escrow_cancel(custody: &str, owner: &str, offer_sequence: u32, memo: &str) -> Transaction {
    let mut tx = Transaction::new(TransactionType::EscrowCancel, custody);
    tx.owner = Some(owner.to_string());
    tx.offer_sequence = Some(offer_sequence);
    tx.memos = vec![MemoEntry::from_text(memo)];
    tx
}

/// EscrowFinish revealing the fulfillment, with the sentinel memo first
pub fn escrow_finish(
    custody: &str,
    escrow: &Escrow,
    pair: &ConditionPair,
    memo: &str,
    rates: &FinishRates,
) -> EngineResult<Transaction> {
    let mut tx = Transaction::new(TransactionType::EscrowFinish, custody);
    tx.owner = Some(escrow.account.clone());
    tx.offer_sequence = Some(escrow.sequence);
    tx.condition = Some(pair.escrow_condition.clone());
    tx.fulfillment = Some(pair.fulfillment.clone());
    tx.memos = vec![
        MemoEntry::from_text(memo),
        MemoEntry::from_text(&serde_json::to_string(rates)?),
    ];
    Ok(tx)
}

/// Unsigned EscrowCreate proposal for the borrower's wallet
pub fn escrow_create(params: &CreateParams<'_>) -> EngineResult<Transaction> {
    let mut tx = Transaction::new(TransactionType::EscrowCreate, params.account);
    tx.destination = Some(params.destination.to_string());
    tx.amount = Some(params.drops.to_string());
    tx.condition = Some(params.condition.to_string());
    tx.finish_after = Some(ledger_seconds("FinishAfter", params.finish_after)?);
    tx.cancel_after = Some(ledger_seconds("CancelAfter", params.cancel_after)?);
    tx.destination_tag = params.destination_tag;
    tx.source_tag = params.source_tag;
    tx.memos = vec![MemoEntry::from_text(&serde_json::to_string(params.terms)?)];
    Ok(tx)
}
