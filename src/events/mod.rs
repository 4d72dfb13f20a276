//! Escrow event types and parsing
//!
//! Turns validated ledger transactions into the escrow events this engine owns.
//! Creates are recognized by the loan-terms memo, cancels and finishes by the
//! engine's own sentinel memo. Anything else is ignored.

use crate::config::EngineConfig;
use crate::error::{EngineError, EngineResult};
use crate::ledger::types::{EngineCode, LedgerTransaction};
use crate::state::{Escrow, LoanTerms};
use crate::tx::TransactionType;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Escrow transactions confirmed on ledger
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum EscrowEvent {
    /// Borrower created an escrow carrying our loan terms
    Created(Box<Escrow>),

    /// Engine-submitted cancel applied
    Cancelled {
        owner: String,
        offer_sequence: u32,
        hash: String,
        engine_result: EngineCode,
    },

    /// Engine-submitted finish applied
    Finished {
        owner: String,
        offer_sequence: u32,
        hash: String,
        condition: Option<String>,
        engine_result: EngineCode,
    },
}

impl EscrowEvent {
    pub fn name(&self) -> &'static str {
        match self {
            EscrowEvent::Created(_) => "EscrowCreate",
            EscrowEvent::Cancelled { .. } => "EscrowCancel",
            EscrowEvent::Finished { .. } => "EscrowFinish",
        }
    }
}

/// Parser for escrow transactions
pub struct EventParser {
    app_id: String,
    cancel_memo: String,
    finish_memo: String,
}

impl EventParser {
    pub fn new(config: &EngineConfig) -> Self {
        Self {
            app_id: config.app_id.clone(),
            cancel_memo: config.cancel_memo.clone(),
            finish_memo: config.finish_memo.clone(),
        }
    }

    /// Parse a transaction from a validated ledger.
    ///
    /// Returns `None` for failed transactions, other transaction types and
    /// memos that do not decode or do not belong to this engine.
    pub fn parse(&self, ledger_index: u32, tx: &LedgerTransaction) -> Option<EscrowEvent> {
        if !tx.succeeded() {
            return None;
        }

        let kind = TransactionType::parse(&tx.transaction_type)?;
        let result = match kind {
            TransactionType::EscrowCreate => self.parse_create(ledger_index, tx),
            TransactionType::EscrowCancel => self.parse_settlement(tx, &self.cancel_memo, kind),
            TransactionType::EscrowFinish => self.parse_settlement(tx, &self.finish_memo, kind),
        };

        match result {
            Ok(event) => Some(event),
            Err(e) => {
                debug!("Ignoring {} {}: {}", tx.transaction_type, tx.hash, e);
                None
            }
        }
    }

    fn parse_create(&self, ledger_index: u32, tx: &LedgerTransaction) -> EngineResult<EscrowEvent> {
        let terms: LoanTerms = serde_json::from_str(&tx.first_memo()?)?;
        if terms.app != self.app_id {
            return Err(EngineError::Decoding(format!("foreign app {}", terms.app)));
        }

        let condition = tx
            .condition
            .clone()
            .ok_or_else(|| EngineError::Decoding("create without Condition".to_string()))?;
        let destination = tx
            .destination
            .clone()
            .ok_or_else(|| EngineError::Decoding("create without Destination".to_string()))?;

        Ok(EscrowEvent::Created(Box::new(Escrow {
            escrow_condition: condition.to_uppercase(),
            hash: tx.hash.clone(),
            account: tx.account.clone(),
            destination,
            currency: terms.currency,
            issuer: terms.issuer,
            amount: terms.amount,
            collateral: terms.collateral,
            rate: terms.rate,
            destination_tag: tx.destination_tag,
            source_tag: tx.source_tag,
            ledger: ledger_index,
            created: Utc::now(),
            cancel_after: tx.cancel_after,
            finish_after: tx.finish_after,
            sequence: tx.sequence.unwrap_or(0),
        })))
    }

    fn parse_settlement(
        &self,
        tx: &LedgerTransaction,
        sentinel: &str,
        kind: TransactionType,
    ) -> EngineResult<EscrowEvent> {
        if tx.first_memo()? != sentinel {
            return Err(EngineError::Decoding("sentinel memo mismatch".to_string()));
        }

        let owner = tx
            .owner
            .clone()
            .ok_or_else(|| EngineError::Decoding("settlement without Owner".to_string()))?;
        let offer_sequence = tx
            .offer_sequence
            .ok_or_else(|| EngineError::Decoding("settlement without OfferSequence".to_string()))?;
        let engine_result = tx
            .meta
            .as_ref()
            .map(|m| EngineCode::from(m.transaction_result.as_str()))
            .unwrap_or(EngineCode::Success);

        Ok(match kind {
            TransactionType::EscrowFinish => EscrowEvent::Finished {
                owner,
                offer_sequence,
                hash: tx.hash.clone(),
                condition: tx.condition.as_ref().map(|c| c.to_uppercase()),
                engine_result,
            },
            _ => EscrowEvent::Cancelled {
                owner,
                offer_sequence,
                hash: tx.hash.clone(),
                engine_result,
            },
        })
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::config::tests::sample_settings;
    use crate::ledger::types::encode_memo;
    use rust_decimal::Decimal;
    use serde_json::{json, Value};

    pub(crate) fn create_tx(app: &str, result: &str) -> Value {
        let terms = json!({
            "collateral": "20",
            "rate": "0.5",
            "amount": "100",
            "currency": "USD",
            "issuer": "rIssuer",
            "app": app,
            "version": "0.0.1"
        });
        json!({
            "TransactionType": "EscrowCreate",
            "Account": "rBorrower",
            "Destination": "rLender",
            "Amount": "60000000",
            "Condition": "a0258020",
            "Sequence": 12,
            "CancelAfter": 800_000_000,
            "FinishAfter": 700_000_000,
            "DestinationTag": 1313,
            "hash": "CREATEHASH",
            "Memos": [{"Memo": {"MemoData": encode_memo(&terms.to_string())}}],
            "metaData": {"TransactionResult": result}
        })
    }

    pub(crate) fn settlement_tx(kind: &str, memo: &str) -> Value {
        json!({
            "TransactionType": kind,
            "Account": "rCustody",
            "Owner": "rBorrower",
            "OfferSequence": 12,
            "hash": "SETTLEHASH",
            "Memos": [{"Memo": {"MemoData": encode_memo(memo)}}],
            "metaData": {"TransactionResult": "tesSUCCESS"}
        })
    }

    fn parser() -> EventParser {
        EventParser::new(&sample_settings().engine)
    }

    fn parse(value: Value) -> Option<EscrowEvent> {
        let tx: LedgerTransaction = serde_json::from_value(value).unwrap();
        parser().parse(77, &tx)
    }

    #[test]
    fn test_create_reads_terms_from_memo() {
        let event = parse(create_tx("xrpl-escrow-engine_loans", "tesSUCCESS")).unwrap();
        let escrow = match event {
            EscrowEvent::Created(escrow) => escrow,
            other => panic!("unexpected {:?}", other),
        };

        assert_eq!(escrow.escrow_condition, "A0258020");
        assert_eq!(escrow.currency, "USD");
        assert_eq!(escrow.amount, Decimal::from(100));
        assert_eq!(escrow.collateral, Decimal::from(20));
        assert_eq!(escrow.rate, Decimal::new(5, 1));
        assert_eq!(escrow.ledger, 77);
        assert_eq!(escrow.sequence, 12);
        assert_eq!(escrow.finish_after, Some(700_000_000));
        assert_eq!(escrow.destination_tag, Some(1313));
    }

    #[test]
    fn test_create_ignored_for_other_apps_and_failures() {
        assert!(parse(create_tx("someone-else", "tesSUCCESS")).is_none());
        assert!(parse(create_tx("xrpl-escrow-engine_loans", "tecUNFUNDED")).is_none());

        let mut garbled = create_tx("xrpl-escrow-engine_loans", "tesSUCCESS");
        garbled["Memos"][0]["Memo"]["MemoData"] = json!("ZZ");
        assert!(parse(garbled).is_none());
    }

    #[test]
    fn test_settlements_require_sentinel() {
        let settings = sample_settings();

        let event = parse(settlement_tx("EscrowCancel", &settings.engine.cancel_memo)).unwrap();
        assert_eq!(event.name(), "EscrowCancel");

        let event = parse(settlement_tx("EscrowFinish", &settings.engine.finish_memo)).unwrap();
        assert!(matches!(event, EscrowEvent::Finished { offer_sequence: 12, .. }));

        // A cancel carrying the finish sentinel is not ours
        assert!(parse(settlement_tx("EscrowCancel", &settings.engine.finish_memo)).is_none());
        assert!(parse(settlement_tx("EscrowFinish", "hello")).is_none());
    }
}
