//! Custody transaction sender: sequence, fee, sign, submit

use super::codec::Transaction;
use super::signer::CustodySigner;
use crate::error::EngineResult;
use crate::ledger::{EngineCode, Ledger};

use std::sync::Arc;
use tracing::{debug, info, warn};

/// Outcome of one submission
#[derive(Debug, Clone, PartialEq)]
pub struct Submission {
    pub engine_result: EngineCode,
    pub hash: String,
    /// Drops
    pub fee: u64,
    /// Custody account sequence consumed
    pub sequence: u32,
}

/// Submits transactions on behalf of the custody account.
///
/// The account sequence is read immediately before signing, so callers must
/// not run two submissions concurrently.
pub struct TransactionSender {
    ledger: Arc<dyn Ledger>,
    signer: CustodySigner,
}

impl TransactionSender {
    pub fn new(ledger: Arc<dyn Ledger>, signer: CustodySigner) -> Self {
        info!(
            "Transaction sender initialized for custody account {}",
            signer.account()
        );
        Self { ledger, signer }
    }

    pub fn custody_account(&self) -> &str {
        self.signer.account()
    }

    /// Fill Sequence and Fee, sign and submit
    pub async fn submit(&self, mut tx: Transaction, fee: u64) -> EngineResult<Submission> {
        let sequence = self.ledger.account_sequence(self.signer.account()).await?;
        tx.sequence = Some(sequence);
        tx.fee = Some(fee.to_string());

        let kind = tx.transaction_type;
        let signed = self.signer.sign(tx)?;
        debug!(
            "Signed {} {} (sequence {}, fee {})",
            kind.as_str(),
            signed.hash,
            sequence,
            fee
        );

        let response = self.ledger.submit(&signed.blob).await?;
        let engine_result = response.code();
        let hash = response.hash().unwrap_or(signed.hash);

        crate::metrics::record_submission(kind.as_str(), engine_result.as_str());

        if engine_result == EngineCode::Success {
            info!("Submitted {} {}: {}", kind.as_str(), hash, engine_result);
        } else {
            warn!(
                "Submitted {} {}: {} ({})",
                kind.as_str(),
                hash,
                engine_result,
                response.engine_result_message.unwrap_or_default()
            );
        }

        Ok(Submission {
            engine_result,
            hash,
            fee,
            sequence,
        })
    }
}
