//! Escrow lifecycle states and settlement outcomes

use crate::error::EngineError;
use crate::ledger::types::{EngineCode, ResultClass};
use crate::state::{Completion, Escrow};
use crate::tx::TransactionType;

use serde::Serialize;
use std::fmt;

/// Where an escrow stands, derived from its records
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EscrowState {
    /// Proposal handed to the borrower, nothing on ledger yet
    Requested,
    /// Settlement submitted, awaiting a terminal outcome
    Submitted,
    /// Confirmed on ledger, no settlement attempted
    Active,
    /// Last attempt failed with a retryable result
    RetryPending,
    Cancelled,
    Finished,
    /// Attempts exhausted or result needs attention
    Stalled,
}

impl EscrowState {
    /// Derive the state from the escrow and its completion record
    pub fn derive(escrow: Option<&Escrow>, completion: Option<&Completion>, max_attempts: u32) -> Self {
        let completion = match (escrow, completion) {
            (None, None) => return EscrowState::Requested,
            (Some(_), None) => return EscrowState::Active,
            (_, Some(c)) => c,
        };

        match completion.engine_result.class() {
            ResultClass::TerminalSuccess | ResultClass::TerminalNotFound => {
                match completion.transaction_type {
                    TransactionType::EscrowFinish => EscrowState::Finished,
                    _ => EscrowState::Cancelled,
                }
            }
            ResultClass::Attention => EscrowState::Stalled,
            _ if completion.attempts >= max_attempts => EscrowState::Stalled,
            ResultClass::RetryFee | ResultClass::Retry if completion.hash.is_some() => {
                EscrowState::RetryPending
            }
            _ => EscrowState::Submitted,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, EscrowState::Cancelled | EscrowState::Finished)
    }
}

/// Result of a cancel or finish request. Lifecycle operations never raise;
/// every path ends in one of these.
#[derive(Debug, Clone, PartialEq)]
pub enum SettlementOutcome {
    /// A transaction was submitted and its engine result recorded
    Submitted {
        engine_result: EngineCode,
        fee: u64,
        hash: String,
        attempts: u32,
    },
    /// A terminal result was already recorded; nothing submitted
    Skipped(EngineCode),
    /// Ledger would reject it: no escrow, no fulfillment, or a deadline not reached
    Blocked(String),
    /// Attempt cap reached; automatic resubmission stopped
    Exhausted { attempts: u32 },
    /// Last result for this transaction type needs an operator
    NeedsAttention(EngineCode),
    /// Completion record changed between read and write
    Conflict,
    Failed(String),
}

impl SettlementOutcome {
    /// Engine result to report to callers, if one exists
    pub fn engine_result(&self) -> Option<&EngineCode> {
        match self {
            SettlementOutcome::Submitted { engine_result, .. } => Some(engine_result),
            SettlementOutcome::Skipped(code) | SettlementOutcome::NeedsAttention(code) => Some(code),
            _ => None,
        }
    }

    pub fn submitted(&self) -> bool {
        matches!(self, SettlementOutcome::Submitted { .. })
    }
}

impl From<EngineError> for SettlementOutcome {
    fn from(e: EngineError) -> Self {
        match e {
            EngineError::Conflict { .. } => SettlementOutcome::Conflict,
            other => SettlementOutcome::Failed(other.to_string()),
        }
    }
}

impl fmt::Display for SettlementOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SettlementOutcome::Submitted {
                engine_result,
                attempts,
                ..
            } => write!(f, "{} (attempt {})", engine_result, attempts),
            SettlementOutcome::Skipped(code) => write!(f, "{}", code),
            SettlementOutcome::Blocked(reason) => write!(f, "blocked: {}", reason),
            SettlementOutcome::Exhausted { attempts } => {
                write!(f, "exhausted after {} attempts", attempts)
            }
            SettlementOutcome::NeedsAttention(code) => write!(f, "{} needs attention", code),
            SettlementOutcome::Conflict => f.write_str("conflict"),
            SettlementOutcome::Failed(reason) => write!(f, "failed: {}", reason),
        }
    }
}
