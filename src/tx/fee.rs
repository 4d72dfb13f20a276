//! Fee selection and escalation for custody submissions

use super::codec::TransactionType;
use crate::config::FeeConfig;
use crate::ledger::types::ResultClass;
use crate::state::Completion;

use tracing::debug;

/// Fee schedule for cancel and finish submissions
#[derive(Debug, Clone)]
pub struct FeeSchedule {
    config: FeeConfig,
}

impl FeeSchedule {
    pub fn new(config: FeeConfig) -> Self {
        Self { config }
    }

    /// First-attempt fee in drops for a transaction type
    pub fn base(&self, kind: TransactionType) -> u64 {
        match kind {
            TransactionType::EscrowFinish => self.config.finish_base_drops,
            TransactionType::EscrowCancel | TransactionType::EscrowCreate => {
                self.config.cancel_base_drops
            }
        }
    }

    /// Fee for the next attempt given the last recorded one.
    ///
    /// An insufficient-fee result raises the previous fee by one step; any other
    /// result reuses it. A record for a different transaction type starts over at
    /// the base fee, so N consecutive insufficient-fee results give
    /// `base + step * N`.
    pub fn next_fee(&self, kind: TransactionType, previous: Option<&Completion>) -> u64 {
        let previous = match previous {
            Some(p) if p.transaction_type == kind => p,
            _ => return self.base(kind),
        };

        let fee = match previous.engine_result.class() {
            ResultClass::RetryFee => previous.fee + self.config.step_drops,
            _ => previous.fee,
        };

        debug!(
            "Next {} fee for {}/{}: {} drops (last {} at {})",
            kind.as_str(),
            previous.owner,
            previous.sequence,
            fee,
            previous.engine_result,
            previous.fee
        );
        fee.max(self.base(kind))
    }
}

impl Default for FeeSchedule {
    fn default() -> Self {
        Self::new(FeeConfig::default())
    }
}
