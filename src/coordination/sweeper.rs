//! Expiry sweeper: cancels escrows whose CancelAfter has passed

use super::engine::SettlementHandle;
use super::lifecycle::SettlementOutcome;
use crate::error::EngineResult;
use crate::ledger::types::now_ledger_time;
use crate::state::Store;

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::time::interval;
use tracing::{debug, error, info, warn};

/// Periodic cancellation of expired escrows
pub struct ExpirySweeper {
    store: Arc<dyn Store>,
    settlement: SettlementHandle,
    period: Duration,
    shutdown: Arc<RwLock<bool>>,
}

impl ExpirySweeper {
    pub fn new(store: Arc<dyn Store>, settlement: SettlementHandle, period_secs: u64) -> Self {
        Self {
            store,
            settlement,
            period: Duration::from_secs(period_secs.max(1)),
            shutdown: Arc::new(RwLock::new(false)),
        }
    }

    pub async fn run(&self) {
        let mut ticker = interval(self.period);
        info!("Expiry sweeper started ({}s period)", self.period.as_secs());

        loop {
            ticker.tick().await;
            if *self.shutdown.read().await {
                break;
            }

            match self.sweep().await {
                Ok(_) => {}
                Err(e) if e.is_retryable() => warn!("Expiry sweep deferred: {}", e),
                Err(e) => error!(alert = e.should_alert(), "Expiry sweep failed: {}", e),
            }
        }

        info!("Expiry sweeper stopped");
    }

    /// One pass over the expired set; returns the number of submissions
    pub async fn sweep(&self) -> EngineResult<usize> {
        let expired = self.store.expired_escrows(now_ledger_time()).await?;
        if expired.is_empty() {
            return Ok(0);
        }
        debug!("{} expired escrow(s) to cancel", expired.len());

        let mut submitted = 0;
        for escrow in expired {
            let outcome = self
                .settlement
                .cancel(&escrow.account, escrow.sequence, &escrow.escrow_condition)
                .await;
            crate::metrics::record_sweep(outcome_label(&outcome));

            match &outcome {
                SettlementOutcome::Submitted { .. } => {
                    submitted += 1;
                    info!(
                        "Cancel for {}/{}: {}",
                        escrow.account, escrow.sequence, outcome
                    );
                }
                SettlementOutcome::Exhausted { .. } | SettlementOutcome::NeedsAttention(_) => {
                    warn!(
                        "Escrow {}/{} stalled: {}",
                        escrow.account, escrow.sequence, outcome
                    );
                }
                _ => debug!(
                    "Cancel for {}/{}: {}",
                    escrow.account, escrow.sequence, outcome
                ),
            }
        }

        Ok(submitted)
    }

    pub async fn stop(&self) {
        *self.shutdown.write().await = true;
    }
}

pub(crate) fn outcome_label(outcome: &SettlementOutcome) -> &'static str {
    match outcome {
        SettlementOutcome::Submitted { .. } => "submitted",
        SettlementOutcome::Skipped(_) => "skipped",
        SettlementOutcome::Blocked(_) => "blocked",
        SettlementOutcome::Exhausted { .. } => "exhausted",
        SettlementOutcome::NeedsAttention(_) => "attention",
        SettlementOutcome::Conflict => "conflict",
        SettlementOutcome::Failed(_) => "failed",
    }
}
