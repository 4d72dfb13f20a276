//! Ledger-close watcher: ingests confirmed escrow transactions

use super::types::LedgerTransaction;
use super::Ledger;
use crate::config::EngineConfig;
use crate::error::EngineResult;
use crate::events::{EscrowEvent, EventParser};
use crate::notify::Notifier;
use crate::pubsub::{Broker, EscrowClear, PubSubMessage};
use crate::state::{CompletionWrite, Store};
use crate::tx::TransactionType;

use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::RwLock;
use tracing::{debug, error, info, warn};

/// Follows validated ledgers and records the escrow transactions in them
pub struct LedgerWatcher {
    ledger: Arc<dyn Ledger>,
    store: Arc<dyn Store>,
    broker: Arc<Broker>,
    notifier: Arc<dyn Notifier>,
    parser: EventParser,
    /// Last ledger processed
    last_ledger: RwLock<u32>,
    shutdown: Arc<RwLock<bool>>,
}

impl LedgerWatcher {
    pub fn new(
        ledger: Arc<dyn Ledger>,
        store: Arc<dyn Store>,
        broker: Arc<Broker>,
        notifier: Arc<dyn Notifier>,
        config: &EngineConfig,
    ) -> Self {
        Self {
            ledger,
            store,
            broker,
            notifier,
            parser: EventParser::new(config),
            last_ledger: RwLock::new(0),
            shutdown: Arc::new(RwLock::new(false)),
        }
    }

    /// Main loop over ledger-close notifications
    pub async fn run(&self) {
        let mut closes = self.ledger.subscribe_ledger_closes();
        info!("Ledger watcher started");

        loop {
            if *self.shutdown.read().await {
                break;
            }

            let closed = match closes.recv().await {
                Ok(closed) => closed,
                Err(RecvError::Lagged(skipped)) => {
                    warn!("Ledger watcher lagged, {} close notification(s) dropped", skipped);
                    continue;
                }
                Err(RecvError::Closed) => {
                    error!("Ledger close stream ended");
                    break;
                }
            };

            if closed.txn_count == 0 {
                *self.last_ledger.write().await = closed.ledger_index;
                continue;
            }

            match self.process_ledger(closed.ledger_index).await {
                Ok(n) if n > 0 => debug!("Ledger {}: {} escrow event(s)", closed.ledger_index, n),
                Ok(_) => {}
                Err(e) => warn!("Ledger {} not processed: {}", closed.ledger_index, e),
            }
        }

        info!("Ledger watcher stopped");
    }

    /// Fetch a validated ledger and handle its transactions
    pub async fn process_ledger(&self, ledger_index: u32) -> EngineResult<usize> {
        let ledger = self.ledger.validated_ledger(ledger_index).await?;
        let mut handled = 0;

        for raw in &ledger.transactions {
            let tx = match LedgerTransaction::deserialize(raw) {
                Ok(tx) => tx,
                Err(e) => {
                    debug!("Ledger {}: skipping undecodable transaction: {}", ledger.ledger_index, e);
                    continue;
                }
            };

            match self.handle_transaction(ledger.ledger_index, &tx).await {
                Ok(Some(event)) => {
                    debug!("Ledger {}: {} {}", ledger.ledger_index, event.name(), tx.hash);
                    handled += 1;
                }
                Ok(None) => {}
                Err(e) => error!("Failed to record {} {}: {}", tx.transaction_type, tx.hash, e),
            }
        }

        *self.last_ledger.write().await = ledger.ledger_index;
        Ok(handled)
    }

    /// Record one transaction if it is an escrow event of ours
    pub async fn handle_transaction(
        &self,
        ledger_index: u32,
        tx: &LedgerTransaction,
    ) -> EngineResult<Option<EscrowEvent>> {
        let event = match self.parser.parse(ledger_index, tx) {
            Some(event) => event,
            None => return Ok(None),
        };

        match &event {
            EscrowEvent::Created(escrow) => {
                if self.store.insert_escrow(escrow).await? {
                    info!(
                        "Escrow {} opened by {} ({} {} + {} collateral)",
                        escrow.escrow_condition,
                        escrow.account,
                        escrow.amount,
                        escrow.currency,
                        escrow.collateral
                    );
                    crate::metrics::record_escrow_ingested(&escrow.currency);
                } else {
                    debug!("Escrow {} already recorded", escrow.escrow_condition);
                }
            }
            EscrowEvent::Cancelled {
                owner,
                offer_sequence,
                hash,
                engine_result,
            } => {
                self.settled(
                    TransactionType::EscrowCancel,
                    owner,
                    *offer_sequence,
                    hash,
                    None,
                    engine_result,
                )
                .await?;
            }
            EscrowEvent::Finished {
                owner,
                offer_sequence,
                hash,
                condition,
                engine_result,
            } => {
                self.settled(
                    TransactionType::EscrowFinish,
                    owner,
                    *offer_sequence,
                    hash,
                    condition.as_deref(),
                    engine_result,
                )
                .await?;
            }
        }

        Ok(Some(event))
    }

    async fn settled(
        &self,
        kind: TransactionType,
        owner: &str,
        sequence: u32,
        hash: &str,
        condition: Option<&str>,
        engine_result: &crate::ledger::EngineCode,
    ) -> EngineResult<()> {
        let escrow = self.store.escrow_by_sequence(owner, sequence).await?;
        let escrow_condition = escrow
            .as_ref()
            .map(|e| e.escrow_condition.clone())
            .or_else(|| condition.map(str::to_string))
            .unwrap_or_default();

        let completion = self
            .store
            .confirm_completion(&CompletionWrite {
                hash: Some(hash.to_string()),
                escrow_condition: escrow_condition.clone(),
                engine_result: engine_result.clone(),
                owner: owner.to_string(),
                fee: 0,
                sequence,
                transaction_type: kind,
                attempts: 0,
            })
            .await?;
        info!(
            "{} {} confirmed for {}/{}: {}",
            kind.as_str(),
            hash,
            owner,
            sequence,
            completion.engine_result
        );

        let (title, body) = match kind {
            TransactionType::EscrowFinish => (
                "Escrow liquidated",
                "Your collateral escrow was finished after falling below its liquidation threshold.",
            ),
            _ => (
                "Escrow cancelled",
                "Your collateral escrow expired and was returned.",
            ),
        };
        let data = json!({
            "escrow_condition": escrow_condition,
            "sequence": sequence,
            "hash": hash,
        });
        if let Err(e) = self.notifier.push(owner, title, body, data).await {
            warn!("Notification to {} failed: {}", owner, e);
        }

        if self.broker.check_channel(owner) {
            let clear = EscrowClear {
                account: owner.to_string(),
                escrow_condition,
                transaction_type: kind.as_str().to_string(),
            };
            self.broker.route(&PubSubMessage::EscrowClear(clear), owner);
        }

        Ok(())
    }

    pub async fn last_ledger(&self) -> u32 {
        *self.last_ledger.read().await
    }

    pub async fn stop(&self) {
        *self.shutdown.write().await = true;
    }
}
