//! Liquidation poller: values every open escrow against the live bid book

use super::book::{walk_liquidity, BookSnapshot, LiquidityOracle, LiquidityWalk, Needed, PriceLevel};
use crate::coordination::{FinishRequest, SettlementHandle, SettlementOutcome};
use crate::error::EngineResult;
use crate::ledger::types::now_ledger_time;
use crate::pubsub::{Broker, PubSubMessage, RateUpdate};
use crate::state::{Escrow, Store};
use crate::tx::FinishRates;

use rust_decimal::Decimal;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, error, info, warn};

/// Liquidation test for one escrow at one book snapshot
#[derive(Debug, Clone, PartialEq)]
pub struct Valuation {
    pub walk: LiquidityWalk,
    /// XRP the loan and collateral fetch at the current bid
    pub liquidation_call: Decimal,
    /// XRP value of the loan at origination
    pub liquidation_base: Decimal,
    pub liquidate: bool,
}

/// Value an escrow against bid levels. `None` when the book is empty.
pub fn valuate(escrow: &Escrow, bids: &[PriceLevel], now_ledger: i64) -> Option<Valuation> {
    let walk = walk_liquidity(bids, Needed::Units(escrow.total()))?;
    if walk.last_price.is_zero() {
        return None;
    }

    let liquidation_call = escrow.total() / walk.last_price;
    let liquidation_base = escrow.rate * escrow.amount;
    let liquidate = liquidation_call < liquidation_base && escrow.finishable_at(now_ledger);

    Some(Valuation {
        walk,
        liquidation_call,
        liquidation_base,
        liquidate,
    })
}

pub struct LiquidationPoller {
    store: Arc<dyn Store>,
    oracle: Arc<LiquidityOracle>,
    broker: Arc<Broker>,
    settlement: SettlementHandle,
    pause: Duration,
    shutdown: Arc<RwLock<bool>>,
}

impl LiquidationPoller {
    pub fn new(
        store: Arc<dyn Store>,
        oracle: Arc<LiquidityOracle>,
        broker: Arc<Broker>,
        settlement: SettlementHandle,
        pause_ms: u64,
    ) -> Self {
        Self {
            store,
            oracle,
            broker,
            settlement,
            pause: Duration::from_millis(pause_ms),
            shutdown: Arc::new(RwLock::new(false)),
        }
    }

    /// Self-paced loop: a cycle, then a fixed pause
    pub async fn run(&self) {
        info!("Liquidation poller started");

        loop {
            if *self.shutdown.read().await {
                break;
            }

            match self.poll_once().await {
                Ok(0) => {}
                Ok(n) => info!("{} liquidation(s) triggered this cycle", n),
                Err(e) if e.is_retryable() => warn!("Liquidation cycle deferred: {}", e),
                Err(e) => error!(alert = e.should_alert(), "Liquidation cycle failed: {}", e),
            }

            tokio::time::sleep(self.pause).await;
        }

        info!("Liquidation poller stopped");
    }

    /// One cycle over every book with open escrows
    pub async fn poll_once(&self) -> EngineResult<usize> {
        let books = self.store.open_books().await?;
        let mut triggered = 0;

        for (currency, issuer) in books {
            let snapshot = match self.oracle.snapshot(&currency, &issuer).await {
                Ok(snapshot) => snapshot,
                Err(e) => {
                    warn!("Skipping {}/{} this cycle: {}", currency, issuer, e);
                    continue;
                }
            };

            let escrows = self.store.open_escrows_for_book(&currency, &issuer).await?;
            for escrow in escrows {
                if self.check(&escrow, &snapshot).await {
                    triggered += 1;
                }
            }
        }

        Ok(triggered)
    }

    async fn check(&self, escrow: &Escrow, snapshot: &BookSnapshot) -> bool {
        let valuation = match valuate(escrow, &snapshot.bids, now_ledger_time()) {
            Some(valuation) => valuation,
            None => {
                debug!(
                    "No bid liquidity for {}/{}",
                    escrow.currency, escrow.issuer
                );
                return false;
            }
        };

        if self.broker.check_channel(&escrow.account) {
            let update = RateUpdate {
                account: escrow.account.clone(),
                escrow_condition: escrow.escrow_condition.clone(),
                currency: escrow.currency.clone(),
                issuer: escrow.issuer.clone(),
                ledger: snapshot.ledger,
                liquidation_call: valuation.liquidation_call,
                liquidation_base: valuation.liquidation_base,
                current_rate: Decimal::ONE / valuation.walk.last_price,
                first_price: valuation.walk.first_price,
                slippage: valuation.walk.slippage,
                orders_crossed: valuation.walk.orders_crossed,
                liquidate: valuation.liquidate,
            };
            self.broker
                .route(&PubSubMessage::RateUpdate(update), &escrow.account);
        }

        if !valuation.liquidate {
            return false;
        }

        info!(
            "Liquidating {}: call {} below base {}",
            escrow.escrow_condition, valuation.liquidation_call, valuation.liquidation_base
        );
        crate::metrics::record_liquidation_trigger(&escrow.currency);

        let outcome = self
            .settlement
            .finish(FinishRequest {
                escrow_condition: escrow.escrow_condition.clone(),
                rates: FinishRates {
                    last_price: valuation.walk.last_price,
                    liquidation_call: valuation.liquidation_call,
                    liquidation_base: valuation.liquidation_base,
                    ledger: snapshot.ledger,
                },
            })
            .await;

        match &outcome {
            SettlementOutcome::Submitted { .. } => info!("Finish for {}: {}", escrow.escrow_condition, outcome),
            _ => warn!("Finish for {}: {}", escrow.escrow_condition, outcome),
        }
        true
    }

    pub async fn stop(&self) {
        *self.shutdown.write().await = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordination::condition::{condition_for, fulfillment_for};
    use crate::coordination::engine::tests::{build, escrow, expect_submissions};
    use crate::ledger::types::EngineCode;
    use crate::ledger::{BookOffersResponse, Issue, MockLedger};
    use crate::oracle::book::tests::bid;
    use crate::state::memory::MemoryStore;
    use crate::state::ConditionPair;
    use crate::tx::TransactionType;

    /// Bid book at `price` USD/XRP with 100 XRP of depth
    fn expect_bid_book(ledger: &mut MockLedger, price: i64) {
        ledger
            .expect_book_offers()
            .returning(move |_, gets: Issue, _, _| {
                let offers = if gets.currency == "XRP" {
                    vec![]
                } else {
                    vec![bid("rMaker", &(price * 100).to_string(), "100000000")]
                };
                Ok(BookOffersResponse {
                    offers,
                    ledger_current_index: Some(900),
                    ledger_index: None,
                })
            });
    }

    fn level(price: i64, volume: i64) -> PriceLevel {
        PriceLevel {
            price: Decimal::from(price),
            volume: Decimal::from(volume),
        }
    }

    #[test]
    fn test_valuation_thresholds() {
        let now = now_ledger_time();
        let loan = escrow("C", now - 10);

        // 120 USD at 3 USD/XRP fetches 40 XRP against a 50 XRP base
        let low = valuate(&loan, &[level(3, 300)], now).unwrap();
        assert_eq!(low.liquidation_call, Decimal::from(40));
        assert_eq!(low.liquidation_base, Decimal::from(50));
        assert!(low.liquidate);

        let high = valuate(&loan, &[level(2, 300)], now).unwrap();
        assert_eq!(high.liquidation_call, Decimal::from(60));
        assert!(!high.liquidate);

        // Undercollateralized but still inside the hold window
        let held = escrow("C", now + 600);
        assert!(!valuate(&held, &[level(3, 300)], now).unwrap().liquidate);

        assert!(valuate(&loan, &[], now).is_none());
    }

    #[tokio::test]
    async fn test_poll_liquidates_undercollateralized_escrow() {
        let mut ledger = MockLedger::new();
        expect_bid_book(&mut ledger, 3);
        expect_submissions(&mut ledger, vec![], 1);

        let store = Arc::new(MemoryStore::new());
        let preimage = [9u8; 32];
        let pair = ConditionPair {
            escrow_condition: hex::encode_upper(condition_for(&preimage)),
            fulfillment: hex::encode_upper(fulfillment_for(&preimage)),
        };
        store.insert_condition(&pair).await.unwrap();
        let loan = escrow(&pair.escrow_condition, now_ledger_time() - 10);
        store.insert_escrow(&loan).await.unwrap();

        let (coordinator, broker) = build(ledger, store.clone());
        let mut rx = broker.subscribe(&loan.account).unwrap();
        let (handle, commands) = SettlementHandle::channel(4);
        let worker = tokio::spawn({
            let coordinator = coordinator.clone();
            async move { coordinator.run(commands).await }
        });

        let poller = LiquidationPoller::new(
            store.clone(),
            coordinator.oracle().clone(),
            broker.clone(),
            handle,
            10,
        );
        assert_eq!(poller.poll_once().await.unwrap(), 1);

        let update: serde_json::Value = serde_json::from_str(&rx.recv().await.unwrap()).unwrap();
        let update = &update[loan.account.as_str()]["RATE_UPDATE"];
        assert_eq!(update["liquidate"], true);
        assert_eq!(update["ledger"], 900);

        let stored = store
            .completion(&loan.account, loan.sequence)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.transaction_type, TransactionType::EscrowFinish);
        assert_eq!(stored.engine_result, EngineCode::Success);

        // Settled escrows leave the open set
        assert_eq!(poller.poll_once().await.unwrap(), 0);

        drop(poller);
        worker.await.unwrap();
    }

    #[tokio::test]
    async fn test_poll_leaves_healthy_escrow_alone() {
        let mut ledger = MockLedger::new();
        expect_bid_book(&mut ledger, 2);
        let store = Arc::new(MemoryStore::new());
        let loan = escrow("HEALTHY", now_ledger_time() - 10);
        store.insert_escrow(&loan).await.unwrap();

        let (coordinator, broker) = build(ledger, store.clone());
        let mut rx = broker.subscribe(&loan.account).unwrap();
        let (handle, mut commands) = SettlementHandle::channel(4);
        let poller =
            LiquidationPoller::new(store, coordinator.oracle().clone(), broker, handle, 10);

        assert_eq!(poller.poll_once().await.unwrap(), 0);

        // Subscribers hear every cycle, triggered or not
        let update: serde_json::Value = serde_json::from_str(&rx.recv().await.unwrap()).unwrap();
        let update = &update[loan.account.as_str()]["RATE_UPDATE"];
        assert_eq!(update["liquidate"], false);
        assert_eq!(update["escrow_condition"], "HEALTHY");
        assert!(commands.try_recv().is_err());
    }
}
