//! Escrow lifecycle coordinator
//!
//! The coordinator:
//! 1. Builds EscrowCreate proposals for borrowers to sign
//! 2. Cancels expired escrows and finishes liquidated ones with the custody key
//! 3. Records every submission in the completion ledger with optimistic versioning
//!
//! Cancel and finish submissions run on a single settlement worker so the
//! custody account sequence is never used twice.

use super::condition::{self, ConditionGenerator};
use super::lifecycle::SettlementOutcome;
use crate::config::EngineConfig;
use crate::error::{EngineError, EngineResult};
use crate::ledger::types::{now_ledger_time, to_ledger_time, ResultClass};
use crate::oracle::LiquidityOracle;
use crate::pubsub::{Broker, PubSubMessage};
use crate::state::{Completion, CompletionWrite, Escrow, LoanTerms, Store};
use crate::tx::builder::{self, CreateParams};
use crate::tx::{FeeSchedule, FinishRates, Transaction, TransactionSender, TransactionType};

use chrono::{DateTime, TimeZone, Utc};
use rust_decimal::Decimal;
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};

/// Borrower request for a new collateral escrow
#[derive(Debug, Clone, PartialEq)]
pub struct EscrowRequest {
    pub account: String,
    pub destination: String,
    pub amount: Decimal,
    pub currency: String,
    pub issuer: String,
    pub collateral: Decimal,
    pub cancel_after: DateTime<Utc>,
}

impl EscrowRequest {
    /// Validate an inbound message; the error names the first missing field
    pub fn from_message(message: &Value) -> EngineResult<Self> {
        let cancel_after = match required(message, "cancel_after")? {
            Value::String(s) => DateTime::parse_from_rfc3339(s)
                .map(|d| d.with_timezone(&Utc))
                .map_err(|_| EngineError::Validation("cancel_after".to_string()))?,
            Value::Number(n) => n
                .as_i64()
                .and_then(|secs| Utc.timestamp_opt(secs, 0).single())
                .ok_or_else(|| EngineError::Validation("cancel_after".to_string()))?,
            _ => return Err(EngineError::Validation("cancel_after".to_string())),
        };

        Ok(Self {
            account: required_str(message, "account")?,
            destination: required_str(message, "destination")?,
            amount: required_decimal(message, "amount")?,
            currency: required_str(message, "currency")?,
            issuer: required_str(message, "issuer")?,
            collateral: required_decimal(message, "collateral")?,
            cancel_after,
        })
    }

    pub fn total(&self) -> Decimal {
        self.amount + self.collateral
    }
}

fn required<'a>(message: &'a Value, field: &str) -> EngineResult<&'a Value> {
    match message.get(field) {
        None | Some(Value::Null) => Err(EngineError::Validation(field.to_string())),
        Some(Value::String(s)) if s.trim().is_empty() => {
            Err(EngineError::Validation(field.to_string()))
        }
        Some(value) => Ok(value),
    }
}

fn required_str(message: &Value, field: &str) -> EngineResult<String> {
    required(message, field)?
        .as_str()
        .map(str::to_string)
        .ok_or_else(|| EngineError::Validation(field.to_string()))
}

fn required_decimal(message: &Value, field: &str) -> EngineResult<Decimal> {
    let value: Decimal = serde_json::from_value(required(message, field)?.clone())
        .map_err(|_| EngineError::Validation(field.to_string()))?;
    if value <= Decimal::ZERO {
        return Err(EngineError::Validation(field.to_string()));
    }
    Ok(value)
}

/// A liquidation decided by the poller
#[derive(Debug, Clone, PartialEq)]
pub struct FinishRequest {
    pub escrow_condition: String,
    pub rates: FinishRates,
}

/// Work for the settlement worker
#[derive(Debug)]
pub enum SettlementCommand {
    Cancel {
        owner: String,
        sequence: u32,
        escrow_condition: String,
        reply: oneshot::Sender<SettlementOutcome>,
    },
    Finish {
        request: FinishRequest,
        reply: oneshot::Sender<SettlementOutcome>,
    },
}

/// Cloneable sender side of the settlement queue
#[derive(Clone)]
pub struct SettlementHandle {
    tx: mpsc::Sender<SettlementCommand>,
}

impl SettlementHandle {
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<SettlementCommand>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx }, rx)
    }

    pub async fn cancel(&self, owner: &str, sequence: u32, escrow_condition: &str) -> SettlementOutcome {
        let (reply, rx) = oneshot::channel();
        let command = SettlementCommand::Cancel {
            owner: owner.to_string(),
            sequence,
            escrow_condition: escrow_condition.to_string(),
            reply,
        };
        self.dispatch(command, rx).await
    }

    pub async fn finish(&self, request: FinishRequest) -> SettlementOutcome {
        let (reply, rx) = oneshot::channel();
        self.dispatch(SettlementCommand::Finish { request, reply }, rx)
            .await
    }

    async fn dispatch(
        &self,
        command: SettlementCommand,
        rx: oneshot::Receiver<SettlementOutcome>,
    ) -> SettlementOutcome {
        if self.tx.send(command).await.is_err() {
            return SettlementOutcome::Failed("settlement worker stopped".to_string());
        }
        rx.await
            .unwrap_or_else(|_| SettlementOutcome::Failed("settlement worker dropped reply".to_string()))
    }
}

/// Escrow lifecycle coordinator
pub struct Coordinator {
    store: Arc<dyn Store>,
    conditions: ConditionGenerator,
    oracle: Arc<LiquidityOracle>,
    sender: TransactionSender,
    fees: FeeSchedule,
    broker: Arc<Broker>,
    config: EngineConfig,
}

impl Coordinator {
    pub fn new(
        store: Arc<dyn Store>,
        oracle: Arc<LiquidityOracle>,
        sender: TransactionSender,
        fees: FeeSchedule,
        broker: Arc<Broker>,
        config: EngineConfig,
    ) -> Self {
        Self {
            conditions: ConditionGenerator::new(store.clone()),
            store,
            oracle,
            sender,
            fees,
            broker,
            config,
        }
    }

    /// Settlement worker loop; ends when every handle is dropped
    pub async fn run(&self, mut commands: mpsc::Receiver<SettlementCommand>) {
        info!("Settlement worker started");

        while let Some(command) = commands.recv().await {
            match command {
                SettlementCommand::Cancel {
                    owner,
                    sequence,
                    escrow_condition,
                    reply,
                } => {
                    let outcome = self.cancel_escrow(sequence, &owner, &escrow_condition).await;
                    let _ = reply.send(outcome);
                }
                SettlementCommand::Finish { request, reply } => {
                    let outcome = self.finish_escrow(&request).await;
                    let _ = reply.send(outcome);
                }
            }
        }

        info!("Settlement worker stopped");
    }

    /// Build an EscrowCreate proposal and route it to the borrower's channel
    pub async fn create_escrow(&self, request: &EscrowRequest) -> EngineResult<Transaction> {
        let pair = self.conditions.generate().await?;
        let rate = self
            .oracle
            .current_rate(request.amount, &request.currency, &request.issuer)
            .await?;

        let total = request.total();
        let finish_after = now_ledger_time() + self.config.minimum_hold_secs as i64;
        let cancel_after = to_ledger_time(request.cancel_after.timestamp());
        if cancel_after <= finish_after {
            return Err(EngineError::Validation("cancel_after".to_string()));
        }

        let terms = LoanTerms {
            collateral: request.collateral,
            rate,
            amount: request.amount,
            currency: request.currency.clone(),
            issuer: request.issuer.clone(),
            app: self.config.app_id.clone(),
            version: self.config.memo_version.clone(),
        };

        let tx = builder::escrow_create(&CreateParams {
            account: &request.account,
            destination: &request.destination,
            drops: builder::drops_for(total, rate)?,
            condition: &pair.escrow_condition,
            finish_after,
            cancel_after,
            destination_tag: self.config.destination_tag,
            source_tag: self.config.source_tag,
            terms: &terms,
        })?;

        info!(
            "Proposed escrow {} for {}: {} {} + {} collateral at rate {}",
            pair.escrow_condition,
            request.account,
            request.amount,
            request.currency,
            request.collateral,
            rate
        );
        crate::metrics::record_escrow_proposed();

        let message = PubSubMessage::EscrowCreate(Box::new(tx.clone()));
        if !self.broker.route(&message, &request.account) {
            debug!("No subscriber for {} to receive the proposal", request.account);
        }

        Ok(tx)
    }

    /// Cancel an escrow past its deadline. Idempotent once a terminal result is recorded.
    /// Escrows this engine has not ingested go straight to the ledger.
    pub async fn cancel_escrow(
        &self,
        sequence: u32,
        owner: &str,
        escrow_condition: &str,
    ) -> SettlementOutcome {
        let kind = TransactionType::EscrowCancel;

        // Before CancelAfter the ledger answers tecNO_PERMISSION
        match self.store.escrow_by_sequence(owner, sequence).await {
            Ok(Some(escrow)) if !escrow.expired_at(now_ledger_time()) => {
                return SettlementOutcome::Blocked("cancel_after not reached".to_string());
            }
            Ok(_) => {}
            Err(e) => return e.into(),
        }

        let previous = match self.store.completion(owner, sequence).await {
            Ok(previous) => previous,
            Err(e) => return e.into(),
        };

        if let Some(outcome) = self.gate(kind, previous.as_ref()) {
            debug!("Cancel {}/{} not submitted: {}", owner, sequence, outcome);
            return outcome;
        }

        let fee = self.fees.next_fee(kind, previous.as_ref());
        let tx = builder::escrow_cancel(
            self.sender.custody_account(),
            owner,
            sequence,
            &self.config.cancel_memo,
        );

        self.submit_and_record(tx, fee, previous.as_ref(), owner, sequence, escrow_condition)
            .await
    }

    /// Finish a liquidated escrow by revealing its fulfillment
    pub async fn finish_escrow(&self, request: &FinishRequest) -> SettlementOutcome {
        let kind = TransactionType::EscrowFinish;

        let escrow = match self.store.escrow_by_condition(&request.escrow_condition).await {
            Ok(Some(escrow)) => escrow,
            Ok(None) => return SettlementOutcome::Blocked("no escrow".to_string()),
            Err(e) => return e.into(),
        };

        if !escrow.finishable_at(now_ledger_time()) {
            return SettlementOutcome::Blocked("finish_after not reached".to_string());
        }

        let fulfillment = match self.store.fulfillment(&escrow.escrow_condition).await {
            Ok(Some(fulfillment)) => fulfillment,
            Ok(None) => return SettlementOutcome::Blocked("no fulfillment".to_string()),
            Err(e) => return e.into(),
        };
        if !condition::verify(&escrow.escrow_condition, &fulfillment) {
            error!("Stored fulfillment does not open {}", escrow.escrow_condition);
            return SettlementOutcome::Blocked("fulfillment mismatch".to_string());
        }

        let previous = match self.store.completion(&escrow.account, escrow.sequence).await {
            Ok(previous) => previous,
            Err(e) => return e.into(),
        };
        if let Some(outcome) = self.gate(kind, previous.as_ref()) {
            debug!("Finish {} not submitted: {}", escrow.escrow_condition, outcome);
            return outcome;
        }

        let fee = self.fees.next_fee(kind, previous.as_ref());
        let pair = crate::state::ConditionPair {
            escrow_condition: escrow.escrow_condition.clone(),
            fulfillment,
        };
        let tx = match builder::escrow_finish(
            self.sender.custody_account(),
            &escrow,
            &pair,
            &self.config.finish_memo,
            &request.rates,
        ) {
            Ok(tx) => tx,
            Err(e) => return e.into(),
        };

        self.submit_and_record(
            tx,
            fee,
            previous.as_ref(),
            &escrow.account,
            escrow.sequence,
            &escrow.escrow_condition,
        )
        .await
    }

    /// Decide from the last completion whether a submission may proceed
    fn gate(&self, kind: TransactionType, previous: Option<&Completion>) -> Option<SettlementOutcome> {
        let previous = previous?;

        if previous.is_terminal() {
            return Some(SettlementOutcome::Skipped(previous.engine_result.clone()));
        }
        if previous.transaction_type != kind {
            return None;
        }
        if previous.engine_result.class() == ResultClass::Attention {
            return Some(SettlementOutcome::NeedsAttention(
                previous.engine_result.clone(),
            ));
        }
        if previous.attempts >= self.config.max_attempts {
            return Some(SettlementOutcome::Exhausted {
                attempts: previous.attempts,
            });
        }
        None
    }

    async fn submit_and_record(
        &self,
        tx: Transaction,
        fee: u64,
        previous: Option<&Completion>,
        owner: &str,
        sequence: u32,
        escrow_condition: &str,
    ) -> SettlementOutcome {
        let kind = tx.transaction_type;
        let attempts = match previous {
            Some(p) if p.transaction_type == kind => p.attempts + 1,
            _ => 1,
        };

        let submission = match self.sender.submit(tx, fee).await {
            Ok(submission) => submission,
            Err(e) => {
                warn!("{} for {}/{} not submitted: {}", kind.as_str(), owner, sequence, e);
                return e.into();
            }
        };

        let record = CompletionWrite {
            hash: Some(submission.hash.clone()),
            escrow_condition: escrow_condition.to_string(),
            engine_result: submission.engine_result.clone(),
            owner: owner.to_string(),
            fee,
            sequence,
            transaction_type: kind,
            attempts,
        };

        if let Err(e) = self
            .store
            .upsert_completion(&record, previous.map(|p| p.version))
            .await
        {
            warn!(
                "{} {} submitted but completion not recorded: {}",
                kind.as_str(),
                submission.hash,
                e
            );
            return e.into();
        }

        SettlementOutcome::Submitted {
            engine_result: submission.engine_result,
            fee,
            hash: submission.hash,
            attempts,
        }
    }

    pub fn oracle(&self) -> &Arc<LiquidityOracle> {
        &self.oracle
    }
}

/// Open escrow plus its derived state, as served to clients
pub fn describe(escrow: &Escrow, completion: Option<&Completion>, max_attempts: u32) -> Value {
    let state = super::EscrowState::derive(Some(escrow), completion, max_attempts);
    let mut value = serde_json::to_value(escrow).unwrap_or(Value::Null);
    value["state"] = serde_json::to_value(state).unwrap_or(Value::Null);
    value
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::config::tests::sample_settings;
    use crate::ledger::types::EngineCode;
    use crate::ledger::{BookOffersResponse, Issue, MockLedger, SubmitResponse};
    use crate::oracle::book::tests::ask;
    use crate::state::memory::MemoryStore;
    use crate::state::ConditionPair;
    use crate::tx::codec::encode_address;
    use crate::tx::signer::tests::test_signer;
    use chrono::Duration;
    use serde_json::json;
    use std::sync::atomic::{AtomicU32, Ordering};

    pub(crate) fn owner() -> String {
        encode_address(&[2u8; 20])
    }

    pub(crate) fn build(ledger: MockLedger, store: Arc<MemoryStore>) -> (Arc<Coordinator>, Arc<Broker>) {
        let settings = sample_settings();
        let ledger: Arc<dyn crate::ledger::Ledger> = Arc::new(ledger);
        let signer = test_signer();
        let oracle = Arc::new(LiquidityOracle::new(
            ledger.clone(),
            signer.account(),
            &settings.ledger,
        ));
        let broker = Arc::new(Broker::new(16, 16));
        let coordinator = Coordinator::new(
            store,
            oracle,
            TransactionSender::new(ledger, signer),
            FeeSchedule::new(settings.fees.clone()),
            broker.clone(),
            settings.engine,
        );
        (Arc::new(coordinator), broker)
    }

    /// Ask book at 2 USD/XRP with 200 USD of depth
    pub(crate) fn expect_ask_book(ledger: &mut MockLedger) {
        ledger.expect_book_offers().returning(|_, gets: Issue, _, _| {
            let offers = if gets.currency == "XRP" {
                vec![ask("rMaker", "100000000", "200")]
            } else {
                vec![]
            };
            Ok(BookOffersResponse {
                offers,
                ledger_current_index: Some(500),
                ledger_index: None,
            })
        });
    }

    /// Submissions answer with `results` in order, then tesSUCCESS
    pub(crate) fn expect_submissions(ledger: &mut MockLedger, results: Vec<&'static str>, times: usize) {
        ledger.expect_account_sequence().times(times).returning(|_| Ok(30));
        let calls = AtomicU32::new(0);
        ledger.expect_submit().times(times).returning(move |_| {
            let n = calls.fetch_add(1, Ordering::Relaxed) as usize;
            Ok(SubmitResponse {
                engine_result: results.get(n).copied().unwrap_or("tesSUCCESS").to_string(),
                engine_result_message: None,
                tx_json: None,
            })
        });
    }

    pub(crate) fn escrow(condition: &str, finish_after: i64) -> Escrow {
        Escrow {
            escrow_condition: condition.to_string(),
            hash: "CREATEHASH".to_string(),
            account: owner(),
            destination: encode_address(&[3u8; 20]),
            currency: "USD".to_string(),
            issuer: "rIssuer".to_string(),
            amount: Decimal::from(100),
            collateral: Decimal::from(20),
            rate: Decimal::new(5, 1),
            destination_tag: None,
            source_tag: None,
            ledger: 400,
            created: Utc::now(),
            cancel_after: Some(now_ledger_time() + 3_600),
            finish_after: Some(finish_after),
            sequence: 12,
        }
    }

    fn rates() -> FinishRates {
        FinishRates {
            last_price: Decimal::from(3),
            liquidation_call: Decimal::from(40),
            liquidation_base: Decimal::from(50),
            ledger: 500,
        }
    }

    fn completion(result: EngineCode, kind: TransactionType, attempts: u32) -> Completion {
        Completion {
            hash: Some("H".to_string()),
            escrow_condition: "C".to_string(),
            engine_result: result,
            created: Utc::now(),
            owner: owner(),
            fee: 10,
            sequence: 12,
            transaction_type: kind,
            attempts,
            version: 3,
        }
    }

    #[tokio::test]
    async fn test_create_escrow_proposal() {
        let mut ledger = MockLedger::new();
        expect_ask_book(&mut ledger);
        let store = Arc::new(MemoryStore::new());
        let (coordinator, broker) = build(ledger, store.clone());
        let mut rx = broker.subscribe("rBorrower").unwrap();

        let request = EscrowRequest::from_message(&json!({
            "account": "rBorrower",
            "destination": "rLender",
            "amount": "100",
            "currency": "USD",
            "issuer": "rIssuer",
            "collateral": 20,
            "cancel_after": (Utc::now() + Duration::hours(1)).to_rfc3339(),
        }))
        .unwrap();

        let before = now_ledger_time();
        let tx = coordinator.create_escrow(&request).await.unwrap();

        assert_eq!(tx.amount.as_deref(), Some("60000000"));
        let finish_after = i64::from(tx.finish_after.unwrap());
        assert!(finish_after >= before + 60 && finish_after <= now_ledger_time() + 60);
        assert!(i64::from(tx.cancel_after.unwrap()) > finish_after);

        let condition = tx.condition.clone().unwrap();
        let fulfillment = store.fulfillment(&condition).await.unwrap().unwrap();
        assert!(condition::verify(&condition, &fulfillment));

        let routed: Value = serde_json::from_str(&rx.recv().await.unwrap()).unwrap();
        assert_eq!(routed["rBorrower"]["ESCROW_CREATE"]["TransactionType"], "EscrowCreate");
    }

    #[test]
    fn test_request_validation_names_missing_field() {
        let err = EscrowRequest::from_message(&json!({
            "account": "rBorrower",
            "amount": "100",
        }))
        .unwrap_err();
        assert!(matches!(err, EngineError::Validation(ref f) if f == "cancel_after"));

        let err = EscrowRequest::from_message(&json!({
            "account": "rBorrower",
            "destination": "",
            "amount": "100",
            "currency": "USD",
            "issuer": "rIssuer",
            "collateral": "20",
            "cancel_after": 1_900_000_000,
        }))
        .unwrap_err();
        assert!(matches!(err, EngineError::Validation(ref f) if f == "destination"));
    }

    #[tokio::test]
    async fn test_cancel_is_idempotent_after_success() {
        let store = Arc::new(MemoryStore::new());
        store.put_completion(completion(EngineCode::Success, TransactionType::EscrowCancel, 1));
        let (coordinator, _) = build(MockLedger::new(), store.clone());

        for _ in 0..3 {
            let outcome = coordinator.cancel_escrow(12, &owner(), "C").await;
            assert_eq!(outcome, SettlementOutcome::Skipped(EngineCode::Success));
        }
        let stored = store.completion(&owner(), 12).await.unwrap().unwrap();
        assert_eq!(stored.version, 3);
    }

    #[tokio::test]
    async fn test_cancel_fee_escalation() {
        let mut ledger = MockLedger::new();
        expect_submissions(
            &mut ledger,
            vec!["telINSUF_FEE_P", "telINSUF_FEE_P", "telINSUF_FEE_P"],
            4,
        );
        let store = Arc::new(MemoryStore::new());
        let (coordinator, _) = build(ledger, store.clone());

        let mut fees = Vec::new();
        for _ in 0..4 {
            match coordinator.cancel_escrow(12, &owner(), "C").await {
                SettlementOutcome::Submitted { fee, .. } => fees.push(fee),
                other => panic!("unexpected {:?}", other),
            }
        }

        // N = 3 insufficient-fee results before the fourth attempt
        assert_eq!(fees, vec![10, 20, 30, 40]);
        let stored = store.completion(&owner(), 12).await.unwrap().unwrap();
        assert_eq!(stored.attempts, 4);
        assert_eq!(stored.fee, 40);
        assert_eq!(stored.engine_result, EngineCode::Success);
    }

    #[tokio::test]
    async fn test_cancel_stops_after_attempt_cap() {
        let mut ledger = MockLedger::new();
        expect_submissions(&mut ledger, vec!["telINSUF_FEE_P"; 5], 5);
        let store = Arc::new(MemoryStore::new());
        let (coordinator, _) = build(ledger, store.clone());

        for _ in 0..5 {
            assert!(coordinator.cancel_escrow(12, &owner(), "C").await.submitted());
        }
        let outcome = coordinator.cancel_escrow(12, &owner(), "C").await;
        assert_eq!(outcome, SettlementOutcome::Exhausted { attempts: 5 });
    }

    #[tokio::test]
    async fn test_attention_results_are_not_retried() {
        let store = Arc::new(MemoryStore::new());
        store.put_completion(completion(EngineCode::NoPermission, TransactionType::EscrowCancel, 1));
        let (coordinator, _) = build(MockLedger::new(), store);

        let outcome = coordinator.cancel_escrow(12, &owner(), "C").await;
        assert_eq!(outcome, SettlementOutcome::NeedsAttention(EngineCode::NoPermission));
    }

    #[tokio::test]
    async fn test_cancel_before_cancel_after_submits_nothing() {
        let store = Arc::new(MemoryStore::new());
        let live = escrow("LIVE", now_ledger_time() - 600);
        store.insert_escrow(&live).await.unwrap();
        let (coordinator, _) = build(MockLedger::new(), store.clone());

        let outcome = coordinator.cancel_escrow(12, &owner(), "LIVE").await;
        assert_eq!(
            outcome,
            SettlementOutcome::Blocked("cancel_after not reached".to_string())
        );
        assert!(store.completion(&owner(), 12).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_cancel_after_deadline_submits() {
        let mut ledger = MockLedger::new();
        expect_submissions(&mut ledger, vec![], 1);
        let store = Arc::new(MemoryStore::new());
        let mut expired = escrow("EXPIRED", now_ledger_time() - 600);
        expired.cancel_after = Some(now_ledger_time() - 5);
        store.insert_escrow(&expired).await.unwrap();
        let (coordinator, _) = build(ledger, store.clone());

        let outcome = coordinator.cancel_escrow(12, &owner(), "EXPIRED").await;
        assert!(matches!(
            outcome,
            SettlementOutcome::Submitted { fee: 10, attempts: 1, .. }
        ));
    }

    #[tokio::test]
    async fn test_finish_before_finish_after_submits_nothing() {
        let store = Arc::new(MemoryStore::new());
        store
            .insert_escrow(&escrow("COND", now_ledger_time() + 600))
            .await
            .unwrap();
        let (coordinator, _) = build(MockLedger::new(), store.clone());

        let outcome = coordinator
            .finish_escrow(&FinishRequest {
                escrow_condition: "COND".to_string(),
                rates: rates(),
            })
            .await;
        assert!(matches!(outcome, SettlementOutcome::Blocked(_)));
        assert!(store.completion(&owner(), 12).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_finish_reveals_fulfillment_once() {
        let mut ledger = MockLedger::new();
        expect_submissions(&mut ledger, vec![], 1);
        let store = Arc::new(MemoryStore::new());

        let preimage = [4u8; 32];
        let pair = ConditionPair {
            escrow_condition: hex::encode_upper(condition::condition_for(&preimage)),
            fulfillment: hex::encode_upper(condition::fulfillment_for(&preimage)),
        };
        store.insert_condition(&pair).await.unwrap();
        store
            .insert_escrow(&escrow(&pair.escrow_condition, now_ledger_time() - 10))
            .await
            .unwrap();
        let (coordinator, _) = build(ledger, store.clone());

        let request = FinishRequest {
            escrow_condition: pair.escrow_condition.clone(),
            rates: rates(),
        };
        let outcome = coordinator.finish_escrow(&request).await;
        assert!(matches!(
            outcome,
            SettlementOutcome::Submitted { fee: 350, attempts: 1, .. }
        ));

        let stored = store.completion(&owner(), 12).await.unwrap().unwrap();
        assert_eq!(stored.transaction_type, TransactionType::EscrowFinish);

        let again = coordinator.finish_escrow(&request).await;
        assert_eq!(again, SettlementOutcome::Skipped(EngineCode::Success));
    }

    #[tokio::test]
    async fn test_worker_serializes_commands() {
        let mut ledger = MockLedger::new();
        expect_submissions(&mut ledger, vec![], 1);
        let store = Arc::new(MemoryStore::new());
        let (coordinator, _) = build(ledger, store);

        let (handle, rx) = SettlementHandle::channel(4);
        let worker = tokio::spawn({
            let coordinator = coordinator.clone();
            async move { coordinator.run(rx).await }
        });

        let first = handle.cancel(&owner(), 12, "C").await;
        assert!(first.submitted());
        let second = handle.cancel(&owner(), 12, "C").await;
        assert_eq!(second, SettlementOutcome::Skipped(EngineCode::Success));

        drop(handle);
        worker.await.unwrap();
    }
}
