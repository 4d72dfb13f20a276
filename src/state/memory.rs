//! In-memory store backing the lifecycle tests

use super::records::{Completion, CompletionWrite, ConditionPair, Escrow, EscrowStats};
use super::Store;
use crate::error::{EngineError, EngineResult};

use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::Mutex;

#[derive(Default)]
struct Tables {
    conditions: HashMap<String, String>,
    escrows: Vec<Escrow>,
    completions: HashMap<(String, u32), Completion>,
}

#[derive(Default)]
pub(crate) struct MemoryStore {
    tables: Mutex<Tables>,
    /// Fail condition writes to exercise the persistence sentinel
    fail_condition_writes: bool,
}

impl MemoryStore {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn failing_condition_writes() -> Self {
        Self {
            fail_condition_writes: true,
            ..Self::default()
        }
    }

    pub(crate) fn put_completion(&self, completion: Completion) {
        let mut tables = self.tables.lock().unwrap();
        tables.completions.insert(
            (completion.owner.clone(), completion.sequence),
            completion,
        );
    }

    pub(crate) fn condition_count(&self) -> usize {
        self.tables.lock().unwrap().conditions.len()
    }

    fn is_open(tables: &Tables, escrow: &Escrow) -> bool {
        tables
            .completions
            .get(&(escrow.account.clone(), escrow.sequence))
            .map_or(true, |c| !c.is_terminal())
    }

    fn open_where(&self, filter: impl Fn(&Escrow) -> bool) -> Vec<Escrow> {
        let tables = self.tables.lock().unwrap();
        tables
            .escrows
            .iter()
            .filter(|e| Self::is_open(&tables, e) && filter(e))
            .cloned()
            .collect()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn insert_condition(&self, pair: &ConditionPair) -> EngineResult<()> {
        if self.fail_condition_writes {
            return Err(EngineError::Persistence("insert condition: store offline".to_string()));
        }
        self.tables
            .lock()
            .unwrap()
            .conditions
            .insert(pair.escrow_condition.clone(), pair.fulfillment.clone());
        Ok(())
    }

    async fn fulfillment(&self, escrow_condition: &str) -> EngineResult<Option<String>> {
        Ok(self
            .tables
            .lock()
            .unwrap()
            .conditions
            .get(escrow_condition)
            .cloned())
    }

    async fn insert_escrow(&self, escrow: &Escrow) -> EngineResult<bool> {
        let mut tables = self.tables.lock().unwrap();
        let exists = tables.escrows.iter().any(|e| {
            e.escrow_condition == escrow.escrow_condition
                || (e.account == escrow.account && e.sequence == escrow.sequence)
        });
        if exists {
            return Ok(false);
        }
        tables.escrows.push(escrow.clone());
        Ok(true)
    }

    async fn escrow_by_condition(&self, escrow_condition: &str) -> EngineResult<Option<Escrow>> {
        let tables = self.tables.lock().unwrap();
        Ok(tables
            .escrows
            .iter()
            .find(|e| e.escrow_condition == escrow_condition)
            .cloned())
    }

    async fn escrow_by_sequence(
        &self,
        owner: &str,
        sequence: u32,
    ) -> EngineResult<Option<Escrow>> {
        let tables = self.tables.lock().unwrap();
        Ok(tables
            .escrows
            .iter()
            .find(|e| e.account == owner && e.sequence == sequence)
            .cloned())
    }

    async fn completion(&self, owner: &str, sequence: u32) -> EngineResult<Option<Completion>> {
        let tables = self.tables.lock().unwrap();
        Ok(tables
            .completions
            .get(&(owner.to_string(), sequence))
            .cloned())
    }

    async fn upsert_completion(
        &self,
        record: &CompletionWrite,
        expected_version: Option<i64>,
    ) -> EngineResult<i64> {
        let mut tables = self.tables.lock().unwrap();
        let key = (record.owner.clone(), record.sequence);
        let current = tables.completions.get(&key).map(|c| c.version);

        if current != expected_version {
            return Err(EngineError::Conflict {
                owner: record.owner.clone(),
                sequence: record.sequence,
            });
        }

        let version = current.map_or(1, |v| v + 1);
        tables.completions.insert(
            key,
            Completion {
                hash: record.hash.clone(),
                escrow_condition: record.escrow_condition.clone(),
                engine_result: record.engine_result.clone(),
                created: Utc::now(),
                owner: record.owner.clone(),
                fee: record.fee,
                sequence: record.sequence,
                transaction_type: record.transaction_type,
                attempts: record.attempts,
                version,
            },
        );
        Ok(version)
    }

    async fn confirm_completion(&self, record: &CompletionWrite) -> EngineResult<Completion> {
        let mut tables = self.tables.lock().unwrap();
        let key = (record.owner.clone(), record.sequence);

        let completion = match tables.completions.get(&key) {
            Some(existing) => Completion {
                hash: record.hash.clone(),
                engine_result: record.engine_result.clone(),
                created: Utc::now(),
                transaction_type: record.transaction_type,
                version: existing.version + 1,
                ..existing.clone()
            },
            None => Completion {
                hash: record.hash.clone(),
                escrow_condition: record.escrow_condition.clone(),
                engine_result: record.engine_result.clone(),
                created: Utc::now(),
                owner: record.owner.clone(),
                fee: record.fee,
                sequence: record.sequence,
                transaction_type: record.transaction_type,
                attempts: record.attempts,
                version: 1,
            },
        };

        tables.completions.insert(key, completion.clone());
        Ok(completion)
    }

    async fn expired_escrows(&self, now_ledger: i64) -> EngineResult<Vec<Escrow>> {
        Ok(self.open_where(|e| e.expired_at(now_ledger)))
    }

    async fn open_books(&self) -> EngineResult<Vec<(String, String)>> {
        let mut books: Vec<(String, String)> = Vec::new();
        for escrow in self.open_where(|_| true) {
            let book = (escrow.currency, escrow.issuer);
            if !books.contains(&book) {
                books.push(book);
            }
        }
        Ok(books)
    }

    async fn open_escrows_for_book(
        &self,
        currency: &str,
        issuer: &str,
    ) -> EngineResult<Vec<Escrow>> {
        Ok(self.open_where(|e| e.currency == currency && e.issuer == issuer))
    }

    async fn open_escrows_for_account(&self, account: &str) -> EngineResult<Vec<Escrow>> {
        Ok(self.open_where(|e| e.account == account || e.destination == account))
    }

    async fn stats(&self) -> EngineResult<EscrowStats> {
        let tables = self.tables.lock().unwrap();
        let mut stats = EscrowStats::default();
        for escrow in &tables.escrows {
            match tables
                .completions
                .get(&(escrow.account.clone(), escrow.sequence))
            {
                None => stats.open += 1,
                Some(c) if c.is_terminal() => stats.settled += 1,
                Some(_) => stats.pending_retry += 1,
            }
        }
        Ok(stats)
    }

    async fn health_check(&self) -> EngineResult<()> {
        Ok(())
    }
}
