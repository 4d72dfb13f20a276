//! PostgreSQL state manager

use super::records::{Completion, CompletionWrite, ConditionPair, Escrow, EscrowStats};
use super::Store;
use crate::config::DatabaseConfig;
use crate::error::{EngineError, EngineResult};
use crate::ledger::types::EngineCode;
use crate::tx::codec::TransactionType;

use async_trait::async_trait;
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::Row;
use tracing::{debug, info, warn};

/// Completion results after which an escrow is settled
const TERMINAL_RESULTS: &str = "('tesSUCCESS', 'tecNO_TARGET')";

const ESCROW_COLUMNS: &str = "e.escrow_condition, e.hash, e.account, e.destination, e.currency, \
     e.issuer, e.amount, e.collateral, e.rate, e.destination_tag, e.source_tag, e.ledger, \
     e.created, e.cancel_after, e.finish_after, e.sequence";

const COMPLETION_COLUMNS: &str = "hash, escrow_condition, engine_result, created, owner, fee, \
     sequence, transaction_type, attempts, version";

/// State manager for PostgreSQL persistence
pub struct StateManager {
    pool: PgPool,
}

impl StateManager {
    /// Create a new state manager
    pub async fn new(config: &DatabaseConfig) -> EngineResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .connect(&config.url)
            .await?;

        Ok(Self { pool })
    }

    /// Run database migrations
    pub async fn run_migrations(&self) -> EngineResult<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS escrow_conditions (
                escrow_condition VARCHAR(128) PRIMARY KEY,
                fulfillment VARCHAR(128) NOT NULL,
                created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS escrow (
                escrow_condition VARCHAR(128) PRIMARY KEY,
                hash VARCHAR(64) NOT NULL,
                account VARCHAR(40) NOT NULL,
                destination VARCHAR(40) NOT NULL,
                currency VARCHAR(40) NOT NULL,
                issuer VARCHAR(40) NOT NULL,
                amount NUMERIC NOT NULL,
                collateral NUMERIC NOT NULL,
                rate NUMERIC NOT NULL,
                destination_tag BIGINT,
                source_tag BIGINT,
                ledger BIGINT NOT NULL,
                created TIMESTAMPTZ NOT NULL,
                cancel_after BIGINT,
                finish_after BIGINT,
                sequence BIGINT NOT NULL,
                UNIQUE (account, sequence)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_escrow_book
            ON escrow (currency, issuer)
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS escrow_completed (
                owner VARCHAR(40) NOT NULL,
                sequence BIGINT NOT NULL,
                hash VARCHAR(64),
                escrow_condition VARCHAR(128) NOT NULL,
                engine_result VARCHAR(64) NOT NULL,
                created TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                fee BIGINT NOT NULL,
                transaction_type VARCHAR(16) NOT NULL,
                attempts INTEGER NOT NULL,
                version BIGINT NOT NULL DEFAULT 1,
                PRIMARY KEY (owner, sequence)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        info!("Database migrations complete");
        Ok(())
    }
}

fn escrow_from_row(row: &PgRow) -> Escrow {
    Escrow {
        escrow_condition: row.get("escrow_condition"),
        hash: row.get("hash"),
        account: row.get("account"),
        destination: row.get("destination"),
        currency: row.get("currency"),
        issuer: row.get("issuer"),
        amount: row.get("amount"),
        collateral: row.get("collateral"),
        rate: row.get("rate"),
        destination_tag: row.get::<Option<i64>, _>("destination_tag").map(|t| t as u32),
        source_tag: row.get::<Option<i64>, _>("source_tag").map(|t| t as u32),
        ledger: row.get::<i64, _>("ledger") as u32,
        created: row.get("created"),
        cancel_after: row.get("cancel_after"),
        finish_after: row.get("finish_after"),
        sequence: row.get::<i64, _>("sequence") as u32,
    }
}

fn completion_from_row(row: &PgRow) -> EngineResult<Completion> {
    let transaction_type: String = row.get("transaction_type");
    let transaction_type = TransactionType::parse(&transaction_type).ok_or_else(|| {
        EngineError::Decoding(format!("unknown transaction type {}", transaction_type))
    })?;

    Ok(Completion {
        hash: row.get("hash"),
        escrow_condition: row.get("escrow_condition"),
        engine_result: EngineCode::from(row.get::<String, _>("engine_result")),
        created: row.get("created"),
        owner: row.get("owner"),
        fee: row.get::<i64, _>("fee") as u64,
        sequence: row.get::<i64, _>("sequence") as u32,
        transaction_type,
        attempts: row.get::<i32, _>("attempts") as u32,
        version: row.get("version"),
    })
}

/// Persistence failures surface as a sentinel the caller logs, never as a panic
fn persistence(context: &str, e: sqlx::Error) -> EngineError {
    warn!("{} failed: {}", context, e);
    EngineError::Persistence(format!("{}: {}", context, e))
}

#[async_trait]
impl Store for StateManager {
    async fn insert_condition(&self, pair: &ConditionPair) -> EngineResult<()> {
        sqlx::query(
            "INSERT INTO escrow_conditions (escrow_condition, fulfillment) VALUES ($1, $2)",
        )
        .bind(&pair.escrow_condition)
        .bind(&pair.fulfillment)
        .execute(&self.pool)
        .await
        .map_err(|e| persistence("insert condition", e))?;

        Ok(())
    }

    async fn fulfillment(&self, escrow_condition: &str) -> EngineResult<Option<String>> {
        let row = sqlx::query("SELECT fulfillment FROM escrow_conditions WHERE escrow_condition = $1")
            .bind(escrow_condition)
            .fetch_optional(&self.pool)
            .await?;

        Ok(row.map(|r| r.get("fulfillment")))
    }

    async fn insert_escrow(&self, escrow: &Escrow) -> EngineResult<bool> {
        let result = sqlx::query(
            r#"
            INSERT INTO escrow
                (escrow_condition, hash, account, destination, currency, issuer, amount,
                 collateral, rate, destination_tag, source_tag, ledger, created,
                 cancel_after, finish_after, sequence)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16)
            ON CONFLICT DO NOTHING
            "#,
        )
        .bind(&escrow.escrow_condition)
        .bind(&escrow.hash)
        .bind(&escrow.account)
        .bind(&escrow.destination)
        .bind(&escrow.currency)
        .bind(&escrow.issuer)
        .bind(escrow.amount)
        .bind(escrow.collateral)
        .bind(escrow.rate)
        .bind(escrow.destination_tag.map(i64::from))
        .bind(escrow.source_tag.map(i64::from))
        .bind(i64::from(escrow.ledger))
        .bind(escrow.created)
        .bind(escrow.cancel_after)
        .bind(escrow.finish_after)
        .bind(i64::from(escrow.sequence))
        .execute(&self.pool)
        .await
        .map_err(|e| persistence("insert escrow", e))?;

        debug!(
            "Insert escrow {} affected {} rows",
            escrow.escrow_condition,
            result.rows_affected()
        );
        Ok(result.rows_affected() == 1)
    }

    async fn escrow_by_condition(&self, escrow_condition: &str) -> EngineResult<Option<Escrow>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM escrow e WHERE e.escrow_condition = $1",
            ESCROW_COLUMNS
        ))
        .bind(escrow_condition)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.as_ref().map(escrow_from_row))
    }

    async fn escrow_by_sequence(
        &self,
        owner: &str,
        sequence: u32,
    ) -> EngineResult<Option<Escrow>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM escrow e WHERE e.account = $1 AND e.sequence = $2",
            ESCROW_COLUMNS
        ))
        .bind(owner)
        .bind(i64::from(sequence))
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.as_ref().map(escrow_from_row))
    }

    async fn completion(&self, owner: &str, sequence: u32) -> EngineResult<Option<Completion>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM escrow_completed WHERE owner = $1 AND sequence = $2",
            COMPLETION_COLUMNS
        ))
        .bind(owner)
        .bind(i64::from(sequence))
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(completion_from_row).transpose()
    }

    async fn upsert_completion(
        &self,
        record: &CompletionWrite,
        expected_version: Option<i64>,
    ) -> EngineResult<i64> {
        // A missing row never matches `version = NULL`, so a stale "no row" read conflicts too
        let row = sqlx::query(
            r#"
            INSERT INTO escrow_completed
                (owner, sequence, hash, escrow_condition, engine_result, created, fee,
                 transaction_type, attempts, version)
            VALUES ($1, $2, $3, $4, $5, NOW(), $6, $7, $8, 1)
            ON CONFLICT (owner, sequence) DO UPDATE SET
                hash = EXCLUDED.hash,
                escrow_condition = EXCLUDED.escrow_condition,
                engine_result = EXCLUDED.engine_result,
                created = NOW(),
                fee = EXCLUDED.fee,
                transaction_type = EXCLUDED.transaction_type,
                attempts = EXCLUDED.attempts,
                version = escrow_completed.version + 1
            WHERE escrow_completed.version = $9
            RETURNING version
            "#,
        )
        .bind(&record.owner)
        .bind(i64::from(record.sequence))
        .bind(&record.hash)
        .bind(&record.escrow_condition)
        .bind(record.engine_result.as_str())
        .bind(record.fee as i64)
        .bind(record.transaction_type.as_str())
        .bind(record.attempts as i32)
        .bind(expected_version)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| persistence("upsert completion", e))?;

        match row {
            Some(row) => Ok(row.get("version")),
            None => Err(EngineError::Conflict {
                owner: record.owner.clone(),
                sequence: record.sequence,
            }),
        }
    }

    async fn confirm_completion(&self, record: &CompletionWrite) -> EngineResult<Completion> {
        let row = sqlx::query(&format!(
            r#"
            INSERT INTO escrow_completed
                (owner, sequence, hash, escrow_condition, engine_result, created, fee,
                 transaction_type, attempts, version)
            VALUES ($1, $2, $3, $4, $5, NOW(), $6, $7, $8, 1)
            ON CONFLICT (owner, sequence) DO UPDATE SET
                hash = EXCLUDED.hash,
                engine_result = EXCLUDED.engine_result,
                created = NOW(),
                transaction_type = EXCLUDED.transaction_type,
                version = escrow_completed.version + 1
            RETURNING {}
            "#,
            COMPLETION_COLUMNS
        ))
        .bind(&record.owner)
        .bind(i64::from(record.sequence))
        .bind(&record.hash)
        .bind(&record.escrow_condition)
        .bind(record.engine_result.as_str())
        .bind(record.fee as i64)
        .bind(record.transaction_type.as_str())
        .bind(record.attempts as i32)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| persistence("confirm completion", e))?;

        completion_from_row(&row)
    }

    async fn expired_escrows(&self, now_ledger: i64) -> EngineResult<Vec<Escrow>> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {} FROM escrow e
            LEFT JOIN escrow_completed c ON c.owner = e.account AND c.sequence = e.sequence
            WHERE e.cancel_after <= $1
              AND (c.engine_result IS NULL OR c.engine_result NOT IN {})
            "#,
            ESCROW_COLUMNS, TERMINAL_RESULTS
        ))
        .bind(now_ledger)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.iter().map(escrow_from_row).collect())
    }

    async fn open_books(&self) -> EngineResult<Vec<(String, String)>> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT DISTINCT e.currency, e.issuer FROM escrow e
            LEFT JOIN escrow_completed c ON c.owner = e.account AND c.sequence = e.sequence
            WHERE c.engine_result IS NULL OR c.engine_result NOT IN {}
            "#,
            TERMINAL_RESULTS
        ))
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .iter()
            .map(|r| (r.get("currency"), r.get("issuer")))
            .collect())
    }

    async fn open_escrows_for_book(
        &self,
        currency: &str,
        issuer: &str,
    ) -> EngineResult<Vec<Escrow>> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {} FROM escrow e
            LEFT JOIN escrow_completed c ON c.owner = e.account AND c.sequence = e.sequence
            WHERE e.currency = $1 AND e.issuer = $2
              AND (c.engine_result IS NULL OR c.engine_result NOT IN {})
            ORDER BY e.created
            "#,
            ESCROW_COLUMNS, TERMINAL_RESULTS
        ))
        .bind(currency)
        .bind(issuer)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.iter().map(escrow_from_row).collect())
    }

    async fn open_escrows_for_account(&self, account: &str) -> EngineResult<Vec<Escrow>> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {} FROM escrow e
            LEFT JOIN escrow_completed c ON c.owner = e.account AND c.sequence = e.sequence
            WHERE (e.account = $1 OR e.destination = $1)
              AND (c.engine_result IS NULL OR c.engine_result NOT IN {})
            ORDER BY e.created DESC
            "#,
            ESCROW_COLUMNS, TERMINAL_RESULTS
        ))
        .bind(account)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.iter().map(escrow_from_row).collect())
    }

    async fn stats(&self) -> EngineResult<EscrowStats> {
        let row = sqlx::query(&format!(
            r#"
            SELECT
                COUNT(*) FILTER (WHERE c.engine_result IS NULL) as open,
                COUNT(*) FILTER (WHERE c.engine_result IN {0}) as settled,
                COUNT(*) FILTER (WHERE c.engine_result NOT IN {0}) as pending_retry
            FROM escrow e
            LEFT JOIN escrow_completed c ON c.owner = e.account AND c.sequence = e.sequence
            "#,
            TERMINAL_RESULTS
        ))
        .fetch_one(&self.pool)
        .await?;

        Ok(EscrowStats {
            open: row.get::<i64, _>("open") as u64,
            settled: row.get::<i64, _>("settled") as u64,
            pending_retry: row.get::<i64, _>("pending_retry") as u64,
        })
    }

    async fn health_check(&self) -> EngineResult<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}
