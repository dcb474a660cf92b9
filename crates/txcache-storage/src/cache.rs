use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sqlx::migrate::Migrator;
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::Row;
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::debug;
use txcache_core::{CacheRecord, RecipientBlob, TransactionRecord, TransactionStatus, UpsertCounts};

pub static MIGRATOR: Migrator = sqlx::migrate!("./migrations");

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("migration failed: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
    #[error("corrupt cache row {id}: {reason}")]
    CorruptRow { id: String, reason: String },
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

/// Write and read contract of the materialized transaction cache.
#[async_trait]
pub trait CacheStore: Send + Sync {
    /// Upsert one batch atomically. Unseen ids are inserted; seen ids have
    /// every mutable column overwritten and count as updated, even when the
    /// incoming values are identical.
    async fn apply(&self, batch: &[TransactionRecord]) -> Result<UpsertCounts, StoreError>;

    async fn get(&self, id: &str) -> Result<Option<CacheRecord>, StoreError>;

    /// Rows with `from <= created_at < to`, ordered by `created_at`.
    async fn list_created_between(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<CacheRecord>, StoreError>;
}

/// Process-local cache, used for dry runs and tests.
#[derive(Debug, Default)]
pub struct MemoryCacheStore {
    rows: RwLock<BTreeMap<String, CacheRecord>>,
}

impl MemoryCacheStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.rows.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.rows.read().await.is_empty()
    }
}

#[async_trait]
impl CacheStore for MemoryCacheStore {
    async fn apply(&self, batch: &[TransactionRecord]) -> Result<UpsertCounts, StoreError> {
        let now = Utc::now();
        let mut rows = self.rows.write().await;
        let mut counts = UpsertCounts::default();

        for record in batch {
            match rows.get_mut(&record.id) {
                Some(row) => {
                    let created_at = row.record.created_at;
                    row.record = record.clone();
                    row.record.created_at = created_at;
                    row.updated_at = now;
                    counts.updated += 1;
                }
                None => {
                    rows.insert(
                        record.id.clone(),
                        CacheRecord {
                            record: record.clone(),
                            cached_at: now,
                            updated_at: now,
                        },
                    );
                    counts.inserted += 1;
                }
            }
        }

        Ok(counts)
    }

    async fn get(&self, id: &str) -> Result<Option<CacheRecord>, StoreError> {
        Ok(self.rows.read().await.get(id).cloned())
    }

    async fn list_created_between(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<CacheRecord>, StoreError> {
        let rows = self.rows.read().await;
        let mut matches = rows
            .values()
            .filter(|row| row.record.created_at >= from && row.record.created_at < to)
            .cloned()
            .collect::<Vec<_>>();
        matches.sort_by(|a, b| {
            a.record
                .created_at
                .cmp(&b.record.created_at)
                .then_with(|| a.record.id.cmp(&b.record.id))
        });
        Ok(matches)
    }
}

const UPSERT_SQL: &str = r#"
    INSERT INTO transaction_cache (
        id, amount, human_amount, charge, human_charge, status, currency, created_at,
        recipient, decline_reason, mode, txn_type, description, external_id,
        from_wallet, to_wallet, debit_id, credit_id, rate, cached_at, updated_at
    ) VALUES (
        $1, $2, $3, $4, $5, $6, $7, $8,
        $9::json, $10, $11, $12, $13, $14,
        $15, $16, $17, $18, $19, $20, $20
    )
    ON CONFLICT (id) DO UPDATE SET
        amount = EXCLUDED.amount,
        human_amount = EXCLUDED.human_amount,
        charge = EXCLUDED.charge,
        human_charge = EXCLUDED.human_charge,
        status = EXCLUDED.status,
        currency = EXCLUDED.currency,
        recipient = EXCLUDED.recipient,
        decline_reason = EXCLUDED.decline_reason,
        mode = EXCLUDED.mode,
        txn_type = EXCLUDED.txn_type,
        description = EXCLUDED.description,
        external_id = EXCLUDED.external_id,
        from_wallet = EXCLUDED.from_wallet,
        to_wallet = EXCLUDED.to_wallet,
        debit_id = EXCLUDED.debit_id,
        credit_id = EXCLUDED.credit_id,
        rate = EXCLUDED.rate,
        updated_at = EXCLUDED.updated_at
    RETURNING (xmax = 0) AS inserted
"#;

const SELECT_COLUMNS: &str = r#"
    id, amount, human_amount, charge, human_charge, status, currency, created_at,
    recipient::text AS recipient, decline_reason, mode, txn_type, description, external_id,
    from_wallet, to_wallet, debit_id, credit_id, rate, cached_at, updated_at
"#;

/// Postgres-backed cache; one transaction per applied batch.
#[derive(Debug, Clone)]
pub struct PgCacheStore {
    pool: PgPool,
}

impl PgCacheStore {
    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .acquire_timeout(Duration::from_secs(10))
            .connect(database_url)
            .await?;
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn migrate(&self) -> Result<(), StoreError> {
        MIGRATOR.run(&self.pool).await?;
        Ok(())
    }
}

#[async_trait]
impl CacheStore for PgCacheStore {
    async fn apply(&self, batch: &[TransactionRecord]) -> Result<UpsertCounts, StoreError> {
        let now = Utc::now();
        let mut tx = self.pool.begin().await?;
        let mut counts = UpsertCounts::default();

        for record in batch {
            let inserted: bool = sqlx::query_scalar(UPSERT_SQL)
                .bind(&record.id)
                .bind(record.amount)
                .bind(record.human_amount)
                .bind(record.charge)
                .bind(record.human_charge)
                .bind(record.status.as_str())
                .bind(&record.currency)
                .bind(record.created_at)
                .bind(record.recipient.as_ref().map(RecipientBlob::as_str))
                .bind(record.decline_reason.as_deref())
                .bind(record.mode.as_deref())
                .bind(record.kind.as_deref())
                .bind(record.description.as_deref())
                .bind(record.external_id.as_deref())
                .bind(record.from_wallet.as_deref())
                .bind(record.to_wallet.as_deref())
                .bind(record.debit_id.as_deref())
                .bind(record.credit_id.as_deref())
                .bind(record.rate)
                .bind(now)
                .fetch_one(&mut *tx)
                .await?;

            if inserted {
                counts.inserted += 1;
            } else {
                counts.updated += 1;
            }
        }

        tx.commit().await?;
        debug!(inserted = counts.inserted, updated = counts.updated, "batch committed");
        Ok(counts)
    }

    async fn get(&self, id: &str) -> Result<Option<CacheRecord>, StoreError> {
        let sql = format!("SELECT {SELECT_COLUMNS} FROM transaction_cache WHERE id = $1");
        let row = sqlx::query(&sql).bind(id).fetch_optional(&self.pool).await?;
        row.as_ref().map(row_to_record).transpose()
    }

    async fn list_created_between(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<CacheRecord>, StoreError> {
        let sql = format!(
            "SELECT {SELECT_COLUMNS} FROM transaction_cache \
             WHERE created_at >= $1 AND created_at < $2 \
             ORDER BY created_at, id"
        );
        let rows = sqlx::query(&sql)
            .bind(from)
            .bind(to)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(row_to_record).collect()
    }
}

fn row_to_record(row: &PgRow) -> Result<CacheRecord, StoreError> {
    let id: String = row.try_get("id")?;
    let recipient = row
        .try_get::<Option<String>, _>("recipient")?
        .map(RecipientBlob::from_json_text)
        .transpose()
        .map_err(|err| StoreError::CorruptRow {
            id: id.clone(),
            reason: format!("recipient is not valid json: {err}"),
        })?;
    let status: String = row.try_get("status")?;

    Ok(CacheRecord {
        record: TransactionRecord {
            amount: row.try_get("amount")?,
            human_amount: row.try_get::<Decimal, _>("human_amount")?,
            charge: row.try_get("charge")?,
            human_charge: row.try_get::<Decimal, _>("human_charge")?,
            status: TransactionStatus::parse(&status),
            currency: row.try_get("currency")?,
            created_at: row.try_get("created_at")?,
            recipient,
            decline_reason: row.try_get("decline_reason")?,
            mode: row.try_get("mode")?,
            kind: row.try_get("txn_type")?,
            description: row.try_get("description")?,
            external_id: row.try_get("external_id")?,
            from_wallet: row.try_get("from_wallet")?,
            to_wallet: row.try_get("to_wallet")?,
            debit_id: row.try_get("debit_id")?,
            credit_id: row.try_get("credit_id")?,
            rate: row.try_get::<Option<Decimal>, _>("rate")?,
            id,
        },
        cached_at: row.try_get("cached_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}
