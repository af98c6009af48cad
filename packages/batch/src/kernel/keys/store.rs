//! Per-day quota ledger persistence.
//!
//! The registry keeps authoritative counters in memory and writes the
//! per-(provider, key, day) usage through on every successful call, so a
//! restart never forgets how much of a key's daily quota is spent. The
//! in-process store covers single-node deployments; the Postgres store is
//! the durable default. A shared key/value service can implement the same
//! trait for horizontally scaled deployments.

use std::collections::HashMap;

use anyhow::Result;
use async_trait::async_trait;
use chrono::NaiveDate;
use datago_client::Provider;
use sqlx::PgPool;

/// Durable usage counters, keyed by (provider, key hash, calendar day).
#[async_trait]
pub trait QuotaStore: Send + Sync {
    /// Usage counters for one provider on one day, keyed by key hash.
    async fn load_day(&self, provider: Provider, day: NaiveDate) -> Result<HashMap<String, u32>>;

    /// Write through the absolute counter for one key on one day.
    async fn record_usage(
        &self,
        provider: Provider,
        key_hash: &str,
        day: NaiveDate,
        used: u32,
    ) -> Result<()>;
}

/// In-process store for single-node runs and tests.
#[derive(Default)]
pub struct MemoryQuotaStore {
    rows: tokio::sync::Mutex<HashMap<(Provider, String, NaiveDate), u32>>,
}

impl MemoryQuotaStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl QuotaStore for MemoryQuotaStore {
    async fn load_day(&self, provider: Provider, day: NaiveDate) -> Result<HashMap<String, u32>> {
        let rows = self.rows.lock().await;
        Ok(rows
            .iter()
            .filter(|((p, _, d), _)| *p == provider && *d == day)
            .map(|((_, hash, _), used)| (hash.clone(), *used))
            .collect())
    }

    async fn record_usage(
        &self,
        provider: Provider,
        key_hash: &str,
        day: NaiveDate,
        used: u32,
    ) -> Result<()> {
        let mut rows = self.rows.lock().await;
        rows.insert((provider, key_hash.to_string(), day), used);
        Ok(())
    }
}

/// Postgres-backed store over `api_key_usage`.
///
/// Rows are per-day and become dead weight after their day passes; the
/// archive purge job trims them together with expired raw rows.
#[derive(Clone)]
pub struct PgQuotaStore {
    pool: PgPool,
}

impl PgQuotaStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Delete ledger rows older than `keep_days`.
    pub async fn purge_before(&self, cutoff: NaiveDate) -> Result<u64> {
        let deleted = sqlx::query("DELETE FROM api_key_usage WHERE usage_date < $1")
            .bind(cutoff)
            .execute(&self.pool)
            .await?
            .rows_affected();
        Ok(deleted)
    }
}

#[async_trait]
impl QuotaStore for PgQuotaStore {
    async fn load_day(&self, provider: Provider, day: NaiveDate) -> Result<HashMap<String, u32>> {
        let rows: Vec<(String, i32)> = sqlx::query_as(
            r#"
            SELECT key_hash, used
            FROM api_key_usage
            WHERE provider = $1 AND usage_date = $2
            "#,
        )
        .bind(provider.as_str())
        .bind(day)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|(hash, used)| (hash, used.max(0) as u32))
            .collect())
    }

    async fn record_usage(
        &self,
        provider: Provider,
        key_hash: &str,
        day: NaiveDate,
        used: u32,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO api_key_usage (provider, key_hash, usage_date, used, updated_at)
            VALUES ($1, $2, $3, $4, NOW())
            ON CONFLICT (provider, key_hash, usage_date) DO UPDATE SET
                used = EXCLUDED.used,
                updated_at = NOW()
            "#,
        )
        .bind(provider.as_str())
        .bind(key_hash)
        .bind(day)
        .bind(used as i32)
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn memory_store_round_trips_per_day() {
        let store = MemoryQuotaStore::new();
        let day = NaiveDate::from_ymd_opt(2026, 3, 15).unwrap();

        store
            .record_usage(Provider::Kto, "abc123", day, 7)
            .await
            .unwrap();
        store
            .record_usage(Provider::Kto, "abc123", day, 8)
            .await
            .unwrap();

        let loaded = store.load_day(Provider::Kto, day).await.unwrap();
        assert_eq!(loaded.get("abc123"), Some(&8));

        // Another day is a separate ledger row.
        let next = day.succ_opt().unwrap();
        assert!(store.load_day(Provider::Kto, next).await.unwrap().is_empty());
    }
}
