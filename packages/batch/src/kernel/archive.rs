//! Raw-response archival.
//!
//! Every outbound call, successful or not, is recorded as one immutable row:
//! the request tuple, the response document, timing, and the hashed key
//! identifier. Rows expire on a provider-class TTL (tourism data is stable
//! for days, weather observations go stale in hours) and are removed by the
//! purge job. Durability is favored over throughput: writes are one row at
//! a time, never batched.

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use datago_client::Provider;
use serde_json::Value;
use sqlx::PgPool;
use uuid::Uuid;

/// TTL for archived rows of one provider class.
fn raw_ttl(provider: Provider) -> Duration {
    match provider {
        Provider::Kto => Duration::days(7),
        Provider::Kma => Duration::hours(6),
    }
}

/// One request/response tuple headed for the archive.
#[derive(Debug, Clone)]
pub struct RawCall {
    pub provider: Provider,
    pub endpoint: String,
    /// Query parameters as a structured map, `serviceKey` excluded.
    pub request_params: Value,
    pub response_status: i32,
    pub response_body: Value,
    pub response_size_bytes: i64,
    pub duration_ms: i64,
    pub key_hash: String,
    /// When the call completed; rows and TTLs anchor to this instant, and
    /// downstream sync stamps derive from it so replaying an archived page
    /// reproduces identical typed rows.
    pub created_at: DateTime<Utc>,
}

/// A persisted archive row.
#[derive(Debug, Clone)]
pub struct RawRecord {
    pub id: Uuid,
    pub call: RawCall,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

/// Sink for raw request/response tuples.
#[async_trait]
pub trait ArchiveWriter: Send + Sync {
    /// Append one row; returns the archive row id for downstream reference.
    async fn record(&self, call: RawCall) -> Result<Uuid>;

    /// Remove rows past their TTL; returns the count removed.
    async fn purge_expired(&self) -> Result<u64>;
}

/// Postgres-backed writer over `api_raw_data`.
#[derive(Clone)]
pub struct PgArchiveWriter {
    pool: PgPool,
}

impl PgArchiveWriter {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ArchiveWriter for PgArchiveWriter {
    async fn record(&self, call: RawCall) -> Result<Uuid> {
        let id = Uuid::new_v4();
        let created_at = call.created_at;
        let expires_at = created_at + raw_ttl(call.provider);

        sqlx::query(
            r#"
            INSERT INTO api_raw_data (
                id, provider, endpoint, request_params, response_status,
                response_body, response_size_bytes, duration_ms, key_hash,
                created_at, expires_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            "#,
        )
        .bind(id)
        .bind(call.provider.as_str())
        .bind(&call.endpoint)
        .bind(&call.request_params)
        .bind(call.response_status)
        .bind(&call.response_body)
        .bind(call.response_size_bytes)
        .bind(call.duration_ms)
        .bind(&call.key_hash)
        .bind(created_at)
        .bind(expires_at)
        .execute(&self.pool)
        .await?;

        Ok(id)
    }

    async fn purge_expired(&self) -> Result<u64> {
        let deleted = sqlx::query("DELETE FROM api_raw_data WHERE expires_at < NOW()")
            .execute(&self.pool)
            .await?
            .rows_affected();
        Ok(deleted)
    }
}

/// In-memory writer for tests and the `test` subcommand.
#[derive(Default)]
pub struct MemoryArchiveWriter {
    rows: tokio::sync::Mutex<Vec<RawRecord>>,
}

impl MemoryArchiveWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn rows(&self) -> Vec<RawRecord> {
        self.rows.lock().await.clone()
    }

    pub async fn len(&self) -> usize {
        self.rows.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.rows.lock().await.is_empty()
    }
}

#[async_trait]
impl ArchiveWriter for MemoryArchiveWriter {
    async fn record(&self, call: RawCall) -> Result<Uuid> {
        let id = Uuid::new_v4();
        let created_at = call.created_at;
        let expires_at = created_at + raw_ttl(call.provider);
        self.rows.lock().await.push(RawRecord {
            id,
            call,
            created_at,
            expires_at,
        });
        Ok(id)
    }

    async fn purge_expired(&self) -> Result<u64> {
        let mut rows = self.rows.lock().await;
        let before = rows.len();
        let now = Utc::now();
        rows.retain(|r| r.expires_at >= now);
        Ok((before - rows.len()) as u64)
    }
}
