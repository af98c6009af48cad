//! Chunked bulk upserts with per-table tuning and a memory guard.
//!
//! Rows are written in chunks, each as one multi-row
//! `INSERT ... ON CONFLICT (keys) DO UPDATE` statement, so re-running a
//! chunk is idempotent. Transient database errors retry per chunk with
//! linear backoff; integrity violations fail the chunk immediately. Five
//! consecutive failed chunks abort the call with a partial report.

use std::time::{Duration, Instant};

use sqlx::{PgPool, Postgres, QueryBuilder};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::transform::{ColValue, TypedRow};
use crate::common::BatchError;

const MIN_CHUNK: usize = 50;
const MAX_CONSECUTIVE_CHUNK_FAILURES: u32 = 5;
const MAX_REPORTED_CHUNK_ERRORS: usize = 10;

/// Operator-selectable tuning preset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TuningPreset {
    Conservative,
    Balanced,
    Aggressive,
    MemoryConstrained,
}

impl TuningPreset {
    pub fn profile(&self) -> TuningProfile {
        match self {
            TuningPreset::Conservative => TuningProfile {
                chunk_size: 500,
                memory_cap_bytes: 512 * 1024 * 1024,
                max_chunk_retries: 5,
                retry_backoff: Duration::from_millis(500),
                parallel_degree: 1,
                upsert_enabled: true,
            },
            TuningPreset::Balanced => TuningProfile {
                chunk_size: 1_000,
                memory_cap_bytes: 1024 * 1024 * 1024,
                max_chunk_retries: 3,
                retry_backoff: Duration::from_millis(250),
                parallel_degree: 2,
                upsert_enabled: true,
            },
            TuningPreset::Aggressive => TuningProfile {
                chunk_size: 2_000,
                memory_cap_bytes: 2048 * 1024 * 1024,
                max_chunk_retries: 2,
                retry_backoff: Duration::from_millis(100),
                parallel_degree: 4,
                upsert_enabled: true,
            },
            TuningPreset::MemoryConstrained => TuningProfile {
                chunk_size: 200,
                memory_cap_bytes: 256 * 1024 * 1024,
                max_chunk_retries: 5,
                retry_backoff: Duration::from_millis(500),
                parallel_degree: 1,
                upsert_enabled: true,
            },
        }
    }
}

#[derive(Debug, Clone)]
pub struct TuningProfile {
    pub chunk_size: usize,
    pub memory_cap_bytes: u64,
    pub max_chunk_retries: u32,
    pub retry_backoff: Duration,
    /// Chunks written concurrently per wave; 1 is strictly sequential.
    pub parallel_degree: usize,
    pub upsert_enabled: bool,
}

/// One bulk-upsert request: a target table, its conflict key, and rows with
/// a uniform column set.
#[derive(Debug)]
pub struct UpsertPlan {
    pub table: String,
    pub conflict_keys: Vec<&'static str>,
    pub rows: Vec<TypedRow>,
}

impl UpsertPlan {
    pub fn new(
        table: impl Into<String>,
        conflict_keys: &[&'static str],
        rows: Vec<TypedRow>,
    ) -> Self {
        Self {
            table: table.into(),
            conflict_keys: conflict_keys.to_vec(),
            rows,
        }
    }

    fn columns(&self) -> Vec<&'static str> {
        self.rows
            .first()
            .map(|r| r.column_names())
            .unwrap_or_default()
    }
}

#[derive(Debug, Clone)]
pub struct ChunkError {
    pub chunk_index: usize,
    pub rows: usize,
    pub message: String,
}

/// Outcome of one bulk-upsert call.
#[derive(Debug, Default)]
pub struct UpsertReport {
    pub total_records: usize,
    pub successful_records: usize,
    pub failed_records: usize,
    pub execution_time: Duration,
    pub records_per_second: f64,
    /// At most ten chunk errors are kept.
    pub chunk_errors: Vec<ChunkError>,
    /// True when five consecutive chunks failed and the call gave up.
    pub aborted: bool,
}

impl UpsertReport {
    pub fn is_complete(&self) -> bool {
        !self.aborted && self.failed_records == 0
    }
}

pub struct BulkUpsertEngine {
    db: PgPool,
    profile: TuningProfile,
}

impl BulkUpsertEngine {
    pub fn new(db: PgPool, profile: TuningProfile) -> Self {
        Self { db, profile }
    }

    pub fn from_preset(db: PgPool, preset: TuningPreset) -> Self {
        Self::new(db, preset.profile())
    }

    /// Execute the plan chunk by chunk. Chunks already committed stay
    /// committed regardless of later failures or cancellation.
    pub async fn execute(
        &self,
        plan: &UpsertPlan,
        cancel: &CancellationToken,
    ) -> Result<UpsertReport, BatchError> {
        let started = Instant::now();
        let mut report = UpsertReport {
            total_records: plan.rows.len(),
            ..Default::default()
        };
        if plan.rows.is_empty() {
            return Ok(report);
        }

        let columns = plan.columns();
        let mut chunk_size = self.profile.chunk_size.max(1);
        let parallel = self.profile.parallel_degree.max(1);
        let mut consecutive_failures = 0u32;
        let mut position = 0usize;
        let mut chunk_index = 0usize;

        'waves: while position < plan.rows.len() {
            if cancel.is_cancelled() {
                return Err(BatchError::Cancelled);
            }

            // Memory guard: over the cap, halve the chunk for the remainder
            // of this call.
            if let Some(resident) = resident_set_bytes() {
                if resident > self.profile.memory_cap_bytes {
                    chunk_size = next_chunk_size(chunk_size);
                    warn!(
                        table = %plan.table,
                        resident_mb = resident / (1024 * 1024),
                        chunk_size,
                        "memory cap exceeded, shrinking chunks"
                    );
                }
            }

            // One wave: up to `parallel` chunks written concurrently.
            let mut wave = Vec::with_capacity(parallel);
            while wave.len() < parallel && position < plan.rows.len() {
                let end = (position + chunk_size).min(plan.rows.len());
                wave.push(&plan.rows[position..end]);
                position = end;
            }

            let results = futures::future::join_all(
                wave.iter()
                    .map(|chunk| self.write_chunk(plan, &columns, chunk)),
            )
            .await;

            for (chunk, result) in wave.iter().zip(results) {
                match result {
                    Ok(()) => {
                        report.successful_records += chunk.len();
                        consecutive_failures = 0;
                        debug!(table = %plan.table, chunk_index, rows = chunk.len(), "chunk committed");
                    }
                    Err(err) => {
                        report.failed_records += chunk.len();
                        consecutive_failures += 1;
                        if report.chunk_errors.len() < MAX_REPORTED_CHUNK_ERRORS {
                            report.chunk_errors.push(ChunkError {
                                chunk_index,
                                rows: chunk.len(),
                                message: err.to_string(),
                            });
                        }
                        warn!(
                            table = %plan.table,
                            chunk_index,
                            error = %err,
                            consecutive_failures,
                            "chunk failed"
                        );
                        if consecutive_failures >= MAX_CONSECUTIVE_CHUNK_FAILURES {
                            report.aborted = true;
                            break 'waves;
                        }
                    }
                }
                chunk_index += 1;
            }
        }

        report.execution_time = started.elapsed();
        let secs = report.execution_time.as_secs_f64();
        report.records_per_second = if secs > 0.0 {
            report.successful_records as f64 / secs
        } else {
            report.successful_records as f64
        };
        Ok(report)
    }

    /// Write one chunk, retrying transient failures with linear backoff.
    async fn write_chunk(
        &self,
        plan: &UpsertPlan,
        columns: &[&'static str],
        chunk: &[TypedRow],
    ) -> Result<(), BatchError> {
        let mut attempt = 0u32;
        loop {
            let mut builder = build_upsert(
                &plan.table,
                columns,
                &plan.conflict_keys,
                chunk,
                self.profile.upsert_enabled,
            );

            match builder.build().execute(&self.db).await {
                Ok(_) => return Ok(()),
                Err(err) => {
                    let classified = BatchError::from(err);
                    let transient = matches!(classified, BatchError::Transient { .. });
                    attempt += 1;
                    if !transient || attempt > self.profile.max_chunk_retries {
                        return Err(classified);
                    }
                    tokio::time::sleep(self.profile.retry_backoff * attempt).await;
                }
            }
        }
    }
}

/// Compose the multi-row statement for one chunk.
fn build_upsert<'a>(
    table: &str,
    columns: &[&'static str],
    conflict_keys: &[&'static str],
    chunk: &'a [TypedRow],
    upsert_enabled: bool,
) -> QueryBuilder<'a, Postgres> {
    let mut qb: QueryBuilder<Postgres> =
        QueryBuilder::new(format!("INSERT INTO {} ({}) ", table, columns.join(", ")));

    qb.push_values(chunk, |mut b, row| {
        for (_, value) in &row.columns {
            match value {
                ColValue::Text(v) => b.push_bind(v.clone()),
                ColValue::Float(v) => b.push_bind(*v),
                ColValue::Int(v) => b.push_bind(*v),
                ColValue::Json(v) => b.push_bind(v.clone()),
                ColValue::Uuid(v) => b.push_bind(*v),
                ColValue::Timestamp(v) => b.push_bind(*v),
            };
        }
    });

    if upsert_enabled && !conflict_keys.is_empty() {
        qb.push(" ON CONFLICT (");
        qb.push(conflict_keys.join(", "));
        qb.push(") DO UPDATE SET ");
        let non_keys: Vec<&&str> = columns
            .iter()
            .filter(|c| !conflict_keys.contains(*c))
            .collect();
        for (i, column) in non_keys.iter().enumerate() {
            if i > 0 {
                qb.push(", ");
            }
            qb.push(format!("{column} = EXCLUDED.{column}"));
        }
    }

    qb
}

fn next_chunk_size(current: usize) -> usize {
    (current / 2).max(MIN_CHUNK)
}

/// Resident set size from procfs; `None` where unavailable, which disables
/// the guard rather than guessing.
fn resident_set_bytes() -> Option<u64> {
    let statm = std::fs::read_to_string("/proc/self/statm").ok()?;
    let resident_pages: u64 = statm.split_whitespace().nth(1)?.parse().ok()?;
    Some(resident_pages * 4_096)
}
