//! Execution envelopes and the durable job ledger.
//!
//! Every attempt to run a job produces exactly one [`JobExecution`] row,
//! written in two steps that are never reordered: the start record when the
//! job enters Running, the end record when it leaves. The ledger also backs
//! the scheduler's dependency check (latest Success within a window) and
//! the operator `status` view.

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use serde_json::Value;
use sqlx::{FromRow, PgPool};
use uuid::Uuid;

use crate::common::Severity;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, sqlx::Type)]
#[sqlx(type_name = "job_execution_status", rename_all = "snake_case")]
pub enum ExecutionStatus {
    Running,
    Success,
    Failed,
    Timeout,
    Skipped,
    Cancelled,
}

impl ExecutionStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, ExecutionStatus::Running)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionStatus::Running => "running",
            ExecutionStatus::Success => "success",
            ExecutionStatus::Failed => "failed",
            ExecutionStatus::Timeout => "timeout",
            ExecutionStatus::Skipped => "skipped",
            ExecutionStatus::Cancelled => "cancelled",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, sqlx::Type)]
#[sqlx(type_name = "retry_status", rename_all = "snake_case")]
pub enum RetryStatus {
    NotRetried,
    Scheduled,
    Exhausted,
}

/// One attempt to run a job; immutable once closed.
#[derive(Debug, Clone, Serialize, FromRow)]
pub struct JobExecution {
    pub execution_id: Uuid,
    pub job_id: String,
    pub status: ExecutionStatus,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub processed_records: i64,
    pub failed_records: i64,
    pub error_message: Option<String>,
    pub error_severity: Option<Severity>,
    pub retry_attempt: i32,
    pub retry_status: RetryStatus,
}

impl JobExecution {
    pub fn start(job_id: &str, retry_attempt: i32) -> Self {
        Self {
            execution_id: Uuid::new_v4(),
            job_id: job_id.to_string(),
            status: ExecutionStatus::Running,
            started_at: Utc::now(),
            finished_at: None,
            processed_records: 0,
            failed_records: 0,
            error_message: None,
            error_severity: None,
            retry_attempt,
            retry_status: RetryStatus::NotRetried,
        }
    }

    /// A Skipped envelope is closed at birth; no body ever ran.
    pub fn skipped(job_id: &str, reason: &str) -> Self {
        let now = Utc::now();
        Self {
            execution_id: Uuid::new_v4(),
            job_id: job_id.to_string(),
            status: ExecutionStatus::Skipped,
            started_at: now,
            finished_at: Some(now),
            processed_records: 0,
            failed_records: 0,
            error_message: Some(reason.to_string()),
            error_severity: None,
            retry_attempt: 0,
            retry_status: RetryStatus::NotRetried,
        }
    }

    pub fn close(&mut self, status: ExecutionStatus) {
        self.status = status;
        self.finished_at = Some(Utc::now().max(self.started_at));
    }
}

/// Durable record of execution attempts.
#[async_trait]
pub trait ExecutionLedger: Send + Sync {
    async fn record_start(&self, exec: &JobExecution) -> Result<()>;
    async fn record_end(&self, exec: &JobExecution) -> Result<()>;

    /// End time of the most recent Success for a job.
    async fn latest_success(&self, job_id: &str) -> Result<Option<DateTime<Utc>>>;

    /// Start time of the most recent attempt (any status) for a job.
    async fn latest_start(&self, job_id: &str) -> Result<Option<DateTime<Utc>>>;

    async fn recent(&self, job_id: Option<&str>, limit: i64) -> Result<Vec<JobExecution>>;

    /// Per-step detail row (page counts, chunk reports).
    async fn append_detail(&self, execution_id: Uuid, step: &str, payload: Value) -> Result<()>;

    /// Operator-queryable log line tied to an execution.
    async fn append_log(&self, execution_id: Uuid, level: &str, message: &str) -> Result<()>;
}

/// Convenience for the scheduler's dependency rule.
pub async fn dependency_satisfied(
    ledger: &dyn ExecutionLedger,
    dep_job_id: &str,
    window: Duration,
) -> Result<bool> {
    match ledger.latest_success(dep_job_id).await? {
        Some(finished) => Ok(Utc::now() - finished <= window),
        None => Ok(false),
    }
}

// ============================================================================
// Postgres ledger
// ============================================================================

#[derive(Clone)]
pub struct PgExecutionLedger {
    pool: PgPool,
}

impl PgExecutionLedger {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ExecutionLedger for PgExecutionLedger {
    async fn record_start(&self, exec: &JobExecution) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO batch_job_executions (
                execution_id, job_id, status, started_at, finished_at,
                processed_records, failed_records, error_message,
                error_severity, retry_attempt, retry_status
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            "#,
        )
        .bind(exec.execution_id)
        .bind(&exec.job_id)
        .bind(exec.status)
        .bind(exec.started_at)
        .bind(exec.finished_at)
        .bind(exec.processed_records)
        .bind(exec.failed_records)
        .bind(&exec.error_message)
        .bind(exec.error_severity)
        .bind(exec.retry_attempt)
        .bind(exec.retry_status)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn record_end(&self, exec: &JobExecution) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE batch_job_executions SET
                status = $1,
                finished_at = $2,
                processed_records = $3,
                failed_records = $4,
                error_message = $5,
                error_severity = $6,
                retry_status = $7
            WHERE execution_id = $8
            "#,
        )
        .bind(exec.status)
        .bind(exec.finished_at)
        .bind(exec.processed_records)
        .bind(exec.failed_records)
        .bind(&exec.error_message)
        .bind(exec.error_severity)
        .bind(exec.retry_status)
        .bind(exec.execution_id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn latest_success(&self, job_id: &str) -> Result<Option<DateTime<Utc>>> {
        let finished = sqlx::query_scalar::<_, DateTime<Utc>>(
            r#"
            SELECT finished_at
            FROM batch_job_executions
            WHERE job_id = $1 AND status = 'success' AND finished_at IS NOT NULL
            ORDER BY finished_at DESC
            LIMIT 1
            "#,
        )
        .bind(job_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(finished)
    }

    async fn latest_start(&self, job_id: &str) -> Result<Option<DateTime<Utc>>> {
        let started = sqlx::query_scalar::<_, DateTime<Utc>>(
            r#"
            SELECT started_at
            FROM batch_job_executions
            WHERE job_id = $1
            ORDER BY started_at DESC
            LIMIT 1
            "#,
        )
        .bind(job_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(started)
    }

    async fn recent(&self, job_id: Option<&str>, limit: i64) -> Result<Vec<JobExecution>> {
        let rows = sqlx::query_as::<_, JobExecution>(
            r#"
            SELECT execution_id, job_id, status, started_at, finished_at,
                   processed_records, failed_records, error_message,
                   error_severity, retry_attempt, retry_status
            FROM batch_job_executions
            WHERE ($1::TEXT IS NULL OR job_id = $1)
            ORDER BY started_at DESC
            LIMIT $2
            "#,
        )
        .bind(job_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows)
    }

    async fn append_detail(&self, execution_id: Uuid, step: &str, payload: Value) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO batch_job_details (id, execution_id, step, payload, created_at)
            VALUES ($1, $2, $3, $4, NOW())
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(execution_id)
        .bind(step)
        .bind(payload)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn append_log(&self, execution_id: Uuid, level: &str, message: &str) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO batch_job_logs (id, execution_id, level, message, created_at)
            VALUES ($1, $2, $3, $4, NOW())
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(execution_id)
        .bind(level)
        .bind(message)
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

// ============================================================================
// In-memory ledger (tests, `test` subcommand)
// ============================================================================

#[derive(Default)]
pub struct MemoryExecutionLedger {
    executions: tokio::sync::Mutex<Vec<JobExecution>>,
    details: tokio::sync::Mutex<Vec<(Uuid, String, Value)>>,
    logs: tokio::sync::Mutex<Vec<(Uuid, String, String)>>,
}

impl MemoryExecutionLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn all(&self) -> Vec<JobExecution> {
        self.executions.lock().await.clone()
    }
}

#[async_trait]
impl ExecutionLedger for MemoryExecutionLedger {
    async fn record_start(&self, exec: &JobExecution) -> Result<()> {
        self.executions.lock().await.push(exec.clone());
        Ok(())
    }

    async fn record_end(&self, exec: &JobExecution) -> Result<()> {
        let mut executions = self.executions.lock().await;
        if let Some(row) = executions
            .iter_mut()
            .find(|e| e.execution_id == exec.execution_id)
        {
            *row = exec.clone();
        } else {
            executions.push(exec.clone());
        }
        Ok(())
    }

    async fn latest_success(&self, job_id: &str) -> Result<Option<DateTime<Utc>>> {
        Ok(self
            .executions
            .lock()
            .await
            .iter()
            .filter(|e| e.job_id == job_id && e.status == ExecutionStatus::Success)
            .filter_map(|e| e.finished_at)
            .max())
    }

    async fn latest_start(&self, job_id: &str) -> Result<Option<DateTime<Utc>>> {
        Ok(self
            .executions
            .lock()
            .await
            .iter()
            .filter(|e| e.job_id == job_id)
            .map(|e| e.started_at)
            .max())
    }

    async fn recent(&self, job_id: Option<&str>, limit: i64) -> Result<Vec<JobExecution>> {
        let executions = self.executions.lock().await;
        let mut rows: Vec<JobExecution> = executions
            .iter()
            .filter(|e| job_id.map(|id| e.job_id == id).unwrap_or(true))
            .cloned()
            .collect();
        rows.sort_by_key(|e| std::cmp::Reverse(e.started_at));
        rows.truncate(limit as usize);
        Ok(rows)
    }

    async fn append_detail(&self, execution_id: Uuid, step: &str, payload: Value) -> Result<()> {
        self.details
            .lock()
            .await
            .push((execution_id, step.to_string(), payload));
        Ok(())
    }

    async fn append_log(&self, execution_id: Uuid, level: &str, message: &str) -> Result<()> {
        self.logs
            .lock()
            .await
            .push((execution_id, level.to_string(), message.to_string()));
        Ok(())
    }
}
