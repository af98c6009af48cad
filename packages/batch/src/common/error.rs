//! Batch error taxonomy.
//!
//! Every failure that can cross a component boundary is one of these kinds.
//! The HTTP executor absorbs what key rotation can absorb, the upsert engine
//! recovers per chunk, the scheduler retries whole jobs; only errors that
//! survive all three layers reach the operator, and they carry a severity
//! and a sanitized message. Service keys never appear in any variant.

use datago_client::{Provider, ProviderFault};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Operator-facing severity of a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "error_severity", rename_all = "snake_case")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Low => "low",
            Severity::Medium => "medium",
            Severity::High => "high",
            Severity::Critical => "critical",
        }
    }
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Classified batch failure.
#[derive(Debug, Error)]
pub enum BatchError {
    /// Every key of a provider is disabled or over quota for the day.
    #[error("daily quota exhausted for provider {provider}")]
    QuotaExhausted { provider: Provider },

    /// Every key of a provider is cooling down at once.
    #[error("all keys cooling down for provider {provider}")]
    RateLimited { provider: Provider },

    /// The provider rejected the service key.
    #[error("provider {provider} rejected the service key")]
    Auth { provider: Provider },

    /// Network, 5xx, or parse failure; safe to retry with backoff.
    #[error("transient failure: {message}")]
    Transient { message: String },

    /// A row was rejected by the transform; never fatal to a job.
    #[error("validation failed: {reason}")]
    Validation { reason: String },

    /// A constraint violation the upsert conflict keys do not cover.
    #[error("conflict on {table}: {message}")]
    Conflict { table: String, message: String },

    /// The scheduler cut the job off at its deadline.
    #[error("job timed out after {seconds}s")]
    Timeout { seconds: u64 },

    /// Cooperative cancellation (shutdown or timeout watcher).
    #[error("cancelled")]
    Cancelled,

    /// Startup-only configuration problem; the process aborts.
    #[error("configuration error: {0}")]
    Config(String),
}

impl BatchError {
    pub fn severity(&self) -> Severity {
        match self {
            BatchError::QuotaExhausted { .. } => Severity::Critical,
            BatchError::Config(_) => Severity::Critical,
            BatchError::Auth { .. } => Severity::High,
            BatchError::Timeout { .. } => Severity::High,
            BatchError::RateLimited { .. } => Severity::Medium,
            BatchError::Transient { .. } => Severity::Medium,
            BatchError::Conflict { .. } => Severity::Medium,
            BatchError::Validation { .. } => Severity::Low,
            BatchError::Cancelled => Severity::Low,
        }
    }

    /// Whether the scheduler may retry a job that failed with this error.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            BatchError::Transient { .. }
                | BatchError::RateLimited { .. }
                | BatchError::Timeout { .. }
        )
    }

    /// Build the matching kind for a provider-reported fault.
    pub fn from_fault(provider: Provider, fault: ProviderFault, message: &str) -> Self {
        match fault {
            ProviderFault::RateLimited => BatchError::RateLimited { provider },
            ProviderFault::Auth => BatchError::Auth { provider },
            ProviderFault::Transient => BatchError::Transient {
                message: message.to_string(),
            },
        }
    }

    pub fn transient(message: impl Into<String>) -> Self {
        BatchError::Transient {
            message: message.into(),
        }
    }
}

impl From<sqlx::Error> for BatchError {
    fn from(err: sqlx::Error) -> Self {
        if let sqlx::Error::Database(db) = &err {
            // Integrity violations (class 23) will not succeed on retry.
            if db.code().map(|c| c.starts_with("23")).unwrap_or(false) {
                return BatchError::Conflict {
                    table: db.table().unwrap_or("unknown").to_string(),
                    message: db.message().to_string(),
                };
            }
        }
        BatchError::Transient {
            message: format!("database error: {err}"),
        }
    }
}

impl From<reqwest::Error> for BatchError {
    fn from(err: reqwest::Error) -> Self {
        // Transport-level failures (timeouts included) are transient; status
        // classification happens in the executor before this conversion.
        BatchError::Transient {
            message: format!("http error: {err}"),
        }
    }
}
