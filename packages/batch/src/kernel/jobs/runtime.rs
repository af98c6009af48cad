//! The contract every batch job implements.
//!
//! A run is always the same composition: `validate` (prerequisites only, no
//! side effects) then `execute` then `cleanup`, with cleanup invoked on
//! every exit path including cancellation and timeout. Errors leave as
//! classified [`BatchError`] values; jobs never swallow them.

use async_trait::async_trait;
use datago_client::ContentType;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::common::{BatchError, WeatherRegion};
use crate::kernel::BatchKernel;

/// Structured parameters delivered opaquely by the scheduler, one variant
/// per job type.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum JobParams {
    Tourism {
        area_codes: Vec<String>,
        content_types: Vec<ContentType>,
    },
    TourismIncremental {
        lookback_days: i64,
    },
    Weather {
        regions: Vec<WeatherRegion>,
    },
    HistoricalWeather {
        lookback_days: i64,
    },
    QualityGate,
    ArchivePurge,
    None,
}

/// Everything a job body may touch.
pub struct JobContext {
    pub kernel: Arc<BatchKernel>,
    pub execution_id: Uuid,
    pub params: JobParams,
    pub cancel: CancellationToken,
}

impl JobContext {
    /// Bail out promptly at a suspension point if cancellation arrived.
    pub fn check_cancelled(&self) -> Result<(), BatchError> {
        if self.cancel.is_cancelled() {
            Err(BatchError::Cancelled)
        } else {
            Ok(())
        }
    }
}

/// Counters a job reports back to the scheduler.
#[derive(Debug, Clone, Copy, Default)]
pub struct JobMetrics {
    pub processed_records: i64,
    pub failed_records: i64,
}

impl JobMetrics {
    pub fn merge(&mut self, other: JobMetrics) {
        self.processed_records += other.processed_records;
        self.failed_records += other.failed_records;
    }
}

#[async_trait]
pub trait BatchJob: Send + Sync {
    /// Stable tag; used in log fields and detail rows.
    fn job_type(&self) -> &'static str;

    /// Check prerequisites without side effects.
    async fn validate(&self, _ctx: &JobContext) -> Result<(), BatchError> {
        Ok(())
    }

    async fn execute(&self, ctx: &JobContext) -> Result<JobMetrics, BatchError>;

    /// Invoked on every exit path; must not fail the run.
    async fn cleanup(&self, _ctx: &JobContext) {}
}

/// Run one job through the full contract.
pub async fn run_job(job: &dyn BatchJob, ctx: &JobContext) -> Result<JobMetrics, BatchError> {
    if let Err(err) = job.validate(ctx).await {
        job.cleanup(ctx).await;
        return Err(err);
    }

    let result = job.execute(ctx).await;
    job.cleanup(ctx).await;
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

    struct Probe {
        fail_validate: bool,
        fail_execute: bool,
        cleaned: AtomicBool,
        executed: AtomicU32,
    }

    impl Probe {
        fn new(fail_validate: bool, fail_execute: bool) -> Self {
            Self {
                fail_validate,
                fail_execute,
                cleaned: AtomicBool::new(false),
                executed: AtomicU32::new(0),
            }
        }
    }

    #[async_trait]
    impl BatchJob for Probe {
        fn job_type(&self) -> &'static str {
            "probe"
        }

        async fn validate(&self, _ctx: &JobContext) -> Result<(), BatchError> {
            if self.fail_validate {
                Err(BatchError::Validation {
                    reason: "missing prerequisite".into(),
                })
            } else {
                Ok(())
            }
        }

        async fn execute(&self, _ctx: &JobContext) -> Result<JobMetrics, BatchError> {
            self.executed.fetch_add(1, Ordering::SeqCst);
            if self.fail_execute {
                Err(BatchError::transient("boom"))
            } else {
                Ok(JobMetrics {
                    processed_records: 5,
                    failed_records: 0,
                })
            }
        }

        async fn cleanup(&self, _ctx: &JobContext) {
            self.cleaned.store(true, Ordering::SeqCst);
        }
    }

    async fn ctx() -> JobContext {
        JobContext {
            kernel: crate::kernel::BatchKernel::for_tests().await,
            execution_id: Uuid::new_v4(),
            params: JobParams::None,
            cancel: CancellationToken::new(),
        }
    }

    #[tokio::test]
    async fn cleanup_runs_after_success() {
        let job = Probe::new(false, false);
        let metrics = run_job(&job, &ctx().await).await.unwrap();
        assert_eq!(metrics.processed_records, 5);
        assert!(job.cleaned.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn cleanup_runs_after_execute_failure() {
        let job = Probe::new(false, true);
        assert!(run_job(&job, &ctx().await).await.is_err());
        assert!(job.cleaned.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn failed_validation_skips_execute_but_still_cleans_up() {
        let job = Probe::new(true, false);
        assert!(run_job(&job, &ctx().await).await.is_err());
        assert_eq!(job.executed.load(Ordering::SeqCst), 0);
        assert!(job.cleaned.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn cancelled_context_reports_cancellation() {
        let ctx = ctx().await;
        ctx.cancel.cancel();
        assert!(matches!(ctx.check_cancelled(), Err(BatchError::Cancelled)));
    }
}
