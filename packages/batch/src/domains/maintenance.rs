//! Housekeeping jobs: archive retention and key probing.

use async_trait::async_trait;
use chrono::{Duration, Utc};
use datago_client::weather::{forecast, BaseDateTime, ForecastKind};
use datago_client::{grid, tour, Provider};
use tracing::info;

use crate::common::BatchError;
use crate::kernel::jobs::{BatchJob, JobContext, JobMetrics};

/// Deletes raw rows past their TTL and stale quota-ledger rows.
pub struct ArchivePurgeJob;

/// Probes disabled keys with a cheap read and reactivates the survivors.
pub struct KeyProbeJob;

#[async_trait]
impl BatchJob for ArchivePurgeJob {
    fn job_type(&self) -> &'static str {
        "archive_purge"
    }

    async fn execute(&self, ctx: &JobContext) -> Result<JobMetrics, BatchError> {
        let purged_raw = ctx
            .kernel
            .archive
            .purge_expired()
            .await
            .map_err(|e| BatchError::transient(format!("archive purge failed: {e}")))?;

        // Quota ledger rows stop mattering once their day has passed; a
        // week of history is kept for the operator surface.
        let cutoff = (Utc::now().with_timezone(&ctx.kernel.config.timezone)
            - Duration::days(7))
        .date_naive();
        let purged_ledger = sqlx::query("DELETE FROM api_key_usage WHERE usage_date < $1")
            .bind(cutoff)
            .execute(&ctx.kernel.db)
            .await
            .map_err(BatchError::from)?
            .rows_affected();

        info!(purged_raw, purged_ledger, "retention sweep complete");
        Ok(JobMetrics {
            processed_records: (purged_raw + purged_ledger) as i64,
            failed_records: 0,
        })
    }
}

#[async_trait]
impl BatchJob for KeyProbeJob {
    fn job_type(&self) -> &'static str {
        "key_probe"
    }

    async fn execute(&self, ctx: &JobContext) -> Result<JobMetrics, BatchError> {
        let mut revived = 0u32;

        // Cheapest read each provider offers.
        let kto_probe = tour::area_codes(&ctx.kernel.config.app_name).paged(1, 1);
        revived += ctx
            .kernel
            .executor
            .probe_disabled_keys(Provider::Kto, &kto_probe, &ctx.cancel)
            .await?;

        let now = Utc::now().with_timezone(&ctx.kernel.config.timezone);
        let seoul = grid::to_grid(37.5663, 126.9779);
        let kma_probe = forecast(ForecastKind::Nowcast, &BaseDateTime::nowcast(now), seoul);
        revived += ctx
            .kernel
            .executor
            .probe_disabled_keys(Provider::Kma, &kma_probe, &ctx.cancel)
            .await?;

        if revived > 0 {
            info!(revived, "probe reactivated keys");
        }
        Ok(JobMetrics {
            processed_records: revived as i64,
            failed_records: 0,
        })
    }
}
