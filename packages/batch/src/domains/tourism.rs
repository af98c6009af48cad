//! Tourism harvest jobs.
//!
//! The comprehensive harvest walks every configured area and content type
//! through the paged listing endpoint; the incremental harvest narrows the
//! same listing to records modified inside a lookback window. Both feed
//! pages through the transform and land rows with the bulk upsert engine,
//! so re-running either job is idempotent on `content_id`.

use async_trait::async_trait;
use chrono::{Duration, Utc};
use datago_client::{tour, ContentType};
use serde_json::json;
use tracing::info;

use crate::common::BatchError;
use crate::kernel::jobs::{BatchJob, JobContext, JobMetrics, JobParams};
use crate::pipeline::{mapping, transform_page, BulkUpsertEngine, UpsertPlan};

/// KTO province/metropolitan area codes harvested by default.
pub const DEFAULT_AREA_CODES: &[&str] = &[
    "1", "2", "3", "4", "5", "6", "7", "8", "31", "32", "33", "34", "35", "36", "37", "38", "39",
];

/// Full area × content-type harvest.
pub struct ComprehensiveTourismJob;

/// Harvest of records modified within a lookback window.
pub struct IncrementalTourismJob;

#[async_trait]
impl BatchJob for ComprehensiveTourismJob {
    fn job_type(&self) -> &'static str {
        "comprehensive_tourism"
    }

    async fn validate(&self, ctx: &JobContext) -> Result<(), BatchError> {
        if ctx.kernel.config.kto_keys.is_empty() {
            return Err(BatchError::Config("no KTO keys configured".into()));
        }
        match &ctx.params {
            JobParams::Tourism { content_types, .. } if !content_types.is_empty() => Ok(()),
            JobParams::Tourism { .. } => Err(BatchError::Validation {
                reason: "tourism params carry no content types".into(),
            }),
            _ => Err(BatchError::Validation {
                reason: "expected tourism params".into(),
            }),
        }
    }

    async fn execute(&self, ctx: &JobContext) -> Result<JobMetrics, BatchError> {
        let JobParams::Tourism {
            area_codes,
            content_types,
        } = &ctx.params
        else {
            return Err(BatchError::Validation {
                reason: "expected tourism params".into(),
            });
        };

        let mut metrics = JobMetrics::default();
        for content_type in content_types {
            for area in area_codes {
                ctx.check_cancelled()?;
                let request = tour::area_based_list(
                    *content_type,
                    Some(area),
                    &ctx.kernel.config.app_name,
                );
                let landed =
                    harvest_listing(ctx, *content_type, request, &format!("area {area}")).await?;
                metrics.merge(landed);
            }
        }
        Ok(metrics)
    }
}

#[async_trait]
impl BatchJob for IncrementalTourismJob {
    fn job_type(&self) -> &'static str {
        "incremental_tourism"
    }

    async fn validate(&self, ctx: &JobContext) -> Result<(), BatchError> {
        if ctx.kernel.config.kto_keys.is_empty() {
            return Err(BatchError::Config("no KTO keys configured".into()));
        }
        Ok(())
    }

    async fn execute(&self, ctx: &JobContext) -> Result<JobMetrics, BatchError> {
        let JobParams::TourismIncremental { lookback_days } = &ctx.params else {
            return Err(BatchError::Validation {
                reason: "expected incremental tourism params".into(),
            });
        };

        let since = (Utc::now().with_timezone(&ctx.kernel.config.timezone)
            - Duration::days(*lookback_days))
        .format("%Y%m%d")
        .to_string();

        let mut metrics = JobMetrics::default();
        for content_type in ContentType::ALL {
            ctx.check_cancelled()?;
            let request = tour::area_based_list_modified(
                content_type,
                None,
                &since,
                &ctx.kernel.config.app_name,
            );
            let landed =
                harvest_listing(ctx, content_type, request, &format!("since {since}")).await?;
            metrics.merge(landed);
        }
        Ok(metrics)
    }
}

/// Drive one paged listing to exhaustion: fetch, transform, upsert.
async fn harvest_listing(
    ctx: &JobContext,
    content_type: ContentType,
    request: datago_client::ProviderRequest,
    scope: &str,
) -> Result<JobMetrics, BatchError> {
    let mapping = mapping::for_content_type(content_type);
    let engine = BulkUpsertEngine::from_preset(
        ctx.kernel.db.clone(),
        ctx.kernel.config.optimization,
    );

    let mut harvest = ctx.kernel.executor.paged(
        request,
        tour::DEFAULT_NUM_OF_ROWS,
        ctx.cancel.clone(),
    );

    let mut rows = Vec::new();
    let mut discarded = 0usize;
    let mut pages = 0usize;
    while let Some(page) = harvest.next_page().await? {
        // Sync stamps come from the archived call so replaying the page
        // reproduces identical rows.
        let synced_at = page.archived_at.unwrap_or_else(Utc::now);
        let out = transform_page(&mapping, &page.slice.items, page.raw_id, synced_at);
        discarded += out.discards.len();
        rows.extend(out.rows);
        pages += 1;
    }

    if rows.is_empty() {
        return Ok(JobMetrics {
            processed_records: 0,
            failed_records: discarded as i64,
        });
    }

    let plan = UpsertPlan::new(mapping.table, mapping.conflict_keys, rows);
    let report = engine.execute(&plan, &ctx.cancel).await?;

    info!(
        content_type = %content_type,
        scope,
        pages,
        landed = report.successful_records,
        failed = report.failed_records,
        discarded,
        "listing harvested"
    );
    ctx.kernel
        .ledger
        .append_detail(
            ctx.execution_id,
            &format!("{content_type}:{scope}"),
            json!({
                "pages": pages,
                "landed": report.successful_records,
                "failed": report.failed_records,
                "discarded": discarded,
                "records_per_second": report.records_per_second,
            }),
        )
        .await
        .ok();

    if report.aborted {
        return Err(BatchError::Conflict {
            table: mapping.table.to_string(),
            message: "bulk upsert aborted after consecutive chunk failures".into(),
        });
    }

    Ok(JobMetrics {
        processed_records: report.successful_records as i64,
        failed_records: (report.failed_records + discarded) as i64,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::BatchKernel;
    use tokio_util::sync::CancellationToken;
    use uuid::Uuid;

    async fn ctx(params: JobParams) -> JobContext {
        JobContext {
            kernel: BatchKernel::for_tests().await,
            execution_id: Uuid::new_v4(),
            params,
            cancel: CancellationToken::new(),
        }
    }

    #[tokio::test]
    async fn validate_rejects_foreign_params() {
        let job = ComprehensiveTourismJob;
        let ctx = ctx(JobParams::ArchivePurge).await;
        assert!(matches!(
            job.validate(&ctx).await,
            Err(BatchError::Validation { .. })
        ));
    }

    #[tokio::test]
    async fn validate_rejects_empty_content_types() {
        let job = ComprehensiveTourismJob;
        let ctx = ctx(JobParams::Tourism {
            area_codes: vec!["1".into()],
            content_types: vec![],
        })
        .await;
        assert!(job.validate(&ctx).await.is_err());
    }

    #[tokio::test]
    async fn validate_accepts_default_shape() {
        let job = ComprehensiveTourismJob;
        let ctx = ctx(JobParams::Tourism {
            area_codes: DEFAULT_AREA_CODES.iter().map(|s| s.to_string()).collect(),
            content_types: ContentType::ALL.to_vec(),
        })
        .await;
        assert!(job.validate(&ctx).await.is_ok());
    }
}
