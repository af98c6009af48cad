//! The scheduled quality-gate job.
//!
//! Runs the gate over every published table. The job itself fails when any
//! table scores below threshold, so jobs that depend on `quality-gate`
//! observe a failed dependency and skip rather than publish on top of bad
//! data.

use async_trait::async_trait;
use serde_json::json;

use super::gate::QualityGate;
use super::spec::default_specs;
use crate::common::BatchError;
use crate::kernel::jobs::{BatchJob, JobContext, JobMetrics};

pub struct QualityGateJob;

#[async_trait]
impl BatchJob for QualityGateJob {
    fn job_type(&self) -> &'static str {
        "quality_gate"
    }

    async fn execute(&self, ctx: &JobContext) -> Result<JobMetrics, BatchError> {
        let gate = QualityGate::new(ctx.kernel.db.clone());
        let specs = default_specs(ctx.kernel.config.quality_threshold);

        let mut metrics = JobMetrics::default();
        let mut failing: Vec<String> = Vec::new();

        for spec in &specs {
            ctx.check_cancelled()?;
            let report = gate.check_table(spec).await?;

            ctx.kernel
                .ledger
                .append_detail(
                    ctx.execution_id,
                    &format!("quality:{}", report.table),
                    json!({
                        "overall": report.overall,
                        "completeness": report.completeness,
                        "validity": report.validity,
                        "consistency": report.consistency,
                        "freshness": report.freshness,
                        "passed": report.passed,
                        "total_rows": report.total_rows,
                    }),
                )
                .await
                .ok();

            metrics.processed_records += 1;
            if !report.passed {
                metrics.failed_records += 1;
                failing.push(report.table);
            }
        }

        if failing.is_empty() {
            Ok(metrics)
        } else {
            Err(BatchError::Conflict {
                table: failing.join(", "),
                message: "quality score below threshold".into(),
            })
        }
    }
}
