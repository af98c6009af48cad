//! Scheduler behavior over an in-memory kernel: dependency gating, overlap
//! protection, timeouts, retries, and alerting.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use batch_core::common::BatchError;
use batch_core::kernel::jobs::{
    BatchJob, ExecutionStatus, JobContext, JobDefinition, JobMetrics, JobRegistry, RetryStatus,
    Scheduler, Trigger,
};
use batch_core::kernel::{BatchKernel, TestKernelParts};
use batch_core::Severity;

#[derive(Clone, Copy)]
enum Behavior {
    Succeed(i64),
    FailTransient,
    FailAuth,
    SleepMs(u64),
}

struct ScriptedJob {
    behavior: Behavior,
    runs: Arc<AtomicU32>,
    cleanups: Arc<AtomicU32>,
}

#[async_trait]
impl BatchJob for ScriptedJob {
    fn job_type(&self) -> &'static str {
        "scripted"
    }

    async fn execute(&self, ctx: &JobContext) -> Result<JobMetrics, BatchError> {
        self.runs.fetch_add(1, Ordering::SeqCst);
        match self.behavior {
            Behavior::Succeed(n) => Ok(JobMetrics {
                processed_records: n,
                failed_records: 0,
            }),
            Behavior::FailTransient => Err(BatchError::transient("synthetic failure")),
            Behavior::FailAuth => Err(BatchError::Auth {
                provider: datago_client::Provider::Kto,
            }),
            Behavior::SleepMs(ms) => {
                tokio::select! {
                    _ = tokio::time::sleep(Duration::from_millis(ms)) => Ok(JobMetrics::default()),
                    _ = ctx.cancel.cancelled() => Err(BatchError::Cancelled),
                }
            }
        }
    }

    async fn cleanup(&self, _ctx: &JobContext) {
        self.cleanups.fetch_add(1, Ordering::SeqCst);
    }
}

struct Harness {
    parts: TestKernelParts,
    registry: JobRegistry,
    runs: Arc<AtomicU32>,
    cleanups: Arc<AtomicU32>,
}

impl Harness {
    async fn new() -> Self {
        Self {
            parts: BatchKernel::test_parts().await,
            registry: JobRegistry::new(),
            runs: Arc::new(AtomicU32::new(0)),
            cleanups: Arc::new(AtomicU32::new(0)),
        }
    }

    fn add_job(&mut self, id: &str, behavior: Behavior, deps: &[&str], timeout: Duration) {
        let runs = self.runs.clone();
        let cleanups = self.cleanups.clone();
        self.registry.register(
            JobDefinition::builder()
                .id(id)
                .name(id)
                .trigger(Trigger::Interval(Duration::from_secs(3_600)))
                .timeout(timeout)
                .max_retries(0u32)
                .depends_on(deps.iter().map(|s| s.to_string()).collect::<Vec<_>>())
                .build(),
            move || {
                Box::new(ScriptedJob {
                    behavior,
                    runs: runs.clone(),
                    cleanups: cleanups.clone(),
                })
            },
        );
    }

    fn scheduler(self) -> (Arc<Scheduler>, TestKernelParts, Arc<AtomicU32>, Arc<AtomicU32>) {
        let scheduler = Scheduler::new(self.parts.kernel.clone(), Arc::new(self.registry));
        (scheduler, self.parts, self.runs, self.cleanups)
    }
}

#[tokio::test]
async fn success_records_a_closed_envelope() {
    let mut harness = Harness::new().await;
    harness.add_job("job-a", Behavior::Succeed(42), &[], Duration::from_secs(5));
    let (scheduler, parts, runs, cleanups) = harness.scheduler();

    let outcome = scheduler.run_job_now("job-a").await.unwrap();

    assert_eq!(outcome.execution.status, ExecutionStatus::Success);
    assert_eq!(outcome.execution.processed_records, 42);
    assert!(outcome.execution.finished_at.unwrap() >= outcome.execution.started_at);
    assert_eq!(runs.load(Ordering::SeqCst), 1);
    assert_eq!(cleanups.load(Ordering::SeqCst), 1);

    let rows = parts.ledger.all().await;
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].status, ExecutionStatus::Success);
}

#[tokio::test]
async fn stale_dependency_skips_without_running_the_body() {
    let mut harness = Harness::new().await;
    harness.add_job("dep", Behavior::Succeed(1), &[], Duration::from_secs(5));
    harness.add_job("job-b", Behavior::Succeed(1), &["dep"], Duration::from_secs(5));
    let (scheduler, parts, runs, _) = harness.scheduler();

    let outcome = scheduler.run_job_now("job-b").await.unwrap();
    assert_eq!(outcome.execution.status, ExecutionStatus::Skipped);
    assert_eq!(runs.load(Ordering::SeqCst), 0);

    // The skip is durable so operators can see why nothing ran.
    let rows = parts.ledger.all().await;
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].status, ExecutionStatus::Skipped);
    assert!(rows[0]
        .error_message
        .as_deref()
        .unwrap()
        .contains("dep"));
}

#[tokio::test]
async fn fresh_dependency_lets_the_job_run() {
    let mut harness = Harness::new().await;
    harness.add_job("dep", Behavior::Succeed(1), &[], Duration::from_secs(5));
    harness.add_job("job-b", Behavior::Succeed(7), &["dep"], Duration::from_secs(5));
    let (scheduler, _parts, _runs, _) = harness.scheduler();

    scheduler.run_job_now("dep").await.unwrap();
    let outcome = scheduler.run_job_now("job-b").await.unwrap();
    assert_eq!(outcome.execution.status, ExecutionStatus::Success);
    assert_eq!(outcome.execution.processed_records, 7);
}

#[tokio::test]
async fn failed_dependency_does_not_count() {
    let mut harness = Harness::new().await;
    harness.add_job("dep", Behavior::FailTransient, &[], Duration::from_secs(5));
    harness.add_job("job-b", Behavior::Succeed(1), &["dep"], Duration::from_secs(5));
    let (scheduler, _parts, runs, _) = harness.scheduler();

    scheduler.run_job_now("dep").await.unwrap();
    let before = runs.load(Ordering::SeqCst);

    let outcome = scheduler.run_job_now("job-b").await.unwrap();
    assert_eq!(outcome.execution.status, ExecutionStatus::Skipped);
    assert_eq!(runs.load(Ordering::SeqCst), before);
}

#[tokio::test]
async fn timeout_cancels_cooperatively_and_records_timeout() {
    let mut harness = Harness::new().await;
    harness.add_job(
        "slow",
        Behavior::SleepMs(5_000),
        &[],
        Duration::from_millis(100),
    );
    let (scheduler, _parts, _runs, cleanups) = harness.scheduler();

    let outcome = scheduler.run_job_now("slow").await.unwrap();

    assert_eq!(outcome.execution.status, ExecutionStatus::Timeout);
    assert_eq!(outcome.execution.error_severity, Some(Severity::High));
    // The body observed cancellation and cleanup still ran.
    assert_eq!(cleanups.load(Ordering::SeqCst), 1);
    assert!(matches!(outcome.error, Some(BatchError::Timeout { .. })));
}

#[tokio::test]
async fn final_failure_emits_exactly_one_alert() {
    let mut harness = Harness::new().await;
    harness.add_job("doomed", Behavior::FailAuth, &[], Duration::from_secs(5));
    let (scheduler, parts, _runs, _) = harness.scheduler();

    let outcome = scheduler.run_job_now("doomed").await.unwrap();
    assert_eq!(outcome.execution.status, ExecutionStatus::Failed);
    assert_eq!(outcome.execution.retry_status, RetryStatus::NotRetried);
    assert_eq!(outcome.execution.error_severity, Some(Severity::High));

    let alerts = parts.notifier.alerts.lock().await;
    assert_eq!(alerts.len(), 1);
    assert_eq!(alerts[0].job_id, "doomed");
    assert_eq!(alerts[0].severity, Severity::High);
}

#[tokio::test]
async fn same_job_never_runs_twice_concurrently() {
    let mut harness = Harness::new().await;
    harness.add_job(
        "slow",
        Behavior::SleepMs(500),
        &[],
        Duration::from_secs(5),
    );
    let (scheduler, _parts, runs, _) = harness.scheduler();

    let first = {
        let scheduler = scheduler.clone();
        tokio::spawn(async move { scheduler.run_job_now("slow").await.unwrap() })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    let second = scheduler.run_job_now("slow").await.unwrap();

    assert_eq!(second.execution.status, ExecutionStatus::Skipped);
    let first = first.await.unwrap();
    assert_eq!(first.execution.status, ExecutionStatus::Success);
    assert_eq!(runs.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn run_all_respects_priority_order_and_reports_each_job() {
    let mut harness = Harness::new().await;
    harness.add_job("a", Behavior::Succeed(1), &[], Duration::from_secs(5));
    harness.add_job("b", Behavior::Succeed(2), &[], Duration::from_secs(5));
    let (scheduler, _parts, runs, _) = harness.scheduler();

    let outcomes = scheduler.run_all().await.unwrap();
    assert_eq!(outcomes.len(), 2);
    assert_eq!(runs.load(Ordering::SeqCst), 2);
    assert!(outcomes
        .iter()
        .all(|o| o.execution.status == ExecutionStatus::Success));
}

#[tokio::test]
async fn unknown_job_id_is_an_error() {
    let harness = Harness::new().await;
    let (scheduler, _parts, _runs, _) = harness.scheduler();
    assert!(scheduler.run_job_now("no-such-job").await.is_err());
}
