//! The job scheduler.
//!
//! Owns the registry of definitions and a bounded worker pool. Cron
//! triggers are evaluated in the configured timezone, interval triggers by
//! plain tickers; both funnel into one fire channel so overlap checks,
//! dependency gating, retries, and the ledger all live in a single
//! dispatch path.
//!
//! ```text
//! cron / interval / retry timer / misfire probe
//!     │
//!     └─► Fire { job_id, attempt } ──► dispatch
//!             ├─ overlap?      skip + log (no ledger row)
//!             ├─ dependencies? record Skipped
//!             ├─ worker permit (FIFO, bounded)
//!             ├─ record Running ► run body with timeout watcher
//!             └─ record terminal envelope, schedule retry or alert
//! ```

use std::collections::HashSet;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use chrono::Utc;
use rand::Rng;
use tokio::sync::{mpsc, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use super::definition::{JobDefinition, Trigger};
use super::execution::{dependency_satisfied, ExecutionStatus, JobExecution, RetryStatus};
use super::registry::{JobRegistry, RegisteredJob};
use super::runtime::{run_job, JobContext, JobMetrics};
use crate::common::BatchError;
use crate::kernel::notify::Alert;
use crate::kernel::BatchKernel;

/// Dependency freshness window: the dependency's latest Success must have
/// finished within this span of the dependent's start.
const DEPENDENCY_WINDOW_HOURS: i64 = 24;
/// Upper bound for exponential retry backoff.
const MAX_BACKOFF: Duration = Duration::from_secs(3_600);
/// Grace given to a timed-out body to unwind and run cleanup.
const CANCEL_GRACE: Duration = Duration::from_secs(30);

#[derive(Debug, Clone)]
struct Fire {
    job_id: String,
    attempt: u32,
}

/// Result of one dispatched execution, as handed to the operator CLI.
pub struct RunOutcome {
    pub execution: JobExecution,
    pub error: Option<BatchError>,
}

pub struct Scheduler {
    kernel: Arc<BatchKernel>,
    registry: Arc<JobRegistry>,
    workers: Arc<Semaphore>,
    running: Arc<StdMutex<HashSet<String>>>,
    fires: mpsc::UnboundedSender<Fire>,
    fire_rx: StdMutex<Option<mpsc::UnboundedReceiver<Fire>>>,
}

impl Scheduler {
    pub fn new(kernel: Arc<BatchKernel>, registry: Arc<JobRegistry>) -> Arc<Self> {
        let (tx, rx) = mpsc::unbounded_channel();
        Arc::new(Self {
            workers: Arc::new(Semaphore::new(kernel.config.worker_count)),
            kernel,
            registry,
            running: Arc::new(StdMutex::new(HashSet::new())),
            fires: tx,
            fire_rx: StdMutex::new(Some(rx)),
        })
    }

    /// Run until the shutdown token fires.
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) -> Result<()> {
        let mut rx = self
            .fire_rx
            .lock()
            .expect("fire receiver lock")
            .take()
            .ok_or_else(|| anyhow!("scheduler already running"))?;

        self.enqueue_misfires().await;

        self.start_cron_triggers(&shutdown)?;
        self.start_interval_triggers(&shutdown);

        info!(
            jobs = self.registry.len(),
            workers = self.kernel.config.worker_count,
            "scheduler started"
        );

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                fire = rx.recv() => {
                    let Some(fire) = fire else { break };
                    let scheduler = self.clone();
                    let shutdown = shutdown.clone();
                    tokio::spawn(async move {
                        scheduler.dispatch(fire, shutdown).await;
                    });
                }
            }
        }

        info!("scheduler stopped");
        Ok(())
    }

    /// Execute one job immediately (operator `run` subcommand). Overlap and
    /// dependency rules still apply; scheduler-level retries do not.
    pub async fn run_job_now(&self, job_id: &str) -> Result<RunOutcome> {
        let job = self
            .registry
            .get(job_id)
            .ok_or_else(|| anyhow!("unknown job id: {job_id}"))?
            .clone();
        let shutdown = CancellationToken::new();
        self.execute_fire(&job, 0, &shutdown, false).await
    }

    /// Fire every enabled job once, in priority order (operator `run-all`).
    pub async fn run_all(&self) -> Result<Vec<RunOutcome>> {
        let mut outcomes = Vec::new();
        let jobs: Vec<RegisteredJob> = self
            .registry
            .by_priority()
            .into_iter()
            .filter(|j| j.definition.enabled)
            .cloned()
            .collect();
        for job in jobs {
            let shutdown = CancellationToken::new();
            outcomes.push(self.execute_fire(&job, 0, &shutdown, false).await?);
        }
        Ok(outcomes)
    }

    // ------------------------------------------------------------------
    // Triggers
    // ------------------------------------------------------------------

    /// One task per cron definition: sleep until the next occurrence in the
    /// configured zone, fire, repeat. Expressions are six-field (seconds
    /// leading), e.g. `"0 0 2 * * *"` for 02:00 daily.
    fn start_cron_triggers(&self, shutdown: &CancellationToken) -> Result<()> {
        let timezone = self.kernel.config.timezone;

        for job in self.registry.iter() {
            let Trigger::Cron(expr) = &job.definition.trigger else {
                continue;
            };
            if !job.definition.enabled {
                continue;
            }

            let schedule: cron::Schedule = expr
                .parse()
                .with_context(|| format!("invalid cron trigger for {}", job.definition.id))?;
            let tx = self.fires.clone();
            let job_id = job.definition.id.clone();
            let shutdown = shutdown.clone();

            tokio::spawn(async move {
                loop {
                    let Some(next) = schedule.upcoming(timezone).next() else {
                        break;
                    };
                    let wait = (next.with_timezone(&Utc) - Utc::now())
                        .to_std()
                        .unwrap_or(Duration::ZERO);
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = tokio::time::sleep(wait) => {
                            if tx.send(Fire { job_id: job_id.clone(), attempt: 0 }).is_err() {
                                break;
                            }
                            // Step past the occurrence just fired so timer
                            // precision cannot double-fire it.
                            tokio::time::sleep(Duration::from_secs(1)).await;
                        }
                    }
                }
            });
        }

        Ok(())
    }

    fn start_interval_triggers(&self, shutdown: &CancellationToken) {
        for job in self.registry.iter() {
            let Trigger::Interval(period) = job.definition.trigger else {
                continue;
            };
            if !job.definition.enabled {
                continue;
            }

            let tx = self.fires.clone();
            let job_id = job.definition.id.clone();
            let shutdown = shutdown.clone();
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(period);
                ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
                // The first tick completes immediately; startup catch-up is
                // the misfire probe's call, not the ticker's.
                ticker.tick().await;
                loop {
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = ticker.tick() => {
                            if tx.send(Fire { job_id: job_id.clone(), attempt: 0 }).is_err() {
                                break;
                            }
                        }
                    }
                }
            });
        }
    }

    /// Startup misfire probe: a job whose last recorded attempt is older
    /// than one trigger period runs once immediately. Anything older is
    /// deliberately not caught up, to avoid storms after long downtime.
    async fn enqueue_misfires(&self) {
        for job in self.registry.iter() {
            if !job.definition.enabled {
                continue;
            }
            let Some(period) = job.definition.trigger.period() else {
                continue;
            };
            let last = match self.kernel.ledger.latest_start(&job.definition.id).await {
                Ok(last) => last,
                Err(err) => {
                    warn!(job_id = %job.definition.id, error = %err, "misfire probe failed");
                    continue;
                }
            };

            let overdue = match last {
                None => true,
                Some(started) => {
                    let elapsed = (Utc::now() - started)
                        .to_std()
                        .unwrap_or(Duration::ZERO);
                    elapsed > period
                }
            };
            if overdue {
                info!(job_id = %job.definition.id, "misfire: firing once at startup");
                let _ = self.fires.send(Fire {
                    job_id: job.definition.id.clone(),
                    attempt: 0,
                });
            }
        }
    }

    // ------------------------------------------------------------------
    // Dispatch
    // ------------------------------------------------------------------

    async fn dispatch(self: Arc<Self>, fire: Fire, shutdown: CancellationToken) {
        let Some(job) = self.registry.get(&fire.job_id).cloned() else {
            warn!(job_id = %fire.job_id, "fire for unregistered job dropped");
            return;
        };
        if !job.definition.enabled {
            return;
        }

        match self.execute_fire(&job, fire.attempt, &shutdown, true).await {
            Ok(_) => {}
            Err(err) => {
                error!(job_id = %fire.job_id, error = %err, "dispatch failed");
            }
        }
    }

    /// The single execution path shared by triggers, retries, and the CLI.
    async fn execute_fire(
        &self,
        job: &RegisteredJob,
        attempt: u32,
        shutdown: &CancellationToken,
        allow_retry: bool,
    ) -> Result<RunOutcome> {
        let def = &job.definition;

        // One Running execution per job id, scheduler-enforced. An overlap
        // is logged but never queued and never reaches the ledger.
        let _guard = match RunningGuard::try_claim(&self.running, &def.id) {
            Some(guard) => guard,
            None => {
                info!(job_id = %def.id, "already running, fire skipped");
                return Ok(RunOutcome {
                    execution: JobExecution::skipped(&def.id, "already running"),
                    error: None,
                });
            }
        };

        // Dependencies: each must have succeeded within the window.
        for dep in &def.depends_on {
            let fresh = dependency_satisfied(
                self.kernel.ledger.as_ref(),
                dep,
                chrono::Duration::hours(DEPENDENCY_WINDOW_HOURS),
            )
            .await
            .unwrap_or(false);
            if !fresh {
                let reason = format!("dependency not satisfied: {dep}");
                info!(job_id = %def.id, dependency = %dep, "skipping, dependency stale");
                let execution = JobExecution::skipped(&def.id, &reason);
                self.kernel.ledger.record_start(&execution).await.ok();
                return Ok(RunOutcome {
                    execution,
                    error: None,
                });
            }
        }

        let _permit = self
            .workers
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| anyhow!("worker pool closed"))?;

        let mut execution = JobExecution::start(&def.id, attempt as i32);
        self.kernel.ledger.record_start(&execution).await?;
        info!(job_id = %def.id, execution_id = %execution.execution_id, attempt, "job starting");
        self.kernel
            .ledger
            .append_log(execution.execution_id, "info", "job starting")
            .await
            .ok();

        let (result, timed_out) = self.run_with_watchers(job, &execution, shutdown).await;

        let error = match result {
            Ok(metrics) => {
                execution.processed_records = metrics.processed_records;
                execution.failed_records = metrics.failed_records;
                execution.close(ExecutionStatus::Success);
                info!(
                    job_id = %def.id,
                    execution_id = %execution.execution_id,
                    processed = metrics.processed_records,
                    failed = metrics.failed_records,
                    "job succeeded"
                );
                None
            }
            Err(err) => {
                let status = if timed_out {
                    ExecutionStatus::Timeout
                } else if matches!(err, BatchError::Cancelled) {
                    ExecutionStatus::Cancelled
                } else {
                    ExecutionStatus::Failed
                };
                let err = if timed_out {
                    BatchError::Timeout {
                        seconds: def.timeout.as_secs(),
                    }
                } else {
                    err
                };

                execution.error_message = Some(err.to_string());
                execution.error_severity = Some(err.severity());
                execution.close(status);

                let retrying = allow_retry
                    && status != ExecutionStatus::Cancelled
                    && should_retry(&err, attempt, def.max_retries);
                execution.retry_status = if retrying {
                    RetryStatus::Scheduled
                } else if err.is_retryable() && def.max_retries > 0 && attempt >= def.max_retries {
                    RetryStatus::Exhausted
                } else {
                    RetryStatus::NotRetried
                };

                warn!(
                    job_id = %def.id,
                    execution_id = %execution.execution_id,
                    status = status.as_str(),
                    severity = %err.severity(),
                    error = %err,
                    retrying,
                    "job did not succeed"
                );

                if retrying {
                    self.schedule_retry(def, attempt);
                } else if status != ExecutionStatus::Cancelled {
                    self.kernel
                        .alerts
                        .raise(Alert {
                            severity: err.severity(),
                            title: format!("job {} failed", def.id),
                            body: err.to_string(),
                            job_id: def.id.clone(),
                            execution_id: execution.execution_id,
                            timestamp: Utc::now(),
                        })
                        .await;
                }
                Some(err)
            }
        };

        let summary = match &execution.error_message {
            Some(message) => format!("finished {}: {message}", execution.status.as_str()),
            None => format!(
                "finished {}: {} processed, {} failed",
                execution.status.as_str(),
                execution.processed_records,
                execution.failed_records
            ),
        };
        self.kernel
            .ledger
            .append_log(
                execution.execution_id,
                if error.is_some() { "error" } else { "info" },
                &summary,
            )
            .await
            .ok();

        self.kernel.ledger.record_end(&execution).await?;
        Ok(RunOutcome { execution, error })
    }

    /// Run the body under the timeout watcher. Cancellation is cooperative:
    /// the watcher cancels the job token, then grants a grace period so
    /// cleanup still runs before the task is abandoned.
    async fn run_with_watchers(
        &self,
        job: &RegisteredJob,
        execution: &JobExecution,
        shutdown: &CancellationToken,
    ) -> (Result<JobMetrics, BatchError>, bool) {
        let cancel = shutdown.child_token();
        let ctx = JobContext {
            kernel: self.kernel.clone(),
            execution_id: execution.execution_id,
            params: job.definition.params.clone(),
            cancel: cancel.clone(),
        };
        let body = job.instantiate();
        let mut handle = tokio::spawn(async move { run_job(body.as_ref(), &ctx).await });

        tokio::select! {
            joined = &mut handle => (flatten_join(joined), false),
            _ = tokio::time::sleep(job.definition.timeout) => {
                cancel.cancel();
                match tokio::time::timeout(CANCEL_GRACE, &mut handle).await {
                    Ok(joined) => (flatten_join(joined), true),
                    Err(_) => {
                        handle.abort();
                        (Err(BatchError::Cancelled), true)
                    }
                }
            }
        }
    }

    fn schedule_retry(&self, def: &JobDefinition, attempt: u32) {
        let delay = backoff_delay(def.backoff_base, attempt);
        let tx = self.fires.clone();
        let job_id = def.id.clone();
        info!(job_id = %job_id, attempt = attempt + 1, delay_secs = delay.as_secs(), "retry scheduled");
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = tx.send(Fire {
                job_id,
                attempt: attempt + 1,
            });
        });
    }
}

fn flatten_join(
    joined: std::result::Result<Result<JobMetrics, BatchError>, tokio::task::JoinError>,
) -> Result<JobMetrics, BatchError> {
    match joined {
        Ok(result) => result,
        Err(join_err) if join_err.is_cancelled() => Err(BatchError::Cancelled),
        Err(join_err) => Err(BatchError::transient(format!("job task panicked: {join_err}"))),
    }
}

/// Retry iff attempts remain and the error kind is in the retryable set.
fn should_retry(err: &BatchError, attempt: u32, max_retries: u32) -> bool {
    attempt < max_retries && err.is_retryable()
}

/// `base × 2^attempt`, capped, with up to 10% jitter so synchronized
/// failures do not re-fire in lockstep.
fn backoff_delay(base: Duration, attempt: u32) -> Duration {
    let exp = base.saturating_mul(2u32.saturating_pow(attempt)).min(MAX_BACKOFF);
    let jitter = rand::thread_rng().gen_range(0.0..0.1);
    exp.mul_f64(1.0 + jitter).min(MAX_BACKOFF)
}

/// Marks a job id as running for the lifetime of the guard.
struct RunningGuard {
    running: Arc<StdMutex<HashSet<String>>>,
    job_id: String,
}

impl RunningGuard {
    fn try_claim(running: &Arc<StdMutex<HashSet<String>>>, job_id: &str) -> Option<Self> {
        let mut set = running.lock().expect("running set lock");
        if !set.insert(job_id.to_string()) {
            return None;
        }
        Some(Self {
            running: running.clone(),
            job_id: job_id.to_string(),
        })
    }
}

impl Drop for RunningGuard {
    fn drop(&mut self) {
        if let Ok(mut set) = self.running.lock() {
            set.remove(&self.job_id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retry_requires_remaining_attempts_and_a_retryable_kind() {
        let transient = BatchError::transient("reset");
        assert!(should_retry(&transient, 0, 3));
        assert!(should_retry(&transient, 2, 3));
        assert!(!should_retry(&transient, 3, 3));

        let auth = BatchError::Auth {
            provider: datago_client::Provider::Kto,
        };
        assert!(!should_retry(&auth, 0, 3));
    }

    #[test]
    fn backoff_doubles_per_attempt_and_caps() {
        let base = Duration::from_secs(60);
        let d0 = backoff_delay(base, 0);
        let d2 = backoff_delay(base, 2);
        assert!(d0 >= Duration::from_secs(60) && d0 <= Duration::from_secs(66));
        assert!(d2 >= Duration::from_secs(240) && d2 <= Duration::from_secs(264));
        assert!(backoff_delay(base, 20) <= MAX_BACKOFF);
    }

    #[test]
    fn running_guard_blocks_second_claim_until_dropped() {
        let running = Arc::new(StdMutex::new(HashSet::new()));
        let guard = RunningGuard::try_claim(&running, "job-a");
        assert!(guard.is_some());
        assert!(RunningGuard::try_claim(&running, "job-a").is_none());
        assert!(RunningGuard::try_claim(&running, "job-b").is_some());

        drop(guard);
        assert!(RunningGuard::try_claim(&running, "job-a").is_some());
    }
}
