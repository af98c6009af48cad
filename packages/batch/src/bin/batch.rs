//! Operator CLI for the batch engine.
//!
//! Exit codes: 0 success, 1 generic failure, 2 misuse (clap), 3 quota
//! exhausted.

use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use batch_core::common::BatchConfig;
use batch_core::domains::default_registry;
use batch_core::kernel::jobs::{ExecutionStatus, Scheduler, Trigger};
use batch_core::kernel::BatchKernel;
use batch_core::BatchError;
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const EXIT_QUOTA_EXHAUSTED: u8 = 3;

#[derive(Parser)]
#[command(name = "batch")]
#[command(about = "Tourism and weather batch engine")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List registered jobs with their triggers and dependencies
    List,

    /// Run one job immediately
    Run { job_id: String },

    /// Run every enabled job once, in priority order
    RunAll,

    /// Show key, governor, and recent-execution state
    Status,

    /// Check configuration, database, and one cheap provider call
    Test,

    /// Run the scheduler until interrupted
    Serve,
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,batch_core=debug,sqlx=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    match run(cli).await {
        Ok(code) => code,
        Err(err) => {
            tracing::error!(error = %format!("{err:#}"), "command failed");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<ExitCode> {
    let config = BatchConfig::from_env().context("configuration error")?;

    match cli.command {
        Commands::List => {
            // Listing needs no database.
            let registry = default_registry(&config);
            println!("{:<24} {:<10} {:<22} {}", "JOB", "ENABLED", "TRIGGER", "DEPENDS ON");
            for job in registry.iter() {
                let def = &job.definition;
                let trigger = match &def.trigger {
                    Trigger::Cron(expr) => format!("cron {expr}"),
                    Trigger::Interval(d) => format!("every {}s", d.as_secs()),
                };
                println!(
                    "{:<24} {:<10} {:<22} {}",
                    def.id,
                    def.enabled,
                    trigger,
                    def.depends_on.join(", ")
                );
            }
            Ok(ExitCode::SUCCESS)
        }

        Commands::Run { job_id } => {
            let kernel = BatchKernel::connect(config.clone()).await?;
            let registry = Arc::new(default_registry(&config));
            let scheduler = Scheduler::new(kernel, registry);

            let outcome = scheduler.run_job_now(&job_id).await?;
            report_execution(&outcome.execution);
            Ok(ExitCode::from(exit_for(
                &outcome.execution.status,
                outcome.error.as_ref(),
            )))
        }

        Commands::RunAll => {
            let kernel = BatchKernel::connect(config.clone()).await?;
            let registry = Arc::new(default_registry(&config));
            let scheduler = Scheduler::new(kernel, registry);

            let outcomes = scheduler.run_all().await?;
            let mut worst = 0u8;
            for outcome in &outcomes {
                report_execution(&outcome.execution);
                worst = worst.max(exit_for(
                    &outcome.execution.status,
                    outcome.error.as_ref(),
                ));
            }
            Ok(ExitCode::from(worst))
        }

        Commands::Status => {
            let kernel = BatchKernel::connect(config).await?;

            println!("== keys ==");
            for provider in kernel.keys.snapshot().await {
                println!("provider {} (day {})", provider.provider, provider.day);
                for key in provider.keys {
                    println!(
                        "  {}  {:<9} {}/{} used, {} errors",
                        key.key_hash,
                        key.state,
                        key.usage_today,
                        key.daily_quota,
                        key.consecutive_errors
                    );
                }
            }

            println!("== governor ==");
            for gate in kernel.governor.snapshot().await {
                println!(
                    "  {}: {} in flight, adaptive delay {}ms",
                    gate.provider, gate.in_flight, gate.adaptive_delay_ms
                );
            }

            println!("== recent executions ==");
            for exec in kernel.ledger.recent(None, 20).await? {
                println!(
                    "  {}  {:<24} {:<9} processed={} failed={} {}",
                    exec.started_at.format("%Y-%m-%d %H:%M:%S"),
                    exec.job_id,
                    exec.status.as_str(),
                    exec.processed_records,
                    exec.failed_records,
                    exec.error_message.as_deref().unwrap_or("")
                );
            }
            Ok(ExitCode::SUCCESS)
        }

        Commands::Test => {
            println!("config: ok ({} KTO keys, {} KMA keys, zone {})",
                config.kto_keys.len(), config.kma_keys.len(), config.timezone);

            let kernel = BatchKernel::connect(config.clone()).await?;
            sqlx::query_scalar::<_, i32>("SELECT 1")
                .fetch_one(&kernel.db)
                .await
                .context("database check failed")?;
            println!("database: ok");

            // One cheap authenticated read proves a key works end to end.
            let probe = datago_client::tour::area_codes(&config.app_name).paged(1, 1);
            let cancel = CancellationToken::new();
            match kernel.executor.call_rotating(&probe, false, &cancel).await {
                Ok(resp) => {
                    println!("provider: ok ({}ms, key {})", resp.duration_ms, resp.key_hash);
                    Ok(ExitCode::SUCCESS)
                }
                Err(err @ BatchError::QuotaExhausted { .. }) => {
                    println!("provider: {err}");
                    Ok(ExitCode::from(EXIT_QUOTA_EXHAUSTED))
                }
                Err(err) => Err(err).context("provider check failed"),
            }
        }

        Commands::Serve => {
            let kernel = BatchKernel::connect(config.clone()).await?;
            sqlx::migrate!("./migrations")
                .run(&kernel.db)
                .await
                .context("failed to run migrations")?;

            let registry = Arc::new(default_registry(&config));
            let scheduler = Scheduler::new(kernel, registry);

            let shutdown = CancellationToken::new();
            let signal_shutdown = shutdown.clone();
            tokio::spawn(async move {
                tokio::signal::ctrl_c().await.ok();
                tracing::info!("shutdown signal received");
                signal_shutdown.cancel();
            });

            scheduler.run(shutdown).await?;
            Ok(ExitCode::SUCCESS)
        }
    }
}

fn report_execution(exec: &batch_core::kernel::jobs::JobExecution) {
    println!(
        "{} [{}] processed={} failed={}{}",
        exec.job_id,
        exec.status.as_str(),
        exec.processed_records,
        exec.failed_records,
        exec.error_message
            .as_deref()
            .map(|m| format!(" error: {m}"))
            .unwrap_or_default()
    );
}

fn exit_for(status: &ExecutionStatus, error: Option<&BatchError>) -> u8 {
    if matches!(error, Some(BatchError::QuotaExhausted { .. })) {
        return EXIT_QUOTA_EXHAUSTED;
    }
    match status {
        ExecutionStatus::Success | ExecutionStatus::Skipped => 0,
        _ => 1,
    }
}
