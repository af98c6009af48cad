//! BatchKernel: the explicit dependency container handed to every job.
//!
//! No module-level singletons anywhere in the engine; jobs receive exactly
//! this context, and tests build a fresh one per case.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use datago_client::Provider;
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;

use super::archive::{ArchiveWriter, MemoryArchiveWriter, PgArchiveWriter};
use super::executor::HttpExecutor;
use super::governor::ConcurrencyGovernor;
use super::jobs::{ExecutionLedger, MemoryExecutionLedger, PgExecutionLedger};
use super::keys::{KeyRegistry, MemoryQuotaStore, PgQuotaStore};
use super::notify::{AlertGate, CollectingNotifier, LogNotifier, Notifier};
use crate::common::BatchConfig;

pub struct BatchKernel {
    pub config: BatchConfig,
    pub db: PgPool,
    pub keys: Arc<KeyRegistry>,
    pub governor: Arc<ConcurrencyGovernor>,
    pub executor: Arc<HttpExecutor>,
    pub archive: Arc<dyn ArchiveWriter>,
    pub ledger: Arc<dyn ExecutionLedger>,
    pub alerts: Arc<AlertGate>,
}

impl BatchKernel {
    /// Connect to Postgres and assemble the production kernel.
    pub async fn connect(config: BatchConfig) -> Result<Arc<Self>> {
        let db = PgPoolOptions::new()
            .max_connections(15)
            .acquire_timeout(Duration::from_secs(10))
            .connect(&config.database_url)
            .await
            .context("failed to connect to the database")?;

        Self::with_pool(config, db).await
    }

    /// Assemble the kernel over an existing pool (migration CLI, tests with
    /// a real database).
    pub async fn with_pool(config: BatchConfig, db: PgPool) -> Result<Arc<Self>> {
        let quota_store = Arc::new(PgQuotaStore::new(db.clone()));
        let archive: Arc<dyn ArchiveWriter> = Arc::new(PgArchiveWriter::new(db.clone()));
        let ledger: Arc<dyn ExecutionLedger> = Arc::new(PgExecutionLedger::new(db.clone()));
        let notifier: Arc<dyn Notifier> = Arc::new(LogNotifier);

        Self::assemble(config, db, quota_store, archive, ledger, notifier).await
    }

    async fn assemble(
        config: BatchConfig,
        db: PgPool,
        quota_store: Arc<dyn super::keys::QuotaStore>,
        archive: Arc<dyn ArchiveWriter>,
        ledger: Arc<dyn ExecutionLedger>,
        notifier: Arc<dyn Notifier>,
    ) -> Result<Arc<Self>> {
        let keys = Arc::new(
            KeyRegistry::new(
                config.timezone,
                quota_store,
                vec![
                    (Provider::Kto, config.kto_keys.clone(), config.kto_daily_quota),
                    (Provider::Kma, config.kma_keys.clone(), config.kma_daily_quota),
                ],
            )
            .await?,
        );

        let governor = Arc::new(ConcurrencyGovernor::new(
            &[Provider::Kto, Provider::Kma],
            config.max_in_flight_per_provider,
            config.max_in_flight_global,
            config.min_request_interval,
            config.max_adaptive_delay,
        ));

        let http = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()
            .context("failed to build the HTTP client")?;

        let executor = Arc::new(HttpExecutor::new(
            http,
            keys.clone(),
            governor.clone(),
            archive.clone(),
            config.kto_base_url.clone(),
            config.kma_base_url.clone(),
        ));

        let alerts = Arc::new(AlertGate::new(notifier, config.alert_cooldown));

        Ok(Arc::new(Self {
            config,
            db,
            keys,
            governor,
            executor,
            archive,
            ledger,
            alerts,
        }))
    }

    /// Fully in-memory kernel for unit tests. The pool is lazy and never
    /// touched unless a test reaches for real SQL.
    pub async fn for_tests() -> Arc<Self> {
        Self::test_parts().await.kernel
    }

    pub async fn test_parts() -> TestKernelParts {
        let config = BatchConfig::for_tests();
        let db = PgPoolOptions::new()
            .connect_lazy(&config.database_url)
            .expect("lazy pool construction cannot fail");

        let archive = Arc::new(MemoryArchiveWriter::new());
        let ledger = Arc::new(MemoryExecutionLedger::new());
        let notifier = Arc::new(CollectingNotifier::new());

        let kernel = Self::assemble(
            config,
            db,
            Arc::new(MemoryQuotaStore::new()),
            archive.clone(),
            ledger.clone(),
            notifier.clone(),
        )
        .await
        .expect("in-memory kernel assembly cannot fail");

        TestKernelParts {
            kernel,
            archive,
            ledger,
            notifier,
        }
    }
}

/// Handles to the in-memory collaborators of a test kernel.
pub struct TestKernelParts {
    pub kernel: Arc<BatchKernel>,
    pub archive: Arc<MemoryArchiveWriter>,
    pub ledger: Arc<MemoryExecutionLedger>,
    pub notifier: Arc<CollectingNotifier>,
}
