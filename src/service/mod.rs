use std::sync::Arc;

use anyhow::{Context, Result};
use sqlx::PgPool;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::config::Config;
use crate::health::HealthMetrics;
use crate::rollup::{Aggregator, PassReport};
use crate::scheduler::{RetryPolicy, Scheduler};
use crate::store::postgres::PgStore;
use crate::store::TotalsStore;

/// Service owns the health server, the database pool and the scheduler task.
pub struct Service {
    cfg: Config,
    health: Arc<HealthMetrics>,
    pool: Option<PgPool>,
    scheduler: Option<JoinHandle<()>>,
    cancel: CancellationToken,
}

impl Service {
    /// Creates a new Service, initializing health metrics.
    pub fn new(cfg: Config) -> Result<Self> {
        let health =
            Arc::new(HealthMetrics::new(&cfg.health.addr).context("creating health metrics")?);

        Ok(Self {
            cfg,
            health,
            pool: None,
            scheduler: None,
            cancel: CancellationToken::new(),
        })
    }

    /// Health metrics shared with the scheduler.
    pub fn health(&self) -> &Arc<HealthMetrics> {
        &self.health
    }

    /// Starts the health server and spawns the rollup scheduler.
    ///
    /// The database is not dialed here; the scheduler's readiness gate keeps
    /// retrying until the store answers and the schema is in place.
    pub async fn start(&mut self) -> Result<()> {
        self.health
            .start()
            .await
            .context("starting health metrics server")?;

        let pool = PgStore::connect_lazy(&self.cfg.database)?;
        let store = PgStore::new(
            pool.clone(),
            self.cfg.tables.clone(),
            self.cfg.migrations.enabled,
        );
        let aggregator =
            Aggregator::new(store, &self.cfg.rollup).with_health(Arc::clone(&self.health));

        let rollup = &self.cfg.rollup;
        let scheduler = Scheduler::new(rollup.interval, RetryPolicy::fixed(rollup.retry_delay))
            .with_health(Arc::clone(&self.health));

        info!(
            samples = %self.cfg.tables.samples,
            totals = %self.cfg.tables.totals,
            quorum = rollup.quorum,
            "starting rollup scheduler",
        );

        let cancel = self.cancel.child_token();
        self.scheduler = Some(tokio::spawn(async move {
            scheduler.run(&aggregator, cancel).await;
        }));
        self.pool = Some(pool);

        Ok(())
    }

    /// Stops the scheduler, waits for the in-flight pass, then closes the pool
    /// and the health server.
    pub async fn stop(&mut self) -> Result<()> {
        self.cancel.cancel();

        if let Some(task) = self.scheduler.take() {
            if let Err(e) = task.await {
                error!(error = %e, "rollup scheduler task failed");
            }
        }

        if let Some(pool) = self.pool.take() {
            pool.close().await;
        }

        self.health.stop().await?;

        Ok(())
    }
}

/// Runs a single pass against the configured database.
pub async fn run_once(cfg: &Config) -> Result<PassReport> {
    let pool = PgStore::connect_lazy(&cfg.database)?;
    let store = PgStore::new(pool.clone(), cfg.tables.clone(), cfg.migrations.enabled);
    store.prepare().await.context("preparing postgres store")?;

    let aggregator = Aggregator::new(store, &cfg.rollup);
    let result = aggregator
        .run_pass_now(&CancellationToken::new())
        .await
        .context("running rollup pass");

    pool.close().await;
    result
}

/// Ensures the totals schema and exits.
pub async fn migrate(cfg: &Config) -> Result<()> {
    let pool = PgStore::connect_lazy(&cfg.database)?;
    let store = PgStore::new(pool.clone(), cfg.tables.clone(), true);

    let result = store.ensure_schema().await;
    pool.close().await;
    result
}
