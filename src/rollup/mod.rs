//! Rollup of presence samples into per-player active-hour totals.
//!
//! A pass reads the hour buckets each player has not had considered yet,
//! counts the buckets that meet the quorum, and commits `total += valid
//! buckets` together with the new watermark. The new watermark is the latest
//! sample time over *all* buckets considered, and the hour holding it is never
//! reopened, so a sub-quorum hour is looked at exactly once and a repeated pass
//! with no new samples writes nothing. The hour still being sampled is always
//! left for a later pass, so one calendar hour is never split across passes.

pub mod quorum;
pub mod watermark;

use std::sync::Arc;

use chrono::NaiveDateTime;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::RollupConfig;
use crate::health::HealthMetrics;
use crate::store::{RollupCommit, StoreError, TotalsStore};
use crate::rollup::quorum::EntityBuckets;
use crate::rollup::watermark::hour_floor;

/// Counters describing one rollup pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PassReport {
    /// Samples in the buckets read past the watermark.
    pub samples_read: usize,
    /// Hour buckets committed, valid or not.
    pub buckets_considered: u32,
    /// Committed buckets that met the quorum.
    pub valid_buckets: u32,
    /// Entity rows committed.
    pub entities_updated: u32,
    /// Active hours added across all entities.
    pub hours_added: i64,
    /// Entities skipped because their watermark would have regressed.
    pub regressions: u32,
    /// The pass stopped early on cancellation.
    pub cancelled: bool,
}

impl PassReport {
    /// True when the pass committed nothing.
    pub fn is_empty(&self) -> bool {
        self.entities_updated == 0
    }
}

/// Folds new samples into per-entity totals through a [`TotalsStore`].
pub struct Aggregator<S> {
    store: S,
    quorum: u32,
    health: Option<Arc<HealthMetrics>>,
}

impl<S: TotalsStore> Aggregator<S> {
    /// Creates an aggregator over `store` using the rollup settings.
    pub fn new(store: S, cfg: &RollupConfig) -> Self {
        Self {
            store,
            quorum: cfg.quorum.max(1),
            health: None,
        }
    }

    /// Attaches health metrics.
    pub fn with_health(mut self, health: Arc<HealthMetrics>) -> Self {
        self.health = Some(health);
        self
    }

    /// Returns the underlying store.
    pub fn store(&self) -> &S {
        &self.store
    }

    /// Runs one pass as of the store's clock, the clock samples are stamped
    /// with.
    pub async fn run_pass_now(&self, cancel: &CancellationToken) -> Result<PassReport, StoreError> {
        let now = self.store.now().await?;
        self.run_pass(now, cancel).await
    }

    /// Runs one pass as of `now`.
    ///
    /// Hours starting at or after the hour holding `now` are left for a later
    /// pass. Each entity is committed in its own transaction. A store failure
    /// aborts the rest of the pass and is returned; entities committed before
    /// it stay committed and the failing entity is left untouched. A watermark
    /// regression only skips that entity. Cancellation is honored between
    /// entity commits.
    pub async fn run_pass(
        &self,
        now: NaiveDateTime,
        cancel: &CancellationToken,
    ) -> Result<PassReport, StoreError> {
        let mut report = PassReport::default();

        let buckets = self.store.pending_buckets(hour_floor(now)).await?;
        report.samples_read = buckets.iter().map(|b| b.sample_count as usize).sum();

        if buckets.is_empty() {
            debug!(store = self.store.name(), "no hours past watermarks");
            return Ok(report);
        }

        let summaries = quorum::summarize(&buckets, self.quorum);
        let result = self.commit_all(summaries, now, cancel, &mut report).await;

        // Recorded on abort too, so hours committed before the failure count.
        if let Some(health) = &self.health {
            health.record_pass(&report);
        }

        result.map(|()| report)
    }

    async fn commit_all(
        &self,
        summaries: Vec<EntityBuckets>,
        now: NaiveDateTime,
        cancel: &CancellationToken,
        report: &mut PassReport,
    ) -> Result<(), StoreError> {
        for summary in summaries {
            if cancel.is_cancelled() {
                report.cancelled = true;
                info!(
                    committed = report.entities_updated,
                    "rollup pass cancelled between entities"
                );
                break;
            }

            let commit = RollupCommit {
                entity_id: summary.entity_id,
                delta_hours: i64::from(summary.valid),
                watermark: summary.latest,
                updated_at: now,
            };

            match self.store.commit(&commit).await {
                Ok(()) => {
                    report.entities_updated += 1;
                    report.buckets_considered += summary.considered;
                    report.valid_buckets += summary.valid;
                    report.hours_added += commit.delta_hours;
                    debug!(
                        entity_id = %commit.entity_id,
                        hours = commit.delta_hours,
                        watermark = %commit.watermark,
                        "entity total advanced",
                    );
                }
                Err(StoreError::Watermark(e)) => {
                    report.regressions += 1;
                    warn!(error = %e, "skipping entity with regressing watermark");
                }
                Err(e) => {
                    warn!(
                        entity_id = %commit.entity_id,
                        committed = report.entities_updated,
                        error = %e,
                        "commit failed, aborting rollup pass",
                    );
                    return Err(e);
                }
            }
        }

        Ok(())
    }
}
