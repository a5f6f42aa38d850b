pub mod memory;
pub mod postgres;

use chrono::{NaiveDate, NaiveDateTime};
use thiserror::Error;

use crate::rollup::quorum::HourBucket;
use crate::rollup::watermark::WatermarkError;

/// One raw presence observation, written by the external sample producer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PresenceSample {
    pub entity_id: String,
    pub calendar_date: NaiveDate,
    /// Nominal hour bucket, 0-23.
    pub hour_of_day: u8,
    pub sample_time: NaiveDateTime,
}

/// Persisted running total for one entity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntityTotal {
    pub entity_id: String,
    pub total_hours: i64,
    /// Latest sample time already folded into `total_hours`.
    pub watermark: NaiveDateTime,
    pub updated_at: NaiveDateTime,
}

/// Increment for one entity, applied as a single transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RollupCommit {
    pub entity_id: String,
    pub delta_hours: i64,
    pub watermark: NaiveDateTime,
    pub updated_at: NaiveDateTime,
}

/// Errors surfaced by a [`TotalsStore`].
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error(transparent)]
    Watermark(#[from] WatermarkError),

    #[error("ensuring schema: {0:#}")]
    Schema(anyhow::Error),

    #[error("store unavailable: {0}")]
    Unavailable(String),
}

/// Storage seam between the rollup aggregator and the totals/samples tables.
pub trait TotalsStore: Send + Sync {
    /// Returns the store's name for logging.
    fn name(&self) -> &str;

    /// Verifies connectivity and makes sure the totals schema exists.
    fn prepare(&self) -> impl std::future::Future<Output = Result<(), StoreError>> + Send;

    /// Current time on the clock the sample producer stamps rows with.
    fn now(&self) -> impl std::future::Future<Output = Result<NaiveDateTime, StoreError>> + Send;

    /// Returns the hour buckets each entity has not yet had considered, ordered
    /// by key. Only hours after the hour holding the entity's watermark and
    /// before `cutoff` are returned; entities without a totals row use the
    /// epoch. Samples with an hour outside 0-23 are ignored.
    fn pending_buckets(
        &self,
        cutoff: NaiveDateTime,
    ) -> impl std::future::Future<Output = Result<Vec<HourBucket>, StoreError>> + Send;

    /// Returns the committed watermark for an entity, or the epoch if unknown.
    fn read_watermark(
        &self,
        entity_id: &str,
    ) -> impl std::future::Future<Output = Result<NaiveDateTime, StoreError>> + Send;

    /// Seeds the entity's row if needed, then adds `delta_hours` and advances
    /// the watermark in one transaction. Fails with
    /// [`StoreError::Watermark`] and leaves the row untouched if the new
    /// watermark is older than the stored one.
    fn commit(
        &self,
        commit: &RollupCommit,
    ) -> impl std::future::Future<Output = Result<(), StoreError>> + Send;

    /// Reads one entity's total row.
    fn total(
        &self,
        entity_id: &str,
    ) -> impl std::future::Future<Output = Result<Option<EntityTotal>, StoreError>> + Send;
}
