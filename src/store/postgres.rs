//! PostgreSQL store backed by `sqlx`.
//!
//! Each [`RollupCommit`] runs in its own transaction:
//! ```sql
//! BEGIN;
//! INSERT INTO totals ... ON CONFLICT (player_name) DO NOTHING;   -- seed
//! SELECT last_processed_at FROM totals
//!     WHERE player_name = $1 FOR UPDATE;                         -- lock
//! -- reject if the new watermark is older than the stored one
//! UPDATE totals SET total_hours = total_hours + $2, ...;         -- apply
//! COMMIT;
//! ```
//! Any failure drops the transaction, which rolls it back, so the total and
//! the watermark always move together.
//!
//! Pending samples are grouped into hour buckets by the database, so a pass
//! reads one row per entity-hour instead of the raw sample history.

use std::time::Duration;

use anyhow::Context;
use chrono::{NaiveDate, NaiveDateTime};
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::Row;
use tracing::warn;

use super::{EntityTotal, RollupCommit, StoreError, TotalsStore};
use crate::config::{DatabaseConfig, TablesConfig};
use crate::migrate::SchemaManager;
use crate::rollup::quorum::{BucketKey, HourBucket};
use crate::rollup::watermark::{check_advance, epoch};

/// SQL rendered once from the configured table and column names.
#[derive(Debug, Clone)]
struct Queries {
    now: String,
    pending: String,
    watermark: String,
    seed: String,
    lock: String,
    apply: String,
    total: String,
}

impl Queries {
    fn new(tables: &TablesConfig) -> Self {
        let samples = &tables.samples;
        let totals = &tables.totals;
        let c = &tables.sample_columns;

        // Eligibility is decided on the hour key: only hours after the hour
        // holding the watermark and before the open hour are returned.
        let pending = format!(
            "SELECT s.{entity}::TEXT AS entity_id, s.{date} AS calendar_date, \
             s.{hour}::INT4 AS hour_of_day, COUNT(*)::INT8 AS sample_count, \
             MAX(s.{time}) AS bucket_time \
             FROM {samples} s \
             LEFT JOIN {totals} t ON t.player_name = s.{entity} \
             WHERE s.{hour} BETWEEN 0 AND 23 \
             AND s.{time} > COALESCE(t.last_processed_at, $1) \
             AND s.{date} + s.{hour} * INTERVAL '1 hour' \
             > date_trunc('hour', COALESCE(t.last_processed_at, $1)) \
             AND s.{date} + s.{hour} * INTERVAL '1 hour' < date_trunc('hour', $2::TIMESTAMP) \
             GROUP BY s.{entity}, s.{date}, s.{hour} \
             ORDER BY s.{entity}, s.{date}, s.{hour}",
            entity = c.entity,
            date = c.date,
            hour = c.hour,
            time = c.time,
        );

        let watermark = format!(
            "SELECT COALESCE(last_processed_at, $2) FROM {totals} WHERE player_name = $1"
        );

        let seed = format!(
            "INSERT INTO {totals} (player_name, total_hours, last_processed_at, updated_at) \
             VALUES ($1, 0, $2, $3) \
             ON CONFLICT (player_name) DO NOTHING"
        );

        let lock = format!(
            "SELECT COALESCE(last_processed_at, $2) FROM {totals} \
             WHERE player_name = $1 FOR UPDATE"
        );

        let apply = format!(
            "UPDATE {totals} \
             SET total_hours = total_hours + $2, last_processed_at = $3, updated_at = $4 \
             WHERE player_name = $1"
        );

        let total = format!(
            "SELECT player_name, total_hours::INT8 AS total_hours, \
             COALESCE(last_processed_at, $2) AS last_processed_at, updated_at \
             FROM {totals} WHERE player_name = $1"
        );

        Self {
            now: "SELECT LOCALTIMESTAMP".to_string(),
            pending,
            watermark,
            seed,
            lock,
            apply,
            total,
        }
    }
}

/// Totals store on a PostgreSQL pool.
pub struct PgStore {
    pool: PgPool,
    queries: Queries,
    schema: SchemaManager,
    ensure_schema: bool,
}

impl PgStore {
    /// Creates a store on an existing pool.
    pub fn new(pool: PgPool, tables: TablesConfig, ensure_schema: bool) -> Self {
        Self {
            pool,
            queries: Queries::new(&tables),
            schema: SchemaManager::new(tables),
            ensure_schema,
        }
    }

    /// Builds a lazily connecting pool; nothing is dialed until first use.
    pub fn connect_lazy(cfg: &DatabaseConfig) -> anyhow::Result<PgPool> {
        PgPoolOptions::new()
            .max_connections(cfg.max_connections)
            .min_connections(cfg.min_connections)
            .acquire_timeout(cfg.acquire_timeout)
            .idle_timeout(Some(Duration::from_secs(600)))
            .connect_lazy(&cfg.url)
            .context("configuring PostgreSQL pool")
    }

    /// Returns the underlying pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Applies the schema steps regardless of the startup setting.
    pub async fn ensure_schema(&self) -> anyhow::Result<()> {
        self.schema.ensure(&self.pool).await
    }
}

impl TotalsStore for PgStore {
    fn name(&self) -> &str {
        "postgres"
    }

    async fn prepare(&self) -> Result<(), StoreError> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;

        if self.ensure_schema {
            self.schema
                .ensure(&self.pool)
                .await
                .map_err(StoreError::Schema)?;
        }

        Ok(())
    }

    async fn now(&self) -> Result<NaiveDateTime, StoreError> {
        let (now,): (NaiveDateTime,) = sqlx::query_as(&self.queries.now)
            .fetch_one(&self.pool)
            .await?;
        Ok(now)
    }

    async fn pending_buckets(&self, cutoff: NaiveDateTime) -> Result<Vec<HourBucket>, StoreError> {
        let rows = sqlx::query(&self.queries.pending)
            .bind(epoch())
            .bind(cutoff)
            .fetch_all(&self.pool)
            .await?;

        let mut buckets = Vec::with_capacity(rows.len());
        for row in rows {
            let entity_id: String = row.try_get("entity_id")?;
            let calendar_date: NaiveDate = row.try_get("calendar_date")?;
            let hour: i32 = row.try_get("hour_of_day")?;
            let sample_count: i64 = row.try_get("sample_count")?;
            let bucket_time: NaiveDateTime = row.try_get("bucket_time")?;

            // The query already restricts hours to 0-23.
            let Ok(hour_of_day) = u8::try_from(hour) else {
                warn!(%entity_id, hour, "skipping bucket with invalid hour");
                continue;
            };

            buckets.push(HourBucket {
                key: BucketKey {
                    entity_id,
                    calendar_date,
                    hour_of_day,
                },
                sample_count: u32::try_from(sample_count).unwrap_or(u32::MAX),
                bucket_time,
            });
        }

        Ok(buckets)
    }

    async fn read_watermark(&self, entity_id: &str) -> Result<NaiveDateTime, StoreError> {
        let row: Option<(NaiveDateTime,)> = sqlx::query_as(&self.queries.watermark)
            .bind(entity_id)
            .bind(epoch())
            .fetch_optional(&self.pool)
            .await?;

        Ok(row.map_or_else(epoch, |(watermark,)| watermark))
    }

    async fn commit(&self, commit: &RollupCommit) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(&self.queries.seed)
            .bind(&commit.entity_id)
            .bind(epoch())
            .bind(commit.updated_at)
            .execute(&mut *tx)
            .await?;

        let (current,): (NaiveDateTime,) = sqlx::query_as(&self.queries.lock)
            .bind(&commit.entity_id)
            .bind(epoch())
            .fetch_one(&mut *tx)
            .await?;

        // Returning early drops `tx`, which rolls back the seed insert too.
        check_advance(&commit.entity_id, current, commit.watermark)?;

        sqlx::query(&self.queries.apply)
            .bind(&commit.entity_id)
            .bind(commit.delta_hours)
            .bind(commit.watermark)
            .bind(commit.updated_at)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;

        Ok(())
    }

    async fn total(&self, entity_id: &str) -> Result<Option<EntityTotal>, StoreError> {
        let row: Option<(String, i64, NaiveDateTime, NaiveDateTime)> =
            sqlx::query_as(&self.queries.total)
                .bind(entity_id)
                .bind(epoch())
                .fetch_optional(&self.pool)
                .await?;

        Ok(
            row.map(|(entity_id, total_hours, watermark, updated_at)| EntityTotal {
                entity_id,
                total_hours,
                watermark,
                updated_at,
            }),
        )
    }
}
