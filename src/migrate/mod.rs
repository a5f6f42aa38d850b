use anyhow::{Context, Result};
use sqlx::PgPool;

use crate::config::TablesConfig;

/// Embedded schema step. Every statement is idempotent, so steps are simply
/// re-applied on each startup instead of tracked by version.
struct SchemaStep {
    version: u32,
    name: &'static str,
    sql: &'static str,
    /// Only applied when index management is enabled.
    indexes: bool,
}

/// All embedded schema steps, ordered by version.
static STEPS: &[SchemaStep] = &[
    SchemaStep {
        version: 1,
        name: "totals_table",
        sql: include_str!("sql/001_totals_table.sql"),
        indexes: false,
    },
    SchemaStep {
        version: 2,
        name: "totals_watermark",
        sql: include_str!("sql/002_totals_watermark.sql"),
        indexes: false,
    },
    SchemaStep {
        version: 3,
        name: "lookup_indexes",
        sql: include_str!("sql/003_lookup_indexes.sql"),
        indexes: true,
    },
];

/// Creates the totals table if absent and upgrades older layouts in place.
///
/// Table and column names come from configuration and are substituted into
/// the embedded SQL; `TablesConfig::validate` guarantees they are bare
/// identifiers.
pub struct SchemaManager {
    tables: TablesConfig,
}

impl SchemaManager {
    pub fn new(tables: TablesConfig) -> Self {
        Self { tables }
    }

    /// Renders the statements that `ensure` would execute, in order.
    pub fn statements(&self) -> Vec<(u32, String)> {
        STEPS
            .iter()
            .filter(|step| !step.indexes || self.tables.ensure_indexes)
            .flat_map(|step| {
                split_statements(step.sql)
                    .into_iter()
                    .map(|stmt| (step.version, render(stmt, &self.tables)))
                    .collect::<Vec<_>>()
            })
            .collect()
    }

    /// Applies every schema step.
    pub async fn ensure(&self, pool: &PgPool) -> Result<()> {
        for step in STEPS {
            if step.indexes && !self.tables.ensure_indexes {
                tracing::debug!(version = step.version, "skipping index step");
                continue;
            }

            tracing::debug!(version = step.version, step = step.name, "applying schema step");

            for statement in split_statements(step.sql) {
                let sql = render(statement, &self.tables);
                sqlx::query(&sql).execute(pool).await.with_context(|| {
                    let preview: String = sql.chars().take(80).collect();
                    format!("applying schema step {} ({preview}...)", step.version)
                })?;
            }
        }

        tracing::info!(totals = %self.tables.totals, "totals schema ensured");

        Ok(())
    }
}

/// Substitutes configured table and column names into a statement.
fn render(sql: &str, tables: &TablesConfig) -> String {
    let columns = &tables.sample_columns;
    sql.replace("{totals_ident}", &tables.totals.replace('.', "_"))
        .replace("{samples_ident}", &tables.samples.replace('.', "_"))
        .replace("{totals}", &tables.totals)
        .replace("{samples}", &tables.samples)
        .replace("{entity}", &columns.entity)
        .replace("{date}", &columns.date)
        .replace("{hour}", &columns.hour)
        .replace("{time}", &columns.time)
}

/// Splits SQL text into individual statements by semicolons.
///
/// Handles empty lines, comments, and whitespace-only segments.
fn split_statements(sql: &str) -> Vec<&str> {
    sql.split(';')
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
        .collect()
}
