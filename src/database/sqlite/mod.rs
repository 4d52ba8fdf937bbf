use anyhow::{Context, Result};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Pool, Sqlite};
use std::collections::HashMap;
use std::path::Path;
use tracing::{debug, info, warn};

use crate::database::sqlite::models::{CorrectionRow, MetricsRow, PatternRow};
use crate::database::sqlite::queries::{
    ApplicationQueries, CorrectionQueries, MetricsQueries, PatternQueries,
};
use crate::feedback::{CorrectionRecord, Pattern};
use crate::metrics::MetricsSnapshot;

#[cfg(test)]
mod tests;

pub mod models;
pub mod queries;

pub type DbPool = Pool<Sqlite>;

/// Durable correction log, patterns, application counts and metrics history
#[derive(Debug, Clone)]
pub struct Database {
    pool: DbPool,
}

impl Database {
    #[inline]
    pub async fn new<P: AsRef<Path>>(database_path: P) -> Result<Self> {
        let options = SqliteConnectOptions::new()
            .filename(database_path)
            .create_if_missing(true)
            .foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await
            .context("Failed to create database connection pool")?;

        let database = Self { pool };
        database.run_migrations().await?;

        Ok(database)
    }

    #[inline]
    pub fn pool(&self) -> &DbPool {
        &self.pool
    }

    #[inline]
    pub async fn run_migrations(&self) -> Result<()> {
        info!("Running database migrations");

        sqlx::migrate!("src/database/sqlite/migrations")
            .run(&self.pool)
            .await
            .context("Failed to run schema migration")?;

        debug!("Database migrations completed successfully");
        Ok(())
    }

    // Correction operations
    /// Appends a correction; returns false when the id was already stored
    #[inline]
    pub async fn insert_correction(&self, record: &CorrectionRecord) -> Result<bool> {
        let row = CorrectionRow::from_record(record)?;
        CorrectionQueries::insert(&self.pool, &row).await
    }

    /// Every stored correction, oldest first. Rows that fail to decode are skipped.
    #[inline]
    pub async fn list_corrections(&self) -> Result<Vec<CorrectionRecord>> {
        let rows = CorrectionQueries::list_all(&self.pool).await?;
        Ok(decode_rows(rows, CorrectionRow::into_record))
    }

    #[inline]
    pub async fn corrections_for_field(&self, field_path: &str) -> Result<Vec<CorrectionRecord>> {
        let rows = CorrectionQueries::list_by_field(&self.pool, field_path).await?;
        Ok(decode_rows(rows, CorrectionRow::into_record))
    }

    #[inline]
    pub async fn count_corrections(&self) -> Result<i64> {
        CorrectionQueries::count(&self.pool).await
    }

    // Pattern operations
    #[inline]
    pub async fn save_pattern(&self, pattern: &Pattern) -> Result<()> {
        let row = PatternRow::from_pattern(pattern)?;
        PatternQueries::upsert(&self.pool, &row).await
    }

    #[inline]
    pub async fn get_pattern(&self, id: &str) -> Result<Option<Pattern>> {
        PatternQueries::get_by_id(&self.pool, id)
            .await?
            .map(PatternRow::into_pattern)
            .transpose()
    }

    #[inline]
    pub async fn list_patterns(&self) -> Result<Vec<Pattern>> {
        let rows = PatternQueries::list_all(&self.pool).await?;
        Ok(decode_rows(rows, PatternRow::into_pattern))
    }

    // Application counts
    #[inline]
    pub async fn set_applications(&self, field_path: &str, applications: u64) -> Result<()> {
        let applications = i64::try_from(applications).unwrap_or(i64::MAX);
        ApplicationQueries::set(&self.pool, field_path, applications).await
    }

    #[inline]
    pub async fn applications(&self) -> Result<HashMap<String, u64>> {
        ApplicationQueries::totals(&self.pool).await
    }

    // Metrics history
    #[inline]
    pub async fn insert_metrics(&self, snapshot: &MetricsSnapshot) -> Result<i64> {
        let per_field = serde_json::to_string(&snapshot.per_field)
            .context("Failed to encode per-field metrics")?;
        MetricsQueries::insert(
            &self.pool,
            snapshot.accuracy,
            snapshot.precision,
            snapshot.recall,
            snapshot.f1,
            &per_field,
            snapshot.timestamp,
        )
        .await
    }

    #[inline]
    pub async fn list_metrics(&self) -> Result<Vec<MetricsSnapshot>> {
        let rows = MetricsQueries::list_all(&self.pool).await?;
        Ok(decode_rows(rows, MetricsRow::into_snapshot))
    }

    /// Deletes every row in one transaction
    #[inline]
    pub async fn clear_all(&self) -> Result<()> {
        let mut tx = self
            .pool
            .begin()
            .await
            .context("Failed to start transaction")?;

        for table in [
            "corrections",
            "patterns",
            "field_applications",
            "metrics_snapshots",
        ] {
            sqlx::query(&format!("DELETE FROM {table}"))
                .execute(&mut *tx)
                .await
                .with_context(|| format!("Failed to clear {table}"))?;
        }

        tx.commit().await.context("Failed to commit clear")?;
        info!("Cleared all feedback tables");
        Ok(())
    }

    /// Reclaims space and refreshes planner statistics, e.g. after `clear_all`
    #[inline]
    pub async fn optimize(&self) -> Result<()> {
        info!("Optimizing feedback database");

        sqlx::query("VACUUM")
            .execute(&self.pool)
            .await
            .context("Failed to vacuum database")?;

        sqlx::query("ANALYZE")
            .execute(&self.pool)
            .await
            .context("Failed to analyze database")?;

        debug!("Database optimization completed");
        Ok(())
    }
}

fn decode_rows<R, T>(rows: Vec<R>, decode: impl Fn(R) -> Result<T>) -> Vec<T> {
    rows.into_iter()
        .filter_map(|row| match decode(row) {
            Ok(item) => Some(item),
            Err(e) => {
                warn!("Skipping unreadable row: {:#}", e);
                None
            }
        })
        .collect()
}
