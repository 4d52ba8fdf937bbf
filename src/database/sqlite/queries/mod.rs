
use std::collections::HashMap;

use super::models::*;
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use tracing::debug;

const CORRECTION_COLUMNS: &str = "id, field_path, before_value, after_value, redacted_before, \
     redacted_after, source_context, pathology, extraction_method, confidence_before, features, \
     diff, created_at";

const PATTERN_COLUMNS: &str = "id, field_path, pathology, signature, rule, learned_value, \
     confidence, success_count, application_count, enabled, origin_correction_ids, created_at, \
     last_applied_at";

pub struct CorrectionQueries;

impl CorrectionQueries {
    /// Inserts a correction. Existing ids are left untouched; returns whether a row was written.
    #[inline]
    pub async fn insert(pool: &SqlitePool, row: &CorrectionRow) -> Result<bool> {
        let result = sqlx::query(&format!(
            "INSERT OR IGNORE INTO corrections ({CORRECTION_COLUMNS}) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"
        ))
        .bind(&row.id)
        .bind(&row.field_path)
        .bind(&row.before_value)
        .bind(&row.after_value)
        .bind(&row.redacted_before)
        .bind(&row.redacted_after)
        .bind(&row.source_context)
        .bind(&row.pathology)
        .bind(&row.extraction_method)
        .bind(row.confidence_before)
        .bind(&row.features)
        .bind(&row.diff)
        .bind(row.created_at)
        .execute(pool)
        .await
        .with_context(|| format!("Failed to insert correction {}", row.id))?;

        Ok(result.rows_affected() > 0)
    }

    #[inline]
    pub async fn list_all(pool: &SqlitePool) -> Result<Vec<CorrectionRow>> {
        sqlx::query_as::<_, CorrectionRow>(&format!(
            "SELECT {CORRECTION_COLUMNS} FROM corrections ORDER BY created_at ASC"
        ))
        .fetch_all(pool)
        .await
        .context("Failed to list corrections")
    }

    #[inline]
    pub async fn list_by_field(pool: &SqlitePool, field_path: &str) -> Result<Vec<CorrectionRow>> {
        sqlx::query_as::<_, CorrectionRow>(&format!(
            "SELECT {CORRECTION_COLUMNS} FROM corrections WHERE field_path = ? \
             ORDER BY created_at ASC"
        ))
        .bind(field_path)
        .fetch_all(pool)
        .await
        .with_context(|| format!("Failed to list corrections for {field_path}"))
    }

    #[inline]
    pub async fn list_since(pool: &SqlitePool, since: DateTime<Utc>) -> Result<Vec<CorrectionRow>> {
        sqlx::query_as::<_, CorrectionRow>(&format!(
            "SELECT {CORRECTION_COLUMNS} FROM corrections WHERE created_at >= ? \
             ORDER BY created_at ASC"
        ))
        .bind(since)
        .fetch_all(pool)
        .await
        .context("Failed to list recent corrections")
    }

    #[inline]
    pub async fn count(pool: &SqlitePool) -> Result<i64> {
        sqlx::query_scalar("SELECT COUNT(*) FROM corrections")
            .fetch_one(pool)
            .await
            .context("Failed to count corrections")
    }

    #[inline]
    pub async fn count_by_field(pool: &SqlitePool) -> Result<Vec<(String, i64)>> {
        sqlx::query_as(
            "SELECT field_path, COUNT(*) FROM corrections GROUP BY field_path ORDER BY field_path",
        )
        .fetch_all(pool)
        .await
        .context("Failed to count corrections by field")
    }
}

pub struct PatternQueries;

impl PatternQueries {
    /// Inserts or fully replaces a pattern
    #[inline]
    pub async fn upsert(pool: &SqlitePool, row: &PatternRow) -> Result<()> {
        sqlx::query(&format!(
            "INSERT INTO patterns ({PATTERN_COLUMNS}) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?) \
             ON CONFLICT(id) DO UPDATE SET \
                 field_path = excluded.field_path, \
                 pathology = excluded.pathology, \
                 signature = excluded.signature, \
                 rule = excluded.rule, \
                 learned_value = excluded.learned_value, \
                 confidence = excluded.confidence, \
                 success_count = excluded.success_count, \
                 application_count = excluded.application_count, \
                 enabled = excluded.enabled, \
                 origin_correction_ids = excluded.origin_correction_ids, \
                 last_applied_at = excluded.last_applied_at"
        ))
        .bind(&row.id)
        .bind(&row.field_path)
        .bind(&row.pathology)
        .bind(&row.signature)
        .bind(&row.rule)
        .bind(&row.learned_value)
        .bind(row.confidence)
        .bind(row.success_count)
        .bind(row.application_count)
        .bind(row.enabled)
        .bind(&row.origin_correction_ids)
        .bind(row.created_at)
        .bind(row.last_applied_at)
        .execute(pool)
        .await
        .with_context(|| format!("Failed to save pattern {}", row.id))?;

        debug!("Saved pattern {}", row.id);
        Ok(())
    }

    #[inline]
    pub async fn get_by_id(pool: &SqlitePool, id: &str) -> Result<Option<PatternRow>> {
        sqlx::query_as::<_, PatternRow>(&format!(
            "SELECT {PATTERN_COLUMNS} FROM patterns WHERE id = ?"
        ))
        .bind(id)
        .fetch_optional(pool)
        .await
        .with_context(|| format!("Failed to get pattern {id}"))
    }

    #[inline]
    pub async fn list_all(pool: &SqlitePool) -> Result<Vec<PatternRow>> {
        sqlx::query_as::<_, PatternRow>(&format!(
            "SELECT {PATTERN_COLUMNS} FROM patterns ORDER BY created_at ASC"
        ))
        .fetch_all(pool)
        .await
        .context("Failed to list patterns")
    }

    #[inline]
    pub async fn list_enabled_for_field(
        pool: &SqlitePool,
        field_path: &str,
    ) -> Result<Vec<PatternRow>> {
        sqlx::query_as::<_, PatternRow>(&format!(
            "SELECT {PATTERN_COLUMNS} FROM patterns WHERE field_path = ? AND enabled = 1 \
             ORDER BY confidence DESC"
        ))
        .bind(field_path)
        .fetch_all(pool)
        .await
        .with_context(|| format!("Failed to list patterns for {field_path}"))
    }
}

pub struct ApplicationQueries;

impl ApplicationQueries {
    /// Stores the running application total for a field
    #[inline]
    pub async fn set(pool: &SqlitePool, field_path: &str, applications: i64) -> Result<()> {
        sqlx::query(
            "INSERT INTO field_applications (field_path, applications, updated_at) VALUES (?, ?, ?) \
             ON CONFLICT(field_path) DO UPDATE SET \
                 applications = excluded.applications, \
                 updated_at = excluded.updated_at",
        )
        .bind(field_path)
        .bind(applications)
        .bind(Utc::now())
        .execute(pool)
        .await
        .with_context(|| format!("Failed to store applications for {field_path}"))?;

        Ok(())
    }

    #[inline]
    pub async fn list_all(pool: &SqlitePool) -> Result<Vec<FieldApplications>> {
        sqlx::query_as::<_, FieldApplications>(
            "SELECT field_path, applications, updated_at FROM field_applications ORDER BY field_path",
        )
        .fetch_all(pool)
        .await
        .context("Failed to list field applications")
    }

    #[inline]
    pub async fn totals(pool: &SqlitePool) -> Result<HashMap<String, u64>> {
        let rows = Self::list_all(pool).await?;
        Ok(rows
            .into_iter()
            .map(|row| (row.field_path, u64::try_from(row.applications).unwrap_or(0)))
            .collect())
    }
}

pub struct MetricsQueries;

impl MetricsQueries {
    #[inline]
    pub async fn insert(
        pool: &SqlitePool,
        accuracy: f64,
        precision: f64,
        recall: f64,
        f1: f64,
        per_field: &str,
        recorded_at: DateTime<Utc>,
    ) -> Result<i64> {
        let id = sqlx::query(
            "INSERT INTO metrics_snapshots (accuracy, precision_score, recall, f1, per_field, recorded_at) \
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(accuracy)
        .bind(precision)
        .bind(recall)
        .bind(f1)
        .bind(per_field)
        .bind(recorded_at)
        .execute(pool)
        .await
        .context("Failed to store metrics snapshot")?
        .last_insert_rowid();

        Ok(id)
    }

    #[inline]
    pub async fn list_all(pool: &SqlitePool) -> Result<Vec<MetricsRow>> {
        sqlx::query_as::<_, MetricsRow>(
            "SELECT id, accuracy, precision_score, recall, f1, per_field, recorded_at \
             FROM metrics_snapshots ORDER BY recorded_at ASC, id ASC",
        )
        .fetch_all(pool)
        .await
        .context("Failed to list metrics snapshots")
    }

    #[inline]
    pub async fn list_since(pool: &SqlitePool, since: DateTime<Utc>) -> Result<Vec<MetricsRow>> {
        sqlx::query_as::<_, MetricsRow>(
            "SELECT id, accuracy, precision_score, recall, f1, per_field, recorded_at \
             FROM metrics_snapshots WHERE recorded_at >= ? ORDER BY recorded_at ASC, id ASC",
        )
        .bind(since)
        .fetch_all(pool)
        .await
        .context("Failed to list recent metrics snapshots")
    }
}
