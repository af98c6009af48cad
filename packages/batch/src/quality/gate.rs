//! Quality scoring and the gate over landed tables.
//!
//! Statistics gathering is SQL; scoring is pure so the arithmetic is
//! testable without a database. A table failing its threshold is surfaced
//! through the gate job's own execution status, which downstream jobs
//! observe as a failed dependency.

use anyhow::{Context, Result};
use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use sqlx::PgPool;
use tracing::{info, warn};
use uuid::Uuid;

use super::spec::QualitySpec;
use crate::common::BatchError;

/// Raw counts for one table, gathered in one inspection pass.
#[derive(Debug, Clone, Default)]
pub struct TableStats {
    pub total_rows: i64,
    pub complete_rows: i64,
    /// Per range-checked column: (rows checked, rows inside bounds).
    /// A NULL value is not inside any bounds, so it counts against the
    /// column.
    pub range_checks: Vec<(String, i64, i64)>,
    pub duplicate_groups: i64,
    pub has_fresh_row: bool,
}

/// Scored result for one table.
#[derive(Debug, Clone, Serialize)]
pub struct QualityReport {
    pub table: String,
    pub completeness: f64,
    pub validity: f64,
    pub consistency: f64,
    pub freshness: f64,
    pub overall: f64,
    pub passed: bool,
    pub total_rows: i64,
    pub checked_at: DateTime<Utc>,
}

/// Score one table's stats against its spec. Pure.
pub fn score(spec: &QualitySpec, stats: &TableStats) -> QualityReport {
    let completeness = if stats.total_rows > 0 {
        stats.complete_rows as f64 / stats.total_rows as f64
    } else {
        0.0
    };

    let (checked, in_range) = stats
        .range_checks
        .iter()
        .fold((0i64, 0i64), |(c, r), (_, checked, in_range)| {
            (c + checked, r + in_range)
        });
    let validity = if checked > 0 {
        in_range as f64 / checked as f64
    } else if stats.total_rows > 0 {
        1.0
    } else {
        0.0
    };

    let consistency = if stats.total_rows > 0 {
        1.0 - stats.duplicate_groups as f64 / stats.total_rows as f64
    } else {
        0.0
    };

    let freshness = if stats.has_fresh_row { 1.0 } else { 0.0 };

    let w = &spec.weights;
    let overall = ((completeness * w.completeness
        + validity * w.validity
        + consistency * w.consistency
        + freshness * w.freshness)
        / w.total())
    .clamp(0.0, 1.0);

    QualityReport {
        table: spec.table.clone(),
        completeness,
        validity,
        consistency,
        freshness,
        overall,
        passed: overall >= spec.fail_threshold,
        total_rows: stats.total_rows,
        checked_at: Utc::now(),
    }
}

pub struct QualityGate {
    db: PgPool,
}

impl QualityGate {
    pub fn new(db: PgPool) -> Self {
        Self { db }
    }

    /// Gather stats, score, persist the report, and return it. The stored
    /// threshold row, when present, overrides the spec's threshold.
    pub async fn check_table(&self, spec: &QualitySpec) -> Result<QualityReport, BatchError> {
        let mut spec = spec.clone();
        for column in spec
            .required_columns
            .iter()
            .chain(spec.duplicate_key_columns.iter())
            .chain(spec.date_column.iter())
            .chain(spec.value_ranges.keys())
        {
            validate_ident(column)?;
        }
        validate_ident(&spec.table)?;

        if let Some(threshold) = self.stored_threshold(&spec.table).await? {
            spec.fail_threshold = threshold;
        }

        let stats = self
            .gather(&spec)
            .await
            .map_err(|e| BatchError::transient(format!("quality inspection failed: {e}")))?;
        let report = score(&spec, &stats);

        if report.passed {
            info!(table = %report.table, overall = report.overall, "quality gate passed");
        } else {
            warn!(
                table = %report.table,
                overall = report.overall,
                completeness = report.completeness,
                validity = report.validity,
                consistency = report.consistency,
                freshness = report.freshness,
                "quality gate FAILED"
            );
        }

        self.persist(&report)
            .await
            .map_err(|e| BatchError::transient(format!("quality report write failed: {e}")))?;
        Ok(report)
    }

    async fn stored_threshold(&self, table: &str) -> Result<Option<f64>, BatchError> {
        let threshold = sqlx::query_scalar::<_, f64>(
            "SELECT min_overall FROM data_quality_thresholds WHERE table_name = $1",
        )
        .bind(table)
        .fetch_optional(&self.db)
        .await
        .map_err(BatchError::from)?;
        Ok(threshold)
    }

    async fn gather(&self, spec: &QualitySpec) -> Result<TableStats> {
        let mut stats = TableStats::default();

        stats.total_rows =
            sqlx::query_scalar::<_, i64>(&format!("SELECT COUNT(*) FROM {}", spec.table))
                .fetch_one(&self.db)
                .await
                .context("row count")?;

        if stats.total_rows == 0 {
            return Ok(stats);
        }

        // Completeness: every required column non-null.
        let predicate = spec
            .required_columns
            .iter()
            .map(|c| format!("{c} IS NOT NULL"))
            .collect::<Vec<_>>()
            .join(" AND ");
        stats.complete_rows = sqlx::query_scalar::<_, i64>(&format!(
            "SELECT COUNT(*) FROM {} WHERE {}",
            spec.table, predicate
        ))
        .fetch_one(&self.db)
        .await
        .context("completeness count")?;

        // Validity: range membership over every row; a NULL does not fall
        // within any declared range.
        for (column, (min, max)) in &spec.value_ranges {
            let in_range = sqlx::query_scalar::<_, i64>(&format!(
                "SELECT COUNT(*) FILTER (WHERE {column} BETWEEN $1 AND $2) FROM {}",
                spec.table
            ))
            .bind(min)
            .bind(max)
            .fetch_one(&self.db)
            .await
            .context("range check")?;
            stats
                .range_checks
                .push((column.clone(), stats.total_rows, in_range));
        }

        // Consistency: key groups occurring more than once.
        if !spec.duplicate_key_columns.is_empty() {
            let keys = spec.duplicate_key_columns.join(", ");
            stats.duplicate_groups = sqlx::query_scalar::<_, i64>(&format!(
                "SELECT COUNT(*) FROM (SELECT 1 FROM {} GROUP BY {} HAVING COUNT(*) > 1) dup",
                spec.table, keys
            ))
            .fetch_one(&self.db)
            .await
            .context("duplicate check")?;
        }

        // Freshness: at least one row inside the window. Date columns are
        // either digit stamps (YYYYMMDD[HHMMSS]) or timestamps; stripping
        // non-digits normalizes both so a YYYYMMDD cutoff prefix-compares.
        if let Some(date_column) = &spec.date_column {
            let cutoff = (Utc::now() - Duration::days(spec.freshness_threshold_days))
                .format("%Y%m%d")
                .to_string();
            stats.has_fresh_row = sqlx::query_scalar::<_, bool>(&format!(
                "SELECT EXISTS(SELECT 1 FROM {} WHERE \
                 regexp_replace({date_column}::TEXT, '[^0-9]', '', 'g') >= $1)",
                spec.table
            ))
            .bind(cutoff)
            .fetch_one(&self.db)
            .await
            .context("freshness check")?;
        } else {
            stats.has_fresh_row = true;
        }

        Ok(stats)
    }

    async fn persist(&self, report: &QualityReport) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO data_quality_checks (
                id, table_name, completeness, validity, consistency,
                freshness, overall, passed, total_rows, checked_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(&report.table)
        .bind(report.completeness)
        .bind(report.validity)
        .bind(report.consistency)
        .bind(report.freshness)
        .bind(report.overall)
        .bind(report.passed)
        .bind(report.total_rows)
        .bind(report.checked_at)
        .execute(&self.db)
        .await?;
        Ok(())
    }
}

/// Identifiers are interpolated into inspection SQL; only plain lowercase
/// names from our own configuration pass.
fn validate_ident(ident: &str) -> Result<(), BatchError> {
    let ok = !ident.is_empty()
        && ident
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
        && !ident.starts_with(|c: char| c.is_ascii_digit());
    if ok {
        Ok(())
    } else {
        Err(BatchError::Config(format!(
            "invalid identifier in quality spec: {ident}"
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::quality::spec::default_specs;
    use std::collections::BTreeMap;

    fn forecast_spec() -> QualitySpec {
        default_specs(0.5)
            .into_iter()
            .find(|s| s.table == "weather_forecasts")
            .unwrap()
    }

    /// One row of a table, every column as value-or-NULL. Mirrors exactly
    /// what the gather queries would compute against these rows, so specs
    /// can be exercised end to end without a database.
    type Row = BTreeMap<&'static str, Option<f64>>;

    fn gather_in_memory(spec: &QualitySpec, rows: &[Row], has_fresh_row: bool) -> TableStats {
        let is_present = |row: &Row, column: &str| {
            row.get(column).map(|v| v.is_some()).unwrap_or(false)
        };

        let total_rows = rows.len() as i64;
        let complete_rows = rows
            .iter()
            .filter(|row| spec.required_columns.iter().all(|c| is_present(row, c)))
            .count() as i64;

        let range_checks = spec
            .value_ranges
            .iter()
            .map(|(column, (min, max))| {
                let in_range = rows
                    .iter()
                    .filter(|row| {
                        row.get(column.as_str())
                            .copied()
                            .flatten()
                            .map(|v| v >= *min && v <= *max)
                            .unwrap_or(false)
                    })
                    .count() as i64;
                (column.clone(), total_rows, in_range)
            })
            .collect();

        TableStats {
            total_rows,
            complete_rows,
            range_checks,
            duplicate_groups: 0,
            has_fresh_row,
        }
    }

    #[test]
    fn all_dimensions_perfect_scores_one() {
        let spec = forecast_spec();
        let stats = TableStats {
            total_rows: 1_000,
            complete_rows: 1_000,
            range_checks: vec![("min_temp".into(), 1_000, 1_000)],
            duplicate_groups: 0,
            has_fresh_row: true,
        };
        let report = score(&spec, &stats);
        assert!((report.overall - 1.0).abs() < 1e-9);
        assert!(report.passed);
    }

    #[test]
    fn sparse_required_columns_fail_the_gate() {
        // 900 of 1000 rows with min_temp NULL: completeness 0.1 and the
        // min_temp range check degraded to 0.1 as well.
        let spec = forecast_spec();
        let stats = TableStats {
            total_rows: 1_000,
            complete_rows: 100,
            range_checks: vec![
                ("temperature".into(), 1_000, 1_000),
                ("min_temp".into(), 1_000, 100),
                ("max_temp".into(), 1_000, 1_000),
                ("humidity".into(), 1_000, 1_000),
                ("precipitation_prob".into(), 1_000, 1_000),
            ],
            duplicate_groups: 0,
            has_fresh_row: false,
        };
        let report = score(&spec, &stats);
        assert!((report.completeness - 0.1).abs() < 1e-9);
        assert!(report.overall < 0.5);
        assert!(!report.passed);
    }

    #[test]
    fn null_min_temp_rows_block_the_forecast_table() {
        // 1000 landed forecast rows, 900 with min_temp NULL, driven through
        // the shipped weather_forecasts spec rather than synthetic stats.
        let spec = forecast_spec();

        let rows: Vec<Row> = (0..1_000)
            .map(|i| {
                BTreeMap::from([
                    ("region_code", Some(11.0)),
                    ("forecast_date", Some(20_260_315.0)),
                    ("forecast_time", Some(600.0)),
                    ("temperature", Some(8.0)),
                    ("min_temp", if i < 100 { Some(3.0) } else { None }),
                    ("max_temp", Some(12.0)),
                    ("humidity", Some(60.0)),
                    ("precipitation_prob", Some(30.0)),
                ])
            })
            .collect();

        let stats = gather_in_memory(&spec, &rows, false);
        let report = score(&spec, &stats);

        assert!((report.completeness - 0.1).abs() < 1e-9);
        assert!(report.overall < 0.5, "overall was {}", report.overall);
        assert!(!report.passed);
    }

    #[test]
    fn empty_table_scores_zero_and_fails() {
        let spec = forecast_spec();
        let report = score(&spec, &TableStats::default());
        assert_eq!(report.overall, 0.0);
        assert!(!report.passed);
    }

    #[test]
    fn duplicates_erode_consistency() {
        let spec = forecast_spec();
        let stats = TableStats {
            total_rows: 100,
            complete_rows: 100,
            range_checks: vec![],
            duplicate_groups: 25,
            has_fresh_row: true,
        };
        let report = score(&spec, &stats);
        assert!((report.consistency - 0.75).abs() < 1e-9);
    }

    #[test]
    fn no_range_columns_means_validity_is_vacuously_full() {
        let spec = forecast_spec();
        let stats = TableStats {
            total_rows: 10,
            complete_rows: 10,
            range_checks: vec![],
            duplicate_groups: 0,
            has_fresh_row: true,
        };
        assert_eq!(score(&spec, &stats).validity, 1.0);
    }

    #[test]
    fn overall_is_clamped_and_weighted() {
        let mut spec = forecast_spec();
        spec.weights.freshness = 0.0;
        let stats = TableStats {
            total_rows: 10,
            complete_rows: 10,
            range_checks: vec![("min_temp".into(), 10, 10)],
            duplicate_groups: 0,
            has_fresh_row: false,
        };
        // Freshness is zero but carries no weight.
        assert!((score(&spec, &stats).overall - 1.0).abs() < 1e-9);
    }

    #[test]
    fn identifier_validation_rejects_injection() {
        assert!(validate_ident("weather_forecasts").is_ok());
        assert!(validate_ident("min_temp").is_ok());
        assert!(validate_ident("t; DROP TABLE x").is_err());
        assert!(validate_ident("1col").is_err());
        assert!(validate_ident("").is_err());
    }
}
