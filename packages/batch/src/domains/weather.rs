//! Weather harvest jobs.
//!
//! KMA products arrive as one record per (category, slot) pair; the pivots
//! fold them into one row per observation or forecast slot before the
//! upsert. The historical job rolls finished forecast days up into the
//! daily table entirely in SQL.

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use datago_client::envelope::decode_page;
use datago_client::grid::to_grid;
use datago_client::weather::{forecast, BaseDateTime, ForecastKind};
use serde_json::{json, Value};
use tracing::info;
use uuid::Uuid;

use crate::common::{BatchError, WeatherRegion};
use crate::kernel::jobs::{BatchJob, JobContext, JobMetrics, JobParams};
use crate::pipeline::transform::{trimmed, ColValue, TypedRow};
use crate::pipeline::{BulkUpsertEngine, UpsertPlan};

const CURRENT_CONFLICT: &[&str] = &["region_code", "observed_at"];
const FORECAST_CONFLICT: &[&str] = &["region_code", "forecast_date", "forecast_time"];

/// Nowcast plus short-term and village forecasts for every region.
pub struct WeatherHarvestJob;

/// Daily rollup of finished forecast days into `historical_weather_daily`.
pub struct HistoricalWeatherJob;

#[async_trait]
impl BatchJob for WeatherHarvestJob {
    fn job_type(&self) -> &'static str {
        "weather_harvest"
    }

    async fn validate(&self, ctx: &JobContext) -> Result<(), BatchError> {
        if ctx.kernel.config.kma_keys.is_empty() {
            return Err(BatchError::Config("no KMA keys configured".into()));
        }
        match &ctx.params {
            JobParams::Weather { regions } if !regions.is_empty() => Ok(()),
            JobParams::Weather { .. } => Err(BatchError::Validation {
                reason: "weather params carry no regions".into(),
            }),
            _ => Err(BatchError::Validation {
                reason: "expected weather params".into(),
            }),
        }
    }

    async fn execute(&self, ctx: &JobContext) -> Result<JobMetrics, BatchError> {
        let JobParams::Weather { regions } = &ctx.params else {
            return Err(BatchError::Validation {
                reason: "expected weather params".into(),
            });
        };

        let now = Utc::now().with_timezone(&ctx.kernel.config.timezone);
        let mut current_rows: Vec<TypedRow> = Vec::new();
        let mut forecast_rows: Vec<TypedRow> = Vec::new();

        for region in regions {
            ctx.check_cancelled()?;
            let grid = to_grid(region.lat, region.lon);

            // Nowcast: one row per region.
            let base = BaseDateTime::nowcast(now.clone());
            let request = forecast(ForecastKind::Nowcast, &base, grid);
            let response = ctx
                .kernel
                .executor
                .call_rotating(&request, true, &ctx.cancel)
                .await?;
            let page = decode_page::<Value>(&response.body)
                .map_err(|e| BatchError::transient(format!("nowcast decode failed: {e}")))?;
            let synced_at = response.archived_at.unwrap_or_else(Utc::now);
            if let Some(row) = pivot_nowcast(region, &base, &page.items, response.raw_id, synced_at)
            {
                current_rows.push(row);
            }

            // Short-term then village forecast; village values win on
            // overlapping slots via merge order.
            for (kind, base) in [
                (ForecastKind::ShortTerm, BaseDateTime::short_term(now.clone())),
                (ForecastKind::Village, BaseDateTime::village(now.clone())),
            ] {
                ctx.check_cancelled()?;
                let request = forecast(kind, &base, grid);
                let response = ctx
                    .kernel
                    .executor
                    .call_rotating(&request, true, &ctx.cancel)
                    .await?;
                let page = decode_page::<Value>(&response.body).map_err(|e| {
                    BatchError::transient(format!("{} decode failed: {e}", kind.as_str()))
                })?;
                let synced_at = response.archived_at.unwrap_or_else(Utc::now);
                forecast_rows.extend(pivot_forecast(
                    region,
                    &page.items,
                    response.raw_id,
                    synced_at,
                ));
            }
        }

        let forecast_rows = merge_forecast_rows(forecast_rows);

        let engine = BulkUpsertEngine::from_preset(
            ctx.kernel.db.clone(),
            ctx.kernel.config.optimization,
        );
        let mut metrics = JobMetrics::default();

        for (table, conflict, rows) in [
            ("weather_current", CURRENT_CONFLICT, current_rows),
            ("weather_forecasts", FORECAST_CONFLICT, forecast_rows),
        ] {
            if rows.is_empty() {
                continue;
            }
            let report = engine
                .execute(&UpsertPlan::new(table, conflict, rows), &ctx.cancel)
                .await?;
            info!(
                table,
                landed = report.successful_records,
                failed = report.failed_records,
                "weather rows landed"
            );
            ctx.kernel
                .ledger
                .append_detail(
                    ctx.execution_id,
                    table,
                    json!({
                        "landed": report.successful_records,
                        "failed": report.failed_records,
                    }),
                )
                .await
                .ok();
            if report.aborted {
                return Err(BatchError::Conflict {
                    table: table.to_string(),
                    message: "bulk upsert aborted after consecutive chunk failures".into(),
                });
            }
            metrics.processed_records += report.successful_records as i64;
            metrics.failed_records += report.failed_records as i64;
        }

        Ok(metrics)
    }
}

#[async_trait]
impl BatchJob for HistoricalWeatherJob {
    fn job_type(&self) -> &'static str {
        "historical_weather"
    }

    async fn execute(&self, ctx: &JobContext) -> Result<JobMetrics, BatchError> {
        let JobParams::HistoricalWeather { lookback_days } = &ctx.params else {
            return Err(BatchError::Validation {
                reason: "expected historical weather params".into(),
            });
        };

        let today = Utc::now().with_timezone(&ctx.kernel.config.timezone);
        let upper = today.format("%Y%m%d").to_string();
        let lower = (today - Duration::days(*lookback_days))
            .format("%Y%m%d")
            .to_string();

        let rolled = sqlx::query(
            r#"
            INSERT INTO historical_weather_daily (
                id, region_code, weather_date, avg_temp, min_temp, max_temp,
                avg_humidity, data_quality_score, processing_status, last_sync_at
            )
            SELECT gen_random_uuid(), region_code, forecast_date,
                   AVG(temperature),
                   MIN(COALESCE(min_temp, temperature)),
                   MAX(COALESCE(max_temp, temperature)),
                   AVG(humidity),
                   1.0, 'processed', NOW()
            FROM weather_forecasts
            WHERE forecast_date >= $1 AND forecast_date < $2
              AND temperature IS NOT NULL
            GROUP BY region_code, forecast_date
            ON CONFLICT (region_code, weather_date) DO UPDATE SET
                avg_temp = EXCLUDED.avg_temp,
                min_temp = EXCLUDED.min_temp,
                max_temp = EXCLUDED.max_temp,
                avg_humidity = EXCLUDED.avg_humidity,
                last_sync_at = NOW()
            "#,
        )
        .bind(&lower)
        .bind(&upper)
        .execute(&ctx.kernel.db)
        .await
        .map_err(BatchError::from)?
        .rows_affected();

        info!(rolled, lower, upper, "historical weather rolled up");
        Ok(JobMetrics {
            processed_records: rolled as i64,
            failed_records: 0,
        })
    }
}

/// Fold nowcast category records into one observation row. Pure: the sync
/// stamp is the archived call's instant, so replay is reproducible.
pub fn pivot_nowcast(
    region: &WeatherRegion,
    base: &BaseDateTime,
    items: &[Value],
    raw_id: Option<Uuid>,
    synced_at: DateTime<Utc>,
) -> Option<TypedRow> {
    if items.is_empty() {
        return None;
    }

    let mut by_category: BTreeMap<String, String> = BTreeMap::new();
    for item in items {
        let (Some(category), Some(value)) = (
            trimmed(item.get("category")),
            trimmed(item.get("obsrValue")),
        ) else {
            continue;
        };
        by_category.insert(category, value);
    }

    let observed_at = format!("{}{}00", base.base_date, base.base_time);
    let important = ["T1H", "REH", "WSD"];
    let present = important
        .iter()
        .filter(|c| by_category.contains_key(**c))
        .count();
    let quality_score = present as f64 / important.len() as f64;

    let num = |key: &str| ColValue::Float(by_category.get(key).and_then(|v| v.parse().ok()));
    Some(TypedRow {
        columns: vec![
            ("region_code", ColValue::Text(Some(region.code.clone()))),
            ("region_name", ColValue::Text(Some(region.name.clone()))),
            ("observed_at", ColValue::Text(Some(observed_at))),
            ("temperature", num("T1H")),
            ("humidity", num("REH")),
            ("rainfall_1h", num("RN1")),
            ("wind_speed", num("WSD")),
            ("wind_direction", num("VEC")),
            (
                "precipitation_type",
                ColValue::Text(by_category.get("PTY").cloned()),
            ),
            ("raw_data_id", ColValue::Uuid(raw_id)),
            ("data_quality_score", ColValue::Float(Some(quality_score))),
            ("processing_status", ColValue::Text(Some("processed".into()))),
            ("last_sync_at", ColValue::Timestamp(Some(synced_at))),
        ],
        quality_score,
    })
}

/// Fold forecast category records into one row per forecast slot. Pure,
/// like [`pivot_nowcast`].
pub fn pivot_forecast(
    region: &WeatherRegion,
    items: &[Value],
    raw_id: Option<Uuid>,
    synced_at: DateTime<Utc>,
) -> Vec<TypedRow> {
    let mut slots: BTreeMap<(String, String), BTreeMap<String, String>> = BTreeMap::new();
    for item in items {
        let (Some(date), Some(time), Some(category), Some(value)) = (
            trimmed(item.get("fcstDate")),
            trimmed(item.get("fcstTime")),
            trimmed(item.get("category")),
            trimmed(item.get("fcstValue")),
        ) else {
            continue;
        };
        slots.entry((date, time)).or_default().insert(category, value);
    }

    slots
        .into_iter()
        .map(|((date, time), categories)| {
            let num = |key: &str| ColValue::Float(categories.get(key).and_then(|v| v.parse().ok()));
            // Village forecasts carry TMP; the short-term product uses T1H.
            let temperature = ColValue::Float(
                categories
                    .get("TMP")
                    .or_else(|| categories.get("T1H"))
                    .and_then(|v| v.parse().ok()),
            );
            let has_temp = !matches!(temperature, ColValue::Float(None));
            let quality_score =
                (has_temp as u8 as f64 + categories.contains_key("REH") as u8 as f64) / 2.0;

            TypedRow {
                columns: vec![
                    ("region_code", ColValue::Text(Some(region.code.clone()))),
                    ("region_name", ColValue::Text(Some(region.name.clone()))),
                    ("forecast_date", ColValue::Text(Some(date))),
                    ("forecast_time", ColValue::Text(Some(time))),
                    ("temperature", temperature),
                    ("min_temp", num("TMN")),
                    ("max_temp", num("TMX")),
                    ("humidity", num("REH")),
                    ("precipitation_prob", num("POP")),
                    (
                        "precipitation_type",
                        ColValue::Text(categories.get("PTY").cloned()),
                    ),
                    (
                        "sky_condition",
                        ColValue::Text(categories.get("SKY").cloned()),
                    ),
                    ("wind_speed", num("WSD")),
                    ("raw_data_id", ColValue::Uuid(raw_id)),
                    ("data_quality_score", ColValue::Float(Some(quality_score))),
                    ("processing_status", ColValue::Text(Some("processed".into()))),
                    ("last_sync_at", ColValue::Timestamp(Some(synced_at))),
                ],
                quality_score,
            }
        })
        .collect()
}

/// Collapse duplicate forecast slots, filling null columns from later rows.
/// One slot must appear once per upsert statement, and village values are
/// appended after short-term ones so they win.
pub fn merge_forecast_rows(rows: Vec<TypedRow>) -> Vec<TypedRow> {
    let mut merged: BTreeMap<(String, String, String), TypedRow> = BTreeMap::new();

    for row in rows {
        let key = (
            text_of(&row, "region_code"),
            text_of(&row, "forecast_date"),
            text_of(&row, "forecast_time"),
        );
        match merged.get_mut(&key) {
            None => {
                merged.insert(key, row);
            }
            Some(existing) => {
                for (name, value) in row.columns {
                    if value.is_null() {
                        continue;
                    }
                    if let Some((_, slot)) =
                        existing.columns.iter_mut().find(|(n, _)| *n == name)
                    {
                        *slot = value;
                    }
                }
            }
        }
    }

    merged.into_values().collect()
}

fn text_of(row: &TypedRow, column: &str) -> String {
    match row.get(column) {
        Some(ColValue::Text(Some(s))) => s.clone(),
        _ => String::new(),
    }
}
