//! Declarative per-table quality specifications.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Relative weights of the four quality dimensions; equal by default.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct DimensionWeights {
    pub completeness: f64,
    pub validity: f64,
    pub consistency: f64,
    pub freshness: f64,
}

impl Default for DimensionWeights {
    fn default() -> Self {
        Self {
            completeness: 1.0,
            validity: 1.0,
            consistency: 1.0,
            freshness: 1.0,
        }
    }
}

impl DimensionWeights {
    pub fn total(&self) -> f64 {
        self.completeness + self.validity + self.consistency + self.freshness
    }
}

/// What "good" means for one target table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QualitySpec {
    pub table: String,
    /// Columns that must be non-null for a row to count as complete.
    pub required_columns: Vec<String>,
    /// 8-or-14-digit stamp column driving the freshness dimension.
    pub date_column: Option<String>,
    pub freshness_threshold_days: i64,
    /// Columns whose value groups should be unique.
    pub duplicate_key_columns: Vec<String>,
    /// Numeric columns with inclusive (min, max) bounds.
    pub value_ranges: BTreeMap<String, (f64, f64)>,
    #[serde(default)]
    pub weights: DimensionWeights,
    /// A table fails when the overall score drops below this.
    pub fail_threshold: f64,
}

impl QualitySpec {
    fn tourism(table: &str, threshold: f64) -> Self {
        Self {
            table: table.to_string(),
            required_columns: vec!["content_id".into(), "title".into()],
            date_column: Some("last_sync_at".into()),
            freshness_threshold_days: 7,
            duplicate_key_columns: vec!["content_id".into()],
            value_ranges: BTreeMap::from([
                ("latitude".into(), (32.0, 39.0)),
                ("longitude".into(), (123.0, 132.0)),
            ]),
            weights: DimensionWeights::default(),
            fail_threshold: threshold,
        }
    }

    fn forecasts(threshold: f64) -> Self {
        Self {
            table: "weather_forecasts".into(),
            required_columns: vec![
                "region_code".into(),
                "forecast_date".into(),
                "forecast_time".into(),
                "min_temp".into(),
            ],
            date_column: Some("forecast_date".into()),
            freshness_threshold_days: 1,
            duplicate_key_columns: vec![
                "region_code".into(),
                "forecast_date".into(),
                "forecast_time".into(),
            ],
            value_ranges: BTreeMap::from([
                ("temperature".into(), (-50.0, 60.0)),
                ("min_temp".into(), (-50.0, 60.0)),
                ("max_temp".into(), (-50.0, 60.0)),
                ("humidity".into(), (0.0, 100.0)),
                ("precipitation_prob".into(), (0.0, 100.0)),
            ]),
            weights: DimensionWeights::default(),
            fail_threshold: threshold,
        }
    }

    fn current(threshold: f64) -> Self {
        Self {
            table: "weather_current".into(),
            required_columns: vec!["region_code".into(), "observed_at".into()],
            date_column: Some("observed_at".into()),
            freshness_threshold_days: 1,
            duplicate_key_columns: vec!["region_code".into(), "observed_at".into()],
            value_ranges: BTreeMap::from([
                ("temperature".into(), (-50.0, 60.0)),
                ("humidity".into(), (0.0, 100.0)),
            ]),
            weights: DimensionWeights::default(),
            fail_threshold: threshold,
        }
    }

    fn historical(threshold: f64) -> Self {
        Self {
            table: "historical_weather_daily".into(),
            required_columns: vec!["region_code".into(), "weather_date".into()],
            date_column: Some("weather_date".into()),
            freshness_threshold_days: 3,
            duplicate_key_columns: vec!["region_code".into(), "weather_date".into()],
            value_ranges: BTreeMap::from([
                ("avg_temp".into(), (-50.0, 60.0)),
                ("min_temp".into(), (-50.0, 60.0)),
                ("max_temp".into(), (-50.0, 60.0)),
            ]),
            weights: DimensionWeights::default(),
            fail_threshold: threshold,
        }
    }
}

/// The default gate configuration over every published table.
pub fn default_specs(threshold: f64) -> Vec<QualitySpec> {
    let mut specs: Vec<QualitySpec> = [
        "tourist_attractions",
        "cultural_facilities",
        "festivals_events",
        "travel_courses",
        "leisure_sports",
        "accommodations",
        "shopping",
        "restaurants",
    ]
    .iter()
    .map(|t| QualitySpec::tourism(t, threshold))
    .collect();

    specs.push(QualitySpec::current(threshold));
    specs.push(QualitySpec::forecasts(threshold));
    specs.push(QualitySpec::historical(threshold));
    specs
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_specs_cover_all_published_tables() {
        let specs = default_specs(0.8);
        assert_eq!(specs.len(), 11);
        assert!(specs.iter().any(|s| s.table == "weather_forecasts"));
        assert!(specs.iter().any(|s| s.table == "restaurants"));
    }

    #[test]
    fn forecast_temperature_range_matches_the_gate_contract() {
        let specs = default_specs(0.8);
        let forecasts = specs
            .iter()
            .find(|s| s.table == "weather_forecasts")
            .unwrap();
        assert_eq!(forecasts.value_ranges.get("min_temp"), Some(&(-50.0, 60.0)));
        // min_temp drives completeness as well as validity.
        assert!(forecasts.required_columns.contains(&"min_temp".to_string()));
    }

    #[test]
    fn equal_weights_sum_to_four() {
        assert_eq!(DimensionWeights::default().total(), 4.0);
    }
}
