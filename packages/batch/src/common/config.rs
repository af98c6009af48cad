//! Typed environment configuration.
//!
//! Everything the engine needs is read once at startup into [`BatchConfig`];
//! a malformed value aborts the process with a ConfigError. Tests build the
//! struct directly instead of going through the environment.

use std::time::Duration;

use chrono_tz::Tz;
use serde::{Deserialize, Serialize};

use super::error::BatchError;
use crate::pipeline::upsert::TuningPreset;

/// One forecast region: an administrative code plus the coordinates used to
/// derive its KMA grid cell.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WeatherRegion {
    pub code: String,
    pub name: String,
    pub lat: f64,
    pub lon: f64,
}

#[derive(Debug, Clone)]
pub struct BatchConfig {
    pub database_url: String,

    pub kto_base_url: String,
    pub kma_base_url: String,
    /// Comma-separated in `KTO_API_KEYS` / `KMA_API_KEYS`.
    pub kto_keys: Vec<String>,
    pub kma_keys: Vec<String>,
    pub kto_daily_quota: u32,
    pub kma_daily_quota: u32,

    /// IANA zone that anchors the daily quota reset and cron triggers.
    pub timezone: Tz,
    pub app_name: String,

    pub request_timeout: Duration,
    pub max_in_flight_per_provider: usize,
    pub max_in_flight_global: usize,
    pub min_request_interval: Duration,
    pub max_adaptive_delay: Duration,

    pub worker_count: usize,
    pub optimization: TuningPreset,
    pub chunk_size: usize,

    pub alert_cooldown: Duration,
    pub quality_threshold: f64,

    pub regions: Vec<WeatherRegion>,
}

impl BatchConfig {
    /// Read configuration from the environment (after `dotenvy` has run).
    pub fn from_env() -> Result<Self, BatchError> {
        let database_url = require("DATABASE_URL")?;

        let kto_keys = split_keys(&optional("KTO_API_KEYS").unwrap_or_default());
        let kma_keys = split_keys(&optional("KMA_API_KEYS").unwrap_or_default());
        if kto_keys.is_empty() && kma_keys.is_empty() {
            return Err(BatchError::Config(
                "no API keys configured (KTO_API_KEYS / KMA_API_KEYS)".into(),
            ));
        }

        let timezone: Tz = optional("BATCH_TIMEZONE")
            .unwrap_or_else(|| "Asia/Seoul".into())
            .parse()
            .map_err(|_| BatchError::Config("BATCH_TIMEZONE is not a valid IANA zone".into()))?;

        let optimization = match optional("BATCH_OPTIMIZATION").as_deref() {
            None | Some("balanced") => TuningPreset::Balanced,
            Some("conservative") => TuningPreset::Conservative,
            Some("aggressive") => TuningPreset::Aggressive,
            Some("memory_constrained") => TuningPreset::MemoryConstrained,
            Some(other) => {
                return Err(BatchError::Config(format!(
                    "unknown BATCH_OPTIMIZATION preset: {other}"
                )))
            }
        };

        Ok(Self {
            database_url,
            kto_base_url: optional("KTO_BASE_URL")
                .unwrap_or_else(|| "https://apis.data.go.kr/B551011/KorService2".into()),
            kma_base_url: optional("KMA_BASE_URL").unwrap_or_else(|| {
                "https://apis.data.go.kr/1360000/VilageFcstInfoService_2.0".into()
            }),
            kto_keys,
            kma_keys,
            kto_daily_quota: parse_or("KTO_DAILY_QUOTA", 1_000)?,
            kma_daily_quota: parse_or("KMA_DAILY_QUOTA", 10_000)?,
            timezone,
            app_name: optional("BATCH_APP_NAME").unwrap_or_else(|| "WeatherFlick".into()),
            request_timeout: Duration::from_secs(parse_or("REQUEST_TIMEOUT_SECS", 30u64)?),
            max_in_flight_per_provider: parse_or("MAX_IN_FLIGHT_PER_PROVIDER", 5usize)?,
            max_in_flight_global: parse_or("MAX_IN_FLIGHT_GLOBAL", 10usize)?,
            min_request_interval: Duration::from_millis(parse_or(
                "MIN_REQUEST_INTERVAL_MS",
                200u64,
            )?),
            max_adaptive_delay: Duration::from_secs(parse_or("MAX_ADAPTIVE_DELAY_SECS", 30u64)?),
            worker_count: parse_or("BATCH_WORKER_COUNT", 20usize)?,
            optimization,
            chunk_size: parse_or("BATCH_CHUNK_SIZE", 1_000usize)?,
            alert_cooldown: Duration::from_secs(parse_or("ALERT_COOLDOWN_SECS", 3_600u64)?),
            quality_threshold: parse_or("QUALITY_THRESHOLD", 0.8f64)?,
            regions: default_regions(),
        })
    }

    /// Minimal configuration for tests; no environment access.
    pub fn for_tests() -> Self {
        Self {
            database_url: "postgres://localhost/weatherflick_test".into(),
            kto_base_url: "http://127.0.0.1:0".into(),
            kma_base_url: "http://127.0.0.1:0".into(),
            kto_keys: vec!["test-key".into()],
            kma_keys: vec!["test-key".into()],
            kto_daily_quota: 1_000,
            kma_daily_quota: 1_000,
            timezone: chrono_tz::Asia::Seoul,
            app_name: "WeatherFlickTest".into(),
            request_timeout: Duration::from_secs(5),
            max_in_flight_per_provider: 5,
            max_in_flight_global: 10,
            min_request_interval: Duration::ZERO,
            max_adaptive_delay: Duration::from_secs(5),
            worker_count: 4,
            optimization: TuningPreset::Balanced,
            chunk_size: 1_000,
            alert_cooldown: Duration::from_secs(60),
            quality_threshold: 0.8,
            regions: default_regions(),
        }
    }
}

fn require(name: &str) -> Result<String, BatchError> {
    std::env::var(name).map_err(|_| BatchError::Config(format!("{name} is not set")))
}

fn optional(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.is_empty())
}

fn parse_or<T: std::str::FromStr>(name: &str, default: T) -> Result<T, BatchError> {
    match optional(name) {
        None => Ok(default),
        Some(raw) => raw
            .parse()
            .map_err(|_| BatchError::Config(format!("{name} has an invalid value: {raw}"))),
    }
}

fn split_keys(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|k| !k.is_empty())
        .map(str::to_string)
        .collect()
}

/// Major-city defaults; overridable once region config moves to a document.
fn default_regions() -> Vec<WeatherRegion> {
    [
        ("11", "Seoul", 37.5663, 126.9779),
        ("26", "Busan", 35.1796, 129.0756),
        ("27", "Daegu", 35.8714, 128.6014),
        ("28", "Incheon", 37.4563, 126.7052),
        ("29", "Gwangju", 35.1595, 126.8526),
        ("30", "Daejeon", 36.3504, 127.3845),
        ("31", "Ulsan", 35.5384, 129.3114),
        ("41", "Suwon", 37.2636, 127.0286),
        ("50", "Jeju", 33.4996, 126.5312),
    ]
    .into_iter()
    .map(|(code, name, lat, lon)| WeatherRegion {
        code: code.into(),
        name: name.into(),
        lat,
        lon,
    })
    .collect()
}
