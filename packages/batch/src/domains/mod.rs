//! Domain jobs and the default schedule wiring.

pub mod maintenance;
pub mod tourism;
pub mod weather;

use std::time::Duration;

use datago_client::ContentType;

use crate::common::BatchConfig;
use crate::kernel::jobs::{JobDefinition, JobParams, JobPriority, JobRegistry, Trigger};
use crate::quality::QualityGateJob;
use maintenance::{ArchivePurgeJob, KeyProbeJob};
use tourism::{ComprehensiveTourismJob, IncrementalTourismJob, DEFAULT_AREA_CODES};
use weather::{HistoricalWeatherJob, WeatherHarvestJob};

/// Build the standard registry: every production job with its trigger,
/// dependencies, and parameters.
pub fn default_registry(config: &BatchConfig) -> JobRegistry {
    let mut registry = JobRegistry::new();

    registry.register(
        JobDefinition::builder()
            .id("comprehensive-tourism")
            .name("Comprehensive tourism harvest")
            .trigger(Trigger::Cron("0 0 2 * * *".into()))
            .timeout(Duration::from_secs(3 * 3_600))
            .priority(JobPriority::High)
            .params(JobParams::Tourism {
                area_codes: DEFAULT_AREA_CODES.iter().map(|s| s.to_string()).collect(),
                content_types: ContentType::ALL.to_vec(),
            })
            .build(),
        || Box::new(ComprehensiveTourismJob),
    );

    registry.register(
        JobDefinition::builder()
            .id("incremental-tourism")
            .name("Incremental tourism harvest")
            .trigger(Trigger::Interval(Duration::from_secs(6 * 3_600)))
            .timeout(Duration::from_secs(3_600))
            .params(JobParams::TourismIncremental { lookback_days: 3 })
            .build(),
        || Box::new(IncrementalTourismJob),
    );

    registry.register(
        JobDefinition::builder()
            .id("weather-harvest")
            .name("Weather harvest")
            .trigger(Trigger::Interval(Duration::from_secs(3 * 3_600)))
            .timeout(Duration::from_secs(1_800))
            .priority(JobPriority::High)
            .params(JobParams::Weather {
                regions: config.regions.clone(),
            })
            .build(),
        || Box::new(WeatherHarvestJob),
    );

    registry.register(
        JobDefinition::builder()
            .id("historical-weather")
            .name("Historical weather rollup")
            .trigger(Trigger::Cron("0 30 1 * * *".into()))
            .timeout(Duration::from_secs(900))
            .depends_on(vec!["weather-harvest".to_string()])
            .params(JobParams::HistoricalWeather { lookback_days: 7 })
            .build(),
        || Box::new(HistoricalWeatherJob),
    );

    registry.register(
        JobDefinition::builder()
            .id("quality-gate")
            .name("Data quality gate")
            .trigger(Trigger::Cron("0 0 4 * * *".into()))
            .timeout(Duration::from_secs(900))
            .max_retries(1u32)
            .depends_on(vec![
                "comprehensive-tourism".to_string(),
                "weather-harvest".to_string(),
            ])
            .params(JobParams::QualityGate)
            .build(),
        || Box::new(QualityGateJob),
    );

    registry.register(
        JobDefinition::builder()
            .id("archive-purge")
            .name("Raw archive retention sweep")
            .trigger(Trigger::Cron("0 0 5 * * *".into()))
            .timeout(Duration::from_secs(900))
            .priority(JobPriority::Low)
            .params(JobParams::ArchivePurge)
            .build(),
        || Box::new(ArchivePurgeJob),
    );

    registry.register(
        JobDefinition::builder()
            .id("key-probe")
            .name("Disabled key probe")
            .trigger(Trigger::Interval(Duration::from_secs(15 * 60)))
            .timeout(Duration::from_secs(120))
            .max_retries(0u32)
            .priority(JobPriority::Low)
            .build(),
        || Box::new(KeyProbeJob),
    );

    registry
}
