//! Static job definitions and triggers.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use typed_builder::TypedBuilder;

use super::runtime::JobParams;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum JobPriority {
    Critical,
    High,
    #[default]
    Normal,
    Low,
}

impl JobPriority {
    /// Lower value sorts first in the ready queue.
    pub fn rank(&self) -> i16 {
        match self {
            JobPriority::Critical => 0,
            JobPriority::High => 1,
            JobPriority::Normal => 2,
            JobPriority::Low => 3,
        }
    }
}

/// When a job fires.
#[derive(Debug, Clone)]
pub enum Trigger {
    /// Six-field cron expression (with seconds) evaluated in the engine's
    /// configured timezone, e.g. `"0 0 2 * * *"` for 02:00 daily.
    Cron(String),
    /// Fixed interval between fires.
    Interval(Duration),
}

impl Trigger {
    /// Approximate period of one trigger cycle; drives the misfire grace
    /// window. For cron this is the gap between the next two occurrences.
    pub fn period(&self) -> Option<Duration> {
        match self {
            Trigger::Interval(d) => Some(*d),
            Trigger::Cron(expr) => {
                let schedule: cron::Schedule = expr.parse().ok()?;
                let mut upcoming = schedule.upcoming(chrono::Utc);
                let first = upcoming.next()?;
                let second = upcoming.next()?;
                (second - first).to_std().ok()
            }
        }
    }
}

/// Static description of one registered job.
#[derive(Debug, Clone, TypedBuilder)]
#[builder(field_defaults(setter(into)))]
pub struct JobDefinition {
    pub id: String,
    pub name: String,
    pub trigger: Trigger,

    #[builder(default = Duration::from_secs(1_800))]
    pub timeout: Duration,
    #[builder(default = 3)]
    pub max_retries: u32,
    #[builder(default = Duration::from_secs(60))]
    pub backoff_base: Duration,
    #[builder(default)]
    pub priority: JobPriority,
    /// Jobs that must have produced a Success within the last 24 h.
    #[builder(default)]
    pub depends_on: Vec<String>,
    #[builder(default = true)]
    pub enabled: bool,
    #[builder(default = JobParams::None)]
    pub params: JobParams,
}
