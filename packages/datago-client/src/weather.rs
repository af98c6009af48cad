//! Request builders for the KMA village-forecast services.

use chrono::{DateTime, Duration, TimeZone, Timelike};
use serde::{Deserialize, Serialize};

use crate::grid::GridPoint;
use crate::request::ProviderRequest;
use crate::Provider;

/// Forecast families offered by the village-forecast service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ForecastKind {
    /// Observations for the current hour (`getUltraSrtNcst`).
    Nowcast,
    /// Six-hour outlook (`getUltraSrtFcst`).
    ShortTerm,
    /// Three-day village forecast (`getVilageFcst`).
    Village,
}

impl ForecastKind {
    pub fn endpoint(&self) -> &'static str {
        match self {
            ForecastKind::Nowcast => "getUltraSrtNcst",
            ForecastKind::ShortTerm => "getUltraSrtFcst",
            ForecastKind::Village => "getVilageFcst",
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ForecastKind::Nowcast => "nowcast",
            ForecastKind::ShortTerm => "short_term",
            ForecastKind::Village => "village",
        }
    }
}

/// A `base_date`/`base_time` pair acceptable to the service.
///
/// The KMA publishes each product on a fixed cadence and rejects requests
/// for a base time that has not been issued yet, so "now" must be rounded
/// down past the publication delay.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BaseDateTime {
    /// `YYYYMMDD`.
    pub base_date: String,
    /// `HHMM`.
    pub base_time: String,
}

impl BaseDateTime {
    /// Nowcast base: every hour on the hour, available from ~HH:40.
    pub fn nowcast<Tz: TimeZone>(now: DateTime<Tz>) -> Self
    where
        Tz::Offset: std::fmt::Display,
    {
        let effective = if now.minute() < 40 {
            now - Duration::hours(1)
        } else {
            now
        };
        Self {
            base_date: effective.format("%Y%m%d").to_string(),
            base_time: format!("{:02}00", effective.hour()),
        }
    }

    /// Short-term forecast base: every hour at HH30, available from ~HH:45.
    pub fn short_term<Tz: TimeZone>(now: DateTime<Tz>) -> Self
    where
        Tz::Offset: std::fmt::Display,
    {
        let effective = if now.minute() < 45 {
            now - Duration::hours(1)
        } else {
            now
        };
        Self {
            base_date: effective.format("%Y%m%d").to_string(),
            base_time: format!("{:02}30", effective.hour()),
        }
    }

    /// Village forecast base: eight daily slots, available ~10 min after
    /// each. Before 02:10 the latest issue is yesterday 23:00.
    pub fn village<Tz: TimeZone>(now: DateTime<Tz>) -> Self
    where
        Tz::Offset: std::fmt::Display,
    {
        const SLOTS: [u32; 8] = [2, 5, 8, 11, 14, 17, 20, 23];

        let minutes = now.hour() * 60 + now.minute();
        let slot = SLOTS
            .iter()
            .rev()
            .find(|&&h| minutes >= h * 60 + 10)
            .copied();

        match slot {
            Some(h) => Self {
                base_date: now.format("%Y%m%d").to_string(),
                base_time: format!("{h:02}00"),
            },
            None => {
                let yesterday = now - Duration::days(1);
                Self {
                    base_date: yesterday.format("%Y%m%d").to_string(),
                    base_time: "2300".into(),
                }
            }
        }
    }
}

/// Build a forecast request for one grid point.
pub fn forecast(kind: ForecastKind, base: &BaseDateTime, grid: GridPoint) -> ProviderRequest {
    let rows = match kind {
        // Nowcast returns 8 categories; forecasts return hundreds of rows.
        ForecastKind::Nowcast => 10,
        ForecastKind::ShortTerm => 60,
        ForecastKind::Village => 1000,
    };

    ProviderRequest::new(Provider::Kma, kind.endpoint())
        .param("dataType", "JSON")
        .param("base_date", base.base_date.clone())
        .param("base_time", base.base_time.clone())
        .param("nx", grid.nx.to_string())
        .param("ny", grid.ny.to_string())
        .paged(1, rows)
}
