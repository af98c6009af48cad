//! Client library for the Korean public-data portal APIs.
//!
//! Covers the two upstream providers of the batch platform:
//! - KTO (Korea Tourism Organization) — area-based content listings,
//!   festivals, detail lookups
//! - KMA (Korea Meteorological Administration) — nowcast, short-term and
//!   village forecasts on the KMA Lambert grid
//!
//! The crate is transport-free: it builds [`ProviderRequest`] values and
//! decodes the portal's response envelope, while the caller owns the HTTP
//! client, the service key, and the retry policy. This keeps key rotation
//! and raw-response archival out of the protocol layer.
//!
//! # Example
//!
//! ```rust,ignore
//! use datago_client::{tour, ContentType};
//!
//! let req = tour::area_based_list(ContentType::TouristAttraction, Some("1"), "WeatherFlick")
//!     .paged(1, 100);
//! // caller composes req.endpoint + req.params + serviceKey and sends it
//! ```

pub mod envelope;
pub mod error;
pub mod grid;
pub mod request;
pub mod tour;
pub mod weather;

pub use envelope::{ApiEnvelope, PageSlice};
pub use error::{DatagoError, ProviderFault};
pub use grid::GridPoint;
pub use request::{PageCursor, ProviderRequest};
pub use tour::ContentType;

use serde::{Deserialize, Serialize};

/// Result alias for envelope decoding.
pub type Result<T> = std::result::Result<T, DatagoError>;

/// Upstream data providers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Provider {
    /// Korea Tourism Organization open API.
    Kto,
    /// Korea Meteorological Administration open API.
    Kma,
}

impl Provider {
    /// Stable lowercase tag used in persistence and log fields.
    pub fn as_str(&self) -> &'static str {
        match self {
            Provider::Kto => "kto",
            Provider::Kma => "kma",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "kto" => Some(Provider::Kto),
            "kma" => Some(Provider::Kma),
            _ => None,
        }
    }
}

impl std::fmt::Display for Provider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn provider_tags_round_trip() {
        assert_eq!(Provider::parse("kto"), Some(Provider::Kto));
        assert_eq!(Provider::parse("kma"), Some(Provider::Kma));
        assert_eq!(Provider::parse("nws"), None);
        assert_eq!(Provider::Kto.to_string(), "kto");
    }
}
