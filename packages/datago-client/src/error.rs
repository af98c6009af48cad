//! Typed errors for envelope decoding and provider fault classification.

use thiserror::Error;

/// How a provider-reported failure should be treated by the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderFault {
    /// Daily call ceiling hit for this service key; rotate or cool down.
    RateLimited,
    /// The service key itself was rejected; do not retry with it.
    Auth,
    /// Anything else; retry with backoff.
    Transient,
}

/// Errors surfaced while decoding a provider response.
#[derive(Debug, Error)]
pub enum DatagoError {
    /// The portal answered with a non-success `resultCode`.
    #[error("provider error {code}: {message}")]
    Provider {
        code: String,
        message: String,
        fault: ProviderFault,
    },

    /// The document did not match the expected envelope shape.
    #[error("malformed response envelope: {0}")]
    Envelope(String),

    /// JSON decoding failed.
    #[error("JSON decode error: {0}")]
    Json(#[from] serde_json::Error),
}

impl DatagoError {
    /// Fault classification for this error. Decode failures are treated as
    /// transient: the portal intermittently serves truncated or HTML bodies.
    pub fn fault(&self) -> ProviderFault {
        match self {
            DatagoError::Provider { fault, .. } => *fault,
            DatagoError::Envelope(_) | DatagoError::Json(_) => ProviderFault::Transient,
        }
    }
}

/// Portal result code for a successful call.
pub const RESULT_OK: &str = "00";

const RATE_LIMIT_TEXT: &str = "LIMITED_NUMBER_OF_SERVICE_REQUESTS_EXCEEDS";
const BAD_KEY_TEXT: &str = "SERVICE_KEY_IS_NOT_REGISTERED";

/// Map a portal `resultCode`/`resultMsg` pair onto a fault class.
///
/// The portal publishes a shared code table for every service behind it:
/// 22 is the daily-quota code, 30/31/32 are key registration and contract
/// problems. The message text is consulted as well because some services
/// return the generic code 99 with a descriptive message.
pub fn classify_result_code(code: &str, message: &str) -> ProviderFault {
    match code {
        "22" => ProviderFault::RateLimited,
        "30" | "31" | "32" => ProviderFault::Auth,
        _ => {
            if message.contains(RATE_LIMIT_TEXT) {
                ProviderFault::RateLimited
            } else if message.contains(BAD_KEY_TEXT) {
                ProviderFault::Auth
            } else {
                ProviderFault::Transient
            }
        }
    }
}
