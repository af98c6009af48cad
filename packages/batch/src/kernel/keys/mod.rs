//! Service-key management: rotation, cooldowns, quota accounting.

mod registry;
mod store;

pub use registry::{
    hash_secret, CallOutcome, KeyRegistry, KeySnapshot, KeyState, LeasedKey, ProviderSnapshot,
};
pub use store::{MemoryQuotaStore, PgQuotaStore, QuotaStore};
