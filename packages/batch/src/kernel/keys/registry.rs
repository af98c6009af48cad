//! Multi-key registry with rotation, cooldowns, and daily-quota accounting.
//!
//! Each provider owns an ordered ring of service keys. `acquire` hands out
//! the next usable key round-robin; `record` feeds call outcomes back into
//! the per-key state machine:
//!
//! ```text
//! Active ──quota hit──► Exhausted ──local midnight──► Active
//! Active ──rate limit──► Cooling ──1h elapsed───────► Active
//! Active ──5 transient─► Disabled ──30m + probe ok──► Active
//! Active ──auth error──► Disabled (manual reactivation only)
//! ```
//!
//! Counters survive restarts through the write-through [`QuotaStore`];
//! secrets never leave this module except inside a [`LeasedKey`], and only
//! the short hash ever reaches logs or persistence.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Duration, NaiveDate, Utc};
use chrono_tz::Tz;
use datago_client::Provider;
use sha2::{Digest, Sha256};
use tokio::sync::Mutex;
use tracing::{info, warn};

use super::store::QuotaStore;
use crate::common::BatchError;

const COOLING_PERIOD: i64 = 3_600; // seconds; rate-limit cooldown
const DISABLE_PERIOD: i64 = 1_800; // seconds; transient-error cooldown
const MAX_CONSECUTIVE_ERRORS: u32 = 5;

/// Outcome of one call made with a leased key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallOutcome {
    Ok,
    RateLimited,
    TransientError,
    AuthError,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyState {
    Active,
    Cooling,
    Exhausted,
    Disabled,
}

impl KeyState {
    pub fn as_str(&self) -> &'static str {
        match self {
            KeyState::Active => "active",
            KeyState::Cooling => "cooling",
            KeyState::Exhausted => "exhausted",
            KeyState::Disabled => "disabled",
        }
    }
}

#[derive(Clone)]
struct ApiKey {
    secret: String,
    key_hash: String,
    daily_quota: u32,
    usage_today: u32,
    consecutive_errors: u32,
    total_calls: u64,
    total_successes: u64,
    state: KeyState,
    cooldown_until: Option<DateTime<Utc>>,
    last_used_at: Option<DateTime<Utc>>,
}

impl ApiKey {
    fn new(secret: String, daily_quota: u32) -> Self {
        let key_hash = hash_secret(&secret);
        Self {
            secret,
            key_hash,
            daily_quota,
            usage_today: 0,
            consecutive_errors: 0,
            total_calls: 0,
            total_successes: 0,
            state: KeyState::Active,
            cooldown_until: None,
            last_used_at: None,
        }
    }

    fn remaining(&self) -> u32 {
        self.daily_quota.saturating_sub(self.usage_today)
    }
}

/// A key checked out for the duration of one call.
#[derive(Clone)]
pub struct LeasedKey {
    pub provider: Provider,
    pub key_hash: String,
    pub secret: String,
    pub remaining: u32,
}

// The secret must not leak through debug formatting.
impl std::fmt::Debug for LeasedKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LeasedKey")
            .field("provider", &self.provider)
            .field("key_hash", &self.key_hash)
            .field("remaining", &self.remaining)
            .finish_non_exhaustive()
    }
}

/// Observability snapshot for one key (no secret).
#[derive(Debug, Clone, serde::Serialize)]
pub struct KeySnapshot {
    pub key_hash: String,
    pub state: &'static str,
    pub usage_today: u32,
    pub daily_quota: u32,
    pub consecutive_errors: u32,
    pub total_calls: u64,
    pub total_successes: u64,
    pub cooldown_until: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct ProviderSnapshot {
    pub provider: Provider,
    pub day: NaiveDate,
    pub keys: Vec<KeySnapshot>,
}

struct ProviderRing {
    keys: Vec<ApiKey>,
    cursor: usize,
    day: NaiveDate,
}

/// Short stable identifier for a secret: first 12 hex chars of SHA-256.
pub fn hash_secret(secret: &str) -> String {
    let digest = Sha256::digest(secret.as_bytes());
    hex::encode(digest)[..12].to_string()
}

pub struct KeyRegistry {
    timezone: Tz,
    store: Arc<dyn QuotaStore>,
    rings: Mutex<HashMap<Provider, ProviderRing>>,
}

impl KeyRegistry {
    /// Build the registry and rehydrate today's usage from the quota store.
    pub async fn new(
        timezone: Tz,
        store: Arc<dyn QuotaStore>,
        providers: Vec<(Provider, Vec<String>, u32)>,
    ) -> anyhow::Result<Self> {
        let now = Utc::now();
        let day = now.with_timezone(&timezone).date_naive();
        let mut rings = HashMap::new();

        for (provider, secrets, quota) in providers {
            let persisted = store.load_day(provider, day).await?;
            let mut keys: Vec<ApiKey> = secrets
                .into_iter()
                .map(|s| ApiKey::new(s, quota))
                .collect();

            for key in &mut keys {
                if let Some(used) = persisted.get(&key.key_hash) {
                    key.usage_today = *used;
                    if key.usage_today >= key.daily_quota {
                        key.state = KeyState::Exhausted;
                    }
                }
            }

            info!(
                provider = %provider,
                keys = keys.len(),
                "key registry loaded"
            );
            rings.insert(
                provider,
                ProviderRing {
                    keys,
                    cursor: 0,
                    day,
                },
            );
        }

        Ok(Self {
            timezone,
            store,
            rings: Mutex::new(rings),
        })
    }

    fn local_day(&self, now: DateTime<Utc>) -> NaiveDate {
        now.with_timezone(&self.timezone).date_naive()
    }

    /// Reset daily counters when the local calendar day has rolled over.
    fn rollover(&self, ring: &mut ProviderRing, now: DateTime<Utc>) {
        let today = self.local_day(now);
        if ring.day == today {
            return;
        }

        for key in &mut ring.keys {
            key.usage_today = 0;
            if key.state == KeyState::Exhausted {
                key.state = KeyState::Active;
            }
        }
        ring.day = today;
    }

    /// Dispense the next usable key, round-robin from the rotation cursor.
    pub async fn acquire(&self, provider: Provider) -> Result<LeasedKey, BatchError> {
        self.acquire_at(provider, Utc::now()).await
    }

    pub async fn acquire_at(
        &self,
        provider: Provider,
        now: DateTime<Utc>,
    ) -> Result<LeasedKey, BatchError> {
        let mut rings = self.rings.lock().await;
        let ring = rings
            .get_mut(&provider)
            .ok_or(BatchError::QuotaExhausted { provider })?;
        self.rollover(ring, now);

        let len = ring.keys.len();
        for offset in 0..len {
            let idx = (ring.cursor + offset) % len;
            let key = &mut ring.keys[idx];

            match key.state {
                KeyState::Cooling => {
                    let elapsed = key.cooldown_until.map(|t| t <= now).unwrap_or(true);
                    if elapsed {
                        key.state = KeyState::Active;
                        key.cooldown_until = None;
                    } else {
                        continue;
                    }
                }
                KeyState::Active => {}
                // Exhausted revives at midnight; Disabled only via probe.
                KeyState::Exhausted | KeyState::Disabled => continue,
            }

            if key.usage_today >= key.daily_quota {
                key.state = KeyState::Exhausted;
                continue;
            }

            let lease = LeasedKey {
                provider,
                key_hash: key.key_hash.clone(),
                secret: key.secret.clone(),
                remaining: key.remaining(),
            };
            ring.cursor = (idx + 1) % len;
            return Ok(lease);
        }

        // Nothing usable: the distinction matters for severity and retry.
        if !ring.keys.is_empty() && ring.keys.iter().all(|k| k.state == KeyState::Cooling) {
            Err(BatchError::RateLimited { provider })
        } else {
            Err(BatchError::QuotaExhausted { provider })
        }
    }

    /// Feed one call outcome back into a key's state.
    pub async fn record(
        &self,
        provider: Provider,
        key_hash: &str,
        outcome: CallOutcome,
    ) -> anyhow::Result<()> {
        self.record_at(provider, key_hash, outcome, Utc::now()).await
    }

    pub async fn record_at(
        &self,
        provider: Provider,
        key_hash: &str,
        outcome: CallOutcome,
        now: DateTime<Utc>,
    ) -> anyhow::Result<()> {
        let mut rings = self.rings.lock().await;
        let ring = match rings.get_mut(&provider) {
            Some(r) => r,
            None => return Ok(()),
        };
        self.rollover(ring, now);
        let day = ring.day;

        let key = match ring.keys.iter_mut().find(|k| k.key_hash == key_hash) {
            Some(k) => k,
            None => return Ok(()),
        };

        key.total_calls += 1;
        match outcome {
            CallOutcome::Ok => {
                key.usage_today += 1;
                key.total_successes += 1;
                key.consecutive_errors = 0;
                key.last_used_at = Some(now);
                if key.usage_today >= key.daily_quota {
                    key.state = KeyState::Exhausted;
                    info!(provider = %provider, key = %key.key_hash, "key exhausted for the day");
                }
                let used = key.usage_today;
                let hash = key.key_hash.clone();
                drop(rings);
                self.store.record_usage(provider, &hash, day, used).await?;
            }
            CallOutcome::RateLimited => {
                // Cooling only; the disable threshold counts transient
                // errors alone.
                key.state = KeyState::Cooling;
                key.cooldown_until = Some(now + Duration::seconds(COOLING_PERIOD));
                warn!(provider = %provider, key = %key.key_hash, "key rate limited, cooling 1h");
            }
            CallOutcome::TransientError => {
                key.consecutive_errors += 1;
                if key.consecutive_errors >= MAX_CONSECUTIVE_ERRORS {
                    key.state = KeyState::Disabled;
                    key.cooldown_until = Some(now + Duration::seconds(DISABLE_PERIOD));
                    warn!(
                        provider = %provider,
                        key = %key.key_hash,
                        errors = key.consecutive_errors,
                        "key disabled after consecutive errors"
                    );
                }
            }
            CallOutcome::AuthError => {
                key.state = KeyState::Disabled;
                key.cooldown_until = None;
                warn!(provider = %provider, key = %key.key_hash, "key rejected, disabled until reactivated");
            }
        }

        Ok(())
    }

    /// Disabled keys whose cooldown has elapsed and that may be probed.
    ///
    /// Keys disabled by an auth error carry no cooldown and are excluded;
    /// those need operator intervention.
    pub async fn probe_candidates(&self, provider: Provider) -> Vec<LeasedKey> {
        self.probe_candidates_at(provider, Utc::now()).await
    }

    pub async fn probe_candidates_at(
        &self,
        provider: Provider,
        now: DateTime<Utc>,
    ) -> Vec<LeasedKey> {
        let rings = self.rings.lock().await;
        let Some(ring) = rings.get(&provider) else {
            return Vec::new();
        };

        ring.keys
            .iter()
            .filter(|k| k.state == KeyState::Disabled)
            .filter(|k| k.cooldown_until.map(|t| t <= now).unwrap_or(false))
            .map(|k| LeasedKey {
                provider,
                key_hash: k.key_hash.clone(),
                secret: k.secret.clone(),
                remaining: k.remaining(),
            })
            .collect()
    }

    /// Return a probed key to service.
    pub async fn reactivate(&self, provider: Provider, key_hash: &str) {
        let mut rings = self.rings.lock().await;
        if let Some(ring) = rings.get_mut(&provider) {
            if let Some(key) = ring.keys.iter_mut().find(|k| k.key_hash == key_hash) {
                key.state = KeyState::Active;
                key.consecutive_errors = 0;
                key.cooldown_until = None;
                info!(provider = %provider, key = %key_hash, "key reactivated");
            }
        }
    }

    /// Aggregated stats for the operator surface.
    pub async fn snapshot(&self) -> Vec<ProviderSnapshot> {
        let rings = self.rings.lock().await;
        let mut out: Vec<ProviderSnapshot> = rings
            .iter()
            .map(|(provider, ring)| ProviderSnapshot {
                provider: *provider,
                day: ring.day,
                keys: ring
                    .keys
                    .iter()
                    .map(|k| KeySnapshot {
                        key_hash: k.key_hash.clone(),
                        state: k.state.as_str(),
                        usage_today: k.usage_today,
                        daily_quota: k.daily_quota,
                        consecutive_errors: k.consecutive_errors,
                        total_calls: k.total_calls,
                        total_successes: k.total_successes,
                        cooldown_until: k.cooldown_until,
                    })
                    .collect(),
            })
            .collect();
        out.sort_by_key(|s| s.provider.as_str());
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::keys::store::MemoryQuotaStore;
    use chrono::TimeZone;

    async fn registry(secrets: &[&str], quota: u32) -> KeyRegistry {
        KeyRegistry::new(
            chrono_tz::Asia::Seoul,
            Arc::new(MemoryQuotaStore::new()),
            vec![(
                Provider::Kto,
                secrets.iter().map(|s| s.to_string()).collect(),
                quota,
            )],
        )
        .await
        .unwrap()
    }

    fn seoul_noon() -> DateTime<Utc> {
        // 2026-03-15 12:00 KST
        Utc.with_ymd_and_hms(2026, 3, 15, 3, 0, 0).unwrap()
    }

    #[tokio::test]
    async fn acquire_rotates_round_robin() {
        let reg = registry(&["k1", "k2"], 100).await;
        let now = seoul_noon();

        let a = reg.acquire_at(Provider::Kto, now).await.unwrap();
        let b = reg.acquire_at(Provider::Kto, now).await.unwrap();
        let c = reg.acquire_at(Provider::Kto, now).await.unwrap();

        assert_ne!(a.key_hash, b.key_hash);
        assert_eq!(a.key_hash, c.key_hash);
    }

    #[tokio::test]
    async fn usage_counts_only_ok_outcomes() {
        let reg = registry(&["k1"], 10).await;
        let now = seoul_noon();
        let lease = reg.acquire_at(Provider::Kto, now).await.unwrap();

        reg.record_at(Provider::Kto, &lease.key_hash, CallOutcome::Ok, now)
            .await
            .unwrap();
        reg.record_at(
            Provider::Kto,
            &lease.key_hash,
            CallOutcome::TransientError,
            now,
        )
        .await
        .unwrap();

        let snap = reg.snapshot().await;
        assert_eq!(snap[0].keys[0].usage_today, 1);
        assert_eq!(snap[0].keys[0].total_calls, 2);
        assert_eq!(snap[0].keys[0].total_successes, 1);
    }

    #[tokio::test]
    async fn quota_exhaustion_surfaces_after_last_call() {
        let reg = registry(&["k1"], 5).await;
        let now = seoul_noon();

        for _ in 0..5 {
            let lease = reg.acquire_at(Provider::Kto, now).await.unwrap();
            reg.record_at(Provider::Kto, &lease.key_hash, CallOutcome::Ok, now)
                .await
                .unwrap();
        }

        let err = reg.acquire_at(Provider::Kto, now).await.unwrap_err();
        assert!(matches!(err, BatchError::QuotaExhausted { .. }));
    }

    #[tokio::test]
    async fn rate_limited_key_cools_for_an_hour() {
        let reg = registry(&["k1", "k2"], 100).await;
        let now = seoul_noon();
        let lease = reg.acquire_at(Provider::Kto, now).await.unwrap();

        reg.record_at(Provider::Kto, &lease.key_hash, CallOutcome::RateLimited, now)
            .await
            .unwrap();

        // The cooling key is skipped; the other key serves.
        let next = reg.acquire_at(Provider::Kto, now).await.unwrap();
        assert_ne!(next.key_hash, lease.key_hash);

        // After the cooldown the key is dispensed again.
        let later = now + Duration::seconds(COOLING_PERIOD + 1);
        let revived = reg.acquire_at(Provider::Kto, later).await.unwrap();
        let again = reg.acquire_at(Provider::Kto, later).await.unwrap();
        assert!(revived.key_hash == lease.key_hash || again.key_hash == lease.key_hash);
    }

    #[tokio::test]
    async fn all_keys_cooling_surfaces_rate_limited() {
        let reg = registry(&["k1"], 100).await;
        let now = seoul_noon();
        let lease = reg.acquire_at(Provider::Kto, now).await.unwrap();
        reg.record_at(Provider::Kto, &lease.key_hash, CallOutcome::RateLimited, now)
            .await
            .unwrap();

        let err = reg.acquire_at(Provider::Kto, now).await.unwrap_err();
        assert!(matches!(err, BatchError::RateLimited { .. }));
    }

    #[tokio::test]
    async fn five_transient_errors_disable_a_key() {
        let reg = registry(&["k1"], 100).await;
        let now = seoul_noon();
        let lease = reg.acquire_at(Provider::Kto, now).await.unwrap();

        for _ in 0..MAX_CONSECUTIVE_ERRORS {
            reg.record_at(
                Provider::Kto,
                &lease.key_hash,
                CallOutcome::TransientError,
                now,
            )
            .await
            .unwrap();
        }

        assert!(matches!(
            reg.acquire_at(Provider::Kto, now).await.unwrap_err(),
            BatchError::QuotaExhausted { .. }
        ));

        // Eligible for probing after the 30-minute cooldown...
        let later = now + Duration::seconds(DISABLE_PERIOD + 1);
        let candidates = reg.probe_candidates_at(Provider::Kto, later).await;
        assert_eq!(candidates.len(), 1);

        // ...and only a successful probe returns it to rotation.
        reg.reactivate(Provider::Kto, &lease.key_hash).await;
        assert!(reg.acquire_at(Provider::Kto, later).await.is_ok());
    }

    #[tokio::test]
    async fn rate_limits_do_not_count_toward_the_disable_threshold() {
        let reg = registry(&["k1"], 100).await;
        let now = seoul_noon();
        let lease = reg.acquire_at(Provider::Kto, now).await.unwrap();

        // Alternate rate limits with transient errors; only the transient
        // ones may advance the counter.
        for round in 0..MAX_CONSECUTIVE_ERRORS {
            reg.record_at(Provider::Kto, &lease.key_hash, CallOutcome::RateLimited, now)
                .await
                .unwrap();
            if round < MAX_CONSECUTIVE_ERRORS - 1 {
                reg.record_at(
                    Provider::Kto,
                    &lease.key_hash,
                    CallOutcome::TransientError,
                    now,
                )
                .await
                .unwrap();
            }
        }

        let snap = reg.snapshot().await;
        assert_eq!(snap[0].keys[0].state, "cooling");
        assert_eq!(
            snap[0].keys[0].consecutive_errors,
            MAX_CONSECUTIVE_ERRORS - 1
        );
    }

    #[tokio::test]
    async fn auth_disabled_keys_are_never_probe_candidates() {
        let reg = registry(&["k1"], 100).await;
        let now = seoul_noon();
        let lease = reg.acquire_at(Provider::Kto, now).await.unwrap();

        reg.record_at(Provider::Kto, &lease.key_hash, CallOutcome::AuthError, now)
            .await
            .unwrap();

        let much_later = now + Duration::days(30);
        assert!(reg
            .probe_candidates_at(Provider::Kto, much_later)
            .await
            .is_empty());
    }

    #[tokio::test]
    async fn usage_resets_at_local_midnight() {
        let reg = registry(&["k1"], 5).await;
        let now = seoul_noon();

        for _ in 0..5 {
            let lease = reg.acquire_at(Provider::Kto, now).await.unwrap();
            reg.record_at(Provider::Kto, &lease.key_hash, CallOutcome::Ok, now)
                .await
                .unwrap();
        }
        assert!(reg.acquire_at(Provider::Kto, now).await.is_err());

        // 2026-03-16 00:05 KST = 2026-03-15 15:05 UTC
        let after_midnight = Utc.with_ymd_and_hms(2026, 3, 15, 15, 5, 0).unwrap();
        let lease = reg.acquire_at(Provider::Kto, after_midnight).await.unwrap();
        assert_eq!(lease.remaining, 5);

        let snap = reg.snapshot().await;
        assert_eq!(snap[0].keys[0].usage_today, 0);
    }

    #[tokio::test]
    async fn startup_rehydrates_usage_from_the_store() {
        let store = Arc::new(MemoryQuotaStore::new());
        let day = Utc::now()
            .with_timezone(&chrono_tz::Asia::Seoul)
            .date_naive();
        store
            .record_usage(Provider::Kto, &hash_secret("k1"), day, 4)
            .await
            .unwrap();

        let reg = KeyRegistry::new(
            chrono_tz::Asia::Seoul,
            store,
            vec![(Provider::Kto, vec!["k1".into()], 5)],
        )
        .await
        .unwrap();

        let lease = reg.acquire(Provider::Kto).await.unwrap();
        assert_eq!(lease.remaining, 1);
    }

    #[test]
    fn hash_is_short_and_stable() {
        let h = hash_secret("secret-value");
        assert_eq!(h.len(), 12);
        assert_eq!(h, hash_secret("secret-value"));
        assert_ne!(h, hash_secret("other-value"));
    }
}
