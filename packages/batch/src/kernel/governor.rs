//! Per-provider concurrency and pacing control.
//!
//! A task that wants to issue a request takes a provider permit, then a
//! global permit, then waits out the pacing interval (minimum spacing plus
//! the adaptive delay). Permit acquisition is FIFO; waiting observes the
//! caller's cancellation token. The adaptive delay grows ×1.5 after each
//! failure (capped) and decays ÷1.2 after each success, so a struggling
//! provider is approached more gently without any configuration change.
//!
//! Lock order across the kernel is fixed: governor slot, then key registry,
//! then database connection.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use datago_client::Provider;
use tokio::sync::{Mutex, OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::common::BatchError;

const DELAY_GROWTH: f64 = 1.5;
const DELAY_DECAY: f64 = 1.2;

#[derive(Debug)]
struct Pacing {
    last_start: Option<Instant>,
    adaptive_delay: Duration,
    consecutive_failures: u32,
}

struct ProviderGate {
    slots: Arc<Semaphore>,
    max_slots: usize,
    pacing: Mutex<Pacing>,
    min_interval: Duration,
    max_adaptive_delay: Duration,
}

/// RAII guard for one in-flight request; permits release on drop.
pub struct Slot {
    _provider_permit: OwnedSemaphorePermit,
    _global_permit: OwnedSemaphorePermit,
}

/// Point-in-time counters for the operator surface.
#[derive(Debug, Clone, serde::Serialize)]
pub struct GovernorSnapshot {
    pub provider: Provider,
    pub in_flight: usize,
    pub adaptive_delay_ms: u64,
    pub consecutive_failures: u32,
}

pub struct ConcurrencyGovernor {
    global: Arc<Semaphore>,
    gates: HashMap<Provider, ProviderGate>,
}

impl ConcurrencyGovernor {
    pub fn new(
        providers: &[Provider],
        max_per_provider: usize,
        max_global: usize,
        min_interval: Duration,
        max_adaptive_delay: Duration,
    ) -> Self {
        let gates = providers
            .iter()
            .map(|p| {
                (
                    *p,
                    ProviderGate {
                        slots: Arc::new(Semaphore::new(max_per_provider)),
                        max_slots: max_per_provider,
                        pacing: Mutex::new(Pacing {
                            last_start: None,
                            adaptive_delay: Duration::ZERO,
                            consecutive_failures: 0,
                        }),
                        min_interval,
                        max_adaptive_delay,
                    },
                )
            })
            .collect();

        Self {
            global: Arc::new(Semaphore::new(max_global)),
            gates,
        }
    }

    /// Wait for a provider slot, a global slot, and the pacing interval.
    pub async fn acquire(
        &self,
        provider: Provider,
        cancel: &CancellationToken,
    ) -> Result<Slot, BatchError> {
        let gate = self
            .gates
            .get(&provider)
            .ok_or_else(|| BatchError::Config(format!("no governor gate for {provider}")))?;

        let provider_permit = tokio::select! {
            permit = gate.slots.clone().acquire_owned() => {
                permit.map_err(|_| BatchError::Cancelled)?
            }
            _ = cancel.cancelled() => return Err(BatchError::Cancelled),
        };

        let global_permit = tokio::select! {
            permit = self.global.clone().acquire_owned() => {
                permit.map_err(|_| BatchError::Cancelled)?
            }
            _ = cancel.cancelled() => return Err(BatchError::Cancelled),
        };

        // Pacing: earliest permissible start is the previous start plus the
        // minimum interval plus the current adaptive delay.
        let wait = {
            let mut pacing = gate.pacing.lock().await;
            let now = Instant::now();
            let wait = pacing
                .last_start
                .map(|last| {
                    (last + gate.min_interval + pacing.adaptive_delay)
                        .saturating_duration_since(now)
                })
                .unwrap_or(Duration::ZERO);
            pacing.last_start = Some(now + wait);
            wait
        };

        if !wait.is_zero() {
            debug!(provider = %provider, wait_ms = wait.as_millis() as u64, "pacing request");
            tokio::select! {
                _ = tokio::time::sleep(wait) => {}
                _ = cancel.cancelled() => return Err(BatchError::Cancelled),
            }
        }

        Ok(Slot {
            _provider_permit: provider_permit,
            _global_permit: global_permit,
        })
    }

    /// Decay the adaptive delay after a successful call.
    pub async fn on_success(&self, provider: Provider) {
        if let Some(gate) = self.gates.get(&provider) {
            let mut pacing = gate.pacing.lock().await;
            pacing.consecutive_failures = 0;
            pacing.adaptive_delay =
                Duration::from_secs_f64(pacing.adaptive_delay.as_secs_f64() / DELAY_DECAY);
            if pacing.adaptive_delay < Duration::from_millis(10) {
                pacing.adaptive_delay = Duration::ZERO;
            }
        }
    }

    /// Grow the adaptive delay after a failed call.
    pub async fn on_failure(&self, provider: Provider) {
        if let Some(gate) = self.gates.get(&provider) {
            let mut pacing = gate.pacing.lock().await;
            pacing.consecutive_failures += 1;
            let grown = if pacing.adaptive_delay.is_zero() {
                Duration::from_secs(1)
            } else {
                Duration::from_secs_f64(pacing.adaptive_delay.as_secs_f64() * DELAY_GROWTH)
            };
            pacing.adaptive_delay = grown.min(gate.max_adaptive_delay);
            debug!(
                provider = %provider,
                delay_ms = pacing.adaptive_delay.as_millis() as u64,
                failures = pacing.consecutive_failures,
                "adaptive delay grown"
            );
        }
    }

    pub async fn snapshot(&self) -> Vec<GovernorSnapshot> {
        let mut out = Vec::with_capacity(self.gates.len());
        for (provider, gate) in &self.gates {
            let pacing = gate.pacing.lock().await;
            out.push(GovernorSnapshot {
                provider: *provider,
                in_flight: gate.max_slots - gate.slots.available_permits(),
                adaptive_delay_ms: pacing.adaptive_delay.as_millis() as u64,
                consecutive_failures: pacing.consecutive_failures,
            });
        }
        out.sort_by_key(|s| s.provider.as_str());
        out
    }
}
