//! Single-request execution against the upstream providers.
//!
//! One call walks the full gauntlet: governor slot, key lease, URL
//! composition (the service key rides as a query parameter), send with
//! timeout, outcome classification, key-registry feedback, raw archival.
//! Rotation lives one level up in [`HttpExecutor::call_rotating`], which
//! swaps keys on rate-limit and auth failures until the registry runs dry.
//!
//! Classification rules:
//! - HTTP 429 or the portal's quota-exceeded message → rate limited
//! - HTTP 401/403 or a key-registration error code → auth
//! - HTTP 5xx, transport errors, timeouts, undecodable bodies → transient

use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use datago_client::envelope::{check_header, decode_page, PageSlice};
use datago_client::{DatagoError, PageCursor, Provider, ProviderFault, ProviderRequest};
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

use super::archive::{ArchiveWriter, RawCall};
use super::governor::ConcurrencyGovernor;
use super::keys::{CallOutcome, KeyRegistry, LeasedKey};
use crate::common::BatchError;

/// Transient retries within one logical call (key rotation not counted).
const MAX_TRANSIENT_ATTEMPTS: u32 = 3;

/// Decoded result of one executed call.
#[derive(Debug)]
pub struct ApiResponse {
    pub status: u16,
    pub body: Value,
    pub duration_ms: i64,
    pub key_hash: String,
    /// Archive row id when `store_raw` was requested.
    pub raw_id: Option<Uuid>,
    /// The archive row's created_at; typed rows derive their sync stamp
    /// from it so replaying the archived page is reproducible.
    pub archived_at: Option<DateTime<Utc>>,
}

pub struct HttpExecutor {
    http: reqwest::Client,
    keys: Arc<KeyRegistry>,
    governor: Arc<ConcurrencyGovernor>,
    archive: Arc<dyn ArchiveWriter>,
    kto_base: String,
    kma_base: String,
}

impl HttpExecutor {
    pub fn new(
        http: reqwest::Client,
        keys: Arc<KeyRegistry>,
        governor: Arc<ConcurrencyGovernor>,
        archive: Arc<dyn ArchiveWriter>,
        kto_base: String,
        kma_base: String,
    ) -> Self {
        Self {
            http,
            keys,
            governor,
            archive,
            kto_base,
            kma_base,
        }
    }

    fn base_for(&self, provider: Provider) -> &str {
        match provider {
            Provider::Kto => &self.kto_base,
            Provider::Kma => &self.kma_base,
        }
    }

    fn compose_url(&self, request: &ProviderRequest) -> String {
        format!(
            "{}/{}",
            self.base_for(request.provider).trim_end_matches('/'),
            request.endpoint
        )
    }

    /// Execute one call with one key. Key state feedback and archival happen
    /// on every path; the caller decides whether to rotate.
    pub async fn call(
        &self,
        request: &ProviderRequest,
        store_raw: bool,
        cancel: &CancellationToken,
    ) -> Result<ApiResponse, BatchError> {
        // Lock order: governor slot, then key registry, then anything else.
        let _slot = self.governor.acquire(request.provider, cancel).await?;
        let lease = self.keys.acquire(request.provider).await?;
        self.call_with_lease(request, &lease, store_raw, cancel).await
    }

    /// Execute with an explicitly supplied key (probe path).
    pub async fn call_with_lease(
        &self,
        request: &ProviderRequest,
        lease: &LeasedKey,
        store_raw: bool,
        cancel: &CancellationToken,
    ) -> Result<ApiResponse, BatchError> {
        let provider = request.provider;
        let url = self.compose_url(request);

        let mut pairs: Vec<(&str, &str)> = request
            .params
            .iter()
            .map(|(k, v)| (k.as_str(), v.as_str()))
            .collect();
        pairs.push(("serviceKey", lease.secret.as_str()));

        let started = Instant::now();
        let send = self.http.get(&url).query(&pairs).send();
        let result = tokio::select! {
            r = send => r,
            _ = cancel.cancelled() => {
                // The request may already be on the wire; debit the key.
                self.keys
                    .record(provider, &lease.key_hash, CallOutcome::TransientError)
                    .await
                    .ok();
                return Err(BatchError::Cancelled);
            }
        };

        let (status, body, size) = match result {
            Ok(resp) => {
                let status = resp.status().as_u16();
                match resp.text().await {
                    Ok(text) => {
                        let size = text.len() as i64;
                        let body = serde_json::from_str::<Value>(&text)
                            .unwrap_or_else(|_| Value::String(truncate(&text, 4_096)));
                        (status, body, size)
                    }
                    Err(err) => (status, Value::String(format!("unreadable body: {err}")), 0),
                }
            }
            Err(err) => {
                let duration_ms = started.elapsed().as_millis() as i64;
                self.finish(
                    request,
                    lease,
                    CallOutcome::TransientError,
                    0,
                    Value::String(format!("transport error: {err}")),
                    0,
                    duration_ms,
                    store_raw,
                )
                .await?;
                return Err(BatchError::transient(format!(
                    "{provider} transport error: {err}"
                )));
            }
        };
        let duration_ms = started.elapsed().as_millis() as i64;

        let (outcome, error) = classify(provider, status, &body);
        let archived = self
            .finish(
                request, lease, outcome, status, body.clone(), size, duration_ms, store_raw,
            )
            .await?;

        match error {
            Some(err) => Err(err),
            None => {
                debug!(
                    provider = %provider,
                    endpoint = %request.endpoint,
                    duration_ms,
                    key = %lease.key_hash,
                    "call ok"
                );
                Ok(ApiResponse {
                    status,
                    body,
                    duration_ms,
                    key_hash: lease.key_hash.clone(),
                    raw_id: archived.map(|(id, _)| id),
                    archived_at: archived.map(|(_, at)| at),
                })
            }
        }
    }

    /// Record the outcome and archive the tuple; shared tail of every path.
    #[allow(clippy::too_many_arguments)]
    async fn finish(
        &self,
        request: &ProviderRequest,
        lease: &LeasedKey,
        outcome: CallOutcome,
        status: u16,
        body: Value,
        size: i64,
        duration_ms: i64,
        store_raw: bool,
    ) -> Result<Option<(Uuid, DateTime<Utc>)>, BatchError> {
        self.keys
            .record(request.provider, &lease.key_hash, outcome)
            .await
            .map_err(|e| BatchError::transient(format!("quota ledger write failed: {e}")))?;

        match outcome {
            CallOutcome::Ok => self.governor.on_success(request.provider).await,
            _ => self.governor.on_failure(request.provider).await,
        }

        if !store_raw {
            return Ok(None);
        }

        let params = Value::Object(
            request
                .params
                .iter()
                .map(|(k, v)| (k.clone(), Value::String(v.clone())))
                .collect(),
        );
        let archived_at = Utc::now();
        let raw_id = self
            .archive
            .record(RawCall {
                provider: request.provider,
                endpoint: request.endpoint.clone(),
                request_params: params,
                response_status: status as i32,
                response_body: body,
                response_size_bytes: size,
                duration_ms,
                key_hash: lease.key_hash.clone(),
                created_at: archived_at,
            })
            .await
            .map_err(|e| BatchError::transient(format!("raw archive write failed: {e}")))?;

        Ok(Some((raw_id, archived_at)))
    }

    /// Execute a call, rotating keys past rate-limit and auth failures and
    /// retrying transient ones. Returns the taxonomy error only after the
    /// registry itself runs out of options.
    pub async fn call_rotating(
        &self,
        request: &ProviderRequest,
        store_raw: bool,
        cancel: &CancellationToken,
    ) -> Result<ApiResponse, BatchError> {
        let mut transient_attempts = 0u32;

        loop {
            match self.call(request, store_raw, cancel).await {
                Ok(resp) => return Ok(resp),
                // The failing key is already cooling or disabled; the next
                // acquire dispenses a different one or reports the registry
                // state as the final error.
                Err(BatchError::RateLimited { provider }) => {
                    warn!(provider = %provider, endpoint = %request.endpoint, "rotating past rate-limited key");
                }
                Err(BatchError::Auth { provider }) => {
                    warn!(provider = %provider, endpoint = %request.endpoint, "rotating past rejected key");
                }
                Err(err @ BatchError::Transient { .. }) => {
                    transient_attempts += 1;
                    if transient_attempts >= MAX_TRANSIENT_ATTEMPTS {
                        return Err(err);
                    }
                    // The governor's adaptive delay paces the retry.
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// Probe disabled keys with a cheap read and reactivate the survivors.
    pub async fn probe_disabled_keys(
        &self,
        provider: Provider,
        probe_request: &ProviderRequest,
        cancel: &CancellationToken,
    ) -> Result<u32, BatchError> {
        let mut revived = 0;
        for lease in self.keys.probe_candidates(provider).await {
            let _slot = self.governor.acquire(provider, cancel).await?;
            match self
                .call_with_lease(probe_request, &lease, false, cancel)
                .await
            {
                Ok(_) => {
                    self.keys.reactivate(provider, &lease.key_hash).await;
                    revived += 1;
                }
                Err(BatchError::Cancelled) => return Err(BatchError::Cancelled),
                Err(err) => {
                    debug!(provider = %provider, key = %lease.key_hash, error = %err, "probe failed");
                }
            }
        }
        Ok(revived)
    }

    /// Sequential paged harvest over one listing request.
    pub fn paged<'a>(
        &'a self,
        request: ProviderRequest,
        num_of_rows: i64,
        cancel: CancellationToken,
    ) -> PagedHarvest<'a> {
        PagedHarvest {
            executor: self,
            request,
            cursor: PageCursor::new(num_of_rows),
            cancel,
        }
    }
}

/// One harvested page plus the archive row it was recorded under.
pub struct HarvestPage {
    pub slice: PageSlice<Value>,
    pub raw_id: Option<Uuid>,
    pub archived_at: Option<DateTime<Utc>>,
}

/// Driver for paged endpoints: page N is fully executed (and archived)
/// before page N+1 is issued, and end of stream is `Ok(None)`.
pub struct PagedHarvest<'a> {
    executor: &'a HttpExecutor,
    request: ProviderRequest,
    cursor: PageCursor,
    cancel: CancellationToken,
}

impl PagedHarvest<'_> {
    pub async fn next_page(&mut self) -> Result<Option<HarvestPage>, BatchError> {
        let Some(page_no) = self.cursor.next_page() else {
            return Ok(None);
        };

        let request = self
            .request
            .clone()
            .paged(page_no, self.cursor.num_of_rows());
        let response = self
            .executor
            .call_rotating(&request, true, &self.cancel)
            .await?;

        let slice = decode_page::<Value>(&response.body)
            .map_err(|e| BatchError::transient(format!("page decode failed: {e}")))?;
        self.cursor.observe(&slice);
        Ok(Some(HarvestPage {
            slice,
            raw_id: response.raw_id,
            archived_at: response.archived_at,
        }))
    }

    pub fn fetched(&self) -> i64 {
        self.cursor.fetched()
    }
}

/// Map transport status and decoded body onto a key outcome and, for
/// failures, the taxonomy error handed to the caller.
fn classify(provider: Provider, status: u16, body: &Value) -> (CallOutcome, Option<BatchError>) {
    match status {
        429 => (
            CallOutcome::RateLimited,
            Some(BatchError::RateLimited { provider }),
        ),
        401 | 403 => (CallOutcome::AuthError, Some(BatchError::Auth { provider })),
        500..=599 => (
            CallOutcome::TransientError,
            Some(BatchError::transient(format!(
                "{provider} returned HTTP {status}"
            ))),
        ),
        200..=299 => match check_header(body) {
            Ok(_) => (CallOutcome::Ok, None),
            Err(DatagoError::Provider {
                fault,
                code,
                message,
            }) => {
                let outcome = match fault {
                    ProviderFault::RateLimited => CallOutcome::RateLimited,
                    ProviderFault::Auth => CallOutcome::AuthError,
                    ProviderFault::Transient => CallOutcome::TransientError,
                };
                let err =
                    BatchError::from_fault(provider, fault, &format!("{provider} {code}: {message}"));
                (outcome, Some(err))
            }
            Err(other) => (
                CallOutcome::TransientError,
                Some(BatchError::transient(format!(
                    "{provider} malformed envelope: {other}"
                ))),
            ),
        },
        _ => (
            CallOutcome::TransientError,
            Some(BatchError::transient(format!(
                "{provider} returned HTTP {status}"
            ))),
        ),
    }
}

fn truncate(text: &str, max: usize) -> String {
    if text.len() <= max {
        text.to_string()
    } else {
        let mut end = max;
        while !text.is_char_boundary(end) {
            end -= 1;
        }
        text[..end].to_string()
    }
}
