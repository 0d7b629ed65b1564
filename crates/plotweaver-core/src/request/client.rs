//! Resilient request client
//!
//! Wraps every backend call with, in order:
//! 1. a cache lookup (GET only),
//! 2. in-flight deduplication (identical keys share one pending result),
//! 3. cancellable execution with a per-attempt timeout,
//! 4. retry with capped exponential backoff (never for 4xx or cancellation).
//!
//! Successful GETs populate the cache; successful mutations invalidate the
//! resource, its parent path and the project collection.
//!
//! Every invalidation bumps a generation counter. A GET only stores its
//! response if no invalidation happened while it was in flight, and
//! mutations detach matching in-flight reads from deduplication, so a read
//! that started before a mutation can never repopulate the cache with
//! pre-mutation state.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use futures_util::future::{BoxFuture, FutureExt, Shared};
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::cache::{ResponseCache, key_within_path};
use crate::config::Config;
use crate::error::{RequestError, Result as CrateResult};

use super::retry::RetryPolicy;
use super::transport::{HttpTransport, Transport};
use super::types::{ApiRequest, ApiResponse};

type RequestResult<T> = std::result::Result<T, RequestError>;
type SharedResponse = Shared<BoxFuture<'static, RequestResult<ApiResponse>>>;

/// Default per-attempt timeout
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

/// Default time-to-live for cached GET responses
const DEFAULT_CACHE_TTL: Duration = Duration::from_secs(30);

struct InFlight {
    id: u64,
    token: CancellationToken,
    response: SharedResponse,
    read: bool,
}

struct Inner {
    transport: Arc<dyn Transport>,
    cache: ResponseCache<Value>,
    in_flight: Mutex<HashMap<String, InFlight>>,
    next_id: AtomicU64,
    generation: AtomicU64,
    retry: RetryPolicy,
    timeout: Duration,
    cache_ttl: Duration,
}

/// Cache-aware, deduplicating, retrying client.
///
/// Cheap to clone; clones share the same cache and in-flight bookkeeping.
#[derive(Clone)]
pub struct RequestClient {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for RequestClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestClient")
            .field("retry", &self.inner.retry)
            .field("timeout", &self.inner.timeout)
            .field("cache_ttl", &self.inner.cache_ttl)
            .field("cached", &self.inner.cache.len())
            .field("pending", &self.pending_count())
            .finish()
    }
}

/// Builder for creating a RequestClient
pub struct RequestClientBuilder {
    transport: Option<Arc<dyn Transport>>,
    retry: RetryPolicy,
    timeout: Duration,
    cache_ttl: Duration,
}

impl Default for RequestClientBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl RequestClientBuilder {
    pub fn new() -> Self {
        Self {
            transport: None,
            retry: RetryPolicy::default(),
            timeout: DEFAULT_TIMEOUT,
            cache_ttl: DEFAULT_CACHE_TTL,
        }
    }

    pub fn transport(mut self, transport: impl Transport) -> Self {
        self.transport = Some(Arc::new(transport));
        self
    }

    pub fn shared_transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Per-attempt timeout
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn cache_ttl(mut self, ttl: Duration) -> Self {
        self.cache_ttl = ttl;
        self
    }

    pub fn build(self) -> CrateResult<RequestClient> {
        let transport = self.transport.ok_or_else(|| {
            crate::error::Error::ConfigError("A transport is required".to_string())
        })?;

        Ok(RequestClient {
            inner: Arc::new(Inner {
                transport,
                cache: ResponseCache::new(),
                in_flight: Mutex::new(HashMap::new()),
                next_id: AtomicU64::new(1),
                generation: AtomicU64::new(0),
                retry: self.retry,
                timeout: self.timeout,
                cache_ttl: self.cache_ttl,
            }),
        })
    }
}

impl RequestClient {
    pub fn builder() -> RequestClientBuilder {
        RequestClientBuilder::new()
    }

    /// Client over HTTP using the request, cache and API sections of `config`
    pub fn from_config(config: &Config) -> CrateResult<Self> {
        Self::builder()
            .transport(HttpTransport::from_config(&config.api)?)
            .retry(RetryPolicy::from_config(&config.request))
            .timeout(config.request.timeout())
            .cache_ttl(config.cache.ttl())
            .build()
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        self.inner.retry
    }

    /// Execute a request and return the response body
    pub async fn execute(&self, request: ApiRequest) -> RequestResult<Value> {
        let key = request.key();

        if request.is_cacheable()
            && let Some(hit) = self.inner.cache.get(&key)
        {
            debug!(key = %key, "Cache hit");
            return Ok(hit);
        }

        let response = self.join_or_start(request, key);
        response.await.map(|response| response.body)
    }

    /// Execute a request and decode the response body
    pub async fn execute_json<T: DeserializeOwned>(&self, request: ApiRequest) -> RequestResult<T> {
        let body = self.execute(request).await?;
        serde_json::from_value(body).map_err(|e| RequestError::Decode(e.to_string()))
    }

    /// Cancel one pending request; its callers observe [`RequestError::Cancelled`]
    pub fn cancel_request(&self, key: &str) -> bool {
        let removed = self.inner.lock_in_flight().remove(key);
        match removed {
            Some(entry) => {
                entry.token.cancel();
                debug!(key = %key, "Cancelled pending request");
                true
            }
            None => false,
        }
    }

    /// Cancel every pending request; returns how many were cancelled
    pub fn cancel_pending_requests(&self) -> usize {
        let drained: Vec<InFlight> = self
            .inner
            .lock_in_flight()
            .drain()
            .map(|(_, entry)| entry)
            .collect();
        for entry in &drained {
            entry.token.cancel();
        }
        if !drained.is_empty() {
            debug!(count = drained.len(), "Cancelled all pending requests");
        }
        drained.len()
    }

    pub fn clear_cache(&self) {
        self.inner.bump_generation();
        self.inner.cache.clear();
    }

    /// Invalidate cache entries whose key contains `pattern`, or everything
    pub fn invalidate_cache(&self, pattern: Option<&str>) -> usize {
        self.inner.bump_generation();
        match pattern {
            Some(pattern) => self.inner.cache.invalidate(pattern),
            None => {
                let count = self.inner.cache.len();
                self.inner.cache.clear();
                count
            }
        }
    }

    /// Whether a fresh cached response exists for `request`
    pub fn is_cached(&self, request: &ApiRequest) -> bool {
        self.inner.cache.get(&request.key()).is_some()
    }

    pub fn pending_count(&self) -> usize {
        self.inner.lock_in_flight().len()
    }

    pub fn pending_keys(&self) -> Vec<String> {
        self.inner.lock_in_flight().keys().cloned().collect()
    }

    fn join_or_start(&self, request: ApiRequest, key: String) -> SharedResponse {
        let mut in_flight = self.inner.lock_in_flight();

        if let Some(existing) = in_flight.get(&key) {
            debug!(key = %key, "Joining in-flight request");
            return existing.response.clone();
        }

        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let token = CancellationToken::new();
        let read = request.is_cacheable();
        let started_at = self.inner.generation.load(Ordering::SeqCst);
        let response = Inner::run(
            self.inner.clone(),
            request,
            key.clone(),
            id,
            started_at,
            token.clone(),
        )
        .boxed()
        .shared();

        in_flight.insert(
            key,
            InFlight {
                id,
                token,
                response: response.clone(),
                read,
            },
        );
        response
    }
}

impl Inner {
    fn lock_in_flight(&self) -> MutexGuard<'_, HashMap<String, InFlight>> {
        self.in_flight.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn bump_generation(&self) {
        self.generation.fetch_add(1, Ordering::SeqCst);
    }

    /// Drop cached and in-flight reads below the paths a mutation touched
    fn invalidate_after_mutation(&self, request: &ApiRequest) {
        let paths = request.invalidation_paths();
        self.bump_generation();
        for path in &paths {
            self.cache.invalidate_path(path);
        }

        let mut in_flight = self.lock_in_flight();
        let before = in_flight.len();
        in_flight.retain(|key, entry| {
            !(entry.read && paths.iter().any(|path| key_within_path(key, path)))
        });
        let detached = before - in_flight.len();
        if detached > 0 {
            debug!(
                endpoint = %request.endpoint,
                detached,
                "Detached in-flight reads made stale by mutation"
            );
        }
    }

    async fn run(
        self: Arc<Self>,
        request: ApiRequest,
        key: String,
        id: u64,
        started_at: u64,
        token: CancellationToken,
    ) -> RequestResult<ApiResponse> {
        let result = self.execute_with_retry(&request, &token).await;

        if let Ok(response) = &result {
            if request.is_cacheable() {
                // Only cache if nothing was invalidated while this read was in flight
                if self.generation.load(Ordering::SeqCst) == started_at {
                    self.cache.set(
                        key.clone(),
                        response.body.clone(),
                        self.cache_ttl,
                        response.etag.clone(),
                    );
                } else {
                    debug!(key = %key, "Skipping cache write for read overtaken by invalidation");
                }
            }
            if request.is_mutation() {
                self.invalidate_after_mutation(&request);
            }
        }

        // A cancelled entry may already have been replaced by a newer call
        let mut in_flight = self.lock_in_flight();
        if in_flight.get(&key).is_some_and(|entry| entry.id == id) {
            in_flight.remove(&key);
        }
        drop(in_flight);

        result
    }

    async fn execute_with_retry(
        &self,
        request: &ApiRequest,
        token: &CancellationToken,
    ) -> RequestResult<ApiResponse> {
        let mut attempts = 0;

        loop {
            attempts += 1;

            let error = match self.attempt(request, token).await {
                Ok(response) => return Ok(response),
                Err(e) => e,
            };

            if !error.is_retryable() {
                debug!(
                    endpoint = %request.endpoint,
                    attempt = attempts,
                    error = %error,
                    "Request failed, not retrying"
                );
                return Err(error);
            }

            if attempts >= self.retry.max_attempts {
                return Err(RequestError::Exhausted {
                    endpoint: request.endpoint.clone(),
                    attempts,
                    last: Box::new(error),
                });
            }

            let backoff = self.retry.delay_for(attempts);
            warn!(
                endpoint = %request.endpoint,
                attempt = attempts,
                wait_ms = backoff.as_millis() as u64,
                error = %error,
                "Request failed, retrying after backoff"
            );

            tokio::select! {
                _ = token.cancelled() => return Err(RequestError::Cancelled),
                _ = tokio::time::sleep(backoff) => {}
            }
        }
    }

    async fn attempt(
        &self,
        request: &ApiRequest,
        token: &CancellationToken,
    ) -> RequestResult<ApiResponse> {
        tokio::select! {
            biased;
            _ = token.cancelled() => Err(RequestError::Cancelled),
            result = tokio::time::timeout(self.timeout, self.transport.send(request)) => {
                match result {
                    Ok(response) => response,
                    Err(_) => Err(RequestError::Timeout(self.timeout)),
                }
            }
        }
    }
}
