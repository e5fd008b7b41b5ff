// src/api/manager.rs
//! Request orchestrator.
//!
//! [`ApiClient`] is the single entry point every screen goes through. One
//! logical request runs:
//!
//! 1. pre-flight cache check (cache-first GETs only)
//! 2. dedup ledger registration
//! 3. admission (one slot for the whole attempt sequence)
//! 4. network attempts with retry/backoff, each under an absolute timeout
//! 5. envelope decode, then cache write
//! 6. on any failure, one fallback cache read before the error propagates
//!
//! All collaborators are owned by the client and injected at construction.

use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{sleep, Instant};
use tokio_util::sync::CancellationToken;
use url::Url;
use uuid::Uuid;

use super::credentials::{CredentialStore, StaticCredentials};
use super::dedup::DedupLedger;
use super::envelope::{self, Pagination};
use super::rate_limiter::{AdmissionController, RateLimitConfig, RateLimitStats};
use super::request::{body_digest, is_absolute_url, Method, RequestDescriptor, RequestKey};
use super::retry::RetryPolicy;
use super::stats::{RequestStats, StatsSnapshot};
use super::transport::{HttpRequest, HttpTransport, RawResponse, Transport};
use crate::cache::{CacheConfig, CacheUsage, FallbackCache};
use crate::config::Config;
use crate::error::{ApiError, TransportErrorKind};
use crate::utils::sanitize_json_for_log;
use crate::utils::timing::Timer;

const TWIN_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Configuration for the API manager
#[derive(Debug, Clone)]
pub struct ApiManagerConfig {
    pub base_url: String,
    pub request_timeout: Duration,
    pub user_agent: String,
}

impl Default for ApiManagerConfig {
    fn default() -> Self {
        Self {
            base_url: crate::config::settings::DEFAULT_BASE_URL.to_string(),
            request_timeout: Duration::from_secs(30),
            user_agent: format!("campus-api-client/{}", env!("CARGO_PKG_VERSION")),
        }
    }
}

/// How a request may use the fallback cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheMode {
    /// Never read or write the cache.
    Bypass,
    /// Serve a live entry without touching the network; fall back on failure.
    CacheFirst,
    /// Always go to the network; the cache is only the failure fallback.
    NetworkFirst,
}

/// API request information
#[derive(Debug, Clone)]
pub struct ApiRequest {
    pub descriptor: RequestDescriptor,
    pub cache_mode: CacheMode,
    pub timeout: Option<Duration>,
}

impl ApiRequest {
    /// GETs default to cache-first, writes are never cached.
    pub fn new(descriptor: RequestDescriptor) -> Self {
        let cache_mode = if descriptor.method() == Method::Get {
            CacheMode::CacheFirst
        } else {
            CacheMode::Bypass
        };
        Self {
            descriptor,
            cache_mode,
            timeout: None,
        }
    }

    pub fn get(endpoint: &str) -> Self {
        Self::new(RequestDescriptor::new(Method::Get, endpoint))
    }

    pub fn delete(endpoint: &str) -> Self {
        Self::new(RequestDescriptor::new(Method::Delete, endpoint))
    }

    pub fn post_json<B: Serialize>(endpoint: &str, body: &B) -> Result<Self, ApiError> {
        Self::with_json(Method::Post, endpoint, body)
    }

    pub fn put_json<B: Serialize>(endpoint: &str, body: &B) -> Result<Self, ApiError> {
        Self::with_json(Method::Put, endpoint, body)
    }

    pub fn patch_json<B: Serialize>(endpoint: &str, body: &B) -> Result<Self, ApiError> {
        Self::with_json(Method::Patch, endpoint, body)
    }

    pub fn with_json<B: Serialize>(method: Method, endpoint: &str, body: &B) -> Result<Self, ApiError> {
        Ok(Self::new(
            RequestDescriptor::new(method, endpoint).with_json_body(body)?,
        ))
    }

    pub fn without_cache(mut self) -> Self {
        self.cache_mode = CacheMode::Bypass;
        self
    }

    /// Skip the pre-flight cache check but keep the failure fallback.
    pub fn network_first(mut self) -> Self {
        if self.cache_mode != CacheMode::Bypass {
            self.cache_mode = CacheMode::NetworkFirst;
        }
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    fn uses_cache(&self) -> bool {
        self.descriptor.method() == Method::Get && self.cache_mode != CacheMode::Bypass
    }
}

/// Where a response came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ResponseSource {
    Network,
    /// Pre-flight cache hit.
    Cache,
    /// Cache entry served after the network path failed.
    Fallback,
    /// Raw result of an identical in-flight write.
    Dedup,
}

/// API response with metadata
#[derive(Debug, Clone)]
pub struct ApiResponse<T> {
    pub data: T,
    pub pagination: Option<Pagination>,
    pub source: ResponseSource,
    pub latency: Duration,
}

#[derive(Debug, Clone)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub has_more: bool,
    pub pagination: Option<Pagination>,
}

struct Fetched {
    body: Vec<u8>,
    source: ResponseSource,
}

pub struct ApiClientBuilder {
    config: ApiManagerConfig,
    rate_limits: RateLimitConfig,
    retry: RetryPolicy,
    dedup_window: Duration,
    cache: CacheConfig,
    transport: Option<Arc<dyn Transport>>,
    credentials: Option<Arc<dyn CredentialStore>>,
}

impl ApiClientBuilder {
    pub fn rate_limits(mut self, rate_limits: RateLimitConfig) -> Self {
        self.rate_limits = rate_limits;
        self
    }

    pub fn retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn dedup_window(mut self, window: Duration) -> Self {
        self.dedup_window = window;
        self
    }

    pub fn cache(mut self, cache: CacheConfig) -> Self {
        self.cache = cache;
        self
    }

    pub fn transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn credentials(mut self, credentials: Arc<dyn CredentialStore>) -> Self {
        self.credentials = Some(credentials);
        self
    }

    pub fn build(self) -> Result<ApiClient, ApiError> {
        let base_url = Url::parse(self.config.base_url.trim_end_matches('/')).map_err(|e| {
            ApiError::Config(format!("invalid base URL '{}': {}", self.config.base_url, e))
        })?;

        let transport: Arc<dyn Transport> = match self.transport {
            Some(transport) => transport,
            None => Arc::new(HttpTransport::new(&self.config.user_agent)?),
        };
        let credentials: Arc<dyn CredentialStore> = match self.credentials {
            Some(credentials) => credentials,
            None => Arc::new(StaticCredentials::default()),
        };

        info!("🏗️ Initializing API client for {}", base_url);
        Ok(ApiClient {
            base_url,
            admission: AdmissionController::new(self.rate_limits),
            dedup: Arc::new(DedupLedger::new(self.dedup_window)),
            cache: Arc::new(FallbackCache::new(self.cache)),
            retry: self.retry,
            transport,
            credentials,
            stats: RequestStats::default(),
            config: self.config,
        })
    }
}

/// Central API client coordinating all request handling
pub struct ApiClient {
    config: ApiManagerConfig,
    base_url: Url,
    admission: AdmissionController,
    dedup: Arc<DedupLedger>,
    cache: Arc<FallbackCache>,
    retry: RetryPolicy,
    transport: Arc<dyn Transport>,
    credentials: Arc<dyn CredentialStore>,
    stats: RequestStats,
}

impl ApiClient {
    pub fn builder(config: ApiManagerConfig) -> ApiClientBuilder {
        ApiClientBuilder {
            config,
            rate_limits: RateLimitConfig::default(),
            retry: RetryPolicy::default(),
            dedup_window: Duration::from_millis(100),
            cache: CacheConfig::default(),
            transport: None,
            credentials: None,
        }
    }

    /// Client wired entirely from application configuration.
    pub fn from_config(config: &Config) -> Result<Self, ApiError> {
        Self::builder(config.manager_config())
            .rate_limits(config.rate_limit_config())
            .retry_policy(config.retry_policy())
            .dedup_window(config.dedup_window())
            .cache(config.cache_config())
            .credentials(Arc::new(StaticCredentials::new(config.api_token.clone())))
            .build()
    }

    pub async fn get<T: DeserializeOwned>(
        &self,
        endpoint: &str,
        cancel: &CancellationToken,
    ) -> Result<T, ApiError> {
        self.request(&ApiRequest::get(endpoint), cancel).await
    }

    pub async fn request<T: DeserializeOwned>(
        &self,
        request: &ApiRequest,
        cancel: &CancellationToken,
    ) -> Result<T, ApiError> {
        self.request_with_meta(request, cancel)
            .await
            .map(|response| response.data)
    }

    /// Requests a list endpoint and keeps its paging metadata.
    pub async fn request_page<T: DeserializeOwned>(
        &self,
        request: &ApiRequest,
        cancel: &CancellationToken,
    ) -> Result<Page<T>, ApiError> {
        let response = self.request_with_meta::<Vec<T>>(request, cancel).await?;
        Ok(Page {
            has_more: response
                .pagination
                .as_ref()
                .map(|p| p.has_more)
                .unwrap_or(false),
            items: response.data,
            pagination: response.pagination,
        })
    }

    pub async fn request_with_meta<T: DeserializeOwned>(
        &self,
        request: &ApiRequest,
        cancel: &CancellationToken,
    ) -> Result<ApiResponse<T>, ApiError> {
        self.stats.record_request();
        let descriptor = &request.descriptor;
        let started = Instant::now();
        let requested_at = Utc::now();
        let mut timer = Timer::start(&format!("{} {}", descriptor.method(), descriptor.endpoint()));

        let url = match self.resolve_url(descriptor.endpoint()) {
            Ok(url) => url,
            Err(err) => {
                self.stats.record_failure();
                return Err(err);
            }
        };

        let cache_key = descriptor.cache_key();
        let cacheable = request.uses_cache() && self.cache.is_enabled();

        if cacheable && request.cache_mode == CacheMode::CacheFirst {
            if let Some(cached) = self.read_cached::<T>(&cache_key, requested_at).await {
                self.stats.record_cache_hit();
                debug!("💾 Served {} from cache", descriptor.endpoint());
                timer.checkpoint("cache");
                timer.finish_with_threshold(self.config.request_timeout);
                return Ok(ApiResponse {
                    data: cached.value,
                    pagination: cached.pagination,
                    source: ResponseSource::Cache,
                    latency: started.elapsed(),
                });
            }
        }

        let timeout = request.timeout.unwrap_or(self.config.request_timeout);
        let outcome = match self.fetch(descriptor, &url, timeout, cancel, &mut timer).await {
            Ok(fetched) => envelope::decode_with_meta::<T>(&fetched.body).map(|decoded| (fetched, decoded)),
            Err(err) => Err(err),
        };

        match outcome {
            Ok((fetched, decoded)) => {
                if cacheable && fetched.source == ResponseSource::Network {
                    self.cache
                        .write(&cache_key, descriptor.endpoint(), &fetched.body)
                        .await;
                }
                if fetched.source == ResponseSource::Network {
                    self.stats.record_network_success();
                }
                timer.finish_with_threshold(self.config.request_timeout);
                Ok(ApiResponse {
                    data: decoded.value,
                    pagination: decoded.pagination,
                    source: fetched.source,
                    latency: started.elapsed(),
                })
            }
            Err(err) => {
                timer.finish_with_threshold(self.config.request_timeout);
                self.recover(descriptor, err, cacheable, &cache_key, started, requested_at)
                    .await
            }
        }
    }

    /// Failure path: one fallback cache read, otherwise the original error.
    /// Entry liveness is judged as of `requested_at`, not after the backoff.
    async fn recover<T: DeserializeOwned>(
        &self,
        descriptor: &RequestDescriptor,
        err: ApiError,
        cacheable: bool,
        cache_key: &str,
        started: Instant,
        requested_at: DateTime<Utc>,
    ) -> Result<ApiResponse<T>, ApiError> {
        if cacheable {
            if let Some(cached) = self.read_cached::<T>(cache_key, requested_at).await {
                self.stats.record_fallback_hit();
                if err.is_cancelled() {
                    debug!("Cancelled {}; returning cached data", descriptor.endpoint());
                } else {
                    info!(
                        "🛟 {} {} failed ({}); serving cached response",
                        descriptor.method(),
                        descriptor.endpoint(),
                        err
                    );
                }
                return Ok(ApiResponse {
                    data: cached.value,
                    pagination: cached.pagination,
                    source: ResponseSource::Fallback,
                    latency: started.elapsed(),
                });
            }
        }

        if err.is_cancelled() {
            self.stats.record_cancelled();
            debug!("🚫 {} {} cancelled", descriptor.method(), descriptor.endpoint());
        } else {
            self.stats.record_failure();
            warn!(
                "❌ {} {} failed: {}",
                descriptor.method(),
                descriptor.endpoint(),
                err
            );
        }
        Err(err)
    }

    /// Reads and decodes a cache entry; an undecodable entry is removed.
    async fn read_cached<T: DeserializeOwned>(
        &self,
        cache_key: &str,
        as_of: DateTime<Utc>,
    ) -> Option<envelope::Decoded<T>> {
        let entry = self.cache.read_live_at(cache_key, as_of).await?;
        match envelope::decode_with_meta::<T>(&entry.payload) {
            Ok(decoded) => Some(decoded),
            Err(e) => {
                warn!("Cached payload for {} no longer decodes ({}); removing", cache_key, e);
                self.cache.remove(cache_key).await;
                None
            }
        }
    }

    /// Dedup, admission and the retried network attempts.
    async fn fetch(
        &self,
        descriptor: &RequestDescriptor,
        url: &Url,
        timeout: Duration,
        cancel: &CancellationToken,
        timer: &mut Timer,
    ) -> Result<Fetched, ApiError> {
        let key = descriptor.key();
        let guard = match self.dedup.begin(&key) {
            Some(guard) => Some(guard),
            None if !descriptor.method().is_idempotent() => {
                if let Some(body) = self.await_twin(&key, cancel).await? {
                    self.stats.record_dedup_reuse();
                    debug!("♻️ Reusing result of identical {}", key);
                    return Ok(Fetched {
                        body: body.as_ref().clone(),
                        source: ResponseSource::Dedup,
                    });
                }
                self.dedup.begin(&key)
            }
            None => {
                debug!("Identical {} already in flight; proceeding independently", key);
                None
            }
        };

        let permit = self.admission.acquire(cancel).await?;
        timer.checkpoint("admitted");

        let result = self
            .retry
            .execute(cancel, |attempt| {
                if attempt > 0 {
                    self.stats.record_retry();
                }
                self.attempt(descriptor, url, timeout, cancel, attempt)
            })
            .await;

        drop(permit);
        timer.checkpoint("network");

        let body = result?;
        if let Some(guard) = guard {
            guard.complete(body.clone());
        }
        Ok(Fetched {
            body,
            source: ResponseSource::Network,
        })
    }

    /// Waits up to the dedup window for an identical write's raw result.
    async fn await_twin(
        &self,
        key: &RequestKey,
        cancel: &CancellationToken,
    ) -> Result<Option<Arc<Vec<u8>>>, ApiError> {
        let deadline = Instant::now() + self.dedup.window();
        loop {
            if let Some(result) = self.dedup.recent_result(key) {
                return Ok(Some(result));
            }
            if !self.dedup.is_in_flight(key) || Instant::now() >= deadline {
                return Ok(None);
            }
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(ApiError::Cancelled),
                _ = sleep(TWIN_POLL_INTERVAL) => {}
            }
        }
    }

    /// One network attempt under an absolute timeout.
    async fn attempt(
        &self,
        descriptor: &RequestDescriptor,
        url: &Url,
        timeout: Duration,
        cancel: &CancellationToken,
        attempt: u32,
    ) -> Result<Vec<u8>, ApiError> {
        let request = HttpRequest {
            method: descriptor.method(),
            url: url.clone(),
            headers: self.build_headers(descriptor),
            body: descriptor.body().map(<[u8]>::to_vec),
            timeout,
        };
        debug!("📤 {} {} (attempt {})", request.method, request.url, attempt + 1);
        if let Some(body) = descriptor.body() {
            debug!("   body: {}", sanitize_json_for_log(body));
        }

        let response = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(ApiError::Cancelled),
            result = tokio::time::timeout(timeout, self.transport.send(request)) => match result {
                Ok(response) => response?,
                Err(_) => {
                    return Err(ApiError::transport(
                        TransportErrorKind::Timeout,
                        format!("no response within {:?}", timeout),
                    ))
                }
            },
        };

        check_status(response)
    }

    fn build_headers(&self, descriptor: &RequestDescriptor) -> Vec<(String, String)> {
        let method = descriptor.method();
        let mut headers: Vec<(String, String)> = vec![
            ("Content-Type".into(), "application/json".into()),
            ("Accept".into(), "application/json".into()),
            ("User-Agent".into(), self.config.user_agent.clone()),
            ("X-Request-ID".into(), Uuid::new_v4().to_string()),
            ("X-Request-Timestamp".into(), Utc::now().timestamp().to_string()),
        ];

        if let Some(body) = descriptor.body() {
            headers.push(("X-Request-Hash".into(), body_digest(body)));
        }
        if method.is_write() {
            headers.push(("Cache-Control".into(), "no-cache".into()));
        }

        match self.credentials.bearer_token() {
            Some(token) => headers.push(("Authorization".into(), format!("Bearer {}", token))),
            None if method.is_write() => {
                warn!("⚠️ {} {} sent without a bearer token", method, descriptor.endpoint())
            }
            None => {}
        }

        for (name, value) in descriptor.headers() {
            headers.retain(|(existing, _)| !existing.eq_ignore_ascii_case(name));
            headers.push((name.clone(), value.clone()));
        }
        headers
    }

    fn resolve_url(&self, endpoint: &str) -> Result<Url, ApiError> {
        if endpoint.is_empty() {
            return Err(ApiError::InvalidRequest("empty endpoint".to_string()));
        }
        let raw = if is_absolute_url(endpoint) {
            endpoint.to_string()
        } else {
            format!(
                "{}/{}",
                self.base_url.as_str().trim_end_matches('/'),
                endpoint.trim_start_matches('/')
            )
        };
        Url::parse(&raw)
            .map_err(|e| ApiError::InvalidRequest(format!("invalid URL '{}': {}", raw, e)))
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot(self.admission.peak_in_flight())
    }

    pub async fn admission_stats(&self) -> RateLimitStats {
        self.admission.get_usage_stats().await
    }

    pub fn cache(&self) -> &FallbackCache {
        &self.cache
    }

    pub async fn cache_usage(&self) -> CacheUsage {
        self.cache.usage().await
    }
}

/// Maps a raw HTTP response onto the error taxonomy.
pub fn check_status(response: RawResponse) -> Result<Vec<u8>, ApiError> {
    if response.is_success() {
        return Ok(response.body);
    }

    let status = response.status;
    let message = envelope::extract_error_message(&response.body);
    Err(match status {
        401 => message.map(ApiError::Application).unwrap_or(ApiError::Unauthorized),
        404 => ApiError::NotFound,
        408 | 429 | 500..=599 => ApiError::ServerError { status, message },
        _ => message
            .map(ApiError::Application)
            .unwrap_or(ApiError::UnexpectedStatus(status)),
    })
}
