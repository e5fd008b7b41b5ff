use std::env;
use std::path::PathBuf;
use std::time::Duration;

use crate::api::manager::ApiManagerConfig;
use crate::api::rate_limiter::RateLimitConfig;
use crate::api::retry::RetryPolicy;
use crate::cache::CacheConfig;

pub const DEFAULT_BASE_URL: &str = "http://127.0.0.1:8080/api";
pub const DEFAULT_TTL_OVERRIDES: &str = "communities.php:1000";

#[derive(Clone)]
pub struct Config {
    pub api_base_url: String,
    pub api_token: Option<String>,
    pub user_agent: String,
    pub request_timeout_secs: u64,
    pub max_concurrent_requests: usize,
    pub max_requests_per_window: usize,
    pub rate_window_ms: u64,
    pub max_attempts: u32,
    pub retry_base_delay_ms: u64,
    pub retry_jitter: bool,
    pub dedup_window_ms: u64,
    pub cache_enabled: bool,
    pub cache_dir: PathBuf,
    pub cache_ttl_ms: u64,
    pub cache_ttl_overrides: Vec<(String, u64)>,
    pub cache_max_bytes: u64,
    pub cache_max_entries: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            api_base_url: DEFAULT_BASE_URL.to_string(),
            api_token: None,
            user_agent: default_user_agent(),
            request_timeout_secs: 30,
            max_concurrent_requests: 12,
            max_requests_per_window: 30,
            rate_window_ms: 1000,
            max_attempts: 3,
            retry_base_delay_ms: 1000,
            retry_jitter: false,
            dedup_window_ms: 100,
            cache_enabled: true,
            cache_dir: env::temp_dir().join("campus-api-cache"),
            cache_ttl_ms: 2000,
            cache_ttl_overrides: parse_ttl_overrides(DEFAULT_TTL_OVERRIDES),
            cache_max_bytes: 100 * 1024 * 1024,
            cache_max_entries: 500,
        }
    }
}

// Token stays out of Debug output so config dumps are safe to log.
impl std::fmt::Debug for Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Config")
            .field("api_base_url", &self.api_base_url)
            .field("api_token", &self.api_token.as_ref().map(|_| "***"))
            .field("user_agent", &self.user_agent)
            .field("request_timeout_secs", &self.request_timeout_secs)
            .field("max_concurrent_requests", &self.max_concurrent_requests)
            .field("max_requests_per_window", &self.max_requests_per_window)
            .field("rate_window_ms", &self.rate_window_ms)
            .field("max_attempts", &self.max_attempts)
            .field("retry_base_delay_ms", &self.retry_base_delay_ms)
            .field("retry_jitter", &self.retry_jitter)
            .field("dedup_window_ms", &self.dedup_window_ms)
            .field("cache_enabled", &self.cache_enabled)
            .field("cache_dir", &self.cache_dir)
            .field("cache_ttl_ms", &self.cache_ttl_ms)
            .field("cache_ttl_overrides", &self.cache_ttl_overrides)
            .field("cache_max_bytes", &self.cache_max_bytes)
            .field("cache_max_entries", &self.cache_max_entries)
            .finish()
    }
}

fn default_user_agent() -> String {
    format!("campus-api-client/{}", env!("CARGO_PKG_VERSION"))
}

fn parse_env<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

/// Parses `prefix:ms,prefix:ms` pairs, skipping malformed parts.
pub fn parse_ttl_overrides(raw: &str) -> Vec<(String, u64)> {
    raw.split(',')
        .filter_map(|part| {
            let (prefix, ms) = part.rsplit_once(':')?;
            let prefix = prefix.trim();
            if prefix.is_empty() {
                return None;
            }
            let ms = ms.trim().parse::<u64>().ok()?;
            Some((prefix.to_string(), ms))
        })
        .collect()
}

impl Config {
    pub fn from_env() -> Self {
        let defaults = Config::default();
        Config {
            api_base_url: env::var("API_BASE_URL")
                .or_else(|_| env::var("FOURKAMPUS_API_BASE_URL"))
                .ok()
                .filter(|v| !v.trim().is_empty())
                .unwrap_or(defaults.api_base_url),
            api_token: env::var("API_TOKEN").ok().filter(|t| !t.is_empty()),
            user_agent: env::var("API_USER_AGENT").unwrap_or(defaults.user_agent),
            request_timeout_secs: parse_env("API_REQUEST_TIMEOUT_SECS", defaults.request_timeout_secs),
            max_concurrent_requests: parse_env("API_MAX_CONCURRENT", defaults.max_concurrent_requests),
            max_requests_per_window: parse_env("API_MAX_PER_WINDOW", defaults.max_requests_per_window),
            rate_window_ms: parse_env("API_RATE_WINDOW_MS", defaults.rate_window_ms),
            max_attempts: parse_env("API_MAX_ATTEMPTS", defaults.max_attempts),
            retry_base_delay_ms: parse_env("API_RETRY_BASE_DELAY_MS", defaults.retry_base_delay_ms),
            retry_jitter: parse_env("API_RETRY_JITTER", defaults.retry_jitter),
            dedup_window_ms: parse_env("API_DEDUP_WINDOW_MS", defaults.dedup_window_ms),
            cache_enabled: parse_env("API_CACHE_ENABLED", defaults.cache_enabled),
            cache_dir: env::var("API_CACHE_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.cache_dir),
            cache_ttl_ms: parse_env("API_CACHE_TTL_MS", defaults.cache_ttl_ms),
            cache_ttl_overrides: env::var("API_CACHE_TTL_OVERRIDES")
                .map(|s| parse_ttl_overrides(&s))
                .unwrap_or(defaults.cache_ttl_overrides),
            cache_max_bytes: parse_env("API_CACHE_MAX_BYTES", defaults.cache_max_bytes),
            cache_max_entries: parse_env("API_CACHE_MAX_ENTRIES", defaults.cache_max_entries),
        }
    }

    pub fn validate_and_log(&self) {
        log::info!("Application Configuration Loaded: {:?}", self);
        if self.max_requests_per_window < self.max_concurrent_requests {
            log::warn!(
                "API_MAX_PER_WINDOW ({}) is below API_MAX_CONCURRENT ({}); the window cap will dominate",
                self.max_requests_per_window,
                self.max_concurrent_requests
            );
        }
    }

    pub fn rate_limit_config(&self) -> RateLimitConfig {
        RateLimitConfig {
            max_concurrent: self.max_concurrent_requests,
            max_per_window: self.max_requests_per_window,
            window: Duration::from_millis(self.rate_window_ms),
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts,
            base_delay: Duration::from_millis(self.retry_base_delay_ms),
            enable_jitter: self.retry_jitter,
            ..RetryPolicy::default()
        }
    }

    pub fn cache_config(&self) -> CacheConfig {
        CacheConfig {
            enabled: self.cache_enabled,
            directory: self.cache_dir.clone(),
            default_ttl: Duration::from_millis(self.cache_ttl_ms),
            ttl_overrides: self
                .cache_ttl_overrides
                .iter()
                .map(|(prefix, ms)| (prefix.clone(), Duration::from_millis(*ms)))
                .collect(),
            max_total_bytes: self.cache_max_bytes,
            max_entries: self.cache_max_entries,
        }
    }

    pub fn dedup_window(&self) -> Duration {
        Duration::from_millis(self.dedup_window_ms)
    }

    pub fn manager_config(&self) -> ApiManagerConfig {
        ApiManagerConfig {
            base_url: self.api_base_url.clone(),
            request_timeout: Duration::from_secs(self.request_timeout_secs),
            user_agent: self.user_agent.clone(),
        }
    }
}
