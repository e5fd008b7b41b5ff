pub mod settings;

pub use settings::Config;

use crate::error::ApiError;
use std::sync::Arc;

/// Loads `.env` (if present) and the process environment into a validated
/// configuration.
pub fn load_config() -> Result<Arc<Config>, ApiError> {
    dotenv::dotenv().ok(); // Load .env file if present, ignore errors

    let config = Config::from_env();
    validate(&config)?;
    config.validate_and_log();

    Ok(Arc::new(config))
}

pub fn validate(config: &Config) -> Result<(), ApiError> {
    if config.api_base_url.trim().is_empty() {
        return Err(ApiError::Config("API_BASE_URL cannot be empty".to_string()));
    }
    url::Url::parse(&config.api_base_url).map_err(|e| {
        ApiError::Config(format!(
            "API_BASE_URL '{}' is not a valid URL: {}",
            config.api_base_url, e
        ))
    })?;
    if config.max_concurrent_requests == 0 {
        return Err(ApiError::Config("API_MAX_CONCURRENT must be at least 1".to_string()));
    }
    if config.max_requests_per_window == 0 {
        return Err(ApiError::Config("API_MAX_PER_WINDOW must be at least 1".to_string()));
    }
    if config.rate_window_ms == 0 {
        return Err(ApiError::Config("API_RATE_WINDOW_MS must be positive".to_string()));
    }
    if config.max_attempts == 0 {
        return Err(ApiError::Config("API_MAX_ATTEMPTS must be at least 1".to_string()));
    }
    Ok(())
}
