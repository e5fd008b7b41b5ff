pub mod api;
pub mod cache;
pub mod config;
pub mod error;
pub mod utils;

// Re-export the types most callers need
pub use api::{ApiClient, ApiRequest, CacheMode, Method, RequestDescriptor};
pub use cache::{CacheConfig, FallbackCache};
pub use config::Config;
pub use error::{ApiError, ErrorCategory, TransportErrorKind};
