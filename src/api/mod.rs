// src/api/mod.rs
//! Request pipeline for the campus backend.
//!
//! - admission control (concurrency + sliding-window rate cap)
//! - in-flight deduplication
//! - retry with exponential backoff
//! - envelope/bare response decoding
//! - orchestration with disk fallback (see [`crate::cache`])

pub mod credentials;
pub mod dedup;
pub mod envelope;
pub mod manager;
pub mod rate_limiter;
pub mod request;
pub mod retry;
pub mod stats;
pub mod transport;

pub use credentials::{CredentialStore, StaticCredentials};
pub use dedup::{DedupLedger, InFlightGuard};
pub use envelope::{decode, decode_with_meta, Decoded, Pagination, PayloadShape, ResponseEnvelope};
pub use manager::{
    ApiClient, ApiClientBuilder, ApiManagerConfig, ApiRequest, ApiResponse, CacheMode, Page,
    ResponseSource,
};
pub use rate_limiter::{AdmissionController, AdmissionPermit, RateLimitConfig, RateLimitStats};
pub use request::{Method, RequestDescriptor, RequestKey};
pub use retry::RetryPolicy;
pub use stats::StatsSnapshot;
pub use transport::{HttpRequest, HttpTransport, RawResponse, Transport};
