//! Request identity: methods, normalized endpoints, dedup keys and cache keys.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::str::FromStr;

use crate::error::ApiError;

/// Longest cache key kept verbatim; longer keys are replaced by a digest so
/// they stay valid file names.
const MAX_PLAIN_CACHE_KEY_LEN: usize = 150;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Method {
    Get,
    Post,
    Put,
    Delete,
    Patch,
}

impl Method {
    pub fn as_str(&self) -> &'static str {
        match self {
            Method::Get => "GET",
            Method::Post => "POST",
            Method::Put => "PUT",
            Method::Delete => "DELETE",
            Method::Patch => "PATCH",
        }
    }

    /// POST and PATCH are the only methods whose duplicates get suppressed.
    pub fn is_idempotent(&self) -> bool {
        !matches!(self, Method::Post | Method::Patch)
    }

    pub fn is_write(&self) -> bool {
        !matches!(self, Method::Get)
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Method {
    type Err = ApiError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "GET" => Ok(Method::Get),
            "POST" => Ok(Method::Post),
            "PUT" => Ok(Method::Put),
            "DELETE" => Ok(Method::Delete),
            "PATCH" => Ok(Method::Patch),
            other => Err(ApiError::InvalidRequest(format!("unsupported method '{}'", other))),
        }
    }
}

/// Stable identity of a request: method + endpoint + body digest.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RequestKey(String);

impl RequestKey {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RequestKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Immutable description of one logical request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestDescriptor {
    endpoint: String,
    method: Method,
    body: Option<Vec<u8>>,
    headers: Vec<(String, String)>,
}

impl RequestDescriptor {
    pub fn new(method: Method, endpoint: &str) -> Self {
        Self {
            endpoint: normalize_endpoint(endpoint),
            method,
            body: None,
            headers: Vec::new(),
        }
    }

    pub fn with_body(mut self, body: Vec<u8>) -> Self {
        self.body = Some(body);
        self
    }

    pub fn with_json_body<B: Serialize>(self, body: &B) -> Result<Self, ApiError> {
        let bytes = serde_json::to_vec(body)
            .map_err(|e| ApiError::InvalidRequest(format!("body is not serializable: {}", e)))?;
        Ok(self.with_body(bytes))
    }

    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        self.headers.push((name.to_string(), value.to_string()));
        self
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub fn method(&self) -> Method {
        self.method
    }

    pub fn body(&self) -> Option<&[u8]> {
        self.body.as_deref()
    }

    pub fn headers(&self) -> &[(String, String)] {
        &self.headers
    }

    pub fn key(&self) -> RequestKey {
        let mut key = format!("{}_{}", self.method.as_str(), self.endpoint);
        if let Some(body) = &self.body {
            key.push('_');
            key.push_str(&body_digest(body)[..16]);
        }
        RequestKey(key)
    }

    /// Key of the fallback-cache entry for this request's endpoint.
    pub fn cache_key(&self) -> String {
        cache_key_for(&self.endpoint)
    }
}

/// Trims whitespace, drops any `#fragment` and the leading `/` of relative
/// endpoints. Absolute URLs keep their scheme and host.
pub fn normalize_endpoint(raw: &str) -> String {
    let trimmed = raw.trim();
    let without_fragment = match trimmed.find('#') {
        Some(idx) => &trimmed[..idx],
        None => trimmed,
    };
    if is_absolute_url(without_fragment) {
        return without_fragment.to_string();
    }
    without_fragment.trim_start_matches('/').to_string()
}

pub fn is_absolute_url(endpoint: &str) -> bool {
    endpoint.starts_with("http://") || endpoint.starts_with("https://")
}

/// Maps an endpoint to a file-system safe key: `events.php?limit=10`
/// becomes `events.php_limit_10`.
pub fn cache_key_for(endpoint: &str) -> String {
    let mut key = String::with_capacity(endpoint.len());
    for ch in endpoint.chars() {
        match ch {
            '/' | '?' | '&' | '=' => key.push('_'),
            c if c.is_ascii_alphanumeric() || c == '.' || c == '_' || c == '-' => key.push(c),
            c => {
                let mut buf = [0u8; 4];
                for byte in c.encode_utf8(&mut buf).bytes() {
                    key.push_str(&format!("%{:02X}", byte));
                }
            }
        }
    }

    // No hidden files
    if key.starts_with('.') {
        key.replace_range(0..1, "%2E");
    }

    if key.len() > MAX_PLAIN_CACHE_KEY_LEN {
        return format!("h_{}", body_digest(endpoint.as_bytes()));
    }
    key
}

/// Hex SHA-256 of a payload.
pub fn body_digest(body: &[u8]) -> String {
    hex::encode(Sha256::digest(body))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalization_strips_leading_slash_and_fragment() {
        assert_eq!(normalize_endpoint("/events.php?limit=10"), "events.php?limit=10");
        assert_eq!(normalize_endpoint("  events.php#top "), "events.php");
        assert_eq!(
            normalize_endpoint("https://api.example.org/v1/events.php"),
            "https://api.example.org/v1/events.php"
        );
    }

    #[test]
    fn cache_key_replaces_separators() {
        assert_eq!(cache_key_for("events.php?limit=10"), "events.php_limit_10");
        assert_eq!(
            cache_key_for("communities.php?university_id=3&limit=30"),
            "communities.php_university_id_3_limit_30"
        );
        assert_eq!(cache_key_for("search.php?q=çay"), "search.php_q_%C3%A7ay");
    }

    #[test]
    fn long_cache_keys_are_hashed() {
        let endpoint = format!("events.php?ids={}", "1,".repeat(200));
        let key = cache_key_for(&endpoint);
        assert!(key.starts_with("h_"));
        assert_eq!(key.len(), 2 + 64);
        assert_eq!(key, cache_key_for(&endpoint));
    }

    #[test]
    fn request_key_includes_method_and_body_digest() {
        let get = RequestDescriptor::new(Method::Get, "/events.php?limit=10");
        assert_eq!(get.key().as_str(), "GET_events.php?limit=10");

        let login_a = RequestDescriptor::new(Method::Post, "login.php").with_body(b"{\"a\":1}".to_vec());
        let login_b = RequestDescriptor::new(Method::Post, "login.php").with_body(b"{\"a\":2}".to_vec());
        assert_ne!(login_a.key(), login_b.key());
        assert!(login_a.key().as_str().starts_with("POST_login.php_"));
        assert_eq!(login_a.key(), login_a.clone().key());
    }

    #[test]
    fn method_parsing_and_idempotency() {
        assert_eq!("get".parse::<Method>().unwrap(), Method::Get);
        assert_eq!(" PATCH ".parse::<Method>().unwrap(), Method::Patch);
        assert!("TRACE".parse::<Method>().is_err());
        assert!(Method::Get.is_idempotent());
        assert!(Method::Put.is_idempotent());
        assert!(!Method::Post.is_idempotent());
        assert!(Method::Delete.is_write());
    }
}
