//! Source of the bearer token attached to outbound requests.

use std::sync::RwLock;

pub trait CredentialStore: Send + Sync {
    fn bearer_token(&self) -> Option<String>;
}

/// Token held in memory; can be swapped after login or cleared on logout.
#[derive(Debug, Default)]
pub struct StaticCredentials {
    token: RwLock<Option<String>>,
}

impl StaticCredentials {
    pub fn new(token: Option<String>) -> Self {
        Self {
            token: RwLock::new(token.filter(|t| !t.trim().is_empty())),
        }
    }

    pub fn set_token(&self, token: Option<String>) {
        if let Ok(mut guard) = self.token.write() {
            *guard = token.filter(|t| !t.trim().is_empty());
        }
    }
}

impl CredentialStore for StaticCredentials {
    fn bearer_token(&self) -> Option<String> {
        self.token.read().ok().and_then(|guard| guard.clone())
    }
}

impl<F> CredentialStore for F
where
    F: Fn() -> Option<String> + Send + Sync,
{
    fn bearer_token(&self) -> Option<String> {
        self()
    }
}
