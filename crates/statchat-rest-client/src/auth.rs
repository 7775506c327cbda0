//! Bearer-token handling for the REST client

use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use std::sync::{Arc, RwLock};

/// Shared holder for the primary session's bearer token
///
/// The session manager writes the token on login/restore and clears it on
/// logout; the REST client reads it when building authenticated requests.
/// Cloning shares the underlying cell.
#[derive(Debug, Clone, Default)]
pub struct BearerCell {
    token: Arc<RwLock<Option<String>>>,
}

impl BearerCell {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the stored token, or clear it with `None`
    pub fn set(&self, token: Option<String>) {
        let mut guard = self.token.write().unwrap_or_else(|e| e.into_inner());
        *guard = token;
    }

    /// Current token, if any
    pub fn get(&self) -> Option<String> {
        let guard = self.token.read().unwrap_or_else(|e| e.into_inner());
        guard.clone()
    }

    /// Headers for an authenticated request (`Authorization: Bearer <token>`)
    ///
    /// Empty when no token is held; callers that require auth surface the
    /// resulting 401 through the normal error path.
    pub fn headers(&self) -> Result<HeaderMap, Box<dyn std::error::Error + Send + Sync>> {
        let mut headers = HeaderMap::new();
        if let Some(token) = self.get() {
            let value = format!("Bearer {}", token);
            headers.insert(
                HeaderName::from_static("authorization"),
                HeaderValue::from_str(&value)?,
            );
        }
        Ok(headers)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bearer_headers_present_when_token_set() {
        let cell = BearerCell::new();
        cell.set(Some("jwt-token".into()));
        let headers = cell.headers().unwrap();
        assert_eq!(headers.get("authorization").unwrap(), "Bearer jwt-token");
    }

    #[test]
    fn bearer_headers_empty_without_token() {
        let cell = BearerCell::new();
        let headers = cell.headers().unwrap();
        assert!(headers.get("authorization").is_none());
    }

    #[test]
    fn clones_share_the_cell() {
        let cell = BearerCell::new();
        let other = cell.clone();
        cell.set(Some("t1".into()));
        assert_eq!(other.get().as_deref(), Some("t1"));
        other.set(None);
        assert!(cell.get().is_none());
    }
}
