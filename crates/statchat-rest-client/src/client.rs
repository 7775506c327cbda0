//! Main REST API client implementation

use async_trait::async_trait;
use reqwest::{Client as HttpClient, Method, Response};
use serde::de::DeserializeOwned;
use statchat_api_contract::*;
use statchat_client_api::{ApiError, ApiResult, ClientApi};
use tracing::debug;
use url::Url;

use crate::auth::BearerCell;
use crate::error::{classify_status, classify_transport};

/// Default backend address, overridable via `STATCHAT_API_URL`
pub const DEFAULT_API_URL: &str = "http://localhost:8000";

/// REST API client for the statchat backend
#[derive(Debug, Clone)]
pub struct RestClient {
    http_client: HttpClient,
    base_url: Url,
    bearer: BearerCell,
}

impl RestClient {
    /// Create a new REST client
    pub fn new(base_url: Url) -> Self {
        let http_client = HttpClient::builder()
            .user_agent("statchat/1.0")
            .build()
            .expect("Failed to create HTTP client");

        Self {
            http_client,
            base_url,
            bearer: BearerCell::new(),
        }
    }

    /// Create a client from a base URL string
    pub fn from_url(base_url: &str) -> ApiResult<Self> {
        let base_url =
            Url::parse(base_url).map_err(|e| ApiError::Network(format!("bad base url: {e}")))?;
        Ok(Self::new(base_url))
    }

    /// Create a client from `STATCHAT_API_URL`, falling back to localhost
    pub fn from_env() -> ApiResult<Self> {
        let base = std::env::var("STATCHAT_API_URL").unwrap_or_else(|_| DEFAULT_API_URL.into());
        Self::from_url(&base)
    }

    /// Get the base URL
    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    /// Handle on the shared bearer cell
    pub fn bearer(&self) -> &BearerCell {
        &self.bearer
    }

    // Private helper methods

    async fn get_authed<T: DeserializeOwned>(&self, path: &str) -> ApiResult<T> {
        self.request(Method::GET, path, None::<&()>, true).await
    }

    async fn post_authed<T: DeserializeOwned, B: serde::Serialize>(
        &self,
        path: &str,
        body: &B,
    ) -> ApiResult<T> {
        self.request(Method::POST, path, Some(body), true).await
    }

    async fn post_credential<T: DeserializeOwned, B: serde::Serialize>(
        &self,
        path: &str,
        body: &B,
    ) -> ApiResult<T> {
        self.request(Method::POST, path, Some(body), false).await
    }

    async fn request<T: DeserializeOwned, B: serde::Serialize>(
        &self,
        method: Method,
        path: &str,
        body: Option<&B>,
        authed: bool,
    ) -> ApiResult<T> {
        let url = self
            .base_url
            .join(path)
            .map_err(|e| ApiError::Network(format!("bad request path: {e}")))?;

        let mut request = self.http_client.request(method.clone(), url);

        if authed {
            let headers = self
                .bearer
                .headers()
                .map_err(|e| ApiError::Network(e.to_string()))?;
            request = request.headers(headers);
        }

        if let Some(body) = body {
            request = request.json(body);
        }

        debug!(%method, path, authed, "dispatching request");
        let response = request.send().await.map_err(classify_transport)?;
        self.handle_response(response, authed).await
    }

    async fn handle_response<T: DeserializeOwned>(
        &self,
        response: Response,
        authed: bool,
    ) -> ApiResult<T> {
        let status = response.status();
        let text = response.text().await.map_err(classify_transport)?;

        if status.is_success() {
            serde_json::from_str(&text).map_err(|e| ApiError::Decode(e.to_string()))
        } else {
            Err(classify_status(status, &text, authed))
        }
    }
}

#[async_trait]
impl ClientApi for RestClient {
    fn set_bearer(&self, token: Option<String>) {
        self.bearer.set(token);
    }

    async fn login(&self, request: &LoginRequest) -> ApiResult<AuthResponse> {
        self.post_credential("/api/auth/login", request).await
    }

    async fn register(&self, request: &RegisterRequest) -> ApiResult<AuthResponse> {
        self.post_credential("/api/auth/register", request).await
    }

    async fn verify(&self, token: &str) -> ApiResult<VerifyResponse> {
        let mut url = self
            .base_url
            .join("/api/auth/verify")
            .map_err(|e| ApiError::Network(format!("bad request path: {e}")))?;
        url.query_pairs_mut().append_pair("token", token);

        let response = self
            .http_client
            .get(url)
            .send()
            .await
            .map_err(classify_transport)?;
        self.handle_response(response, false).await
    }

    async fn logout(&self) -> ApiResult<()> {
        // Response body is ignored; the call is best-effort
        let url = self
            .base_url
            .join("/api/auth/logout")
            .map_err(|e| ApiError::Network(format!("bad request path: {e}")))?;
        self.http_client
            .post(url)
            .send()
            .await
            .map_err(classify_transport)?;
        Ok(())
    }

    async fn escalate(&self, request: &EscalationRequest) -> ApiResult<EscalationToken> {
        self.post_credential("/api/chat/auth", request).await
    }

    async fn send_message(&self, request: &ChatRequest) -> ApiResult<ChatResponse> {
        self.post_authed("/api/chat/message", request).await
    }

    async fn chat_history(&self) -> ApiResult<Vec<ChatMessage>> {
        self.get_authed("/api/chat/history").await
    }

    async fn clear_history(&self) -> ApiResult<()> {
        let url = self
            .base_url
            .join("/api/chat/clear")
            .map_err(|e| ApiError::Network(format!("bad request path: {e}")))?;
        let headers = self
            .bearer
            .headers()
            .map_err(|e| ApiError::Network(e.to_string()))?;

        let response = self
            .http_client
            .post(url)
            .headers(headers)
            .send()
            .await
            .map_err(classify_transport)?;

        let status = response.status();
        if status.is_success() {
            // 2xx with an empty body
            Ok(())
        } else {
            let text = response.text().await.map_err(classify_transport)?;
            Err(classify_status(status, &text, true))
        }
    }
}
