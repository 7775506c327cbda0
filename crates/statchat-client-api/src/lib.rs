//! Client API trait for the statchat backend
//!
//! The session, escalation, and chat managers all talk to the backend
//! through this trait so tests can substitute a scripted mock.

use async_trait::async_trait;
use statchat_api_contract::*;
use thiserror::Error;

/// Client-facing error taxonomy
///
/// `Denied` carries the server-supplied `detail` for credential rejections
/// (bad login, taken username, wrong admin password) so the UI can show the
/// actual reason instead of a generic failure. `Unauthorized` is reserved
/// for an invalid or expired bearer token on an authenticated call; callers
/// treat it as a signal to tear the session down.
#[derive(Debug, Clone, Error)]
pub enum ApiError {
    #[error("network failure: {0}")]
    Network(String),

    #[error("session token rejected")]
    Unauthorized,

    #[error("{0}")]
    Denied(String),

    #[error("server error {status}: {detail}")]
    Server { status: u16, detail: String },

    #[error("malformed response: {0}")]
    Decode(String),
}

impl ApiError {
    /// True for credential rejections as opposed to transport problems
    pub fn is_denied(&self) -> bool {
        matches!(self, ApiError::Denied(_))
    }
}

pub type ApiResult<T> = Result<T, ApiError>;

/// Backend REST surface consumed by the state managers
///
/// Implementations attach `Authorization: Bearer <token>` to every request
/// except login, register, verify, and escalation. The bearer value is
/// pushed in by the session manager via [`ClientApi::set_bearer`].
#[async_trait]
pub trait ClientApi: Send + Sync {
    /// Replace (or clear) the bearer token used for authenticated calls
    fn set_bearer(&self, token: Option<String>);

    async fn login(&self, request: &LoginRequest) -> ApiResult<AuthResponse>;
    async fn register(&self, request: &RegisterRequest) -> ApiResult<AuthResponse>;
    async fn verify(&self, token: &str) -> ApiResult<VerifyResponse>;
    /// Best-effort server-side logout; callers swallow errors
    async fn logout(&self) -> ApiResult<()>;

    async fn escalate(&self, request: &EscalationRequest) -> ApiResult<EscalationToken>;

    async fn send_message(&self, request: &ChatRequest) -> ApiResult<ChatResponse>;
    async fn chat_history(&self) -> ApiResult<Vec<ChatMessage>>;
    async fn clear_history(&self) -> ApiResult<()>;
}
