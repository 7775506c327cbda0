//! Primary session lifecycle
//!
//! Owns the authenticated `Session`: login, registration, logout, and
//! start-up verification/restoration. State is published over a watch
//! channel so consumers render reactively; no other component mutates the
//! session.

use serde::{Deserialize, Serialize};
use statchat_api_contract::{
    AuthResponse, LoginRequest, RegisterRequest, Session, UserRole,
};
use statchat_client_api::{ApiError, ClientApi};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, info, warn};
use validator::Validate;

use crate::storage::{keys, StorageError, StoragePort};

/// Lifecycle states of the primary session
///
/// `Unknown -> Restoring -> { Anonymous | Authenticated }`;
/// `Authenticated -> Anonymous` via logout or failed verification;
/// `Anonymous -> Authenticated` via login/register or verification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionState {
    /// Before the start-up restore has been attempted
    Unknown,
    /// Restore in flight
    Restoring,
    /// No session
    Anonymous,
    Authenticated(Session),
}

impl SessionState {
    pub fn session(&self) -> Option<&Session> {
        match self {
            SessionState::Authenticated(session) => Some(session),
            _ => None,
        }
    }
}

#[derive(Debug, Error)]
pub enum SessionError {
    /// Bad login credentials; carries the server-supplied message
    #[error("{0}")]
    Authentication(String),

    /// Registration rejected (e.g. username taken)
    #[error("{0}")]
    Registration(String),

    #[error("network failure: {0}")]
    Network(String),

    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// Persisted user record: the session minus its token
#[derive(Debug, Serialize, Deserialize)]
struct StoredUser {
    user_id: i64,
    username: String,
    role: UserRole,
}

impl StoredUser {
    fn into_session(self, token: String) -> Session {
        Session {
            user_id: self.user_id,
            username: self.username,
            role: self.role,
            token,
        }
    }
}

/// First validation message, flattened for user display
fn validate_register(request: &RegisterRequest) -> Result<(), String> {
    request.validate().map_err(|errors| {
        errors
            .field_errors()
            .values()
            .flat_map(|errs| errs.iter())
            .filter_map(|e| e.message.as_ref().map(|m| m.to_string()))
            .next()
            .unwrap_or_else(|| "Invalid registration data".to_string())
    })
}

/// Owner of the primary authenticated session
pub struct SessionManager<C: ClientApi> {
    client: Arc<C>,
    storage: Arc<dyn StoragePort>,
    state: watch::Sender<SessionState>,
    restore_guard: tokio::sync::Mutex<()>,
}

impl<C: ClientApi> SessionManager<C> {
    pub fn new(client: Arc<C>, storage: Arc<dyn StoragePort>) -> Self {
        let (state, _) = watch::channel(SessionState::Unknown);
        Self {
            client,
            storage,
            state,
            restore_guard: tokio::sync::Mutex::new(()),
        }
    }

    /// Subscribe to session state changes
    pub fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.state.subscribe()
    }

    /// Current state snapshot
    pub fn current(&self) -> SessionState {
        self.state.borrow().clone()
    }

    /// Authenticate against the backend and persist the session
    ///
    /// On failure the prior state is left untouched.
    pub async fn login(&self, username: &str, password: &str) -> Result<Session, SessionError> {
        let request = LoginRequest {
            username: username.to_string(),
            password: password.to_string(),
        };
        let response = self.client.login(&request).await.map_err(|e| match e {
            ApiError::Denied(detail) => SessionError::Authentication(detail),
            other => SessionError::Network(other.to_string()),
        })?;

        info!(username, "login succeeded");
        self.install_session(response)
    }

    /// Create an account and sign in
    pub async fn register(
        &self,
        username: &str,
        password: &str,
        first_name: Option<&str>,
    ) -> Result<Session, SessionError> {
        let request = RegisterRequest {
            username: username.to_string(),
            password: password.to_string(),
            first_name: first_name.map(str::to_string),
        };
        validate_register(&request).map_err(SessionError::Registration)?;

        let response = self.client.register(&request).await.map_err(|e| match e {
            ApiError::Denied(detail) => SessionError::Registration(detail),
            other => SessionError::Network(other.to_string()),
        })?;

        info!(username, "registration succeeded");
        self.install_session(response)
    }

    fn install_session(&self, response: AuthResponse) -> Result<Session, SessionError> {
        let session = response.into_session();
        let stored = StoredUser {
            user_id: session.user_id,
            username: session.username.clone(),
            role: session.role,
        };
        self.storage.set(keys::AUTH_TOKEN, &session.token)?;
        self.storage
            .set(keys::AUTH_USER, &serde_json::to_string(&stored).map_err(StorageError::from)?)?;
        self.client.set_bearer(Some(session.token.clone()));
        self.state.send_replace(SessionState::Authenticated(session.clone()));
        Ok(session)
    }

    /// Clear the session locally and notify the backend best-effort
    ///
    /// Always locally successful: backend failures are swallowed. Callers
    /// compose the cross-cutting cache and escalation clearing (see
    /// `App::logout`).
    pub async fn logout(&self) {
        self.purge_local();
        if let Err(e) = self.client.logout().await {
            debug!(error = %e, "backend logout ignored");
        }
    }

    /// Tear the session down without contacting the backend
    ///
    /// Used when an authenticated call reports the bearer token invalid.
    pub fn force_logout(&self) {
        warn!("session rejected by backend, forcing logout");
        self.purge_local();
    }

    fn purge_local(&self) {
        for key in [keys::AUTH_TOKEN, keys::AUTH_USER, keys::CHAT_SESSION_ID] {
            if let Err(e) = self.storage.remove(key) {
                warn!(key, error = %e, "failed to clear storage entry");
            }
        }
        self.client.set_bearer(None);
        self.state.send_replace(SessionState::Anonymous);
    }

    /// Verify persisted credentials at start-up and restore the session
    ///
    /// Idempotent and safe to race with an explicit `login`: a session
    /// installed by login is never clobbered back to Anonymous, and the
    /// purge only fires while the verified token is still the stored one.
    pub async fn verify_and_restore(&self) -> Result<(), SessionError> {
        let _guard = self.restore_guard.lock().await;

        // A login that already landed wins; re-running restore is a no-op
        if matches!(&*self.state.borrow(), SessionState::Authenticated(_)) {
            return Ok(());
        }

        let token = self.storage.get(keys::AUTH_TOKEN)?;
        let user_json = self.storage.get(keys::AUTH_USER)?;

        let (token, user_json) = match (token, user_json) {
            (Some(token), Some(user)) => (token, user),
            (None, None) => {
                // Nothing persisted: not an error
                self.settle_anonymous(None);
                return Ok(());
            }
            _ => {
                // Half the pair is missing; drop the orphan so it does not
                // linger across restarts
                warn!("partial persisted session, purging");
                let _ = self.storage.remove(keys::AUTH_TOKEN);
                let _ = self.storage.remove(keys::AUTH_USER);
                self.settle_anonymous(None);
                return Ok(());
            }
        };

        let stored: StoredUser = match serde_json::from_str(&user_json) {
            Ok(stored) => stored,
            Err(e) => {
                warn!(error = %e, "malformed persisted user, purging");
                self.settle_anonymous(Some(&token));
                return Ok(());
            }
        };

        self.state.send_if_modified(|state| {
            if matches!(state, SessionState::Unknown) {
                *state = SessionState::Restoring;
                true
            } else {
                false
            }
        });

        match self.client.verify(&token).await {
            Ok(response) if response.valid => {
                // A login that completed while verify was in flight wins;
                // the verified-but-stale session is discarded
                let session = stored.into_session(token);
                let installed = self.state.send_if_modified(|state| {
                    if matches!(state, SessionState::Authenticated(_)) {
                        false
                    } else {
                        *state = SessionState::Authenticated(session.clone());
                        true
                    }
                });
                if installed {
                    info!(username = %session.username, "session restored");
                    self.client.set_bearer(Some(session.token));
                } else {
                    debug!("discarding restore result, a fresh login landed first");
                }
            }
            Ok(_) => {
                debug!("persisted token rejected by verify");
                self.settle_anonymous(Some(&token));
            }
            Err(e) => {
                debug!(error = %e, "verify failed, treating session as invalid");
                self.settle_anonymous(Some(&token));
            }
        }
        Ok(())
    }

    /// Resolve a restore to "no session" without clobbering a login that
    /// raced ahead of it.
    fn settle_anonymous(&self, stale_token: Option<&str>) {
        if let Some(stale) = stale_token {
            // Only purge if the stored token is still the one we examined
            match self.storage.get(keys::AUTH_TOKEN) {
                Ok(Some(current)) if current == stale => {
                    let _ = self.storage.remove(keys::AUTH_TOKEN);
                    let _ = self.storage.remove(keys::AUTH_USER);
                }
                _ => {}
            }
        }
        self.state.send_if_modified(|state| {
            if matches!(state, SessionState::Authenticated(_)) {
                false
            } else {
                *state = SessionState::Anonymous;
                true
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStorage;
    use statchat_api_contract::VerifyResponse;
    use statchat_client_api::ApiError;
    use statchat_rest_client_mock::{MockClient, RecordedCall};

    fn auth_response(token: &str) -> AuthResponse {
        AuthResponse {
            token: token.into(),
            expires_at: chrono::Utc::now() + chrono::Duration::hours(1),
            user_id: 1,
            username: "admin".into(),
            role: UserRole::Administrator,
        }
    }

    fn manager() -> (SessionManager<MockClient>, Arc<MockClient>, Arc<MemoryStorage>) {
        let client = Arc::new(MockClient::new());
        let storage = Arc::new(MemoryStorage::new());
        let manager = SessionManager::new(client.clone(), storage.clone() as Arc<dyn StoragePort>);
        (manager, client, storage)
    }

    #[tokio::test]
    async fn login_persists_session_and_pushes_bearer() {
        let (manager, client, storage) = manager();
        client.script_login(Ok(auth_response("t1")));

        let session = manager.login("admin", "pw").await.unwrap();
        assert_eq!(session.token, "t1");
        assert_eq!(storage.get(keys::AUTH_TOKEN).unwrap().as_deref(), Some("t1"));
        assert!(storage.get(keys::AUTH_USER).unwrap().is_some());
        assert_eq!(client.bearer().as_deref(), Some("t1"));
        assert!(matches!(manager.current(), SessionState::Authenticated(_)));
    }

    #[tokio::test]
    async fn rejected_login_leaves_prior_state_untouched() {
        let (manager, client, storage) = manager();
        client.script_login(Err(ApiError::Denied("Invalid username or password".into())));

        let err = manager.login("admin", "wrong").await.unwrap_err();
        assert!(matches!(err, SessionError::Authentication(m) if m.contains("Invalid")));
        assert!(storage.get(keys::AUTH_TOKEN).unwrap().is_none());
        assert_eq!(manager.current(), SessionState::Unknown);
    }

    #[tokio::test]
    async fn register_validates_before_calling_the_backend() {
        let (manager, client, _) = manager();
        let err = manager.register("ab", "short", None).await.unwrap_err();
        assert!(matches!(err, SessionError::Registration(_)));
        assert!(client.recorded_calls().is_empty());
    }

    #[tokio::test]
    async fn restore_with_empty_storage_settles_anonymous_without_network() {
        let (manager, client, _) = manager();
        manager.verify_and_restore().await.unwrap();
        assert_eq!(manager.current(), SessionState::Anonymous);
        assert!(client.recorded_calls().is_empty());
    }

    #[tokio::test]
    async fn restore_publishes_the_exact_persisted_session() {
        let (manager, client, storage) = manager();
        storage.set(keys::AUTH_TOKEN, "t1").unwrap();
        storage
            .set(
                keys::AUTH_USER,
                r#"{"user_id":1,"username":"admin","role":"administrator"}"#,
            )
            .unwrap();
        client.script_verify(Ok(VerifyResponse {
            valid: true,
            user_id: None,
            username: None,
            role: None,
        }));

        manager.verify_and_restore().await.unwrap();
        let expected = Session {
            user_id: 1,
            username: "admin".into(),
            role: UserRole::Administrator,
            token: "t1".into(),
        };
        assert_eq!(manager.current(), SessionState::Authenticated(expected));
        assert_eq!(client.bearer().as_deref(), Some("t1"));
    }

    #[tokio::test]
    async fn invalid_verify_purges_the_persisted_pair() {
        let (manager, client, storage) = manager();
        storage.set(keys::AUTH_TOKEN, "t1").unwrap();
        storage
            .set(
                keys::AUTH_USER,
                r#"{"user_id":1,"username":"admin","role":"administrator"}"#,
            )
            .unwrap();
        client.script_verify(Ok(VerifyResponse {
            valid: false,
            user_id: None,
            username: None,
            role: None,
        }));

        manager.verify_and_restore().await.unwrap();
        assert_eq!(manager.current(), SessionState::Anonymous);
        assert!(storage.get(keys::AUTH_TOKEN).unwrap().is_none());
        assert!(storage.get(keys::AUTH_USER).unwrap().is_none());
    }

    #[tokio::test]
    async fn network_failure_during_verify_also_purges() {
        let (manager, client, storage) = manager();
        storage.set(keys::AUTH_TOKEN, "t1").unwrap();
        storage
            .set(
                keys::AUTH_USER,
                r#"{"user_id":1,"username":"admin","role":"administrator"}"#,
            )
            .unwrap();
        client.script_verify(Err(ApiError::Network("connection refused".into())));

        manager.verify_and_restore().await.unwrap();
        assert_eq!(manager.current(), SessionState::Anonymous);
        assert!(storage.get(keys::AUTH_TOKEN).unwrap().is_none());
    }

    #[tokio::test]
    async fn malformed_persisted_user_is_purged_without_network() {
        let (manager, client, storage) = manager();
        storage.set(keys::AUTH_TOKEN, "t1").unwrap();
        storage.set(keys::AUTH_USER, "{not valid json").unwrap();

        manager.verify_and_restore().await.unwrap();
        assert_eq!(manager.current(), SessionState::Anonymous);
        assert!(storage.get(keys::AUTH_TOKEN).unwrap().is_none());
        assert!(client.recorded_calls().is_empty());
    }

    #[tokio::test]
    async fn restore_never_clobbers_a_login_that_raced_ahead() {
        let (manager, client, storage) = manager();
        storage.set(keys::AUTH_TOKEN, "stale").unwrap();
        storage
            .set(
                keys::AUTH_USER,
                r#"{"user_id":1,"username":"admin","role":"administrator"}"#,
            )
            .unwrap();

        // Login lands first and rewrites storage
        client.script_login(Ok(auth_response("fresh")));
        manager.login("admin", "pw").await.unwrap();

        // A restore arriving afterwards must not touch anything; no verify
        // call is scripted, so any network traffic would fail the test
        manager.verify_and_restore().await.unwrap();

        assert!(matches!(manager.current(), SessionState::Authenticated(s) if s.token == "fresh"));
        assert_eq!(storage.get(keys::AUTH_TOKEN).unwrap().as_deref(), Some("fresh"));
        assert!(!client
            .recorded_calls()
            .iter()
            .any(|c| matches!(c, RecordedCall::Verify(_))));
    }

    #[tokio::test]
    async fn login_landing_during_verify_survives_the_restore_result() {
        let (manager, client, storage) = manager();
        let manager = Arc::new(manager);
        storage.set(keys::AUTH_TOKEN, "t1").unwrap();
        storage
            .set(
                keys::AUTH_USER,
                r#"{"user_id":1,"username":"admin","role":"administrator"}"#,
            )
            .unwrap();

        // Restore parks on the verify call
        let gate = client.install_verify_gate();
        let restore = tokio::spawn({
            let manager = manager.clone();
            async move { manager.verify_and_restore().await }
        });
        while gate.dispatched() < 1 {
            tokio::task::yield_now().await;
        }

        // A login completes while verify is still in flight
        client.script_login(Ok(AuthResponse {
            token: "fresh".into(),
            expires_at: chrono::Utc::now() + chrono::Duration::hours(1),
            user_id: 2,
            username: "bob".into(),
            role: UserRole::User,
        }));
        manager.login("bob", "pw").await.unwrap();

        // The stale-but-valid verify result must not clobber it
        gate.release(
            0,
            Ok(VerifyResponse {
                valid: true,
                user_id: None,
                username: None,
                role: None,
            }),
        );
        restore.await.unwrap().unwrap();

        match manager.current() {
            SessionState::Authenticated(session) => {
                assert_eq!(session.username, "bob");
                assert_eq!(session.token, "fresh");
            }
            other => panic!("expected Authenticated, got {other:?}"),
        }
        assert_eq!(client.bearer().as_deref(), Some("fresh"));
    }

    #[tokio::test]
    async fn orphan_token_without_user_is_purged() {
        let (manager, client, storage) = manager();
        storage.set(keys::AUTH_TOKEN, "t1").unwrap();

        manager.verify_and_restore().await.unwrap();
        assert_eq!(manager.current(), SessionState::Anonymous);
        assert!(storage.get(keys::AUTH_TOKEN).unwrap().is_none());
        assert!(client.recorded_calls().is_empty());
    }

    #[tokio::test]
    async fn logout_is_locally_successful_even_when_backend_fails() {
        let (manager, client, storage) = manager();
        client.script_login(Ok(auth_response("t1")));
        manager.login("admin", "pw").await.unwrap();

        client.script_logout(Err(ApiError::Network("timeout".into())));
        manager.logout().await;

        assert_eq!(manager.current(), SessionState::Anonymous);
        assert!(storage.get(keys::AUTH_TOKEN).unwrap().is_none());
        assert!(client.bearer().is_none());
        assert!(client.recorded_calls().contains(&RecordedCall::Logout));
    }
}
