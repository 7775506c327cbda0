//! Composition root
//!
//! Wires the session manager, escalation authenticator, and chat
//! controller together and owns the cross-cutting rules: forced logout on
//! an invalid bearer, one-way clearing of escalation on primary logout,
//! and binding the chat cache to the signed-in identity.

use statchat_api_contract::Session;
use statchat_client_api::ClientApi;
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

use crate::chat::{ChatController, IdentityKey};
use crate::escalation::EscalationAuthenticator;
use crate::session::{SessionError, SessionManager, SessionState};
use crate::storage::{keys, StoragePort};

/// The assembled statchat client
pub struct App<C: ClientApi + 'static> {
    storage: Arc<dyn StoragePort>,
    session: Arc<SessionManager<C>>,
    escalation: Arc<EscalationAuthenticator<C>>,
    chat: ChatController<C>,
}

impl<C: ClientApi + 'static> App<C> {
    pub fn new(client: Arc<C>, storage: Arc<dyn StoragePort>) -> Self {
        let session = Arc::new(SessionManager::new(client.clone(), storage.clone()));
        let escalation = Arc::new(EscalationAuthenticator::new(client.clone(), storage.clone()));
        let chat = ChatController::new(client, escalation.clone());

        // An invalid bearer on any authenticated call tears everything
        // down; no user action is needed for the next render to show
        // "logged out"
        let hook_session = session.clone();
        let hook_escalation = escalation.clone();
        chat.on_unauthorized(move || {
            hook_session.force_logout();
            hook_escalation.logout();
        });

        Self {
            storage,
            session,
            escalation,
            chat,
        }
    }

    pub fn session(&self) -> &SessionManager<C> {
        &self.session
    }

    pub fn escalation(&self) -> &EscalationAuthenticator<C> {
        &self.escalation
    }

    pub fn chat(&self) -> &ChatController<C> {
        &self.chat
    }

    /// Start-up restoration: escalation (local), then the primary session,
    /// then the chat identity binding
    pub async fn start(&self) -> Result<(), SessionError> {
        if let Err(e) = self.escalation.restore() {
            warn!(error = %e, "escalation restore failed");
        }
        self.session.verify_and_restore().await?;
        self.bind_current_identity().await;
        Ok(())
    }

    pub async fn login(&self, username: &str, password: &str) -> Result<Session, SessionError> {
        let session = self.session.login(username, password).await?;
        self.bind_current_identity().await;
        Ok(session)
    }

    pub async fn register(
        &self,
        username: &str,
        password: &str,
        first_name: Option<&str>,
    ) -> Result<Session, SessionError> {
        let session = self.session.register(username, password, first_name).await?;
        self.bind_current_identity().await;
        Ok(session)
    }

    /// Sign out everywhere this library has state
    ///
    /// Always locally successful: chat cache, escalation, and persisted
    /// session are cleared regardless of whether the backend hears about
    /// it.
    pub async fn logout(&self) {
        info!("logging out");
        self.chat.reset().await;
        self.escalation.logout();
        self.session.logout().await;
        self.bind_current_identity().await;
    }

    async fn bind_current_identity(&self) {
        match self.session.current() {
            SessionState::Authenticated(session) => {
                if let Err(e) = self
                    .chat
                    .bind_identity(IdentityKey::User(session.user_id), true)
                    .await
                {
                    warn!(error = %e, "history seed failed");
                }
            }
            _ => {
                let key = self.anonymous_key();
                // Fetch stays disabled without a signed-in identity
                let _ = self.chat.bind_identity(key, false).await;
            }
        }
    }

    /// Stable anonymous identity, persisted across restarts until logout
    fn anonymous_key(&self) -> IdentityKey {
        if let Ok(Some(stored)) = self.storage.get(keys::CHAT_SESSION_ID) {
            if let Ok(id) = Uuid::parse_str(&stored) {
                return IdentityKey::Anonymous(id);
            }
        }
        let id = Uuid::new_v4();
        if let Err(e) = self.storage.set(keys::CHAT_SESSION_ID, &id.to_string()) {
            warn!(error = %e, "failed to persist anonymous chat identity");
        }
        IdentityKey::Anonymous(id)
    }
}
