//! Admin-mode escalation
//!
//! A secondary, short-lived credential gating entry into admin chat mode.
//! Its lifecycle is independent of the primary session except for one-way
//! coupling: a primary logout force-clears escalation (composed in
//! `App::logout`). Expiry is checked locally; the backend is never asked
//! to re-validate an unexpired token.

use chrono::{DateTime, Utc};
use statchat_api_contract::{EscalationRequest, EscalationToken};
use statchat_client_api::{ApiError, ClientApi};
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::storage::{keys, StorageError, StoragePort};

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum EscalationState {
    #[default]
    NotEscalated,
    Escalated(EscalationToken),
}

impl EscalationState {
    pub fn is_escalated(&self) -> bool {
        matches!(self, EscalationState::Escalated(_))
    }
}

#[derive(Debug, Error)]
pub enum EscalationError {
    /// Wrong admin password; distinguishable from transport failure so the
    /// UI can say so
    #[error("{0}")]
    Denied(String),

    #[error("network failure: {0}")]
    Network(String),

    #[error(transparent)]
    Storage(#[from] StorageError),
}

type Observer = Box<dyn Fn(&EscalationState) + Send + Sync>;

/// Owner of the admin escalation token
pub struct EscalationAuthenticator<C: ClientApi> {
    client: Arc<C>,
    storage: Arc<dyn StoragePort>,
    state: watch::Sender<EscalationState>,
    observers: Mutex<Vec<Observer>>,
}

impl<C: ClientApi> EscalationAuthenticator<C> {
    pub fn new(client: Arc<C>, storage: Arc<dyn StoragePort>) -> Self {
        let (state, _) = watch::channel(EscalationState::NotEscalated);
        Self {
            client,
            storage,
            state,
            observers: Mutex::new(Vec::new()),
        }
    }

    /// Subscribe to escalation state changes
    pub fn subscribe(&self) -> watch::Receiver<EscalationState> {
        self.state.subscribe()
    }

    /// Register a synchronous observer, notified on every transition
    ///
    /// Observers run inline on the mutating call, which keeps reactions
    /// (like completing a pending mode switch) deterministic.
    pub fn on_change(&self, observer: impl Fn(&EscalationState) + Send + Sync + 'static) {
        self.observers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(Box::new(observer));
    }

    fn publish(&self, state: EscalationState) {
        self.state.send_replace(state.clone());
        let observers = self.observers.lock().unwrap_or_else(|e| e.into_inner());
        for observer in observers.iter() {
            observer(&state);
        }
    }

    /// Whether a valid escalation token is currently held
    ///
    /// Crossing the expiry instant is detected here lazily: the first
    /// observation after expiry purges the token and downgrades the state.
    pub fn is_escalated(&self) -> bool {
        let expired = match &*self.state.borrow() {
            EscalationState::Escalated(token) => !token.is_valid_at(Utc::now()),
            EscalationState::NotEscalated => return false,
        };
        if expired {
            debug!("escalation token expired");
            self.purge();
            self.publish(EscalationState::NotEscalated);
            return false;
        }
        true
    }

    /// Exchange the admin password for an escalation token
    ///
    /// On rejection the state and storage are untouched.
    pub async fn authenticate(&self, password: &str) -> Result<EscalationToken, EscalationError> {
        let request = EscalationRequest {
            password: password.to_string(),
        };
        let token = self.client.escalate(&request).await.map_err(|e| match e {
            ApiError::Denied(detail) => EscalationError::Denied(detail),
            other => EscalationError::Network(other.to_string()),
        })?;

        self.storage.set(keys::CHAT_ADMIN_TOKEN, &token.token)?;
        self.storage
            .set(keys::CHAT_ADMIN_TOKEN_EXPIRES, &token.expires_at.to_rfc3339())?;
        info!(expires_at = %token.expires_at, "admin escalation granted");
        self.publish(EscalationState::Escalated(token.clone()));
        Ok(token)
    }

    /// Restore escalation from storage at start-up; local-only
    ///
    /// An expired or unparsable persisted pair is purged without any
    /// network call.
    pub fn restore(&self) -> Result<(), EscalationError> {
        let token = self.storage.get(keys::CHAT_ADMIN_TOKEN)?;
        let expires = self.storage.get(keys::CHAT_ADMIN_TOKEN_EXPIRES)?;

        let (token, expires) = match (token, expires) {
            (Some(token), Some(expires)) => (token, expires),
            (None, None) => {
                self.publish(EscalationState::NotEscalated);
                return Ok(());
            }
            _ => {
                // Token without expiry (or the reverse) is unusable state;
                // drop the orphan key
                warn!("partial persisted escalation, purging");
                self.purge();
                self.publish(EscalationState::NotEscalated);
                return Ok(());
            }
        };

        let expires_at = match DateTime::parse_from_rfc3339(&expires) {
            Ok(parsed) => parsed.with_timezone(&Utc),
            Err(e) => {
                warn!(error = %e, "malformed escalation expiry, purging");
                self.purge();
                self.publish(EscalationState::NotEscalated);
                return Ok(());
            }
        };

        let token = EscalationToken { token, expires_at };
        if token.is_valid_at(Utc::now()) {
            debug!(expires_at = %token.expires_at, "escalation restored from storage");
            self.publish(EscalationState::Escalated(token));
        } else {
            debug!("persisted escalation token already expired");
            self.purge();
            self.publish(EscalationState::NotEscalated);
        }
        Ok(())
    }

    /// Drop escalation locally; never contacts the backend
    pub fn logout(&self) {
        self.purge();
        self.publish(EscalationState::NotEscalated);
    }

    fn purge(&self) {
        for key in [keys::CHAT_ADMIN_TOKEN, keys::CHAT_ADMIN_TOKEN_EXPIRES] {
            if let Err(e) = self.storage.remove(key) {
                warn!(key, error = %e, "failed to clear escalation entry");
            }
        }
    }
}
