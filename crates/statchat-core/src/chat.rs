//! Chat history and mode control
//!
//! Owns the ordered message log and the current chat mode. History is
//! scoped to an identity key and replaced wholesale when the identity
//! changes; two identities never observe each other's messages. Sends are
//! optimistic appends: the user/assistant pair lands in the cache only
//! after the backend accepts the message, as one indivisible unit.

use chrono::Utc;
use statchat_api_contract::{ChatMessage, ChatMode, ChatRequest, ChatRole};
use statchat_client_api::{ApiError, ClientApi};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};
use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::escalation::{EscalationAuthenticator, EscalationState};

/// Opaque key scoping the history cache to one signed-in (or anonymous)
/// identity
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum IdentityKey {
    User(i64),
    Anonymous(Uuid),
}

/// Observable chat state
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatSnapshot {
    pub mode: ChatMode,
    pub messages: Vec<ChatMessage>,
    /// True strictly while at least one send is in flight
    pub is_loading: bool,
    /// True strictly while the initial history fetch is in flight
    pub is_loading_history: bool,
    /// Most recent send or history error, for display
    pub last_error: Option<String>,
    /// An admin switch was requested but is waiting on escalation
    pub pending_admin: bool,
}

impl Default for ChatSnapshot {
    fn default() -> Self {
        Self {
            mode: ChatMode::Normal,
            messages: Vec::new(),
            is_loading: false,
            is_loading_history: false,
            last_error: None,
            pending_admin: false,
        }
    }
}

/// Result of a mode-switch request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SetModeOutcome {
    Switched,
    /// Admin was requested without valid escalation; the switch is parked
    /// and the caller should prompt for the admin password
    EscalationRequired,
}

#[derive(Debug, Error)]
pub enum ChatError {
    #[error("{0}")]
    Rejected(String),

    #[error("network failure: {0}")]
    Network(String),

    #[error("session expired")]
    Unauthorized,
}

impl From<ApiError> for ChatError {
    fn from(e: ApiError) -> Self {
        match e {
            ApiError::Unauthorized => ChatError::Unauthorized,
            ApiError::Denied(detail) => ChatError::Rejected(detail),
            other => ChatError::Network(other.to_string()),
        }
    }
}

#[derive(Default)]
struct Cache {
    identity: Option<IdentityKey>,
    fetch_enabled: bool,
    seeded: bool,
    messages: Vec<ChatMessage>,
}

struct ControlState {
    mode: ChatMode,
    pending_admin: bool,
}

struct ChatInner<C: ClientApi> {
    client: Arc<C>,
    escalation: Arc<EscalationAuthenticator<C>>,
    control: Mutex<ControlState>,
    // Held across the seed fetch so sends queue behind it; never held
    // across a send's network await, so concurrent sends append in
    // response-arrival order
    cache: tokio::sync::Mutex<Cache>,
    inflight_sends: AtomicUsize,
    snapshot: watch::Sender<ChatSnapshot>,
    on_unauthorized: Mutex<Option<Box<dyn Fn() + Send + Sync>>>,
}

/// Mediator for sending, clearing, and mode switching
///
/// Cheap to clone; clones share state.
pub struct ChatController<C: ClientApi> {
    inner: Arc<ChatInner<C>>,
}

impl<C: ClientApi> Clone for ChatController<C> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<C: ClientApi + 'static> ChatController<C> {
    pub fn new(client: Arc<C>, escalation: Arc<EscalationAuthenticator<C>>) -> Self {
        let (snapshot, _) = watch::channel(ChatSnapshot::default());
        let inner = Arc::new(ChatInner {
            client,
            escalation: escalation.clone(),
            control: Mutex::new(ControlState {
                mode: ChatMode::Normal,
                pending_admin: false,
            }),
            cache: tokio::sync::Mutex::new(Cache::default()),
            inflight_sends: AtomicUsize::new(0),
            snapshot,
            on_unauthorized: Mutex::new(None),
        });

        // Complete a parked admin switch the moment escalation succeeds,
        // and leave admin mode the moment escalation is lost
        let weak: Weak<ChatInner<C>> = Arc::downgrade(&inner);
        escalation.on_change(move |state| {
            let Some(inner) = weak.upgrade() else { return };
            let mut control = inner.control.lock().unwrap_or_else(|e| e.into_inner());
            match state {
                EscalationState::Escalated(_) if control.pending_admin => {
                    control.mode = ChatMode::Admin;
                    control.pending_admin = false;
                }
                EscalationState::NotEscalated => {
                    control.mode = ChatMode::Normal;
                    control.pending_admin = false;
                }
                _ => return,
            }
            let (mode, pending) = (control.mode, control.pending_admin);
            drop(control);
            inner.snapshot.send_modify(|s| {
                s.mode = mode;
                s.pending_admin = pending;
            });
        });

        Self { inner }
    }

    /// Subscribe to chat state changes
    pub fn subscribe(&self) -> watch::Receiver<ChatSnapshot> {
        self.inner.snapshot.subscribe()
    }

    /// Current state snapshot
    pub fn snapshot(&self) -> ChatSnapshot {
        self.inner.snapshot.borrow().clone()
    }

    /// Hook invoked when an authenticated call reports the bearer invalid
    pub fn on_unauthorized(&self, hook: impl Fn() + Send + Sync + 'static) {
        let mut slot = self
            .inner
            .on_unauthorized
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        *slot = Some(Box::new(hook));
    }

    /// Current mode, re-checked against escalation validity
    ///
    /// Observing an expired escalation downgrades the mode before it is
    /// reported, so admin is never visible without valid escalation.
    pub fn mode(&self) -> ChatMode {
        // is_escalated() runs the expiry check and, through the observer,
        // downgrades the mode if the token lapsed
        let escalated = self.inner.escalation.is_escalated();
        let control = self.inner.control.lock().unwrap_or_else(|e| e.into_inner());
        if control.mode == ChatMode::Admin && !escalated {
            ChatMode::Normal
        } else {
            control.mode
        }
    }

    /// Request a mode switch
    ///
    /// Switching to normal always succeeds. Switching to admin requires
    /// valid escalation; without it the switch is parked (`pending_admin`)
    /// and completes reactively when escalation is granted.
    pub fn set_mode(&self, mode: ChatMode) -> SetModeOutcome {
        let escalated = self.inner.escalation.is_escalated();
        let mut control = self.inner.control.lock().unwrap_or_else(|e| e.into_inner());
        let outcome = match mode {
            ChatMode::Normal => {
                control.mode = ChatMode::Normal;
                control.pending_admin = false;
                SetModeOutcome::Switched
            }
            ChatMode::Admin if escalated => {
                control.mode = ChatMode::Admin;
                control.pending_admin = false;
                SetModeOutcome::Switched
            }
            ChatMode::Admin => {
                debug!("admin mode requested without escalation, parking switch");
                control.pending_admin = true;
                SetModeOutcome::EscalationRequired
            }
        };
        let (mode, pending) = (control.mode, control.pending_admin);
        drop(control);
        self.inner.snapshot.send_modify(|s| {
            s.mode = mode;
            s.pending_admin = pending;
        });
        outcome
    }

    /// Rebind the history cache to a (new) identity
    ///
    /// A no-op when the identity is unchanged. Otherwise the cache is
    /// replaced and, for identities that can fetch, seeded from the
    /// backend. In-flight sends for the previous identity are discarded
    /// when they resolve.
    pub async fn bind_identity(
        &self,
        key: IdentityKey,
        fetch_enabled: bool,
    ) -> Result<(), ChatError> {
        let mut cache = self.inner.cache.lock().await;
        if cache.identity.as_ref() == Some(&key) {
            return Ok(());
        }
        debug!(?key, fetch_enabled, "rebinding chat identity");
        cache.identity = Some(key);
        cache.fetch_enabled = fetch_enabled;
        cache.seeded = !fetch_enabled;
        cache.messages.clear();
        self.inner.snapshot.send_modify(|s| {
            s.messages.clear();
            s.last_error = None;
        });

        if fetch_enabled {
            self.seed_locked(&mut cache).await?;
        }
        Ok(())
    }

    /// Seed the cache from the backend; caller holds the cache lock, which
    /// makes sends issued during the fetch queue behind it
    async fn seed_locked(&self, cache: &mut Cache) -> Result<(), ChatError> {
        self.inner
            .snapshot
            .send_modify(|s| s.is_loading_history = true);
        let result = self.inner.client.chat_history().await;
        self.inner
            .snapshot
            .send_modify(|s| s.is_loading_history = false);

        // Seeded either way: a failed fetch is surfaced, not retried, and
        // must not wedge every subsequent send behind it
        cache.seeded = true;
        match result {
            Ok(messages) => {
                cache.messages = messages.clone();
                self.inner.snapshot.send_modify(|s| s.messages = messages);
                Ok(())
            }
            Err(e) => {
                let err = ChatError::from(e);
                self.record_error(&err);
                if matches!(err, ChatError::Unauthorized) {
                    self.invalidate_locked(cache);
                    self.fire_unauthorized();
                }
                Err(err)
            }
        }
    }

    async fn ensure_seeded(&self) -> Result<(), ChatError> {
        let mut cache = self.inner.cache.lock().await;
        if cache.seeded || !cache.fetch_enabled {
            return Ok(());
        }
        self.seed_locked(&mut cache).await
    }

    /// Send a message in the current mode and append the resulting
    /// user/assistant pair
    ///
    /// Whitespace-only input is a no-op. The pair append is atomic under
    /// the cache lock; concurrent sends append in the order their
    /// responses arrive. A response that arrives after the identity
    /// changed is discarded.
    pub async fn send_message(&self, text: &str) -> Result<(), ChatError> {
        let trimmed = text.trim();
        if trimmed.is_empty() {
            return Ok(());
        }

        self.ensure_seeded().await?;
        let identity = self.inner.cache.lock().await.identity.clone();
        let mode = self.mode();

        if self.inner.inflight_sends.fetch_add(1, Ordering::SeqCst) == 0 {
            self.inner.snapshot.send_modify(|s| s.is_loading = true);
        }

        let request = ChatRequest {
            message: trimmed.to_string(),
            mode,
        };
        let result = self.inner.client.send_message(&request).await;

        let outcome = {
            let mut cache = self.inner.cache.lock().await;
            if cache.identity == identity {
                match result {
                    Ok(response) => {
                        let user = ChatMessage {
                            role: ChatRole::User,
                            content: trimmed.to_string(),
                            sql_query: None,
                            timestamp: Utc::now(),
                        };
                        let assistant = ChatMessage {
                            role: ChatRole::Assistant,
                            content: response.message,
                            sql_query: response.sql_query,
                            timestamp: response.timestamp,
                        };
                        cache.messages.push(user);
                        cache.messages.push(assistant);
                        let messages = cache.messages.clone();
                        self.inner.snapshot.send_modify(|s| {
                            s.messages = messages;
                            s.last_error = None;
                        });
                        Ok(())
                    }
                    Err(e) => {
                        let err = ChatError::from(e);
                        self.record_error(&err);
                        if matches!(err, ChatError::Unauthorized) {
                            self.invalidate_locked(&mut cache);
                            self.fire_unauthorized();
                        }
                        Err(err)
                    }
                }
            } else {
                // The identity moved on while this send was in flight
                debug!("discarding send response for a stale identity");
                Ok(())
            }
        };

        if self.inner.inflight_sends.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.inner.snapshot.send_modify(|s| s.is_loading = false);
        }
        outcome
    }

    /// Clear the current identity's history on the backend and locally
    pub async fn clear_history(&self) -> Result<(), ChatError> {
        let identity = self.inner.cache.lock().await.identity.clone();
        let result = self.inner.client.clear_history().await;

        let mut cache = self.inner.cache.lock().await;
        if cache.identity != identity {
            return Ok(());
        }
        match result {
            Ok(()) => {
                cache.messages.clear();
                self.inner.snapshot.send_modify(|s| s.messages.clear());
                Ok(())
            }
            Err(e) => {
                let err = ChatError::from(e);
                self.record_error(&err);
                if matches!(err, ChatError::Unauthorized) {
                    self.invalidate_locked(&mut cache);
                    self.fire_unauthorized();
                }
                Err(err)
            }
        }
    }

    /// Drop all per-identity state and return to normal mode
    ///
    /// Part of the logout path; responses still in flight resolve against
    /// the cleared identity and are discarded.
    pub async fn reset(&self) {
        let mut cache = self.inner.cache.lock().await;
        self.invalidate_locked(&mut cache);
        drop(cache);

        let mut control = self.inner.control.lock().unwrap_or_else(|e| e.into_inner());
        control.mode = ChatMode::Normal;
        control.pending_admin = false;
        drop(control);
        self.inner.snapshot.send_modify(|s| {
            s.mode = ChatMode::Normal;
            s.pending_admin = false;
            s.last_error = None;
        });
    }

    fn invalidate_locked(&self, cache: &mut Cache) {
        cache.identity = None;
        cache.fetch_enabled = false;
        cache.seeded = false;
        cache.messages.clear();
        self.inner.snapshot.send_modify(|s| s.messages.clear());
    }

    fn record_error(&self, err: &ChatError) {
        warn!(error = %err, "chat operation failed");
        let message = err.to_string();
        self.inner
            .snapshot
            .send_modify(|s| s.last_error = Some(message));
    }

    fn fire_unauthorized(&self) {
        let hook = self
            .inner
            .on_unauthorized
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        if let Some(hook) = hook.as_ref() {
            hook();
        }
    }
}
