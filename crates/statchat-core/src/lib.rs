//! Session and chat-mode state management for the statchat client
//!
//! Three composed state machines, each publishing over a watch channel:
//!
//! - [`session::SessionManager`] owns the primary authenticated session
//!   (login, registration, logout, start-up restoration);
//! - [`escalation::EscalationAuthenticator`] owns the short-lived admin
//!   escalation token gating admin chat mode;
//! - [`chat::ChatController`] owns the identity-scoped message history and
//!   the current mode.
//!
//! [`app::App`] wires them together with the cross-cutting rules: forced
//! logout on an invalid bearer token, and one-way clearing of escalation
//! and chat state on primary logout.

pub mod app;
pub mod chat;
pub mod escalation;
pub mod session;
pub mod storage;

pub use app::App;
pub use chat::{ChatController, ChatError, ChatSnapshot, IdentityKey, SetModeOutcome};
pub use escalation::{EscalationAuthenticator, EscalationError, EscalationState};
pub use session::{SessionError, SessionManager, SessionState};
pub use storage::{keys, FileStorage, MemoryStorage, StorageError, StoragePort};
