//! Scriptable mock client for state-manager tests
//!
//! Each endpoint consumes responses from a per-endpoint script queue; an
//! unscripted call fails loudly so tests notice unexpected traffic. Every
//! call is recorded for assertions about what went over the wire. Sends,
//! history fetches, and verify calls can additionally be gated behind a
//! [`Gate`] so tests control the order in which in-flight responses resolve.

use async_trait::async_trait;
use statchat_api_contract::*;
use statchat_client_api::{ApiError, ApiResult, ClientApi};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use tokio::sync::oneshot;

/// A call observed by the mock, in dispatch order
#[derive(Debug, Clone, PartialEq)]
pub enum RecordedCall {
    SetBearer(Option<String>),
    Login(LoginRequest),
    Register(RegisterRequest),
    Verify(String),
    Logout,
    Escalate(EscalationRequest),
    SendMessage(ChatRequest),
    ChatHistory,
    ClearHistory,
}

/// Test-side control over gated calls
///
/// While installed for an endpoint, every call to it parks until the test
/// releases its slot, which lets responses resolve in an order chosen by
/// the test.
pub struct Gate<T> {
    slots: Arc<Mutex<Vec<Option<oneshot::Sender<ApiResult<T>>>>>>,
}

impl<T> Clone for Gate<T> {
    fn clone(&self) -> Self {
        Self {
            slots: self.slots.clone(),
        }
    }
}

impl<T> Default for Gate<T> {
    fn default() -> Self {
        Self {
            slots: Arc::new(Mutex::new(Vec::new())),
        }
    }
}

impl<T> Gate<T> {
    fn park(&self) -> oneshot::Receiver<ApiResult<T>> {
        let (tx, rx) = oneshot::channel();
        self.slots.lock().unwrap().push(Some(tx));
        rx
    }

    /// Number of calls dispatched so far (released or not)
    pub fn dispatched(&self) -> usize {
        self.slots.lock().unwrap().len()
    }

    /// Resolve the `index`-th dispatched call with `result`
    ///
    /// Panics if the slot was already released; tests own the ordering.
    pub fn release(&self, index: usize, result: ApiResult<T>) {
        let sender = self.slots.lock().unwrap()[index]
            .take()
            .expect("call already released");
        let _ = sender.send(result);
    }
}

pub type SendGate = Gate<ChatResponse>;
pub type HistoryGate = Gate<Vec<ChatMessage>>;
pub type VerifyGate = Gate<VerifyResponse>;

#[derive(Default)]
struct Scripts {
    login: VecDeque<ApiResult<AuthResponse>>,
    register: VecDeque<ApiResult<AuthResponse>>,
    verify: VecDeque<ApiResult<VerifyResponse>>,
    logout: VecDeque<ApiResult<()>>,
    escalate: VecDeque<ApiResult<EscalationToken>>,
    send: VecDeque<ApiResult<ChatResponse>>,
    history: VecDeque<ApiResult<Vec<ChatMessage>>>,
    clear: VecDeque<ApiResult<()>>,
}

#[derive(Default)]
struct Inner {
    scripts: Mutex<Scripts>,
    calls: Mutex<Vec<RecordedCall>>,
    bearer: Mutex<Option<String>>,
    send_gate: Mutex<Option<SendGate>>,
    history_gate: Mutex<Option<HistoryGate>>,
    verify_gate: Mutex<Option<VerifyGate>>,
}

/// Mock REST client backed by scripted responses
#[derive(Clone, Default)]
pub struct MockClient {
    inner: Arc<Inner>,
}

impl MockClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn script_login(&self, result: ApiResult<AuthResponse>) {
        self.inner.scripts.lock().unwrap().login.push_back(result);
    }

    pub fn script_register(&self, result: ApiResult<AuthResponse>) {
        self.inner.scripts.lock().unwrap().register.push_back(result);
    }

    pub fn script_verify(&self, result: ApiResult<VerifyResponse>) {
        self.inner.scripts.lock().unwrap().verify.push_back(result);
    }

    pub fn script_logout(&self, result: ApiResult<()>) {
        self.inner.scripts.lock().unwrap().logout.push_back(result);
    }

    pub fn script_escalate(&self, result: ApiResult<EscalationToken>) {
        self.inner.scripts.lock().unwrap().escalate.push_back(result);
    }

    pub fn script_send(&self, result: ApiResult<ChatResponse>) {
        self.inner.scripts.lock().unwrap().send.push_back(result);
    }

    pub fn script_history(&self, result: ApiResult<Vec<ChatMessage>>) {
        self.inner.scripts.lock().unwrap().history.push_back(result);
    }

    pub fn script_clear(&self, result: ApiResult<()>) {
        self.inner.scripts.lock().unwrap().clear.push_back(result);
    }

    /// Park subsequent sends behind a gate the test controls
    pub fn install_send_gate(&self) -> SendGate {
        let gate = SendGate::default();
        *self.inner.send_gate.lock().unwrap() = Some(gate.clone());
        gate
    }

    /// Park subsequent history fetches behind a gate the test controls
    pub fn install_history_gate(&self) -> HistoryGate {
        let gate = HistoryGate::default();
        *self.inner.history_gate.lock().unwrap() = Some(gate.clone());
        gate
    }

    /// Park subsequent verify calls behind a gate the test controls
    pub fn install_verify_gate(&self) -> VerifyGate {
        let gate = VerifyGate::default();
        *self.inner.verify_gate.lock().unwrap() = Some(gate.clone());
        gate
    }

    /// Everything dispatched so far, in order
    pub fn recorded_calls(&self) -> Vec<RecordedCall> {
        self.inner.calls.lock().unwrap().clone()
    }

    /// Bearer token most recently pushed by the session manager
    pub fn bearer(&self) -> Option<String> {
        self.inner.bearer.lock().unwrap().clone()
    }

    fn record(&self, call: RecordedCall) {
        self.inner.calls.lock().unwrap().push(call);
    }

    fn take<T>(
        &self,
        pick: impl FnOnce(&mut Scripts) -> Option<ApiResult<T>>,
        endpoint: &str,
    ) -> ApiResult<T> {
        let mut scripts = self.inner.scripts.lock().unwrap();
        pick(&mut scripts)
            .unwrap_or_else(|| Err(ApiError::Network(format!("unscripted call: {endpoint}"))))
    }
}

#[async_trait]
impl ClientApi for MockClient {
    fn set_bearer(&self, token: Option<String>) {
        self.record(RecordedCall::SetBearer(token.clone()));
        *self.inner.bearer.lock().unwrap() = token;
    }

    async fn login(&self, request: &LoginRequest) -> ApiResult<AuthResponse> {
        self.record(RecordedCall::Login(request.clone()));
        self.take(|s| s.login.pop_front(), "login")
    }

    async fn register(&self, request: &RegisterRequest) -> ApiResult<AuthResponse> {
        self.record(RecordedCall::Register(request.clone()));
        self.take(|s| s.register.pop_front(), "register")
    }

    async fn verify(&self, token: &str) -> ApiResult<VerifyResponse> {
        self.record(RecordedCall::Verify(token.to_string()));

        let gate = self.inner.verify_gate.lock().unwrap().clone();
        if let Some(gate) = gate {
            let rx = gate.park();
            return rx
                .await
                .unwrap_or_else(|_| Err(ApiError::Network("verify gate dropped".into())));
        }
        self.take(|s| s.verify.pop_front(), "verify")
    }

    async fn logout(&self) -> ApiResult<()> {
        self.record(RecordedCall::Logout);
        // Logout defaults to success; tests script a failure explicitly
        let mut scripts = self.inner.scripts.lock().unwrap();
        scripts.logout.pop_front().unwrap_or(Ok(()))
    }

    async fn escalate(&self, request: &EscalationRequest) -> ApiResult<EscalationToken> {
        self.record(RecordedCall::Escalate(request.clone()));
        self.take(|s| s.escalate.pop_front(), "escalate")
    }

    async fn send_message(&self, request: &ChatRequest) -> ApiResult<ChatResponse> {
        self.record(RecordedCall::SendMessage(request.clone()));

        let gate = self.inner.send_gate.lock().unwrap().clone();
        if let Some(gate) = gate {
            let rx = gate.park();
            return rx
                .await
                .unwrap_or_else(|_| Err(ApiError::Network("send gate dropped".into())));
        }
        self.take(|s| s.send.pop_front(), "send_message")
    }

    async fn chat_history(&self) -> ApiResult<Vec<ChatMessage>> {
        self.record(RecordedCall::ChatHistory);

        let gate = self.inner.history_gate.lock().unwrap().clone();
        if let Some(gate) = gate {
            let rx = gate.park();
            return rx
                .await
                .unwrap_or_else(|_| Err(ApiError::Network("history gate dropped".into())));
        }
        self.take(|s| s.history.pop_front(), "chat_history")
    }

    async fn clear_history(&self) -> ApiResult<()> {
        self.record(RecordedCall::ClearHistory);
        self.take(|s| s.clear.pop_front(), "clear_history")
    }
}
