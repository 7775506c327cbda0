//! End-to-end properties of the composed state managers

use chrono::Utc;
use statchat_api_contract::{
    AuthResponse, ChatMessage, ChatMode, ChatResponse, ChatRole, EscalationToken, UserRole,
    VerifyResponse,
};
use statchat_client_api::ApiError;
use statchat_core::{keys, App, MemoryStorage, SessionState, SetModeOutcome, StoragePort};
use statchat_rest_client_mock::{MockClient, RecordedCall};
use std::sync::Arc;

fn build_app() -> (App<MockClient>, Arc<MockClient>, Arc<MemoryStorage>) {
    let client = Arc::new(MockClient::new());
    let storage = Arc::new(MemoryStorage::new());
    let app = App::new(client.clone(), storage.clone() as Arc<dyn StoragePort>);
    (app, client, storage)
}

fn auth_response(token: &str) -> AuthResponse {
    AuthResponse {
        token: token.into(),
        expires_at: Utc::now() + chrono::Duration::hours(1),
        user_id: 1,
        username: "admin".into(),
        role: UserRole::Administrator,
    }
}

fn reply(text: &str) -> ChatResponse {
    ChatResponse {
        message: text.into(),
        sql_query: None,
        timestamp: Utc::now(),
    }
}

fn escalation_grant() -> EscalationToken {
    EscalationToken {
        token: "e1".into(),
        expires_at: Utc::now() + chrono::Duration::minutes(30),
    }
}

async fn signed_in_app() -> (App<MockClient>, Arc<MockClient>, Arc<MemoryStorage>) {
    let (app, client, storage) = build_app();
    client.script_login(Ok(auth_response("t1")));
    client.script_history(Ok(vec![]));
    app.login("admin", "pw").await.unwrap();
    (app, client, storage)
}

#[tokio::test]
async fn rejected_verification_purges_the_stored_pair() {
    let (app, client, storage) = build_app();
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

    app.start().await.unwrap();

    assert_eq!(app.session().current(), SessionState::Anonymous);
    assert!(storage.get(keys::AUTH_TOKEN).unwrap().is_none());
    assert!(storage.get(keys::AUTH_USER).unwrap().is_none());
}

#[tokio::test]
async fn confirmed_verification_restores_the_exact_session() {
    let (app, client, storage) = build_app();
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
    client.script_history(Ok(vec![]));

    app.start().await.unwrap();

    match app.session().current() {
        SessionState::Authenticated(session) => {
            assert_eq!(session.user_id, 1);
            assert_eq!(session.username, "admin");
            assert_eq!(session.role, UserRole::Administrator);
            assert_eq!(session.token, "t1");
        }
        other => panic!("expected Authenticated, got {other:?}"),
    }
    // Restored identity seeds history exactly once
    let fetches = client
        .recorded_calls()
        .iter()
        .filter(|c| matches!(c, RecordedCall::ChatHistory))
        .count();
    assert_eq!(fetches, 1);
}

#[tokio::test]
async fn concurrent_sends_keep_pairs_together_in_arrival_order() {
    let (app, client, _) = signed_in_app().await;
    let gate = client.install_send_gate();

    let first = tokio::spawn({
        let chat = app.chat().clone();
        async move { chat.send_message("first question").await }
    });
    while gate.dispatched() < 1 {
        tokio::task::yield_now().await;
    }
    let second = tokio::spawn({
        let chat = app.chat().clone();
        async move { chat.send_message("second question").await }
    });
    while gate.dispatched() < 2 {
        tokio::task::yield_now().await;
    }

    // Responses resolve in reverse dispatch order
    gate.release(1, Ok(reply("answer two")));
    second.await.unwrap().unwrap();
    gate.release(0, Ok(reply("answer one")));
    first.await.unwrap().unwrap();

    let messages = app.chat().snapshot().messages;
    let turns: Vec<(ChatRole, &str)> = messages
        .iter()
        .map(|m| (m.role, m.content.as_str()))
        .collect();
    assert_eq!(
        turns,
        vec![
            (ChatRole::User, "second question"),
            (ChatRole::Assistant, "answer two"),
            (ChatRole::User, "first question"),
            (ChatRole::Assistant, "answer one"),
        ]
    );
}

#[tokio::test]
async fn sends_queue_behind_the_initial_history_fetch() {
    let (app, client, _) = build_app();
    client.script_login(Ok(auth_response("t1")));
    let history_gate = client.install_history_gate();

    // Drive login (and its history seed) on a task
    let app = Arc::new(app);
    let login = tokio::spawn({
        let app = app.clone();
        async move { app.login("admin", "pw").await }
    });
    while history_gate.dispatched() < 1 {
        tokio::task::yield_now().await;
    }

    // A send issued mid-seed must wait for the fetch, never race ahead
    client.script_send(Ok(reply("the answer")));
    let send = tokio::spawn({
        let chat = app.chat().clone();
        async move { chat.send_message("hi").await }
    });
    for _ in 0..20 {
        tokio::task::yield_now().await;
    }
    assert!(
        !client
            .recorded_calls()
            .iter()
            .any(|c| matches!(c, RecordedCall::SendMessage(_))),
        "send dispatched before history seed completed"
    );

    let prior_turn = ChatMessage {
        role: ChatRole::Assistant,
        content: "welcome back".into(),
        sql_query: None,
        timestamp: Utc::now(),
    };
    history_gate.release(0, Ok(vec![prior_turn]));
    login.await.unwrap().unwrap();
    send.await.unwrap().unwrap();

    let contents: Vec<String> = app
        .chat()
        .snapshot()
        .messages
        .iter()
        .map(|m| m.content.clone())
        .collect();
    assert_eq!(contents, vec!["welcome back", "hi", "the answer"]);
}

#[tokio::test]
async fn admin_mode_is_gated_by_escalation_at_every_step() {
    let (app, client, storage) = signed_in_app().await;

    // Requesting admin without escalation parks the switch
    assert_eq!(
        app.chat().set_mode(ChatMode::Admin),
        SetModeOutcome::EscalationRequired
    );
    assert_eq!(app.chat().mode(), ChatMode::Normal);

    // A denied escalation keeps the switch parked and writes nothing
    client.script_escalate(Err(ApiError::Denied("Invalid admin password".into())));
    assert!(app.escalation().authenticate("wrongpass").await.is_err());
    assert_eq!(app.chat().mode(), ChatMode::Normal);
    assert!(storage.get(keys::CHAT_ADMIN_TOKEN).unwrap().is_none());
    assert!(app.chat().snapshot().pending_admin);

    // Success completes the parked switch reactively
    client.script_escalate(Ok(escalation_grant()));
    app.escalation().authenticate("adminpw").await.unwrap();
    assert_eq!(app.chat().mode(), ChatMode::Admin);
    assert!(!app.chat().snapshot().pending_admin);

    // Losing escalation leaves admin mode immediately
    app.escalation().logout();
    assert_eq!(app.chat().mode(), ChatMode::Normal);
}

#[tokio::test]
async fn history_of_one_user_is_invisible_to_the_next() {
    let (app, client, _) = signed_in_app().await;
    client.script_send(Ok(reply("private answer")));
    app.chat().send_message("private question").await.unwrap();
    assert_eq!(app.chat().snapshot().messages.len(), 2);

    client.script_logout(Ok(()));
    app.logout().await;
    assert!(app.chat().snapshot().messages.is_empty());

    // A different user signs in; their history comes only from the backend
    client.script_login(Ok(AuthResponse {
        token: "t2".into(),
        expires_at: Utc::now() + chrono::Duration::hours(1),
        user_id: 2,
        username: "bob".into(),
        role: UserRole::User,
    }));
    client.script_history(Ok(vec![]));
    app.login("bob", "pw").await.unwrap();
    assert!(app.chat().snapshot().messages.is_empty());
}

#[tokio::test]
async fn admin_replies_carry_the_sql_query() {
    let (app, client, _) = signed_in_app().await;
    client.script_escalate(Ok(escalation_grant()));
    app.escalation().authenticate("adminpw").await.unwrap();
    app.chat().set_mode(ChatMode::Admin);

    client.script_send(Ok(ChatResponse {
        message: "There are 42 users".into(),
        sql_query: Some("SELECT COUNT(*) FROM users".into()),
        timestamp: Utc::now(),
    }));
    app.chat().send_message("how many users?").await.unwrap();

    let messages = app.chat().snapshot().messages;
    assert_eq!(messages[1].sql_query.as_deref(), Some("SELECT COUNT(*) FROM users"));
    assert!(messages[0].sql_query.is_none());
}
