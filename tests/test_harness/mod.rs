//! Shared setup for the integration tests: the full service wired on the
//! in-process backends, plus helpers to mint tokens and await events.

#![allow(dead_code)]

use chat_fanout_service::config::Config;
use chat_fanout_service::models::UserId;
use chat_fanout_service::services::auth::JwtTokenVerifier;
use chat_fanout_service::services::session_manager::Session;
use chat_fanout_service::services::social_graph::InMemorySocialGraph;
use chat_fanout_service::state::{AppState, Backends};
use chat_fanout_service::websocket::{CloseReason, ConnectionRegistry, SessionChannels};
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

pub const SECRET: &str = "integration-test-secret";

pub struct TestEnvironment {
    pub state: AppState,
    pub social: Arc<InMemorySocialGraph>,
    pub tokens: JwtTokenVerifier,
}

/// Configuration with generous handshake limits; `overrides` win.
pub fn test_config(overrides: &[(&str, &str)]) -> Config {
    let mut vars: HashMap<String, String> = [
        ("TOKEN_SECRET", SECRET),
        ("INSTANCE_ID", "test-instance"),
        ("RATE_LIMIT_IP_CAPACITY", "1000"),
        ("RATE_LIMIT_ACCOUNT_CAPACITY", "1000"),
        ("RATE_LIMIT_CONNECTION_CAPACITY", "1000"),
        ("RATE_LIMIT_ROOM_CAPACITY", "1000"),
    ]
    .into_iter()
    .map(|(k, v)| (k.to_string(), v.to_string()))
    .collect();
    for (k, v) in overrides {
        vars.insert(k.to_string(), v.to_string());
    }
    Config::from_lookup(|key| vars.get(key).cloned()).expect("test config")
}

impl TestEnvironment {
    pub fn new() -> Self {
        Self::with(&[])
    }

    pub fn with(overrides: &[(&str, &str)]) -> Self {
        let config = test_config(overrides);
        let registry = ConnectionRegistry::new();
        let social = Arc::new(InMemorySocialGraph::new());
        let backends = Backends::in_memory(&config, &registry, social.clone());
        let state = AppState::build(config, registry, backends);
        Self {
            state,
            social,
            tokens: JwtTokenVerifier::new(SECRET),
        }
    }

    pub fn token(&self, user: UserId, device: &str) -> String {
        self.tokens.issue(user, device, 3600).expect("issue token")
    }

    pub async fn connect(&self, user: UserId, device: &str) -> (Session, SessionChannels) {
        self.state
            .sessions
            .connect(&self.token(user, device), "127.0.0.1")
            .await
            .expect("connect")
    }

    pub async fn disconnect(&self, session: Session) {
        self.state
            .sessions
            .disconnect(session, &CloseReason::ClientClosed)
            .await;
    }

    pub async fn unread(&self, user: UserId) -> u64 {
        self.state.chat.unread_count(user).await.expect("unread count")
    }
}

/// Next event pushed to the session, parsed as JSON.
pub async fn next_event(channels: &mut SessionChannels) -> serde_json::Value {
    let frame = tokio::time::timeout(Duration::from_secs(2), channels.outbound.recv())
        .await
        .expect("timed out waiting for an event")
        .expect("outbound channel closed");
    serde_json::from_str(&frame.text).expect("event is JSON")
}

/// `true` if nothing else arrives within a short grace period.
pub async fn stays_quiet(channels: &mut SessionChannels) -> bool {
    tokio::time::timeout(Duration::from_millis(150), channels.outbound.recv())
        .await
        .is_err()
}

/// Poll `check` until it holds or two seconds pass.
pub async fn eventually<F, Fut>(mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    for _ in 0..200 {
        if check().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}
