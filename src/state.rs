use crate::{
    config::Config,
    services::{
        auth::{JwtTokenVerifier, TokenVerifier},
        call_service::{CallService, CallStore, InMemoryCallStore},
        chat_service::ChatService,
        dispatcher::{DispatchQueue, FanoutDispatcher},
        message_store::{InMemoryMessageStore, MessageStore},
        notification::PushQueue,
        offline_queue::{InMemoryOfflineQueue, OfflineQueue},
        presence::{InMemoryPresenceStore, PresenceRegistry, PresenceStore},
        push::{NoopNotifier, PushNotifier},
        rate_limiter::RateLimiter,
        retention,
        session_manager::SessionManager,
        social_graph::SocialGraph,
    },
    websocket::{
        broadcast::{Broadcaster, LocalBroadcaster},
        ConnectionRegistry,
    },
};
use std::sync::Arc;
use std::time::Duration;

/// Storage and collaborator implementations the services run on.
pub struct Backends {
    pub presence: Arc<dyn PresenceStore>,
    pub offline: Arc<dyn OfflineQueue>,
    pub messages: Arc<dyn MessageStore>,
    pub calls: Arc<dyn CallStore>,
    pub broadcaster: Arc<dyn Broadcaster>,
    pub social: Arc<dyn SocialGraph>,
    pub notifier: Arc<dyn PushNotifier>,
    pub verifier: Arc<dyn TokenVerifier>,
}

impl Backends {
    /// Single-instance wiring: everything in process except the social graph.
    pub fn in_memory(
        config: &Config,
        registry: &ConnectionRegistry,
        social: Arc<dyn SocialGraph>,
    ) -> Self {
        Self {
            presence: Arc::new(InMemoryPresenceStore::new()),
            offline: Arc::new(InMemoryOfflineQueue::new()),
            messages: Arc::new(InMemoryMessageStore::new()),
            calls: Arc::new(InMemoryCallStore::new()),
            broadcaster: Arc::new(LocalBroadcaster::new(registry.clone())),
            social,
            notifier: Arc::new(NoopNotifier),
            verifier: Arc::new(JwtTokenVerifier::new(&config.token_secret)),
        }
    }
}

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub registry: ConnectionRegistry,
    pub limiter: Arc<RateLimiter>,
    pub verifier: Arc<dyn TokenVerifier>,
    pub presence: Arc<PresenceRegistry>,
    pub chat: Arc<ChatService>,
    pub calls: Arc<CallService>,
    pub sessions: Arc<SessionManager>,
}

impl AppState {
    /// Wire the services and spawn the background workers: dispatch, push,
    /// overflow reaper and message retention. Must run inside a Tokio runtime.
    pub fn build(config: Config, registry: ConnectionRegistry, backends: Backends) -> Self {
        let config = Arc::new(config);
        let limiter = Arc::new(RateLimiter::new(&config.rate_limits));
        let presence = Arc::new(PresenceRegistry::new(
            backends.presence,
            backends.broadcaster.clone(),
            Duration::from_secs(config.presence_ttl_secs),
        ));

        let (push, _push_worker) = PushQueue::start(backends.notifier, &config.push);
        let dispatcher = Arc::new(FanoutDispatcher::new(
            presence.clone(),
            backends.offline.clone(),
            backends.broadcaster,
            backends.social.clone(),
            push,
        ));
        let (dispatch, _workers) = DispatchQueue::start(
            dispatcher,
            config.dispatch_queue_capacity,
            config.dispatch_workers,
        );

        let messages = backends.messages;
        let chat = Arc::new(ChatService::new(
            messages.clone(),
            backends.offline.clone(),
            backends.social.clone(),
            limiter.clone(),
            dispatch.clone(),
            config.recall_window(),
        ));
        let calls = Arc::new(CallService::new(
            backends.calls,
            backends.social.clone(),
            limiter.clone(),
            dispatch,
            config.end_while_ringing,
        ));
        let sessions = Arc::new(SessionManager::new(
            backends.verifier.clone(),
            limiter.clone(),
            presence.clone(),
            registry.clone(),
            backends.social,
            backends.offline,
            config.instance_id.clone(),
            config.outbound_queue_capacity,
        ));
        sessions.spawn_overflow_reaper();
        if let Some(retention) = config.message_retention() {
            retention::spawn_sweeper(
                messages,
                retention,
                config.retention_sweep_interval,
            );
        }

        Self {
            config,
            registry,
            limiter,
            verifier: backends.verifier,
            presence,
            chat,
            calls,
            sessions,
        }
    }
}
