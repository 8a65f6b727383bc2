use actix_web::{web, App, HttpServer};
use anyhow::Context;
use chat_fanout_service::{
    config, db, logging,
    redis_client::RedisClient,
    routes,
    services::{
        call_service::RedisCallStore,
        message_store::PgMessageStore,
        offline_queue::RedisOfflineQueue,
        presence::RedisPresenceStore,
        push::NtfyNotifier,
        social_graph::{HttpSocialGraph, InMemorySocialGraph, SocialGraph},
    },
    state::{AppState, Backends},
    websocket::{
        broadcast::{LocalBroadcaster, RedisBroadcaster},
        pubsub::run_fanout_listener,
        ConnectionRegistry,
    },
};
use std::sync::Arc;
use std::time::Duration;

const SOCIAL_GRAPH_TIMEOUT: Duration = Duration::from_secs(5);

#[actix_web::main]
async fn main() -> anyhow::Result<()> {
    logging::init_tracing();
    let cfg = config::Config::from_env().context("load configuration")?;

    let registry = ConnectionRegistry::new();

    let social: Arc<dyn SocialGraph> = match &cfg.social_graph_url {
        Some(url) => Arc::new(
            HttpSocialGraph::new(url.clone(), SOCIAL_GRAPH_TIMEOUT)
                .context("social graph client")?,
        ),
        None => {
            tracing::warn!("SOCIAL_GRAPH_URL not set, using an empty in-process social graph");
            Arc::new(InMemorySocialGraph::new())
        }
    };

    let mut backends = Backends::in_memory(&cfg, &registry, social);

    if let Some(url) = &cfg.database_url {
        let pool = db::init_pool(url).await.context("postgres")?;
        backends.messages = Arc::new(PgMessageStore::new(pool));
        tracing::info!("message store: postgres");
    } else {
        tracing::warn!("DATABASE_URL not set, messages are kept in memory");
    }

    if let Some(url) = &cfg.redis_url {
        let redis = RedisClient::from_url(url).await.context("redis")?;
        backends.presence = Arc::new(RedisPresenceStore::new(redis.clone()));
        backends.offline = Arc::new(RedisOfflineQueue::new(
            redis.clone(),
            cfg.offline_message_ttl_secs,
        ));
        backends.calls = Arc::new(RedisCallStore::new(redis.clone()));
        backends.broadcaster = Arc::new(RedisBroadcaster::new(
            redis.clone(),
            LocalBroadcaster::new(registry.clone()),
            cfg.instance_id.clone(),
        ));

        // Cross-instance fan-out: every instance delivers published room
        // events to its own sessions.
        tokio::spawn(run_fanout_listener(
            redis,
            registry.clone(),
            cfg.instance_id.clone(),
        ));
        tracing::info!("presence, offline queue, calls and broadcast: redis");
    } else {
        tracing::warn!("REDIS_URL not set, running as a single instance");
    }

    if cfg.push.enabled {
        match &cfg.push.ntfy_url {
            Some(url) => {
                backends.notifier = Arc::new(
                    NtfyNotifier::new(url.clone(), cfg.push.topic_prefix.clone(), cfg.push.timeout)
                        .context("ntfy client")?,
                );
            }
            None => tracing::warn!("PUSH_ENABLED without NTFY_URL, notifications are dropped"),
        }
    }

    let bind_addr = format!("0.0.0.0:{}", cfg.port);
    let instance_id = cfg.instance_id.clone();
    let state = AppState::build(cfg, registry, backends);
    tracing::info!(%bind_addr, %instance_id, "starting chat-fanout-service");

    HttpServer::new(move || {
        App::new()
            .app_data(web::Data::new(state.clone()))
            .configure(routes::configure)
    })
    .bind(&bind_addr)
    .with_context(|| format!("bind {bind_addr}"))?
    .run()
    .await
    .context("http server")?;

    Ok(())
}
