use crate::models::RoomId;
use crate::redis_client::RedisClient;
use crate::services::presence::SessionRef;
use crate::websocket::{CloseReason, ConnectionRegistry, Frame};
use futures_util::StreamExt;
use redis::AsyncCommands;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

const ROOM_PREFIX: &str = "fanout:room:";
const EVICT_CHANNEL: &str = "fanout:evict";
const PATTERN: &str = "fanout:*";

/// Room event as it travels between instances.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoomEnvelope {
    pub room: RoomId,
    pub msg_id: Option<Uuid>,
    /// Rendered client event, forwarded verbatim.
    pub event: String,
}

fn channel_for_room(room: RoomId) -> String {
    format!("{ROOM_PREFIX}{room}")
}

fn encode_error(e: serde_json::Error) -> redis::RedisError {
    redis::RedisError::from((
        redis::ErrorKind::TypeError,
        "serialize fanout envelope",
        e.to_string(),
    ))
}

pub async fn publish_room(redis: &RedisClient, envelope: &RoomEnvelope) -> redis::RedisResult<()> {
    let payload = serde_json::to_string(envelope).map_err(encode_error)?;
    let mut conn = redis.connection();
    conn.publish::<_, _, ()>(channel_for_room(envelope.room), payload)
        .await
}

pub async fn publish_evict(redis: &RedisClient, session: &SessionRef) -> redis::RedisResult<()> {
    let payload = serde_json::to_string(session).map_err(encode_error)?;
    let mut conn = redis.connection();
    conn.publish::<_, _, ()>(EVICT_CHANNEL, payload).await
}

/// Apply one pub/sub message to the local registry.
fn dispatch_local(registry: &ConnectionRegistry, instance_id: &str, channel: &str, payload: &str) {
    if channel == EVICT_CHANNEL {
        match serde_json::from_str::<SessionRef>(payload) {
            Ok(session) if session.instance_id == instance_id => {
                registry.close_session(session.session_id, CloseReason::Evicted);
            }
            Ok(_) => {}
            Err(e) => tracing::warn!(error = %e, "malformed eviction notice"),
        }
        return;
    }

    if channel.starts_with(ROOM_PREFIX) {
        match serde_json::from_str::<RoomEnvelope>(payload) {
            Ok(envelope) => {
                let frame = Frame {
                    msg_id: envelope.msg_id,
                    text: Arc::from(envelope.event),
                };
                registry.deliver(envelope.room, &frame);
            }
            Err(e) => tracing::warn!(channel, error = %e, "malformed room envelope"),
        }
    }
}

pub async fn start_fanout_listener(
    redis: RedisClient,
    registry: ConnectionRegistry,
    instance_id: String,
) -> redis::RedisResult<()> {
    // PubSub requires a dedicated connection, not multiplexed
    let mut pubsub = redis.pubsub().await?;
    pubsub.psubscribe(PATTERN).await?;
    tracing::info!(pattern = PATTERN, "fanout listener subscribed");

    let mut stream = pubsub.on_message();
    while let Some(msg) = stream.next().await {
        let channel: String = msg.get_channel_name().into();
        let payload: String = match msg.get_payload() {
            Ok(p) => p,
            Err(e) => {
                tracing::warn!(channel, error = %e, "non-text fanout payload");
                continue;
            }
        };
        dispatch_local(&registry, &instance_id, &channel, &payload);
    }
    Ok(())
}

/// Keep the listener alive across Redis disconnects.
pub async fn run_fanout_listener(redis: RedisClient, registry: ConnectionRegistry, instance_id: String) {
    loop {
        match start_fanout_listener(redis.clone(), registry.clone(), instance_id.clone()).await {
            Ok(()) => tracing::warn!("fanout listener stream ended, resubscribing"),
            Err(e) => tracing::error!(error = %e, "fanout listener failed, resubscribing"),
        }
        tokio::time::sleep(Duration::from_secs(1)).await;
    }
}
