//! Room broadcast behind one interface, with an in-process variant for a
//! single instance and a Redis pub/sub variant for several.

use crate::error::{AppError, AppResult};
use crate::models::RoomId;
use crate::redis_client::RedisClient;
use crate::services::presence::SessionRef;
use crate::websocket::message_types::WsOutboundEvent;
use crate::websocket::pubsub::{self, RoomEnvelope};
use crate::websocket::{CloseReason, ConnectionRegistry, Frame, LocalDelivery};
use async_trait::async_trait;
use std::sync::Arc;

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct BroadcastReport {
    /// Sessions on this instance reached synchronously.
    pub local: LocalDelivery,
    /// The event went out on the shared bus for every instance to deliver.
    pub published: bool,
}

#[async_trait]
pub trait Broadcaster: Send + Sync {
    /// Deliver `event` to every session joined to `room`.
    async fn broadcast(&self, room: RoomId, event: &WsOutboundEvent) -> AppResult<BroadcastReport>;

    /// Force-close `session`, wherever it is hosted.
    async fn evict(&self, session: &SessionRef) -> AppResult<()>;
}

pub fn render(event: &WsOutboundEvent) -> AppResult<Frame> {
    let text = event.to_json().map_err(|e| {
        tracing::error!(error = %e, "failed to serialize outbound event");
        AppError::Internal
    })?;
    Ok(Frame {
        msg_id: event.requeue_id(),
        text: Arc::from(text),
    })
}

/// In-process broadcaster over the local [`ConnectionRegistry`].
#[derive(Clone)]
pub struct LocalBroadcaster {
    registry: ConnectionRegistry,
}

impl LocalBroadcaster {
    pub fn new(registry: ConnectionRegistry) -> Self {
        Self { registry }
    }
}

#[async_trait]
impl Broadcaster for LocalBroadcaster {
    async fn broadcast(&self, room: RoomId, event: &WsOutboundEvent) -> AppResult<BroadcastReport> {
        let frame = render(event)?;
        Ok(BroadcastReport {
            local: self.registry.deliver(room, &frame),
            published: false,
        })
    }

    async fn evict(&self, session: &SessionRef) -> AppResult<()> {
        if !self
            .registry
            .close_session(session.session_id, CloseReason::Evicted)
        {
            tracing::debug!(session_id = %session.session_id, "evicted session already gone");
        }
        Ok(())
    }
}

/// Cross-instance broadcaster. Every instance, this one included, receives
/// room events through its pub/sub listener and delivers them locally, so a
/// broadcast here never touches the local registry directly.
pub struct RedisBroadcaster {
    redis: RedisClient,
    local: LocalBroadcaster,
    instance_id: String,
}

impl RedisBroadcaster {
    pub fn new(redis: RedisClient, local: LocalBroadcaster, instance_id: impl Into<String>) -> Self {
        Self {
            redis,
            local,
            instance_id: instance_id.into(),
        }
    }
}

#[async_trait]
impl Broadcaster for RedisBroadcaster {
    async fn broadcast(&self, room: RoomId, event: &WsOutboundEvent) -> AppResult<BroadcastReport> {
        let frame = render(event)?;
        let envelope = RoomEnvelope {
            room,
            msg_id: frame.msg_id,
            event: frame.text.to_string(),
        };
        pubsub::publish_room(&self.redis, &envelope).await?;
        Ok(BroadcastReport {
            local: LocalDelivery::default(),
            published: true,
        })
    }

    async fn evict(&self, session: &SessionRef) -> AppResult<()> {
        if session.instance_id == self.instance_id {
            return self.local.evict(session).await;
        }
        pubsub::publish_evict(&self.redis, session).await?;
        Ok(())
    }
}
