//! Lifecycle of one physical connection: handshake, room membership,
//! heartbeat and teardown. The transport (the WebSocket actor) owns the
//! returned [`SessionChannels`] and calls back in here.

use crate::error::AppResult;
use crate::metrics::ACTIVE_SESSIONS;
use crate::models::{DeviceId, RoomId, UserId};
use crate::services::auth::TokenVerifier;
use crate::services::offline_queue::OfflineQueue;
use crate::services::presence::{PresenceRegistry, RefreshOutcome, SessionRef};
use crate::services::rate_limiter::{Dimension, RateLimiter};
use crate::services::social_graph::SocialGraph;
use crate::websocket::{CloseReason, ConnectionHandle, ConnectionRegistry, SessionChannels};
use std::collections::HashSet;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// An authenticated connection hosted by this instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    pub session_id: Uuid,
    pub user_id: UserId,
    pub device_id: DeviceId,
    pub instance_id: String,
}

impl Session {
    pub fn session_ref(&self) -> SessionRef {
        SessionRef::new(self.session_id, self.instance_id.clone())
    }
}

/// Group rooms added and removed by a rejoin.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RoomChanges {
    pub joined: Vec<RoomId>,
    pub left: Vec<RoomId>,
}

pub struct SessionManager {
    verifier: Arc<dyn TokenVerifier>,
    limiter: Arc<RateLimiter>,
    presence: Arc<PresenceRegistry>,
    registry: ConnectionRegistry,
    social: Arc<dyn SocialGraph>,
    offline: Arc<dyn OfflineQueue>,
    instance_id: String,
    outbound_capacity: usize,
}

impl SessionManager {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        verifier: Arc<dyn TokenVerifier>,
        limiter: Arc<RateLimiter>,
        presence: Arc<PresenceRegistry>,
        registry: ConnectionRegistry,
        social: Arc<dyn SocialGraph>,
        offline: Arc<dyn OfflineQueue>,
        instance_id: impl Into<String>,
        outbound_capacity: usize,
    ) -> Self {
        Self {
            verifier,
            limiter,
            presence,
            registry,
            social,
            offline,
            instance_id: instance_id.into(),
            outbound_capacity,
        }
    }

    /// Authenticate a handshake and bring the session online.
    ///
    /// The session joins its own room and every group room the account is
    /// in right now; later membership changes need [`rejoin_rooms`].
    /// Installing presence evicts any older session of the same device.
    ///
    /// [`rejoin_rooms`]: Self::rejoin_rooms
    pub async fn connect(
        &self,
        token: &str,
        client_ip: &str,
    ) -> AppResult<(Session, SessionChannels)> {
        self.limiter.check(Dimension::Ip, client_ip)?;
        let identity = self.verifier.verify(token)?;
        self.limiter
            .check(Dimension::Account, &identity.user_id.to_string())?;

        let session = Session {
            session_id: Uuid::new_v4(),
            user_id: identity.user_id,
            device_id: identity.device_id,
            instance_id: self.instance_id.clone(),
        };
        let (handle, channels) = ConnectionHandle::channel(
            session.session_id,
            session.user_id,
            session.device_id.clone(),
            self.outbound_capacity,
        );
        self.registry.register(handle);
        self.registry
            .join(session.session_id, RoomId::User(session.user_id));

        match self.social.groups_of(session.user_id).await {
            Ok(groups) => {
                for group in groups {
                    self.registry.join(session.session_id, RoomId::Group(group));
                }
            }
            Err(e) => warn!(
                user_id = %session.user_id,
                error = %e,
                "group lookup failed, session joined its own room only"
            ),
        }

        if let Err(e) = self
            .presence
            .set_online(session.user_id, &session.device_id, &session.session_ref())
            .await
        {
            self.registry.unregister(session.session_id);
            error!(user_id = %session.user_id, error = %e, "presence install failed");
            return Err(e);
        }

        ACTIVE_SESSIONS.inc();
        info!(
            session_id = %session.session_id,
            user_id = %session.user_id,
            device_id = %session.device_id,
            rooms = self.registry.rooms_of(session.session_id).len(),
            "session connected"
        );
        Ok((session, channels))
    }

    /// Extend presence. A session whose entry expired re-installs it; one
    /// that was displaced by a newer session is closed.
    pub async fn heartbeat(&self, session: &Session) -> AppResult<RefreshOutcome> {
        let outcome = self
            .presence
            .refresh(session.user_id, &session.device_id, &session.session_ref())
            .await?;
        match outcome {
            RefreshOutcome::Refreshed => {}
            // Dropped from the registry (overflow, eviction) and waiting to
            // close: the device must keep reading as offline.
            RefreshOutcome::Missing if !self.registry.contains(session.session_id) => {
                debug!(session_id = %session.session_id, "heartbeat from closing session ignored");
            }
            RefreshOutcome::Missing => {
                debug!(session_id = %session.session_id, "presence expired, reinstalling");
                self.presence
                    .set_online(session.user_id, &session.device_id, &session.session_ref())
                    .await?;
            }
            RefreshOutcome::Displaced => {
                info!(session_id = %session.session_id, "heartbeat from displaced session");
                self.registry
                    .close_session(session.session_id, CloseReason::Evicted);
            }
        }
        Ok(outcome)
    }

    /// Clear presence for sessions the registry drops on overflow as soon as
    /// they are dropped, so no message is counted as live while the socket
    /// drains. Returns `None` if another task already consumes the notices.
    pub fn spawn_overflow_reaper(self: &Arc<Self>) -> Option<JoinHandle<()>> {
        let mut notices = self.registry.subscribe_overflows()?;
        let manager = self.clone();
        Some(tokio::spawn(async move {
            while let Some(notice) = notices.recv().await {
                let session = SessionRef::new(notice.session_id, manager.instance_id.clone());
                match manager
                    .presence
                    .clear(notice.user_id, &notice.device_id, &session)
                    .await
                {
                    Ok(()) => debug!(
                        session_id = %notice.session_id,
                        user_id = %notice.user_id,
                        "presence cleared for overflowed session"
                    ),
                    Err(e) => warn!(
                        session_id = %notice.session_id,
                        error = %e,
                        "presence clear after overflow failed"
                    ),
                }
            }
        }))
    }

    /// Re-read group membership and adjust the joined group rooms.
    pub async fn rejoin_rooms(&self, session: &Session) -> AppResult<RoomChanges> {
        let wanted: HashSet<RoomId> = self
            .social
            .groups_of(session.user_id)
            .await?
            .into_iter()
            .map(RoomId::Group)
            .collect();
        let current: HashSet<RoomId> = self
            .registry
            .rooms_of(session.session_id)
            .into_iter()
            .filter(RoomId::is_group)
            .collect();

        let mut changes = RoomChanges::default();
        for room in wanted.difference(&current) {
            if self.registry.join(session.session_id, *room) {
                changes.joined.push(*room);
            }
        }
        for room in current.difference(&wanted) {
            self.registry.leave(session.session_id, *room);
            changes.left.push(*room);
        }
        debug!(
            session_id = %session.session_id,
            joined = changes.joined.len(),
            left = changes.left.len(),
            "rooms rejoined"
        );
        Ok(changes)
    }

    /// Tear the session down. Presence is only cleared if this session still
    /// owns it; a message dropped on overflow goes to the offline queue.
    pub async fn disconnect(&self, session: Session, reason: &CloseReason) {
        self.registry.unregister(session.session_id);

        if let Err(e) = self
            .presence
            .clear(session.user_id, &session.device_id, &session.session_ref())
            .await
        {
            warn!(session_id = %session.session_id, error = %e, "presence clear failed");
        }

        if let CloseReason::Overflow {
            dropped: Some(msg_id),
        } = reason
        {
            match self.offline.enqueue(session.user_id, *msg_id).await {
                Ok(_) => info!(
                    session_id = %session.session_id,
                    msg_id = %msg_id,
                    "overflowed message requeued offline"
                ),
                Err(e) => error!(
                    session_id = %session.session_id,
                    msg_id = %msg_id,
                    error = %e,
                    "failed to requeue overflowed message"
                ),
            }
        }

        ACTIVE_SESSIONS.dec();
        info!(
            session_id = %session.session_id,
            user_id = %session.user_id,
            device_id = %session.device_id,
            reason = ?reason,
            "session disconnected"
        );
    }
}
