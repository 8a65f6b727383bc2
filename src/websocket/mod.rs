use crate::metrics::OUTBOUND_OVERFLOW_TOTAL;
use crate::models::{DeviceId, RoomId, UserId};
use dashmap::DashMap;
use once_cell::sync::OnceCell;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::mpsc::{
    self,
    error::TrySendError,
    UnboundedReceiver, UnboundedSender,
};
use uuid::Uuid;

pub mod broadcast;
pub mod message_types;
pub mod pubsub;

/// One rendered event queued for a session.
#[derive(Debug, Clone)]
pub struct Frame {
    /// Set for events the offline queue can hold if the session overflows.
    pub msg_id: Option<Uuid>,
    pub text: Arc<str>,
}

/// Why a session is being closed from the server side.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    /// The same device connected again.
    Evicted,
    /// The outbound queue was full; `dropped` names the message that did not fit.
    Overflow { dropped: Option<Uuid> },
    HeartbeatTimeout,
    ClientClosed,
}

/// Sending half of a session: a bounded outbound queue for events and an
/// unbounded control channel for close signals.
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    pub session_id: Uuid,
    pub user_id: UserId,
    pub device_id: DeviceId,
    outbound: mpsc::Sender<Frame>,
    control: UnboundedSender<CloseReason>,
}

/// Receiving half, owned by the transport task of the session.
#[derive(Debug)]
pub struct SessionChannels {
    pub outbound: mpsc::Receiver<Frame>,
    pub control: UnboundedReceiver<CloseReason>,
}

impl ConnectionHandle {
    pub fn channel(
        session_id: Uuid,
        user_id: UserId,
        device_id: DeviceId,
        capacity: usize,
    ) -> (Self, SessionChannels) {
        let (outbound_tx, outbound_rx) = mpsc::channel(capacity.max(1));
        let (control_tx, control_rx) = mpsc::unbounded_channel();
        (
            Self {
                session_id,
                user_id,
                device_id,
                outbound: outbound_tx,
                control: control_tx,
            },
            SessionChannels {
                outbound: outbound_rx,
                control: control_rx,
            },
        )
    }

    /// Ask the session to close. Returns `false` if it is already gone.
    pub fn close(&self, reason: CloseReason) -> bool {
        self.control.send(reason).is_ok()
    }
}

/// A session dropped by [`ConnectionRegistry::deliver`] because its queue
/// was full.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Overflowed {
    pub session_id: Uuid,
    pub user_id: UserId,
    pub device_id: DeviceId,
    pub dropped: Option<Uuid>,
}

struct Registered {
    handle: ConnectionHandle,
    rooms: HashSet<RoomId>,
}

/// Result of a local room delivery.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct LocalDelivery {
    /// `(user, device)` of every session that accepted the frame.
    pub delivered: Vec<(UserId, DeviceId)>,
    /// Sessions disconnected because their queue was full.
    pub overflowed: Vec<Uuid>,
}

/// Connection registry for the sessions hosted by this instance.
///
/// Tracks which sessions joined which rooms. Every subscriber sits behind a
/// bounded queue: a slow session never blocks delivery to the rest of the
/// room. A session whose queue is full is unsubscribed everywhere and told
/// to close, carrying the id of the message it missed so teardown can park
/// it in the offline queue.
#[derive(Default, Clone)]
pub struct ConnectionRegistry {
    rooms: Arc<DashMap<RoomId, HashMap<Uuid, ConnectionHandle>>>,
    sessions: Arc<DashMap<Uuid, Registered>>,
    overflows: Arc<OnceCell<UnboundedSender<Overflowed>>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Receive a notice for every session dropped on overflow. Only the
    /// first subscriber gets a receiver.
    pub fn subscribe_overflows(&self) -> Option<UnboundedReceiver<Overflowed>> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.overflows.set(tx).ok().map(|()| rx)
    }

    pub fn contains(&self, session_id: Uuid) -> bool {
        self.sessions.contains_key(&session_id)
    }

    pub fn register(&self, handle: ConnectionHandle) {
        self.sessions.insert(
            handle.session_id,
            Registered {
                handle,
                rooms: HashSet::new(),
            },
        );
    }

    /// Subscribe a registered session to `room`. Returns `false` if the
    /// session is unknown (already unregistered).
    pub fn join(&self, session_id: Uuid, room: RoomId) -> bool {
        let handle = {
            let Some(mut registered) = self.sessions.get_mut(&session_id) else {
                return false;
            };
            registered.rooms.insert(room);
            registered.handle.clone()
        };
        self.rooms.entry(room).or_default().insert(session_id, handle);
        tracing::debug!(session_id = %session_id, room = %room, "joined room");
        true
    }

    pub fn leave(&self, session_id: Uuid, room: RoomId) {
        if let Some(mut registered) = self.sessions.get_mut(&session_id) {
            registered.rooms.remove(&room);
        }
        self.remove_from_room(session_id, room);
    }

    fn remove_from_room(&self, session_id: Uuid, room: RoomId) {
        if let Some(mut subscribers) = self.rooms.get_mut(&room) {
            subscribers.remove(&session_id);
        }
        self.rooms.remove_if(&room, |_, subscribers| subscribers.is_empty());
    }

    pub fn rooms_of(&self, session_id: Uuid) -> HashSet<RoomId> {
        self.sessions
            .get(&session_id)
            .map(|r| r.rooms.clone())
            .unwrap_or_default()
    }

    /// Remove a session from every room. Returns its handle if it was still
    /// registered.
    pub fn unregister(&self, session_id: Uuid) -> Option<ConnectionHandle> {
        let (_, registered) = self.sessions.remove(&session_id)?;
        for room in &registered.rooms {
            self.remove_from_room(session_id, *room);
        }
        Some(registered.handle)
    }

    /// Unregister the session and signal it to close.
    pub fn close_session(&self, session_id: Uuid, reason: CloseReason) -> bool {
        match self.unregister(session_id) {
            Some(handle) => handle.close(reason),
            None => false,
        }
    }

    /// Push `frame` to every session in `room` without waiting on any of them.
    pub fn deliver(&self, room: RoomId, frame: &Frame) -> LocalDelivery {
        // Snapshot the subscribers so no map guard is held while sending or
        // while overflowing sessions are removed.
        let subscribers: Vec<ConnectionHandle> = match self.rooms.get(&room) {
            Some(subs) => subs.values().cloned().collect(),
            None => return LocalDelivery::default(),
        };

        let mut outcome = LocalDelivery::default();
        for handle in subscribers {
            match handle.outbound.try_send(frame.clone()) {
                Ok(()) => outcome
                    .delivered
                    .push((handle.user_id, handle.device_id.clone())),
                Err(TrySendError::Full(_)) => {
                    OUTBOUND_OVERFLOW_TOTAL.inc();
                    tracing::warn!(
                        session_id = %handle.session_id,
                        user_id = %handle.user_id,
                        room = %room,
                        "outbound queue full, disconnecting session"
                    );
                    self.unregister(handle.session_id);
                    self.remove_from_room(handle.session_id, room);
                    handle.close(CloseReason::Overflow {
                        dropped: frame.msg_id,
                    });
                    if let Some(overflows) = self.overflows.get() {
                        let _ = overflows.send(Overflowed {
                            session_id: handle.session_id,
                            user_id: handle.user_id,
                            device_id: handle.device_id.clone(),
                            dropped: frame.msg_id,
                        });
                    }
                    outcome.overflowed.push(handle.session_id);
                }
                Err(TrySendError::Closed(_)) => {
                    tracing::debug!(session_id = %handle.session_id, "dropping closed subscriber");
                    self.unregister(handle.session_id);
                    self.remove_from_room(handle.session_id, room);
                }
            }
        }
        outcome
    }

    /// Get subscriber count for a room (for debugging/metrics)
    pub fn subscriber_count(&self, room: RoomId) -> usize {
        self.rooms.get(&room).map(|s| s.len()).unwrap_or(0)
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(msg_id: Option<Uuid>) -> Frame {
        Frame {
            msg_id,
            text: Arc::from("{}"),
        }
    }

    fn session(
        registry: &ConnectionRegistry,
        user: UserId,
        device: &str,
        capacity: usize,
    ) -> (Uuid, SessionChannels) {
        let id = Uuid::new_v4();
        let (handle, channels) = ConnectionHandle::channel(id, user, device.into(), capacity);
        registry.register(handle);
        (id, channels)
    }

    #[test]
    fn delivers_once_per_joined_session() {
        let registry = ConnectionRegistry::new();
        let group = RoomId::Group(Uuid::new_v4());
        let (a, mut rx_a) = session(&registry, Uuid::new_v4(), "phone", 4);
        let (b, mut rx_b) = session(&registry, Uuid::new_v4(), "laptop", 4);
        let (_c, mut rx_c) = session(&registry, Uuid::new_v4(), "tablet", 4);
        assert!(registry.join(a, group));
        assert!(registry.join(b, group));
        assert!(registry.join(b, group));

        let outcome = registry.deliver(group, &frame(None));
        assert_eq!(outcome.delivered.len(), 2);
        assert!(rx_a.outbound.try_recv().is_ok());
        assert!(rx_b.outbound.try_recv().is_ok());
        assert!(rx_b.outbound.try_recv().is_err());
        assert!(rx_c.outbound.try_recv().is_err());
    }

    #[test]
    fn overflow_disconnects_only_the_slow_session() {
        let registry = ConnectionRegistry::new();
        let room = RoomId::Group(Uuid::new_v4());
        let (slow, mut slow_rx) = session(&registry, Uuid::new_v4(), "phone", 1);
        let (fast, mut fast_rx) = session(&registry, Uuid::new_v4(), "phone", 8);
        registry.join(slow, room);
        registry.join(fast, room);

        registry.deliver(room, &frame(None));
        let dropped = Uuid::new_v4();
        let outcome = registry.deliver(room, &frame(Some(dropped)));

        assert_eq!(outcome.overflowed, vec![slow]);
        assert_eq!(outcome.delivered.len(), 1);
        assert_eq!(
            slow_rx.control.try_recv().unwrap(),
            CloseReason::Overflow {
                dropped: Some(dropped)
            }
        );
        assert_eq!(registry.subscriber_count(room), 1);
        assert!(registry.rooms_of(slow).is_empty());

        assert!(fast_rx.outbound.try_recv().is_ok());
        assert!(fast_rx.outbound.try_recv().is_ok());
    }

    #[test]
    fn overflow_notice_names_the_session() {
        let registry = ConnectionRegistry::new();
        let mut notices = registry.subscribe_overflows().unwrap();
        assert!(registry.subscribe_overflows().is_none());

        let user = Uuid::new_v4();
        let room = RoomId::User(user);
        let (slow, _slow_rx) = session(&registry, user, "watch", 1);
        registry.join(slow, room);
        registry.deliver(room, &frame(None));
        assert!(notices.try_recv().is_err());

        let dropped = Uuid::new_v4();
        registry.deliver(room, &frame(Some(dropped)));
        assert_eq!(
            notices.try_recv().unwrap(),
            Overflowed {
                session_id: slow,
                user_id: user,
                device_id: "watch".into(),
                dropped: Some(dropped),
            }
        );
        assert!(!registry.contains(slow));
    }

    #[test]
    fn unregister_leaves_every_room() {
        let registry = ConnectionRegistry::new();
        let user = Uuid::new_v4();
        let (id, _rx) = session(&registry, user, "phone", 4);
        registry.join(id, RoomId::User(user));
        let group = RoomId::Group(Uuid::new_v4());
        registry.join(id, group);

        assert!(registry.unregister(id).is_some());
        assert!(registry.unregister(id).is_none());
        assert_eq!(registry.subscriber_count(group), 0);
        assert_eq!(registry.subscriber_count(RoomId::User(user)), 0);
        assert!(!registry.join(id, group));
    }
}
