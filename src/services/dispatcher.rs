//! Fan-out of persisted messages, recalls, read receipts and call events.
//!
//! The dispatcher runs behind [`DispatchQueue`], bounded job queues drained
//! by a fixed pool of workers, so request handlers return once the job is
//! queued. Jobs are sharded by room: everything for one room runs on one
//! worker, in submission order. Each recipient is handled in isolation: a
//! failure for one never stops delivery to the rest of the recipient set.

use crate::error::{AppError, AppResult};
use crate::metrics::{
    DISPATCH_QUEUE_DEPTH, FANOUT_FAILURES_TOTAL, FANOUT_LIVE_DELIVERIES_TOTAL,
    FANOUT_OFFLINE_ENQUEUED_TOTAL,
};
use crate::models::{Call, CallAction, Message, ReceiverKind, RoomId, UserId};
use crate::services::notification::{NotificationPreview, PushQueue};
use crate::services::offline_queue::OfflineQueue;
use crate::services::presence::PresenceRegistry;
use crate::services::social_graph::SocialGraph;
use crate::websocket::broadcast::{BroadcastReport, Broadcaster};
use crate::websocket::message_types::WsOutboundEvent;
use futures_util::future::join_all;
use std::collections::hash_map::DefaultHasher;
use std::collections::HashSet;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

const MEMBERSHIP_ATTEMPTS: u32 = 3;
const MEMBERSHIP_BACKOFF: Duration = Duration::from_millis(100);

/// Where one message ended up.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeliveryOutcome {
    pub msg_id: Uuid,
    /// Recipients with at least one session that took the message.
    pub live: Vec<UserId>,
    /// Recipients whose message was parked in the offline queue.
    pub offline: Vec<UserId>,
    pub failed: Vec<(UserId, String)>,
}

impl DeliveryOutcome {
    fn new(msg_id: Uuid) -> Self {
        Self {
            msg_id,
            ..Self::default()
        }
    }
}

pub struct FanoutDispatcher {
    presence: Arc<PresenceRegistry>,
    offline: Arc<dyn OfflineQueue>,
    broadcaster: Arc<dyn Broadcaster>,
    social: Arc<dyn SocialGraph>,
    push: PushQueue,
}

impl FanoutDispatcher {
    pub fn new(
        presence: Arc<PresenceRegistry>,
        offline: Arc<dyn OfflineQueue>,
        broadcaster: Arc<dyn Broadcaster>,
        social: Arc<dyn SocialGraph>,
        push: PushQueue,
    ) -> Self {
        Self {
            presence,
            offline,
            broadcaster,
            social,
            push,
        }
    }

    pub async fn run(&self, job: DispatchJob) {
        match job {
            DispatchJob::Deliver(message) => {
                self.deliver(&message).await;
            }
            DispatchJob::Recall { message, by } => {
                if let Err(e) = self.deliver_recall(&message, by).await {
                    FANOUT_FAILURES_TOTAL.inc();
                    warn!(msg_id = %message.id, error = %e, "recall broadcast failed");
                }
            }
            DispatchJob::Read { message, reader } => {
                if let Err(e) = self.deliver_read(&message, reader).await {
                    FANOUT_FAILURES_TOTAL.inc();
                    warn!(msg_id = %message.id, error = %e, "read receipt broadcast failed");
                }
            }
            DispatchJob::Call { call, action } => self.deliver_call(&call, action).await,
        }
    }

    /// Deliver a persisted message to its recipients.
    ///
    /// Direct messages go to the receiver's room when any of their devices
    /// is online and to the offline queue otherwise. Group messages are one
    /// broadcast into the group room; the member list, read now rather than
    /// at send time, only decides who needs an offline entry. A recipient
    /// that presence reports online but no local session accepted (its queue
    /// overflowed, say) is parked offline as well.
    pub async fn deliver(&self, message: &Message) -> DeliveryOutcome {
        let outcome = match message.receiver_kind {
            ReceiverKind::Direct => self.deliver_direct(message).await,
            ReceiverKind::Group => self.deliver_group(message).await,
        };

        let kind = message.receiver_kind.as_str();
        FANOUT_LIVE_DELIVERIES_TOTAL
            .with_label_values(&[kind])
            .inc_by(outcome.live.len() as u64);
        FANOUT_OFFLINE_ENQUEUED_TOTAL
            .with_label_values(&[kind])
            .inc_by(outcome.offline.len() as u64);
        info!(
            msg_id = %message.id,
            receiver_kind = kind,
            receiver_id = %message.receiver_id,
            live = outcome.live.len(),
            offline = outcome.offline.len(),
            failed = outcome.failed.len(),
            "message dispatched"
        );
        outcome
    }

    async fn deliver_direct(&self, message: &Message) -> DeliveryOutcome {
        let mut outcome = DeliveryOutcome::new(message.id);
        let recipient = message.receiver_id;
        let devices = self.presence.is_online(recipient).await;

        if !devices.is_empty() {
            let event = WsOutboundEvent::NewMessage {
                message: message.clone(),
            };
            match self.broadcaster.broadcast(message.room(), &event).await {
                Ok(report) if reached(&report, recipient) => {
                    debug!(
                        msg_id = %message.id,
                        devices = devices.len(),
                        local_sessions = report.local.delivered.len(),
                        published = report.published,
                        "direct message broadcast"
                    );
                    outcome.live.push(recipient);
                    return outcome;
                }
                Ok(report) => {
                    debug!(
                        msg_id = %message.id,
                        user_id = %recipient,
                        overflowed = report.local.overflowed.len(),
                        "no session accepted the message"
                    );
                }
                Err(e) => {
                    // Fall through to the offline path so the message is not lost.
                    FANOUT_FAILURES_TOTAL.inc();
                    warn!(msg_id = %message.id, user_id = %recipient, error = %e, "live delivery failed");
                    outcome.failed.push((recipient, e.to_string()));
                }
            }
        }

        self.park_offline(message, recipient, &mut outcome).await;
        outcome
    }

    async fn deliver_group(&self, message: &Message) -> DeliveryOutcome {
        let mut outcome = DeliveryOutcome::new(message.id);
        let event = WsOutboundEvent::NewMessage {
            message: message.clone(),
        };
        // `None`: published on the bus, every online member counts as reached.
        let accepted: Option<HashSet<UserId>> =
            match self.broadcaster.broadcast(message.room(), &event).await {
                Ok(report) => {
                    debug!(
                        msg_id = %message.id,
                        local_sessions = report.local.delivered.len(),
                        overflowed = report.local.overflowed.len(),
                        published = report.published,
                        "group message broadcast"
                    );
                    (!report.published).then(|| {
                        report
                            .local
                            .delivered
                            .iter()
                            .map(|(user, _)| *user)
                            .collect()
                    })
                }
                Err(e) => {
                    FANOUT_FAILURES_TOTAL.inc();
                    warn!(msg_id = %message.id, group_id = %message.receiver_id, error = %e, "group broadcast failed");
                    Some(HashSet::new())
                }
            };

        let members = match self.group_members_with_retry(message.receiver_id).await {
            Ok(members) => members,
            Err(e) => {
                FANOUT_FAILURES_TOTAL.inc();
                error!(
                    msg_id = %message.id,
                    group_id = %message.receiver_id,
                    attempts = MEMBERSHIP_ATTEMPTS,
                    error = %e,
                    "membership lookup failed, offline backlog skipped"
                );
                return outcome;
            }
        };
        let recipients: Vec<UserId> = members
            .into_iter()
            .filter(|member| *member != message.sender_id)
            .collect();

        let online = self.online_flags(&recipients).await;
        for (member, is_online) in recipients.into_iter().zip(online) {
            let took_it = accepted.as_ref().map_or(true, |users| users.contains(&member));
            if is_online && took_it {
                outcome.live.push(member);
            } else {
                self.park_offline(message, member, &mut outcome).await;
            }
        }
        outcome
    }

    async fn group_members_with_retry(&self, group: Uuid) -> AppResult<Vec<UserId>> {
        let mut delay = MEMBERSHIP_BACKOFF;
        let mut attempt = 1;
        loop {
            match self.social.group_members(group).await {
                Ok(members) => return Ok(members),
                Err(e) if attempt < MEMBERSHIP_ATTEMPTS => {
                    warn!(group_id = %group, attempt, error = %e, "membership lookup failed, retrying");
                    tokio::time::sleep(delay).await;
                    delay *= 2;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Presence of each user, looked up concurrently.
    async fn online_flags(&self, users: &[UserId]) -> Vec<bool> {
        join_all(
            users
                .iter()
                .map(|user| async move { !self.presence.is_online(*user).await.is_empty() }),
        )
        .await
    }

    async fn park_offline(&self, message: &Message, user: UserId, outcome: &mut DeliveryOutcome) {
        match self.offline.enqueue(user, message.id).await {
            Ok(fresh) => {
                if !fresh {
                    debug!(msg_id = %message.id, user_id = %user, "already queued offline");
                }
                outcome.offline.push(user);
                self.push
                    .enqueue(user, NotificationPreview::for_message(message));
            }
            Err(e) => {
                FANOUT_FAILURES_TOTAL.inc();
                error!(msg_id = %message.id, user_id = %user, error = %e, "offline enqueue failed");
                outcome.failed.push((user, e.to_string()));
            }
        }
    }

    /// Announce a recall in the room the message was delivered to.
    pub async fn deliver_recall(&self, message: &Message, by: UserId) -> AppResult<BroadcastReport> {
        let room = message.room();
        let event = WsOutboundEvent::RecallMessage {
            msg_id: message.id,
            room,
            recalled_by: by,
        };
        let report = self.broadcaster.broadcast(room, &event).await?;
        info!(msg_id = %message.id, room = %room, "recall broadcast");
        Ok(report)
    }

    /// Tell the sender's devices that `reader` has read the message.
    pub async fn deliver_read(&self, message: &Message, reader: UserId) -> AppResult<BroadcastReport> {
        let event = WsOutboundEvent::ReadReceipt {
            msg_id: message.id,
            reader_id: reader,
        };
        self.broadcaster
            .broadcast(RoomId::User(message.sender_id), &event)
            .await
    }

    /// Rooms a call event goes to. Group rooms already include the initiator.
    pub fn call_rooms(call: &Call) -> Vec<RoomId> {
        match call.receiver_kind {
            ReceiverKind::Direct if call.receiver_id != call.initiator_id => {
                vec![call.room(), RoomId::User(call.initiator_id)]
            }
            _ => vec![call.room()],
        }
    }

    pub async fn deliver_call(&self, call: &Call, action: CallAction) {
        let event = WsOutboundEvent::Call {
            action,
            call: call.clone(),
        };
        for room in Self::call_rooms(call) {
            if let Err(e) = self.broadcaster.broadcast(room, &event).await {
                FANOUT_FAILURES_TOTAL.inc();
                warn!(call_id = %call.id, room = %room, error = %e, "call event broadcast failed");
            }
        }

        if action == CallAction::Incoming && self.push.is_enabled() {
            let recipients = match self.call_recipients(call).await {
                Ok(recipients) => recipients,
                Err(e) => {
                    warn!(call_id = %call.id, error = %e, "call recipients lookup failed");
                    Vec::new()
                }
            };
            let online = self.online_flags(&recipients).await;
            for (user, is_online) in recipients.into_iter().zip(online) {
                if !is_online {
                    self.push
                        .enqueue(user, NotificationPreview::for_incoming_call(call));
                }
            }
        }
        info!(call_id = %call.id, action = ?action, status = %call.status, "call event dispatched");
    }

    async fn call_recipients(&self, call: &Call) -> AppResult<Vec<UserId>> {
        match call.receiver_kind {
            ReceiverKind::Direct => Ok(vec![call.receiver_id]),
            ReceiverKind::Group => Ok(self
                .social
                .group_members(call.receiver_id)
                .await?
                .into_iter()
                .filter(|member| *member != call.initiator_id)
                .collect()),
        }
    }
}

fn reached(report: &BroadcastReport, user: UserId) -> bool {
    report.published || report.local.delivered.iter().any(|(u, _)| *u == user)
}

/// Work handed from request handlers to the dispatch workers.
#[derive(Debug, Clone)]
pub enum DispatchJob {
    Deliver(Message),
    Recall { message: Message, by: UserId },
    Read { message: Message, reader: UserId },
    Call { call: Call, action: CallAction },
}

impl DispatchJob {
    fn kind(&self) -> &'static str {
        match self {
            DispatchJob::Deliver(_) => "deliver",
            DispatchJob::Recall { .. } => "recall",
            DispatchJob::Read { .. } => "read",
            DispatchJob::Call { .. } => "call",
        }
    }

    /// Ordering key: jobs for the same room are run in submission order.
    pub fn room(&self) -> RoomId {
        match self {
            DispatchJob::Deliver(message)
            | DispatchJob::Recall { message, .. }
            | DispatchJob::Read { message, .. } => message.room(),
            DispatchJob::Call { call, .. } => call.room(),
        }
    }
}

fn shard_for(room: RoomId, shards: usize) -> usize {
    let mut hasher = DefaultHasher::new();
    room.hash(&mut hasher);
    (hasher.finish() % shards.max(1) as u64) as usize
}

/// Bounded queues in front of the dispatcher, one per worker.
#[derive(Clone)]
pub struct DispatchQueue {
    shards: Arc<[mpsc::Sender<DispatchJob>]>,
}

impl DispatchQueue {
    /// Spawn `workers` tasks, each draining its own queue; `capacity` is
    /// split across them.
    pub fn start(
        dispatcher: Arc<FanoutDispatcher>,
        capacity: usize,
        workers: usize,
    ) -> (Self, Vec<JoinHandle<()>>) {
        let workers = workers.max(1);
        let per_shard = (capacity / workers).max(1);
        let mut shards = Vec::with_capacity(workers);
        let mut handles = Vec::with_capacity(workers);
        for worker in 0..workers {
            let (tx, mut rx) = mpsc::channel::<DispatchJob>(per_shard);
            let dispatcher = dispatcher.clone();
            handles.push(tokio::spawn(async move {
                while let Some(job) = rx.recv().await {
                    DISPATCH_QUEUE_DEPTH.dec();
                    dispatcher.run(job).await;
                }
                debug!(worker, "dispatch worker stopped");
            }));
            shards.push(tx);
        }
        info!(capacity, workers, "dispatch queue started");
        (
            Self {
                shards: shards.into(),
            },
            handles,
        )
    }

    /// Queue a job on its room's worker, waiting for room when that worker
    /// is saturated.
    pub async fn submit(&self, job: DispatchJob) -> AppResult<()> {
        let kind = job.kind();
        let shard = shard_for(job.room(), self.shards.len());
        DISPATCH_QUEUE_DEPTH.inc();
        if self.shards[shard].send(job).await.is_err() {
            DISPATCH_QUEUE_DEPTH.dec();
            error!(job = kind, shard, "dispatch queue closed");
            return Err(AppError::Internal);
        }
        Ok(())
    }
}
