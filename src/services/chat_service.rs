//! Message operations exposed to collaborators: send, recall, read marks,
//! offline drain and unread count.
//!
//! A send is acknowledged once the message store append succeeds. Fan-out
//! happens on the dispatch workers afterwards.

use crate::error::{AppError, AppResult};
use crate::models::{ContentKind, Message, ReceiverKind, UserId};
use crate::services::dispatcher::{DispatchJob, DispatchQueue};
use crate::services::message_store::MessageStore;
use crate::services::offline_queue::OfflineQueue;
use crate::services::rate_limiter::{Dimension, RateLimiter};
use crate::services::social_graph::{authorize_direct, authorize_group_send, SocialGraph};
use chrono::{DateTime, Duration, Utc};
use std::sync::Arc;
use tracing::{error, info, warn};
use uuid::Uuid;

/// Acknowledgement returned to the sender.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub struct SendReceipt {
    pub msg_id: Uuid,
    pub sent_at: DateTime<Utc>,
}

pub struct ChatService {
    messages: Arc<dyn MessageStore>,
    offline: Arc<dyn OfflineQueue>,
    social: Arc<dyn SocialGraph>,
    limiter: Arc<RateLimiter>,
    dispatch: DispatchQueue,
    recall_window: Duration,
}

impl ChatService {
    pub fn new(
        messages: Arc<dyn MessageStore>,
        offline: Arc<dyn OfflineQueue>,
        social: Arc<dyn SocialGraph>,
        limiter: Arc<RateLimiter>,
        dispatch: DispatchQueue,
        recall_window: Duration,
    ) -> Self {
        Self {
            messages,
            offline,
            social,
            limiter,
            dispatch,
            recall_window,
        }
    }

    /// Persist and dispatch a message. `connection_key` identifies the
    /// sending connection (session id for sockets, client address for HTTP).
    pub async fn send_message(
        &self,
        sender: UserId,
        connection_key: &str,
        receiver_kind: ReceiverKind,
        receiver_id: Uuid,
        content_kind: ContentKind,
        payload: Vec<u8>,
    ) -> AppResult<SendReceipt> {
        if payload.is_empty() {
            return Err(AppError::BadRequest("payload must not be empty".into()));
        }
        self.limiter.check(Dimension::Connection, connection_key)?;
        let message = Message::new(sender, receiver_kind, receiver_id, content_kind, payload);
        self.limiter.check_room(sender, message.room())?;

        match receiver_kind {
            ReceiverKind::Direct => {
                authorize_direct(self.social.as_ref(), sender, receiver_id).await?
            }
            ReceiverKind::Group => {
                authorize_group_send(self.social.as_ref(), receiver_id, sender, message.sent_at)
                    .await?
            }
        }

        let msg_id = self.messages.append(&message).await.map_err(|e| {
            error!(sender = %sender, receiver = %receiver_id, error = %e, "message append failed");
            e
        })?;
        let receipt = SendReceipt {
            msg_id,
            sent_at: message.sent_at,
        };
        info!(
            msg_id = %msg_id,
            sender = %sender,
            receiver_kind = receiver_kind.as_str(),
            receiver_id = %receiver_id,
            content_kind = content_kind.as_str(),
            "message stored"
        );

        // The message is durable from here on; a dispatch failure only costs
        // the live push and clients re-sync by id.
        if let Err(e) = self.dispatch.submit(DispatchJob::Deliver(message)).await {
            warn!(msg_id = %msg_id, error = %e, "message stored but not dispatched");
        }
        Ok(receipt)
    }

    pub async fn recall_message(&self, msg_id: Uuid, by: UserId) -> AppResult<Message> {
        let message = self.messages.get(msg_id).await?.ok_or(AppError::NotFound)?;
        self.limiter.check_room(by, message.room())?;

        let recalled = self
            .messages
            .mark_recalled(msg_id, by, Utc::now(), self.recall_window)
            .await?;
        info!(msg_id = %msg_id, by = %by, "message recalled");
        self.dispatch
            .submit(DispatchJob::Recall {
                message: recalled.clone(),
                by,
            })
            .await?;
        Ok(recalled)
    }

    /// Mark a message read for `reader` and notify the sender the first
    /// time it happens.
    pub async fn mark_read(&self, msg_id: Uuid, reader: UserId) -> AppResult<Message> {
        let message = self.messages.get(msg_id).await?.ok_or(AppError::NotFound)?;
        if message.receiver_kind == ReceiverKind::Group
            && self
                .social
                .membership(message.receiver_id, reader)
                .await?
                .is_none()
        {
            return Err(AppError::NotAuthorized("not a group member".into()));
        }

        let mark = self.messages.mark_read(msg_id, reader).await?;
        if mark.newly_read {
            self.dispatch
                .submit(DispatchJob::Read {
                    message: mark.message.clone(),
                    reader,
                })
                .await?;
        }
        Ok(mark.message)
    }

    /// Hand back everything parked for `user`, oldest first. The queue is
    /// empty afterwards; if the messages cannot be loaded the ids are put
    /// back so nothing is lost.
    pub async fn drain_offline(&self, user: UserId) -> AppResult<Vec<Message>> {
        let ids = self.offline.drain(user).await?;
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        match self.messages.get_many(&ids).await {
            Ok(messages) => {
                info!(user_id = %user, drained = messages.len(), "offline queue drained");
                Ok(messages)
            }
            Err(e) => {
                warn!(user_id = %user, error = %e, "message load failed, restoring offline queue");
                for id in ids {
                    if let Err(requeue) = self.offline.enqueue(user, id).await {
                        error!(user_id = %user, msg_id = %id, error = %requeue, "offline requeue failed");
                    }
                }
                Err(e)
            }
        }
    }

    pub async fn unread_count(&self, user: UserId) -> AppResult<u64> {
        self.offline.count(user).await
    }
}
