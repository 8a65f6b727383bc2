//! Durable message log. A message counts as sent once `append` succeeds;
//! fan-out is layered on top and never the source of truth.

use crate::error::{AppError, AppResult};
use crate::models::{ContentKind, Message, ReceiverKind, UserId};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use deadpool_postgres::Pool;
use std::collections::HashMap;
use tokio_postgres::Row;
use uuid::Uuid;

/// Result of a read mark: the message and whether this call flipped the flag.
#[derive(Debug, Clone)]
pub struct ReadMark {
    pub message: Message,
    pub newly_read: bool,
}

#[async_trait]
pub trait MessageStore: Send + Sync {
    async fn append(&self, message: &Message) -> AppResult<Uuid>;

    async fn get(&self, id: Uuid) -> AppResult<Option<Message>>;

    /// Messages for `ids` in request order; unknown ids are skipped.
    async fn get_many(&self, ids: &[Uuid]) -> AppResult<Vec<Message>>;

    /// Flip `recalled` if `by` sent the message and it is still inside
    /// `window` (inclusive) at `now`.
    async fn mark_recalled(
        &self,
        id: Uuid,
        by: UserId,
        now: DateTime<Utc>,
        window: Duration,
    ) -> AppResult<Message>;

    /// Direct messages may only be marked by their receiver; membership for
    /// group messages is checked by the caller. Read state is per account.
    async fn mark_read(&self, id: Uuid, reader: UserId) -> AppResult<ReadMark>;

    /// Delete messages sent strictly before `cutoff`. Returns the number
    /// removed.
    async fn purge_sent_before(&self, cutoff: DateTime<Utc>) -> AppResult<u64>;
}

/// Classify a refused recall. Check order: owner, already recalled, window.
fn recall_error(message: &Message, by: UserId, now: DateTime<Utc>, window: Duration) -> AppError {
    if message.sender_id != by {
        AppError::NotOwner
    } else if message.recalled {
        AppError::AlreadyRecalled
    } else if !message.within_recall_window(now, window) {
        AppError::RecallWindowExpired {
            sent_at: message.sent_at,
            window_secs: window.num_seconds(),
        }
    } else {
        AppError::Internal
    }
}

fn may_mark_read(message: &Message, reader: UserId) -> bool {
    match message.receiver_kind {
        ReceiverKind::Direct => message.receiver_id == reader,
        ReceiverKind::Group => true,
    }
}

#[derive(Default)]
pub struct InMemoryMessageStore {
    messages: DashMap<Uuid, Message>,
}

impl InMemoryMessageStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl MessageStore for InMemoryMessageStore {
    async fn append(&self, message: &Message) -> AppResult<Uuid> {
        self.messages.insert(message.id, message.clone());
        Ok(message.id)
    }

    async fn get(&self, id: Uuid) -> AppResult<Option<Message>> {
        Ok(self.messages.get(&id).map(|m| m.clone()))
    }

    async fn get_many(&self, ids: &[Uuid]) -> AppResult<Vec<Message>> {
        Ok(ids
            .iter()
            .filter_map(|id| self.messages.get(id).map(|m| m.clone()))
            .collect())
    }

    async fn mark_recalled(
        &self,
        id: Uuid,
        by: UserId,
        now: DateTime<Utc>,
        window: Duration,
    ) -> AppResult<Message> {
        let mut message = self.messages.get_mut(&id).ok_or(AppError::NotFound)?;
        if message.sender_id != by || message.recalled || !message.within_recall_window(now, window)
        {
            return Err(recall_error(&message, by, now, window));
        }
        message.recalled = true;
        Ok(message.clone())
    }

    async fn mark_read(&self, id: Uuid, reader: UserId) -> AppResult<ReadMark> {
        let mut message = self.messages.get_mut(&id).ok_or(AppError::NotFound)?;
        if !may_mark_read(&message, reader) {
            return Err(AppError::Forbidden);
        }
        let newly_read = !message.read_by_recipient;
        message.read_by_recipient = true;
        Ok(ReadMark {
            message: message.clone(),
            newly_read,
        })
    }

    async fn purge_sent_before(&self, cutoff: DateTime<Utc>) -> AppResult<u64> {
        let before = self.messages.len();
        self.messages.retain(|_, message| message.sent_at >= cutoff);
        Ok(before.saturating_sub(self.messages.len()) as u64)
    }
}

const COLUMNS: &str = "id, sender_id, receiver_kind, receiver_id, content_kind, payload, \
                       sent_at, recalled, read_by_recipient";

pub struct PgMessageStore {
    db: Pool,
}

impl PgMessageStore {
    pub fn new(db: Pool) -> Self {
        Self { db }
    }

    fn from_row(row: &Row) -> AppResult<Message> {
        let receiver_kind: String = row.get("receiver_kind");
        let content_kind: String = row.get("content_kind");
        Ok(Message {
            id: row.get("id"),
            sender_id: row.get("sender_id"),
            receiver_kind: ReceiverKind::from_db(&receiver_kind).ok_or_else(|| {
                AppError::StoreUnavailable(format!("unknown receiver_kind {receiver_kind}"))
            })?,
            receiver_id: row.get("receiver_id"),
            content_kind: ContentKind::from_db(&content_kind).ok_or_else(|| {
                AppError::StoreUnavailable(format!("unknown content_kind {content_kind}"))
            })?,
            payload: row.get("payload"),
            sent_at: row.get("sent_at"),
            recalled: row.get("recalled"),
            read_by_recipient: row.get("read_by_recipient"),
        })
    }
}

#[async_trait]
impl MessageStore for PgMessageStore {
    async fn append(&self, message: &Message) -> AppResult<Uuid> {
        let client = self.db.get().await?;
        client
            .execute(
                r#"
                INSERT INTO messages
                    (id, sender_id, receiver_kind, receiver_id, content_kind, payload, sent_at)
                VALUES ($1, $2, $3, $4, $5, $6, $7)
                "#,
                &[
                    &message.id,
                    &message.sender_id,
                    &message.receiver_kind.as_str(),
                    &message.receiver_id,
                    &message.content_kind.as_str(),
                    &message.payload,
                    &message.sent_at,
                ],
            )
            .await?;
        Ok(message.id)
    }

    async fn get(&self, id: Uuid) -> AppResult<Option<Message>> {
        let client = self.db.get().await?;
        let row = client
            .query_opt(
                &format!("SELECT {COLUMNS} FROM messages WHERE id = $1"),
                &[&id],
            )
            .await?;
        row.as_ref().map(Self::from_row).transpose()
    }

    async fn get_many(&self, ids: &[Uuid]) -> AppResult<Vec<Message>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let client = self.db.get().await?;
        let rows = client
            .query(
                &format!("SELECT {COLUMNS} FROM messages WHERE id = ANY($1)"),
                &[&ids],
            )
            .await?;

        let mut by_id = HashMap::with_capacity(rows.len());
        for row in &rows {
            let message = Self::from_row(row)?;
            by_id.insert(message.id, message);
        }
        Ok(ids.iter().filter_map(|id| by_id.remove(id)).collect())
    }

    async fn mark_recalled(
        &self,
        id: Uuid,
        by: UserId,
        now: DateTime<Utc>,
        window: Duration,
    ) -> AppResult<Message> {
        let client = self.db.get().await?;
        let earliest = now - window;
        let updated = client
            .query_opt(
                &format!(
                    "UPDATE messages SET recalled = TRUE \
                     WHERE id = $1 AND sender_id = $2 AND recalled = FALSE AND sent_at >= $3 \
                     RETURNING {COLUMNS}"
                ),
                &[&id, &by, &earliest],
            )
            .await?;
        if let Some(row) = updated {
            return Self::from_row(&row);
        }

        // Nothing changed; read the row back to say why.
        let current = client
            .query_opt(
                &format!("SELECT {COLUMNS} FROM messages WHERE id = $1"),
                &[&id],
            )
            .await?
            .ok_or(AppError::NotFound)?;
        Err(recall_error(&Self::from_row(&current)?, by, now, window))
    }

    async fn mark_read(&self, id: Uuid, reader: UserId) -> AppResult<ReadMark> {
        let client = self.db.get().await?;
        let current = client
            .query_opt(
                &format!("SELECT {COLUMNS} FROM messages WHERE id = $1"),
                &[&id],
            )
            .await?
            .ok_or(AppError::NotFound)?;
        let mut message = Self::from_row(&current)?;
        if !may_mark_read(&message, reader) {
            return Err(AppError::Forbidden);
        }

        let flipped = client
            .execute(
                "UPDATE messages SET read_by_recipient = TRUE \
                 WHERE id = $1 AND read_by_recipient = FALSE",
                &[&id],
            )
            .await?;
        message.read_by_recipient = true;
        Ok(ReadMark {
            message,
            newly_read: flipped == 1,
        })
    }

    async fn purge_sent_before(&self, cutoff: DateTime<Utc>) -> AppResult<u64> {
        let client = self.db.get().await?;
        let deleted = client
            .execute("DELETE FROM messages WHERE sent_at < $1", &[&cutoff])
            .await?;
        Ok(deleted)
    }
}
