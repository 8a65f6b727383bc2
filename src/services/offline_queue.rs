//! Per-account backlog of message ids that could not be delivered live.
//!
//! One entry per offline *account* (not per device), deduplicated on
//! `(user, msg_id)`. `drain` hands back ids in enqueue order and empties the
//! queue; `count` is a cheap counter for unread badges.

use crate::error::AppResult;
use crate::models::UserId;
use crate::redis_client::RedisClient;
use async_trait::async_trait;
use dashmap::DashMap;
use std::collections::HashSet;
use uuid::Uuid;

#[async_trait]
pub trait OfflineQueue: Send + Sync {
    /// Returns `false` when the pair was already queued.
    async fn enqueue(&self, user: UserId, msg_id: Uuid) -> AppResult<bool>;

    async fn drain(&self, user: UserId) -> AppResult<Vec<Uuid>>;

    async fn count(&self, user: UserId) -> AppResult<u64>;
}

#[derive(Default)]
struct UserQueue {
    entries: Vec<Uuid>,
    queued: HashSet<Uuid>,
}

#[derive(Default)]
pub struct InMemoryOfflineQueue {
    users: DashMap<UserId, UserQueue>,
}

impl InMemoryOfflineQueue {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl OfflineQueue for InMemoryOfflineQueue {
    async fn enqueue(&self, user: UserId, msg_id: Uuid) -> AppResult<bool> {
        let mut queue = self.users.entry(user).or_default();
        if !queue.queued.insert(msg_id) {
            return Ok(false);
        }
        queue.entries.push(msg_id);
        Ok(true)
    }

    async fn drain(&self, user: UserId) -> AppResult<Vec<Uuid>> {
        let Some((_, queue)) = self.users.remove(&user) else {
            return Ok(Vec::new());
        };
        Ok(queue.entries)
    }

    async fn count(&self, user: UserId) -> AppResult<u64> {
        Ok(self
            .users
            .get(&user)
            .map(|q| q.entries.len() as u64)
            .unwrap_or(0))
    }
}

const ENQUEUE_SCRIPT: &str = r#"
if redis.call('SADD', KEYS[2], ARGV[1]) == 0 then
    return 0
end
redis.call('RPUSH', KEYS[1], ARGV[1])
redis.call('INCR', KEYS[3])
redis.call('EXPIRE', KEYS[1], ARGV[2])
redis.call('EXPIRE', KEYS[2], ARGV[2])
redis.call('EXPIRE', KEYS[3], ARGV[2])
return 1
"#;

const DRAIN_SCRIPT: &str = r#"
local ids = redis.call('LRANGE', KEYS[1], 0, -1)
redis.call('DEL', KEYS[1], KEYS[2], KEYS[3])
return ids
"#;

/// Redis-backed queue: a list for order, a set for dedupe and a counter for
/// badges, all under one hash tag and updated by scripts so they never
/// disagree.
pub struct RedisOfflineQueue {
    redis: RedisClient,
    ttl_secs: u64,
}

impl RedisOfflineQueue {
    pub fn new(redis: RedisClient, ttl_secs: u64) -> Self {
        Self {
            redis,
            ttl_secs: ttl_secs.max(1),
        }
    }

    fn keys(user: UserId) -> [String; 3] {
        [
            format!("offline:{{{user}}}:queue"),
            format!("offline:{{{user}}}:queued"),
            format!("offline_msg_count:{{{user}}}"),
        ]
    }
}

#[async_trait]
impl OfflineQueue for RedisOfflineQueue {
    async fn enqueue(&self, user: UserId, msg_id: Uuid) -> AppResult<bool> {
        let mut conn = self.redis.connection();
        let [queue, queued, counter] = Self::keys(user);
        let added: i64 = redis::Script::new(ENQUEUE_SCRIPT)
            .key(queue)
            .key(queued)
            .key(counter)
            .arg(msg_id.to_string())
            .arg(self.ttl_secs)
            .invoke_async(&mut conn)
            .await?;
        Ok(added == 1)
    }

    async fn drain(&self, user: UserId) -> AppResult<Vec<Uuid>> {
        let mut conn = self.redis.connection();
        let [queue, queued, counter] = Self::keys(user);
        let raw: Vec<String> = redis::Script::new(DRAIN_SCRIPT)
            .key(queue)
            .key(queued)
            .key(counter)
            .invoke_async(&mut conn)
            .await?;
        Ok(raw
            .iter()
            .filter_map(|id| match Uuid::parse_str(id) {
                Ok(id) => Some(id),
                Err(_) => {
                    tracing::warn!(user_id = %user, entry = %id, "skipping malformed offline entry");
                    None
                }
            })
            .collect())
    }

    async fn count(&self, user: UserId) -> AppResult<u64> {
        let mut conn = self.redis.connection();
        let [_, _, counter] = Self::keys(user);
        let count: Option<u64> = redis::cmd("GET")
            .arg(counter)
            .query_async(&mut conn)
            .await?;
        Ok(count.unwrap_or(0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn drain_is_fifo_and_empties_queue() {
        let queue = InMemoryOfflineQueue::new();
        let user = Uuid::new_v4();
        let ids: Vec<Uuid> = (0..3).map(|_| Uuid::new_v4()).collect();
        for id in &ids {
            assert!(queue.enqueue(user, *id).await.unwrap());
        }
        assert_eq!(queue.count(user).await.unwrap(), 3);

        assert_eq!(queue.drain(user).await.unwrap(), ids);
        assert_eq!(queue.count(user).await.unwrap(), 0);
        assert!(queue.drain(user).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn duplicate_enqueue_is_ignored() {
        let queue = InMemoryOfflineQueue::new();
        let user = Uuid::new_v4();
        let msg = Uuid::new_v4();

        assert!(queue.enqueue(user, msg).await.unwrap());
        assert!(!queue.enqueue(user, msg).await.unwrap());
        assert_eq!(queue.count(user).await.unwrap(), 1);
        assert_eq!(queue.drain(user).await.unwrap(), vec![msg]);
    }

    #[tokio::test]
    async fn queues_are_per_user() {
        let queue = InMemoryOfflineQueue::new();
        let (alice, bob) = (Uuid::new_v4(), Uuid::new_v4());
        let msg = Uuid::new_v4();
        queue.enqueue(alice, msg).await.unwrap();
        queue.enqueue(bob, msg).await.unwrap();

        assert_eq!(queue.drain(alice).await.unwrap(), vec![msg]);
        assert_eq!(queue.count(bob).await.unwrap(), 1);
    }

    #[test]
    fn redis_keys_share_a_hash_tag() {
        let user = Uuid::new_v4();
        let tag = format!("{{{user}}}");
        assert!(RedisOfflineQueue::keys(user).iter().all(|k| k.contains(&tag)));
    }
}
