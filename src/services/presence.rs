//! Presence registry: which devices of an account hold a live session, and
//! on which instance.
//!
//! At most one entry exists per `(user, device)`. Installing a new session
//! for a device swaps the entry atomically and hands the displaced session to
//! the broadcaster for eviction; the new session never waits for the old
//! socket to close. Entries expire unless refreshed by heartbeats.

use crate::error::AppResult;
use crate::metrics::SESSION_EVICTIONS_TOTAL;
use crate::models::{DeviceId, UserId};
use crate::redis_client::RedisClient;
use crate::websocket::broadcast::Broadcaster;
use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Names one live connection on one server instance.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionRef {
    pub session_id: Uuid,
    pub instance_id: String,
}

impl SessionRef {
    pub fn new(session_id: Uuid, instance_id: impl Into<String>) -> Self {
        Self {
            session_id,
            instance_id: instance_id.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshOutcome {
    Refreshed,
    /// Entry expired or was cleared; the caller may reinstall it.
    Missing,
    /// Another session owns the device now.
    Displaced,
}

#[async_trait]
pub trait PresenceStore: Send + Sync {
    /// Install `session` for the device, returning the session it replaced.
    async fn swap(
        &self,
        user: UserId,
        device: &str,
        session: &SessionRef,
        ttl: Duration,
    ) -> AppResult<Option<SessionRef>>;

    async fn refresh(
        &self,
        user: UserId,
        device: &str,
        session: &SessionRef,
        ttl: Duration,
    ) -> AppResult<RefreshOutcome>;

    /// Remove the entry only if `session` still owns it. Idempotent.
    async fn clear(&self, user: UserId, device: &str, session: &SessionRef) -> AppResult<bool>;

    /// Drop the device entry whoever owns it, returning the removed session.
    async fn remove(&self, user: UserId, device: &str) -> AppResult<Option<SessionRef>>;

    async fn devices(&self, user: UserId) -> AppResult<HashSet<DeviceId>>;
}

// ---------------------------------------------------------------------------
// In-process store
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
struct Entry {
    session: SessionRef,
    expires_at: Instant,
}

/// Single-instance store. Each account's devices live under one map shard
/// entry, so every update is atomic per user without a registry-wide lock.
#[derive(Default)]
pub struct InMemoryPresenceStore {
    users: DashMap<UserId, HashMap<DeviceId, Entry>>,
}

impl InMemoryPresenceStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl PresenceStore for InMemoryPresenceStore {
    async fn swap(
        &self,
        user: UserId,
        device: &str,
        session: &SessionRef,
        ttl: Duration,
    ) -> AppResult<Option<SessionRef>> {
        let entry = Entry {
            session: session.clone(),
            expires_at: Instant::now() + ttl,
        };
        let previous = self
            .users
            .entry(user)
            .or_default()
            .insert(device.to_string(), entry);
        Ok(previous
            .map(|e| e.session)
            .filter(|prev| prev != session))
    }

    async fn refresh(
        &self,
        user: UserId,
        device: &str,
        session: &SessionRef,
        ttl: Duration,
    ) -> AppResult<RefreshOutcome> {
        let now = Instant::now();
        let Some(mut devices) = self.users.get_mut(&user) else {
            return Ok(RefreshOutcome::Missing);
        };
        if devices.get(device).is_some_and(|e| e.expires_at <= now) {
            devices.remove(device);
            return Ok(RefreshOutcome::Missing);
        }
        match devices.get_mut(device) {
            Some(entry) if &entry.session == session => {
                entry.expires_at = now + ttl;
                Ok(RefreshOutcome::Refreshed)
            }
            Some(_) => Ok(RefreshOutcome::Displaced),
            None => Ok(RefreshOutcome::Missing),
        }
    }

    async fn clear(&self, user: UserId, device: &str, session: &SessionRef) -> AppResult<bool> {
        let mut cleared = true;
        if let Some(mut devices) = self.users.get_mut(&user) {
            match devices.get(device) {
                Some(entry) if &entry.session == session => {
                    devices.remove(device);
                }
                Some(_) => cleared = false,
                None => {}
            }
        }
        self.users.remove_if(&user, |_, devices| devices.is_empty());
        Ok(cleared)
    }

    async fn remove(&self, user: UserId, device: &str) -> AppResult<Option<SessionRef>> {
        let now = Instant::now();
        let removed = self
            .users
            .get_mut(&user)
            .and_then(|mut devices| devices.remove(device))
            .filter(|entry| entry.expires_at > now)
            .map(|entry| entry.session);
        self.users.remove_if(&user, |_, devices| devices.is_empty());
        Ok(removed)
    }

    async fn devices(&self, user: UserId) -> AppResult<HashSet<DeviceId>> {
        let now = Instant::now();
        let Some(mut devices) = self.users.get_mut(&user) else {
            return Ok(HashSet::new());
        };
        devices.retain(|_, entry| entry.expires_at > now);
        Ok(devices.keys().cloned().collect())
    }
}

// ---------------------------------------------------------------------------
// Redis store
// ---------------------------------------------------------------------------

const REFRESH_SCRIPT: &str = r#"
local current = redis.call('GET', KEYS[1])
if not current then
    return 0
end
if current ~= ARGV[1] then
    return -1
end
redis.call('EXPIRE', KEYS[1], ARGV[2])
redis.call('EXPIRE', KEYS[2], ARGV[2])
return 1
"#;

const CLEAR_SCRIPT: &str = r#"
local current = redis.call('GET', KEYS[1])
if current == ARGV[1] then
    redis.call('DEL', KEYS[1])
    redis.call('SREM', KEYS[2], ARGV[2])
    return 1
end
if not current then
    return 1
end
return 0
"#;

/// Shared store for multi-instance deployments. One key per device holds the
/// encoded [`SessionRef`]; a per-user set indexes the device ids so
/// `devices` does not need `SCAN`. Index members whose key expired are
/// pruned lazily.
pub struct RedisPresenceStore {
    redis: RedisClient,
}

impl RedisPresenceStore {
    pub fn new(redis: RedisClient) -> Self {
        Self { redis }
    }

    // Hash tag keeps a user's keys in one cluster slot for the scripts.
    fn device_key(user: UserId, device: &str) -> String {
        format!("presence:{{{user}}}:device:{device}")
    }

    fn index_key(user: UserId) -> String {
        format!("presence:{{{user}}}:devices")
    }

    fn encode(session: &SessionRef) -> String {
        format!("{}@{}", session.session_id, session.instance_id)
    }

    fn decode(raw: &str) -> Option<SessionRef> {
        let (id, instance) = raw.split_once('@')?;
        Some(SessionRef::new(Uuid::parse_str(id).ok()?, instance))
    }
}

#[async_trait]
impl PresenceStore for RedisPresenceStore {
    async fn swap(
        &self,
        user: UserId,
        device: &str,
        session: &SessionRef,
        ttl: Duration,
    ) -> AppResult<Option<SessionRef>> {
        let mut conn = self.redis.connection();
        let ttl_secs = ttl.as_secs().max(1);
        let encoded = Self::encode(session);

        let (previous,): (Option<String>,) = redis::pipe()
            .atomic()
            .cmd("SET")
            .arg(Self::device_key(user, device))
            .arg(&encoded)
            .arg("EX")
            .arg(ttl_secs)
            .arg("GET")
            .cmd("SADD")
            .arg(Self::index_key(user))
            .arg(device)
            .ignore()
            .cmd("EXPIRE")
            .arg(Self::index_key(user))
            .arg(ttl_secs)
            .ignore()
            .query_async(&mut conn)
            .await?;

        Ok(previous
            .as_deref()
            .and_then(Self::decode)
            .filter(|prev| prev != session))
    }

    async fn refresh(
        &self,
        user: UserId,
        device: &str,
        session: &SessionRef,
        ttl: Duration,
    ) -> AppResult<RefreshOutcome> {
        let mut conn = self.redis.connection();
        let result: i64 = redis::Script::new(REFRESH_SCRIPT)
            .key(Self::device_key(user, device))
            .key(Self::index_key(user))
            .arg(Self::encode(session))
            .arg(ttl.as_secs().max(1))
            .invoke_async(&mut conn)
            .await?;
        Ok(match result {
            1 => RefreshOutcome::Refreshed,
            0 => RefreshOutcome::Missing,
            _ => RefreshOutcome::Displaced,
        })
    }

    async fn clear(&self, user: UserId, device: &str, session: &SessionRef) -> AppResult<bool> {
        let mut conn = self.redis.connection();
        let cleared: i64 = redis::Script::new(CLEAR_SCRIPT)
            .key(Self::device_key(user, device))
            .key(Self::index_key(user))
            .arg(Self::encode(session))
            .arg(device)
            .invoke_async(&mut conn)
            .await?;
        Ok(cleared == 1)
    }

    async fn remove(&self, user: UserId, device: &str) -> AppResult<Option<SessionRef>> {
        let mut conn = self.redis.connection();
        let (previous,): (Option<String>,) = redis::pipe()
            .atomic()
            .cmd("GETDEL")
            .arg(Self::device_key(user, device))
            .cmd("SREM")
            .arg(Self::index_key(user))
            .arg(device)
            .ignore()
            .query_async(&mut conn)
            .await?;
        Ok(previous.as_deref().and_then(Self::decode))
    }

    async fn devices(&self, user: UserId) -> AppResult<HashSet<DeviceId>> {
        let mut conn = self.redis.connection();
        let index = Self::index_key(user);
        let members: Vec<String> = redis::cmd("SMEMBERS")
            .arg(&index)
            .query_async(&mut conn)
            .await?;
        if members.is_empty() {
            return Ok(HashSet::new());
        }

        let keys: Vec<String> = members
            .iter()
            .map(|device| Self::device_key(user, device))
            .collect();
        let values: Vec<Option<String>> = redis::cmd("MGET")
            .arg(&keys)
            .query_async(&mut conn)
            .await?;

        let mut live = HashSet::new();
        let mut stale = Vec::new();
        for (device, value) in members.into_iter().zip(values) {
            if value.is_some() {
                live.insert(device);
            } else {
                stale.push(device);
            }
        }
        if !stale.is_empty() {
            let _: i64 = redis::cmd("SREM")
                .arg(&index)
                .arg(&stale)
                .query_async(&mut conn)
                .await?;
        }
        Ok(live)
    }
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

pub struct PresenceRegistry {
    store: Arc<dyn PresenceStore>,
    broadcaster: Arc<dyn Broadcaster>,
    ttl: Duration,
}

impl PresenceRegistry {
    pub fn new(
        store: Arc<dyn PresenceStore>,
        broadcaster: Arc<dyn Broadcaster>,
        ttl: Duration,
    ) -> Self {
        Self {
            store,
            broadcaster,
            ttl,
        }
    }

    /// Make `session` the canonical session for the device. A displaced
    /// session is evicted in the background.
    pub async fn set_online(
        &self,
        user: UserId,
        device: &str,
        session: &SessionRef,
    ) -> AppResult<()> {
        let displaced = self.store.swap(user, device, session, self.ttl).await?;
        if let Some(old) = displaced {
            SESSION_EVICTIONS_TOTAL.inc();
            info!(
                user_id = %user,
                device_id = device,
                evicted_session = %old.session_id,
                evicted_instance = %old.instance_id,
                new_session = %session.session_id,
                "device reconnected, evicting previous session"
            );
            let broadcaster = self.broadcaster.clone();
            tokio::spawn(async move {
                if let Err(e) = broadcaster.evict(&old).await {
                    warn!(session_id = %old.session_id, error = %e, "eviction failed");
                }
            });
        }
        Ok(())
    }

    pub async fn refresh(
        &self,
        user: UserId,
        device: &str,
        session: &SessionRef,
    ) -> AppResult<RefreshOutcome> {
        self.store.refresh(user, device, session, self.ttl).await
    }

    pub async fn clear(&self, user: UserId, device: &str, session: &SessionRef) -> AppResult<()> {
        let cleared = self.store.clear(user, device, session).await?;
        if !cleared {
            debug!(user_id = %user, device_id = device, "presence owned by a newer session, kept");
        }
        Ok(())
    }

    /// Live devices of `user`, with store failures surfaced.
    pub async fn devices(&self, user: UserId) -> AppResult<HashSet<DeviceId>> {
        self.store.devices(user).await
    }

    /// Sign a device out at the account owner's request. Returns `false`
    /// when the device has no live session.
    pub async fn kick(&self, user: UserId, device: &str) -> AppResult<bool> {
        let Some(session) = self.store.remove(user, device).await? else {
            return Ok(false);
        };
        SESSION_EVICTIONS_TOTAL.inc();
        info!(
            user_id = %user,
            device_id = device,
            session_id = %session.session_id,
            instance_id = %session.instance_id,
            "device kicked"
        );
        self.broadcaster.evict(&session).await?;
        Ok(true)
    }

    /// Live devices of `user`. Store failures read as "offline" so callers
    /// fall through to the offline queue instead of dropping messages.
    pub async fn is_online(&self, user: UserId) -> HashSet<DeviceId> {
        match self.store.devices(user).await {
            Ok(devices) => devices,
            Err(e) => {
                warn!(user_id = %user, error = %e, "presence lookup failed, treating as offline");
                HashSet::new()
            }
        }
    }
}
