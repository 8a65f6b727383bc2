//! Read-only view of the social graph owned by another service: friendship
//! and blacklist checks, group membership and per-member mute deadlines.

use crate::error::{AppError, AppResult};
use crate::models::UserId;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use std::collections::{HashMap, HashSet};
use std::sync::RwLock;
use std::time::Duration;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DirectPermission {
    Allowed,
    NotFriend,
    Blocked,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Deserialize)]
pub struct Membership {
    #[serde(default)]
    pub muted_until: Option<DateTime<Utc>>,
}

impl Membership {
    pub fn is_muted(&self, now: DateTime<Utc>) -> bool {
        self.muted_until.is_some_and(|until| until > now)
    }
}

#[async_trait]
pub trait SocialGraph: Send + Sync {
    async fn direct_permission(&self, sender: UserId, receiver: UserId)
        -> AppResult<DirectPermission>;

    async fn group_members(&self, group: Uuid) -> AppResult<Vec<UserId>>;

    /// `None` when `user` is not a member of `group`.
    async fn membership(&self, group: Uuid, user: UserId) -> AppResult<Option<Membership>>;

    async fn groups_of(&self, user: UserId) -> AppResult<Vec<Uuid>>;
}

/// Caller-facing check shared by sends and call initiation.
pub async fn authorize_direct(
    graph: &dyn SocialGraph,
    sender: UserId,
    receiver: UserId,
) -> AppResult<()> {
    match graph.direct_permission(sender, receiver).await? {
        DirectPermission::Allowed => Ok(()),
        DirectPermission::NotFriend => Err(AppError::NotAuthorized("not a friend".into())),
        DirectPermission::Blocked => Err(AppError::NotAuthorized("blocked by receiver".into())),
    }
}

/// Membership check for group sends; a muted member is refused with the
/// deadline.
pub async fn authorize_group_send(
    graph: &dyn SocialGraph,
    group: Uuid,
    sender: UserId,
    now: DateTime<Utc>,
) -> AppResult<()> {
    let membership = graph
        .membership(group, sender)
        .await?
        .ok_or_else(|| AppError::NotAuthorized("not a group member".into()))?;
    match membership.muted_until {
        Some(until) if membership.is_muted(now) => Err(AppError::Muted { until }),
        _ => Ok(()),
    }
}

#[derive(Default)]
struct Graph {
    friends: HashSet<(UserId, UserId)>,
    // (blocker, blocked)
    blocked: HashSet<(UserId, UserId)>,
    groups: HashMap<Uuid, HashMap<UserId, Membership>>,
}

/// In-process graph for single-node development and tests.
#[derive(Default)]
pub struct InMemorySocialGraph {
    inner: RwLock<Graph>,
}

impl InMemorySocialGraph {
    pub fn new() -> Self {
        Self::default()
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, Graph> {
        self.inner.write().unwrap_or_else(|e| e.into_inner())
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, Graph> {
        self.inner.read().unwrap_or_else(|e| e.into_inner())
    }

    pub fn add_friends(&self, a: UserId, b: UserId) {
        let mut g = self.write();
        g.friends.insert((a, b));
        g.friends.insert((b, a));
    }

    pub fn block(&self, blocker: UserId, blocked: UserId) {
        self.write().blocked.insert((blocker, blocked));
    }

    pub fn add_member(&self, group: Uuid, user: UserId) {
        self.write()
            .groups
            .entry(group)
            .or_default()
            .insert(user, Membership::default());
    }

    pub fn remove_member(&self, group: Uuid, user: UserId) {
        if let Some(members) = self.write().groups.get_mut(&group) {
            members.remove(&user);
        }
    }

    pub fn mute(&self, group: Uuid, user: UserId, until: DateTime<Utc>) {
        if let Some(member) = self
            .write()
            .groups
            .get_mut(&group)
            .and_then(|m| m.get_mut(&user))
        {
            member.muted_until = Some(until);
        }
    }
}

#[async_trait]
impl SocialGraph for InMemorySocialGraph {
    async fn direct_permission(
        &self,
        sender: UserId,
        receiver: UserId,
    ) -> AppResult<DirectPermission> {
        let g = self.read();
        if g.blocked.contains(&(receiver, sender)) {
            return Ok(DirectPermission::Blocked);
        }
        if g.friends.contains(&(sender, receiver)) {
            Ok(DirectPermission::Allowed)
        } else {
            Ok(DirectPermission::NotFriend)
        }
    }

    async fn group_members(&self, group: Uuid) -> AppResult<Vec<UserId>> {
        Ok(self
            .read()
            .groups
            .get(&group)
            .map(|m| m.keys().copied().collect())
            .unwrap_or_default())
    }

    async fn membership(&self, group: Uuid, user: UserId) -> AppResult<Option<Membership>> {
        Ok(self
            .read()
            .groups
            .get(&group)
            .and_then(|m| m.get(&user).cloned()))
    }

    async fn groups_of(&self, user: UserId) -> AppResult<Vec<Uuid>> {
        Ok(self
            .read()
            .groups
            .iter()
            .filter(|(_, members)| members.contains_key(&user))
            .map(|(group, _)| *group)
            .collect())
    }
}

#[derive(Deserialize)]
struct PermissionResponse {
    status: DirectPermission,
}

#[derive(Deserialize)]
struct MembersResponse {
    members: Vec<UserId>,
}

#[derive(Deserialize)]
struct GroupsResponse {
    groups: Vec<Uuid>,
}

/// JSON client for the social-graph service.
///
/// - `GET {base}/relations/{sender}/{receiver}` -> `{"status": "allowed" | "not_friend" | "blocked"}`
/// - `GET {base}/groups/{group}/members` -> `{"members": [..]}`
/// - `GET {base}/groups/{group}/members/{user}` -> `{"muted_until": ..}` or 404
/// - `GET {base}/users/{user}/groups` -> `{"groups": [..]}`
pub struct HttpSocialGraph {
    client: reqwest::Client,
    base_url: String,
}

impl HttpSocialGraph {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> AppResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| AppError::Config(format!("social graph client: {e}")))?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    async fn get_json<T: serde::de::DeserializeOwned>(&self, path: &str) -> AppResult<Option<T>> {
        let url = format!("{}{}", self.base_url, path);
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| AppError::StoreUnavailable(format!("social graph: {e}")))?;
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let response = response
            .error_for_status()
            .map_err(|e| AppError::StoreUnavailable(format!("social graph: {e}")))?;
        let body = response
            .json::<T>()
            .await
            .map_err(|e| AppError::StoreUnavailable(format!("social graph body: {e}")))?;
        Ok(Some(body))
    }
}

#[async_trait]
impl SocialGraph for HttpSocialGraph {
    async fn direct_permission(
        &self,
        sender: UserId,
        receiver: UserId,
    ) -> AppResult<DirectPermission> {
        let resp: Option<PermissionResponse> = self
            .get_json(&format!("/relations/{sender}/{receiver}"))
            .await?;
        Ok(resp
            .map(|r| r.status)
            .unwrap_or(DirectPermission::NotFriend))
    }

    async fn group_members(&self, group: Uuid) -> AppResult<Vec<UserId>> {
        let resp: Option<MembersResponse> =
            self.get_json(&format!("/groups/{group}/members")).await?;
        Ok(resp.map(|r| r.members).unwrap_or_default())
    }

    async fn membership(&self, group: Uuid, user: UserId) -> AppResult<Option<Membership>> {
        self.get_json(&format!("/groups/{group}/members/{user}"))
            .await
    }

    async fn groups_of(&self, user: UserId) -> AppResult<Vec<Uuid>> {
        let resp: Option<GroupsResponse> = self.get_json(&format!("/users/{user}/groups")).await?;
        Ok(resp.map(|r| r.groups).unwrap_or_default())
    }
}
