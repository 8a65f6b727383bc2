//! Call signaling: lifecycle per call id, authorization of each transition
//! and fan-out of the resulting events.

use crate::error::{AppError, AppResult};
use crate::models::{
    Call, CallAction, CallEvent, CallKind, CallStatus, EndWhileRinging, ReceiverKind, RoomId,
    UserId,
};
use crate::redis_client::RedisClient;
use crate::services::dispatcher::{DispatchJob, DispatchQueue};
use crate::services::rate_limiter::RateLimiter;
use crate::services::social_graph::{authorize_direct, authorize_group_send, SocialGraph};
use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

#[async_trait]
pub trait CallStore: Send + Sync {
    async fn create(&self, call: &Call) -> AppResult<()>;

    async fn get(&self, id: Uuid) -> AppResult<Option<Call>>;

    /// Replace the stored call with `next` only if its status is still
    /// `expected`. Returns `false` when another transition won the race.
    async fn compare_and_swap(&self, expected: CallStatus, next: &Call) -> AppResult<bool>;
}

#[derive(Default)]
pub struct InMemoryCallStore {
    calls: DashMap<Uuid, Call>,
}

impl InMemoryCallStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CallStore for InMemoryCallStore {
    async fn create(&self, call: &Call) -> AppResult<()> {
        self.calls.insert(call.id, call.clone());
        Ok(())
    }

    async fn get(&self, id: Uuid) -> AppResult<Option<Call>> {
        Ok(self.calls.get(&id).map(|c| c.clone()))
    }

    async fn compare_and_swap(&self, expected: CallStatus, next: &Call) -> AppResult<bool> {
        let Some(mut current) = self.calls.get_mut(&next.id) else {
            return Ok(false);
        };
        if current.status != expected {
            return Ok(false);
        }
        *current = next.clone();
        Ok(true)
    }
}

const CALL_TTL_SECS: u64 = 86_400;

const CAS_SCRIPT: &str = r#"
local current = redis.call('GET', KEYS[1])
if not current then
    return 0
end
if cjson.decode(current).status ~= ARGV[1] then
    return 0
end
redis.call('SET', KEYS[1], ARGV[2], 'EX', ARGV[3])
return 1
"#;

/// Calls as JSON values under `call:<id>`, expiring a day after the last
/// transition.
pub struct RedisCallStore {
    redis: RedisClient,
}

impl RedisCallStore {
    pub fn new(redis: RedisClient) -> Self {
        Self { redis }
    }

    fn key(id: Uuid) -> String {
        format!("call:{id}")
    }

    fn encode(call: &Call) -> AppResult<String> {
        serde_json::to_string(call).map_err(|e| {
            tracing::error!(call_id = %call.id, error = %e, "failed to encode call");
            AppError::Internal
        })
    }
}

#[async_trait]
impl CallStore for RedisCallStore {
    async fn create(&self, call: &Call) -> AppResult<()> {
        let mut conn = self.redis.connection();
        let _: () = redis::cmd("SET")
            .arg(Self::key(call.id))
            .arg(Self::encode(call)?)
            .arg("EX")
            .arg(CALL_TTL_SECS)
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn get(&self, id: Uuid) -> AppResult<Option<Call>> {
        let mut conn = self.redis.connection();
        let raw: Option<String> = redis::cmd("GET")
            .arg(Self::key(id))
            .query_async(&mut conn)
            .await?;
        raw.map(|raw| {
            serde_json::from_str(&raw)
                .map_err(|e| AppError::StoreUnavailable(format!("corrupt call {id}: {e}")))
        })
        .transpose()
    }

    async fn compare_and_swap(&self, expected: CallStatus, next: &Call) -> AppResult<bool> {
        let mut conn = self.redis.connection();
        let swapped: i64 = redis::Script::new(CAS_SCRIPT)
            .key(Self::key(next.id))
            .arg(expected.as_str())
            .arg(Self::encode(next)?)
            .arg(CALL_TTL_SECS)
            .invoke_async(&mut conn)
            .await?;
        Ok(swapped == 1)
    }
}

pub struct CallService {
    store: Arc<dyn CallStore>,
    social: Arc<dyn SocialGraph>,
    limiter: Arc<RateLimiter>,
    dispatch: DispatchQueue,
    end_while_ringing: EndWhileRinging,
}

impl CallService {
    pub fn new(
        store: Arc<dyn CallStore>,
        social: Arc<dyn SocialGraph>,
        limiter: Arc<RateLimiter>,
        dispatch: DispatchQueue,
        end_while_ringing: EndWhileRinging,
    ) -> Self {
        Self {
            store,
            social,
            limiter,
            dispatch,
            end_while_ringing,
        }
    }

    /// Start ringing a user or a group. The caller needs the same standing
    /// a message send would need.
    pub async fn initiate(
        &self,
        initiator: UserId,
        receiver_kind: ReceiverKind,
        receiver_id: Uuid,
        kind: CallKind,
    ) -> AppResult<Call> {
        let room = RoomId::for_target(receiver_kind, receiver_id);
        self.limiter.check_room(initiator, room)?;

        let now = Utc::now();
        match receiver_kind {
            ReceiverKind::Direct => {
                if receiver_id == initiator {
                    return Err(AppError::BadRequest("cannot call yourself".into()));
                }
                authorize_direct(self.social.as_ref(), initiator, receiver_id).await?
            }
            ReceiverKind::Group => {
                authorize_group_send(self.social.as_ref(), receiver_id, initiator, now).await?
            }
        }

        let call = Call::ring(initiator, receiver_kind, receiver_id, kind, now);
        self.store.create(&call).await?;
        info!(
            call_id = %call.id,
            initiator = %initiator,
            room = %room,
            kind = kind.as_str(),
            "call initiated"
        );
        self.dispatch
            .submit(DispatchJob::Call {
                call: call.clone(),
                action: CallAction::Incoming,
            })
            .await?;
        Ok(call)
    }

    pub async fn get(&self, call_id: Uuid, viewer: UserId) -> AppResult<Call> {
        let call = self.store.get(call_id).await?.ok_or(AppError::NotFound)?;
        if call.initiator_id != viewer && !self.is_recipient(&call, viewer).await? {
            return Err(AppError::Forbidden);
        }
        Ok(call)
    }

    /// Apply `event` on behalf of `actor`. Accept and reject belong to the
    /// recipients; either side may end.
    pub async fn transition(
        &self,
        call_id: Uuid,
        actor: UserId,
        event: CallEvent,
    ) -> AppResult<Call> {
        let call = self.store.get(call_id).await?.ok_or(AppError::NotFound)?;

        let is_initiator = call.initiator_id == actor;
        let allowed = match event {
            CallEvent::Accept | CallEvent::Reject => {
                !is_initiator && self.is_recipient(&call, actor).await?
            }
            CallEvent::End => is_initiator || self.is_recipient(&call, actor).await?,
        };
        if !allowed {
            return Err(AppError::Forbidden);
        }

        let (next, action) = call.transition(event, Utc::now(), self.end_while_ringing)?;
        if !self.store.compare_and_swap(call.status, &next).await? {
            // Lost a race with another transition; report what it left behind.
            let status = self
                .store
                .get(call_id)
                .await?
                .map(|c| c.status)
                .unwrap_or(call.status);
            return Err(AppError::InvalidCallState { status, event });
        }

        info!(
            call_id = %call_id,
            actor = %actor,
            event = %event,
            from = %call.status,
            to = %next.status,
            duration_secs = next.duration_secs,
            "call transition"
        );
        self.dispatch
            .submit(DispatchJob::Call {
                call: next.clone(),
                action,
            })
            .await?;
        Ok(next)
    }

    async fn is_recipient(&self, call: &Call, user: UserId) -> AppResult<bool> {
        match call.receiver_kind {
            ReceiverKind::Direct => Ok(call.receiver_id == user),
            ReceiverKind::Group => Ok(self
                .social
                .membership(call.receiver_id, user)
                .await?
                .is_some()),
        }
    }
}
