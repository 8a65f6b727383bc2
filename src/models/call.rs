use crate::error::{AppError, AppResult};
use crate::models::{ReceiverKind, RoomId, UserId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallKind {
    Voice,
    Video,
}

impl CallKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            CallKind::Voice => "voice",
            CallKind::Video => "video",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallStatus {
    Ringing,
    Active,
    Rejected,
    Ended,
    Missed,
}

impl CallStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CallStatus::Ringing => "ringing",
            CallStatus::Active => "active",
            CallStatus::Rejected => "rejected",
            CallStatus::Ended => "ended",
            CallStatus::Missed => "missed",
        }
    }
}

impl fmt::Display for CallStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Client-driven transitions on an existing call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallEvent {
    Accept,
    Reject,
    End,
}

impl fmt::Display for CallEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            CallEvent::Accept => "accept",
            CallEvent::Reject => "reject",
            CallEvent::End => "end",
        })
    }
}

/// Action tag carried by `call` push events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallAction {
    Incoming,
    Accepted,
    Rejected,
    Ended,
    Missed,
}

/// What `end` does to a call nobody has answered yet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EndWhileRinging {
    /// Caller cancel: the call becomes `missed`.
    #[default]
    MarkMissed,
    /// `end` is only legal on an active call.
    Refuse,
}

impl FromStr for EndWhileRinging {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "missed" => Ok(EndWhileRinging::MarkMissed),
            "reject" | "refuse" => Ok(EndWhileRinging::Refuse),
            other => Err(format!("unknown end-while-ringing policy: {other}")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Call {
    pub id: Uuid,
    pub initiator_id: UserId,
    pub receiver_kind: ReceiverKind,
    pub receiver_id: Uuid,
    pub kind: CallKind,
    pub status: CallStatus,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub duration_secs: i64,
}

impl Call {
    /// A freshly initiated call, ringing.
    pub fn ring(
        initiator_id: UserId,
        receiver_kind: ReceiverKind,
        receiver_id: Uuid,
        kind: CallKind,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            initiator_id,
            receiver_kind,
            receiver_id,
            kind,
            status: CallStatus::Ringing,
            created_at: now,
            started_at: None,
            ended_at: None,
            duration_secs: 0,
        }
    }

    pub fn room(&self) -> RoomId {
        RoomId::for_target(self.receiver_kind, self.receiver_id)
    }

    /// Apply `event` and return the resulting call together with the action
    /// to announce. Illegal transitions leave `self` untouched.
    pub fn transition(
        &self,
        event: CallEvent,
        now: DateTime<Utc>,
        policy: EndWhileRinging,
    ) -> AppResult<(Call, CallAction)> {
        let mut next = self.clone();
        let action = match (self.status, event) {
            (CallStatus::Ringing, CallEvent::Accept) => {
                next.status = CallStatus::Active;
                next.started_at = Some(now);
                CallAction::Accepted
            }
            (CallStatus::Ringing, CallEvent::Reject) => {
                next.status = CallStatus::Rejected;
                next.ended_at = Some(now);
                next.duration_secs = 0;
                CallAction::Rejected
            }
            (CallStatus::Active, CallEvent::End) => {
                let started = self.started_at.unwrap_or(self.created_at);
                next.status = CallStatus::Ended;
                next.ended_at = Some(now);
                next.duration_secs = (now - started).num_seconds().max(0);
                CallAction::Ended
            }
            (CallStatus::Ringing, CallEvent::End) if policy == EndWhileRinging::MarkMissed => {
                next.status = CallStatus::Missed;
                next.ended_at = Some(now);
                next.duration_secs = 0;
                CallAction::Missed
            }
            (status, event) => return Err(AppError::InvalidCallState { status, event }),
        };
        Ok((next, action))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn ringing() -> Call {
        Call::ring(
            Uuid::new_v4(),
            ReceiverKind::Direct,
            Uuid::new_v4(),
            CallKind::Voice,
            Utc::now(),
        )
    }

    #[test]
    fn reject_has_zero_duration() {
        let call = ringing();
        let (next, action) = call
            .transition(CallEvent::Reject, Utc::now(), EndWhileRinging::MarkMissed)
            .unwrap();
        assert_eq!(next.status, CallStatus::Rejected);
        assert_eq!(next.duration_secs, 0);
        assert!(next.ended_at.is_some());
        assert_eq!(action, CallAction::Rejected);
    }

    #[test]
    fn accept_then_end_measures_duration() {
        let call = ringing();
        let start = Utc::now();
        let (active, _) = call
            .transition(CallEvent::Accept, start, EndWhileRinging::MarkMissed)
            .unwrap();
        assert_eq!(active.started_at, Some(start));

        let end = start + Duration::seconds(42);
        let (ended, action) = active
            .transition(CallEvent::End, end, EndWhileRinging::MarkMissed)
            .unwrap();
        assert_eq!(ended.status, CallStatus::Ended);
        assert_eq!(ended.duration_secs, 42);
        assert_eq!(action, CallAction::Ended);
    }

    #[test]
    fn end_while_ringing_follows_policy() {
        let call = ringing();
        let (missed, action) = call
            .transition(CallEvent::End, Utc::now(), EndWhileRinging::MarkMissed)
            .unwrap();
        assert_eq!(missed.status, CallStatus::Missed);
        assert_eq!(action, CallAction::Missed);

        let err = call
            .transition(CallEvent::End, Utc::now(), EndWhileRinging::Refuse)
            .unwrap_err();
        assert!(matches!(
            err,
            AppError::InvalidCallState {
                status: CallStatus::Ringing,
                event: CallEvent::End
            }
        ));
    }

    #[test]
    fn terminal_states_reject_every_event() {
        let (rejected, _) = ringing()
            .transition(CallEvent::Reject, Utc::now(), EndWhileRinging::MarkMissed)
            .unwrap();
        for event in [CallEvent::Accept, CallEvent::Reject, CallEvent::End] {
            assert!(rejected
                .transition(event, Utc::now(), EndWhileRinging::MarkMissed)
                .is_err());
        }
    }

    #[test]
    fn active_call_cannot_be_accepted_again() {
        let (active, _) = ringing()
            .transition(CallEvent::Accept, Utc::now(), EndWhileRinging::MarkMissed)
            .unwrap();
        assert!(active
            .transition(CallEvent::Accept, Utc::now(), EndWhileRinging::MarkMissed)
            .is_err());
        assert!(active
            .transition(CallEvent::Reject, Utc::now(), EndWhileRinging::MarkMissed)
            .is_err());
    }

    #[test]
    fn policy_parses_from_config_values() {
        assert_eq!(
            "missed".parse::<EndWhileRinging>().unwrap(),
            EndWhileRinging::MarkMissed
        );
        assert_eq!(
            "REJECT".parse::<EndWhileRinging>().unwrap(),
            EndWhileRinging::Refuse
        );
        assert!("hangup".parse::<EndWhileRinging>().is_err());
    }
}
