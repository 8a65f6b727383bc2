//! Call lifecycle through the service: authorization, transitions and the
//! events each side sees.

use chat_fanout_service::error::AppError;
use chat_fanout_service::models::{CallEvent, CallKind, CallStatus, ReceiverKind};
use uuid::Uuid;

mod test_harness;
use test_harness::{next_event, TestEnvironment};

fn friends(env: &TestEnvironment) -> (Uuid, Uuid) {
    let (caller, callee) = (Uuid::new_v4(), Uuid::new_v4());
    env.social.add_friends(caller, callee);
    (caller, callee)
}

#[tokio::test]
async fn callee_is_rung_and_accept_then_end_records_duration() {
    let env = TestEnvironment::new();
    let (caller, callee) = friends(&env);
    let (_callee_session, mut callee_rx) = env.connect(callee, "phone").await;
    let (_caller_session, mut caller_rx) = env.connect(caller, "phone").await;

    let call = env
        .state
        .calls
        .initiate(caller, ReceiverKind::Direct, callee, CallKind::Video)
        .await
        .unwrap();
    assert_eq!(call.status, CallStatus::Ringing);

    let ring = next_event(&mut callee_rx).await;
    assert_eq!(ring["type"], "call");
    assert_eq!(ring["action"], "incoming");
    assert_eq!(ring["call"]["id"], call.id.to_string());
    assert_eq!(ring["call"]["kind"], "video");
    assert_eq!(next_event(&mut caller_rx).await["action"], "incoming");

    let active = env
        .state
        .calls
        .transition(call.id, callee, CallEvent::Accept)
        .await
        .unwrap();
    assert_eq!(active.status, CallStatus::Active);
    assert!(active.started_at.is_some());
    assert_eq!(next_event(&mut caller_rx).await["action"], "accepted");

    let ended = env
        .state
        .calls
        .transition(call.id, caller, CallEvent::End)
        .await
        .unwrap();
    assert_eq!(ended.status, CallStatus::Ended);
    let (started, finished) = (ended.started_at.unwrap(), ended.ended_at.unwrap());
    assert_eq!(ended.duration_secs, (finished - started).num_seconds());
    assert!(ended.duration_secs >= 0);

    let seen = env.state.calls.get(call.id, callee).await.unwrap();
    assert_eq!(seen.status, CallStatus::Ended);
}

#[tokio::test]
async fn reject_leaves_zero_duration_and_is_terminal() {
    let env = TestEnvironment::new();
    let (caller, callee) = friends(&env);
    let call = env
        .state
        .calls
        .initiate(caller, ReceiverKind::Direct, callee, CallKind::Voice)
        .await
        .unwrap();

    let rejected = env
        .state
        .calls
        .transition(call.id, callee, CallEvent::Reject)
        .await
        .unwrap();
    assert_eq!(rejected.status, CallStatus::Rejected);
    assert_eq!(rejected.duration_secs, 0);
    assert!(rejected.started_at.is_none());

    assert!(matches!(
        env.state.calls.transition(call.id, callee, CallEvent::Accept).await,
        Err(AppError::InvalidCallState {
            status: CallStatus::Rejected,
            event: CallEvent::Accept
        })
    ));
}

#[tokio::test]
async fn ending_an_unanswered_call_marks_it_missed() {
    let env = TestEnvironment::new();
    let (caller, callee) = friends(&env);
    let call = env
        .state
        .calls
        .initiate(caller, ReceiverKind::Direct, callee, CallKind::Voice)
        .await
        .unwrap();

    let missed = env
        .state
        .calls
        .transition(call.id, caller, CallEvent::End)
        .await
        .unwrap();
    assert_eq!(missed.status, CallStatus::Missed);
    assert_eq!(missed.duration_secs, 0);
}

#[tokio::test]
async fn ending_an_unanswered_call_can_be_refused() {
    let env = TestEnvironment::with(&[("CALL_END_WHILE_RINGING", "reject")]);
    let (caller, callee) = friends(&env);
    let call = env
        .state
        .calls
        .initiate(caller, ReceiverKind::Direct, callee, CallKind::Voice)
        .await
        .unwrap();

    assert!(matches!(
        env.state.calls.transition(call.id, caller, CallEvent::End).await,
        Err(AppError::InvalidCallState {
            status: CallStatus::Ringing,
            event: CallEvent::End
        })
    ));
}

#[tokio::test]
async fn only_recipients_answer() {
    let env = TestEnvironment::new();
    let (caller, callee) = friends(&env);
    let stranger = Uuid::new_v4();
    let call = env
        .state
        .calls
        .initiate(caller, ReceiverKind::Direct, callee, CallKind::Voice)
        .await
        .unwrap();

    assert!(matches!(
        env.state.calls.transition(call.id, caller, CallEvent::Accept).await,
        Err(AppError::Forbidden)
    ));
    assert!(matches!(
        env.state.calls.transition(call.id, stranger, CallEvent::End).await,
        Err(AppError::Forbidden)
    ));
    assert!(matches!(
        env.state.calls.get(call.id, stranger).await,
        Err(AppError::Forbidden)
    ));
}

#[tokio::test]
async fn calling_requires_a_relationship() {
    let env = TestEnvironment::new();
    let (caller, stranger) = (Uuid::new_v4(), Uuid::new_v4());

    assert!(matches!(
        env.state
            .calls
            .initiate(caller, ReceiverKind::Direct, stranger, CallKind::Voice)
            .await,
        Err(AppError::NotAuthorized(_))
    ));
    assert!(matches!(
        env.state
            .calls
            .initiate(caller, ReceiverKind::Direct, caller, CallKind::Voice)
            .await,
        Err(AppError::BadRequest(_))
    ));
}

#[tokio::test]
async fn group_call_rings_every_member_device() {
    let env = TestEnvironment::new();
    let group = Uuid::new_v4();
    let (caller, member) = (Uuid::new_v4(), Uuid::new_v4());
    env.social.add_member(group, caller);
    env.social.add_member(group, member);
    let (_session, mut member_rx) = env.connect(member, "phone").await;

    let call = env
        .state
        .calls
        .initiate(caller, ReceiverKind::Group, group, CallKind::Voice)
        .await
        .unwrap();
    let ring = next_event(&mut member_rx).await;
    assert_eq!(ring["action"], "incoming");
    assert_eq!(ring["call"]["id"], call.id.to_string());

    let active = env
        .state
        .calls
        .transition(call.id, member, CallEvent::Accept)
        .await
        .unwrap();
    assert_eq!(active.status, CallStatus::Active);
}
