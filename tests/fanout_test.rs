//! Message fan-out end to end: live delivery, the offline backlog and group
//! broadcast semantics.

use chat_fanout_service::error::AppError;
use chat_fanout_service::models::{ContentKind, ReceiverKind};
use chat_fanout_service::services::chat_service::SendReceipt;
use chrono::Utc;
use uuid::Uuid;

mod test_harness;
use test_harness::{eventually, next_event, stays_quiet, TestEnvironment};

async fn send_text(
    env: &TestEnvironment,
    sender: Uuid,
    kind: ReceiverKind,
    receiver: Uuid,
    text: &str,
) -> Result<SendReceipt, AppError> {
    env.state
        .chat
        .send_message(
            sender,
            &format!("conn-{sender}"),
            kind,
            receiver,
            ContentKind::Text,
            text.as_bytes().to_vec(),
        )
        .await
}

#[tokio::test]
async fn message_to_disconnected_user_lands_in_offline_queue() {
    let env = TestEnvironment::new();
    let (alice, bob) = (Uuid::new_v4(), Uuid::new_v4());
    env.social.add_friends(alice, bob);

    let (session, _rx) = env.connect(bob, "phone").await;
    env.disconnect(session).await;

    let receipt = send_text(&env, alice, ReceiverKind::Direct, bob, "are you there?")
        .await
        .unwrap();

    let env = &env;
    assert!(eventually(|| async move { env.unread(bob).await == 1 }).await);
    let drained = env.state.chat.drain_offline(bob).await.unwrap();
    assert_eq!(drained.len(), 1);
    assert_eq!(drained[0].id, receipt.msg_id);
    assert_eq!(drained[0].payload, b"are you there?");
    assert_eq!(env.unread(bob).await, 0);
    assert!(env.state.chat.drain_offline(bob).await.unwrap().is_empty());
}

#[tokio::test]
async fn message_to_connected_user_is_pushed_not_queued() {
    let env = TestEnvironment::new();
    let (alice, bob) = (Uuid::new_v4(), Uuid::new_v4());
    env.social.add_friends(alice, bob);
    let (_phone, mut phone_rx) = env.connect(bob, "phone").await;
    let (_laptop, mut laptop_rx) = env.connect(bob, "laptop").await;

    let receipt = send_text(&env, alice, ReceiverKind::Direct, bob, "hi")
        .await
        .unwrap();

    for rx in [&mut phone_rx, &mut laptop_rx] {
        let event = next_event(rx).await;
        assert_eq!(event["type"], "new_message");
        assert_eq!(event["id"], receipt.msg_id.to_string());
        assert_eq!(event["sender_id"], alice.to_string());
    }
    assert_eq!(env.unread(bob).await, 0);
}

#[tokio::test]
async fn relationship_checks_gate_direct_messages() {
    let env = TestEnvironment::new();
    let (alice, bob, stranger) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());
    env.social.add_friends(alice, bob);

    assert!(matches!(
        send_text(&env, stranger, ReceiverKind::Direct, bob, "hello").await,
        Err(AppError::NotAuthorized(_))
    ));

    env.social.block(bob, alice);
    assert!(matches!(
        send_text(&env, alice, ReceiverKind::Direct, bob, "hello").await,
        Err(AppError::NotAuthorized(_))
    ));
    assert_eq!(env.unread(bob).await, 0);
}

#[tokio::test]
async fn empty_payload_is_rejected() {
    let env = TestEnvironment::new();
    let (alice, bob) = (Uuid::new_v4(), Uuid::new_v4());
    env.social.add_friends(alice, bob);
    assert!(matches!(
        send_text(&env, alice, ReceiverKind::Direct, bob, "").await,
        Err(AppError::BadRequest(_))
    ));
}

#[tokio::test]
async fn group_message_reaches_each_online_device_once_and_queues_per_offline_member() {
    let env = TestEnvironment::new();
    let group = Uuid::new_v4();
    let (sender, online, offline_a, offline_b) = (
        Uuid::new_v4(),
        Uuid::new_v4(),
        Uuid::new_v4(),
        Uuid::new_v4(),
    );
    for member in [sender, online, offline_a, offline_b] {
        env.social.add_member(group, member);
    }

    let (_sender_session, mut sender_rx) = env.connect(sender, "phone").await;
    let (_phone, mut phone_rx) = env.connect(online, "phone").await;
    let (_tablet, mut tablet_rx) = env.connect(online, "tablet").await;
    // offline_b has two devices that both went away.
    let (gone_1, _) = env.connect(offline_b, "phone").await;
    let (gone_2, _) = env.connect(offline_b, "laptop").await;
    env.disconnect(gone_1).await;
    env.disconnect(gone_2).await;

    let receipt = send_text(&env, sender, ReceiverKind::Group, group, "hello group")
        .await
        .unwrap();

    for rx in [&mut phone_rx, &mut tablet_rx, &mut sender_rx] {
        let event = next_event(rx).await;
        assert_eq!(event["id"], receipt.msg_id.to_string());
        assert!(stays_quiet(rx).await, "delivered more than once");
    }

    let env = &env;
    assert!(eventually(|| async move {
        env.unread(offline_a).await == 1 && env.unread(offline_b).await == 1
    })
    .await);
    assert_eq!(env.unread(online).await, 0);
    assert_eq!(env.unread(sender).await, 0);
}

#[tokio::test]
async fn delivery_follows_current_membership() {
    let env = TestEnvironment::new();
    let group = Uuid::new_v4();
    let (sender, member) = (Uuid::new_v4(), Uuid::new_v4());
    env.social.add_member(group, sender);
    env.social.add_member(group, member);

    send_text(&env, sender, ReceiverKind::Group, group, "first")
        .await
        .unwrap();
    let env_ref = &env;
    assert!(eventually(|| async move { env_ref.unread(member).await == 1 }).await);

    env.social.remove_member(group, member);
    let late = Uuid::new_v4();
    env.social.add_member(group, late);
    send_text(&env, sender, ReceiverKind::Group, group, "second")
        .await
        .unwrap();
    assert!(eventually(|| async move { env_ref.unread(late).await == 1 }).await);
    assert_eq!(env.unread(member).await, 1);
}

#[tokio::test]
async fn muted_member_cannot_post() {
    let env = TestEnvironment::new();
    let group = Uuid::new_v4();
    let member = Uuid::new_v4();
    env.social.add_member(group, member);
    let until = Utc::now() + chrono::Duration::minutes(10);
    env.social.mute(group, member, until);

    assert!(matches!(
        send_text(&env, member, ReceiverKind::Group, group, "psst").await,
        Err(AppError::Muted { until: u }) if u == until
    ));
    assert!(matches!(
        send_text(&env, Uuid::new_v4(), ReceiverKind::Group, group, "hi").await,
        Err(AppError::NotAuthorized(_))
    ));
}

#[tokio::test]
async fn read_receipt_goes_to_sender_once() {
    let env = TestEnvironment::new();
    let (alice, bob) = (Uuid::new_v4(), Uuid::new_v4());
    env.social.add_friends(alice, bob);
    let (_alice_session, mut alice_rx) = env.connect(alice, "phone").await;

    let receipt = send_text(&env, alice, ReceiverKind::Direct, bob, "read me")
        .await
        .unwrap();

    assert!(matches!(
        env.state.chat.mark_read(receipt.msg_id, alice).await,
        Err(AppError::Forbidden)
    ));
    env.state.chat.mark_read(receipt.msg_id, bob).await.unwrap();
    env.state.chat.mark_read(receipt.msg_id, bob).await.unwrap();

    let event = next_event(&mut alice_rx).await;
    assert_eq!(event["type"], "read_receipt");
    assert_eq!(event["msg_id"], receipt.msg_id.to_string());
    assert_eq!(event["reader_id"], bob.to_string());
    assert!(stays_quiet(&mut alice_rx).await);
}
