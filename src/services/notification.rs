//! Push notification previews and the bounded queue that sends them.
//!
//! Dispatch never waits on the push provider: requests go into a bounded
//! queue drained by a single task that runs at most `concurrency` sends at a
//! time, each under a timeout. A full queue drops the notification.

use crate::config::PushConfig;
use crate::metrics::PUSH_NOTIFICATIONS_TOTAL;
use crate::models::{Call, CallKind, ContentKind, Message, ReceiverKind, UserId};
use crate::services::push::PushNotifier;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinHandle;

const PREVIEW_MAX_CHARS: usize = 100;

/// Title and body shown on the device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NotificationPreview {
    pub title: String,
    pub body: String,
}

/// Truncate to a maximum number of characters, appending an ellipsis.
pub fn truncate_preview(content: &str, max_chars: usize) -> String {
    let mut chars = content.chars();
    let head: String = chars.by_ref().take(max_chars).collect();
    if chars.next().is_some() {
        format!("{head}...")
    } else {
        head
    }
}

impl NotificationPreview {
    pub fn for_message(message: &Message) -> Self {
        let title = match message.receiver_kind {
            ReceiverKind::Direct => "New message",
            ReceiverKind::Group => "New group message",
        };
        let body = match message.content_kind {
            ContentKind::Text | ContentKind::System => {
                truncate_preview(&String::from_utf8_lossy(&message.payload), PREVIEW_MAX_CHARS)
            }
            ContentKind::Image => "[image]".to_string(),
            ContentKind::File => "[file]".to_string(),
            ContentKind::Emoji => "[emoji]".to_string(),
            ContentKind::Voice => "[voice]".to_string(),
        };
        Self {
            title: title.to_string(),
            body,
        }
    }

    pub fn for_incoming_call(call: &Call) -> Self {
        let title = match call.kind {
            CallKind::Voice => "Incoming voice call",
            CallKind::Video => "Incoming video call",
        };
        let body = match call.receiver_kind {
            ReceiverKind::Direct => "Tap to answer".to_string(),
            ReceiverKind::Group => "A group call has started".to_string(),
        };
        Self {
            title: title.to_string(),
            body,
        }
    }
}

#[derive(Debug)]
struct PushRequest {
    user: UserId,
    preview: NotificationPreview,
}

/// Handle for queueing push notifications. Cloning shares the queue.
#[derive(Clone)]
pub struct PushQueue {
    tx: Option<mpsc::Sender<PushRequest>>,
}

impl PushQueue {
    pub fn disabled() -> Self {
        Self { tx: None }
    }

    /// Spawn the sender task. Returns a disabled queue when push is off.
    pub fn start(
        notifier: Arc<dyn PushNotifier>,
        config: &PushConfig,
    ) -> (Self, Option<JoinHandle<()>>) {
        if !config.enabled {
            return (Self::disabled(), None);
        }
        let (tx, rx) = mpsc::channel(config.queue_capacity.max(1));
        let handle = tokio::spawn(run_push_worker(
            rx,
            notifier,
            config.concurrency.max(1),
            config.timeout,
        ));
        (Self { tx: Some(tx) }, Some(handle))
    }

    pub fn is_enabled(&self) -> bool {
        self.tx.is_some()
    }

    /// Queue a notification without waiting. Returns `false` if it was dropped.
    pub fn enqueue(&self, user: UserId, preview: NotificationPreview) -> bool {
        let Some(tx) = &self.tx else {
            return false;
        };
        match tx.try_send(PushRequest { user, preview }) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(req)) => {
                PUSH_NOTIFICATIONS_TOTAL.with_label_values(&["dropped"]).inc();
                tracing::warn!(user_id = %req.user, "push queue full, notification dropped");
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                tracing::warn!(user_id = %user, "push queue closed");
                false
            }
        }
    }
}

async fn run_push_worker(
    mut rx: mpsc::Receiver<PushRequest>,
    notifier: Arc<dyn PushNotifier>,
    concurrency: usize,
    timeout: Duration,
) {
    let permits = Arc::new(Semaphore::new(concurrency));
    while let Some(request) = rx.recv().await {
        let Ok(permit) = permits.clone().acquire_owned().await else {
            break;
        };
        let notifier = notifier.clone();
        tokio::spawn(async move {
            let _permit = permit;
            let sent = tokio::time::timeout(
                timeout,
                notifier.notify(request.user, &request.preview.title, &request.preview.body),
            )
            .await;
            let outcome = match sent {
                Ok(Ok(())) => "sent",
                Ok(Err(e)) => {
                    tracing::warn!(user_id = %request.user, error = %e, "push notification failed");
                    "failed"
                }
                Err(_) => {
                    tracing::warn!(user_id = %request.user, ?timeout, "push notification timed out");
                    "timeout"
                }
            };
            PUSH_NOTIFICATIONS_TOTAL.with_label_values(&[outcome]).inc();
        });
    }
    tracing::debug!("push worker stopped");
}
