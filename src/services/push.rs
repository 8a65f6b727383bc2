use crate::error::{AppError, AppResult};
use crate::models::UserId;
use async_trait::async_trait;
use serde::Serialize;
use std::time::Duration;

/// Best-effort notification sender. Callers decide cadence and never retry.
#[async_trait]
pub trait PushNotifier: Send + Sync {
    async fn notify(&self, user: UserId, title: &str, body: &str) -> AppResult<()>;
}

/// Used when push is disabled.
pub struct NoopNotifier;

#[async_trait]
impl PushNotifier for NoopNotifier {
    async fn notify(&self, user: UserId, title: &str, _body: &str) -> AppResult<()> {
        tracing::trace!(user_id = %user, title, "push disabled, notification skipped");
        Ok(())
    }
}

#[derive(Debug, Serialize)]
struct NtfyMessage<'a> {
    topic: String,
    title: &'a str,
    message: &'a str,
    priority: u8,
    tags: [&'a str; 1],
}

/// Publishes to an ntfy server; each account subscribes to its own topic
/// `<prefix>_<user>`.
pub struct NtfyNotifier {
    client: reqwest::Client,
    url: String,
    topic_prefix: String,
}

impl NtfyNotifier {
    pub fn new(
        url: impl Into<String>,
        topic_prefix: impl Into<String>,
        timeout: Duration,
    ) -> AppResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| AppError::Config(format!("ntfy client: {e}")))?;
        Ok(Self {
            client,
            url: url.into(),
            topic_prefix: topic_prefix.into(),
        })
    }

    fn topic_for(&self, user: UserId) -> String {
        format!("{}_{}", self.topic_prefix, user)
    }
}

#[async_trait]
impl PushNotifier for NtfyNotifier {
    async fn notify(&self, user: UserId, title: &str, body: &str) -> AppResult<()> {
        let payload = NtfyMessage {
            topic: self.topic_for(user),
            title,
            message: body,
            priority: 4,
            tags: ["chat_im"],
        };
        let response = self
            .client
            .post(&self.url)
            .json(&payload)
            .send()
            .await
            .map_err(|e| AppError::StoreUnavailable(format!("ntfy: {e}")))?;

        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            return Err(AppError::StoreUnavailable(format!(
                "ntfy returned {status}: {text}"
            )));
        }
        Ok(())
    }
}
