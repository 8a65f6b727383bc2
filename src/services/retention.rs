//! Periodic deletion of messages older than the configured retention.
//!
//! Offline queue entries that point at purged messages are skipped when the
//! queue is drained and age out with the queue's own TTL.

use crate::error::AppResult;
use crate::metrics::MESSAGES_PURGED_TOTAL;
use crate::services::message_store::MessageStore;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{error, info};

/// Purge everything sent more than `retention` before `now`.
pub async fn sweep_once(
    messages: &dyn MessageStore,
    retention: chrono::Duration,
    now: DateTime<Utc>,
) -> AppResult<u64> {
    let cutoff = now - retention;
    let purged = messages.purge_sent_before(cutoff).await?;
    MESSAGES_PURGED_TOTAL.inc_by(purged);
    info!(purged, cutoff = %cutoff, "retention sweep finished");
    Ok(purged)
}

/// Run [`sweep_once`] every `every`, starting right away. A failed sweep is
/// logged and retried on the next tick.
pub fn spawn_sweeper(
    messages: Arc<dyn MessageStore>,
    retention: chrono::Duration,
    every: Duration,
) -> JoinHandle<()> {
    info!(
        retention_days = retention.num_days(),
        interval_secs = every.as_secs(),
        "message retention enabled"
    );
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(every);
        loop {
            interval.tick().await;
            if let Err(e) = sweep_once(messages.as_ref(), retention, Utc::now()).await {
                error!(error = %e, "retention sweep failed");
            }
        }
    })
}
