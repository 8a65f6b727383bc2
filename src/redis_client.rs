use redis::aio::ConnectionManager;
use redis::{Client, RedisResult};

/// Shared handle to the Redis deployment backing presence, offline queues,
/// calls and cross-instance broadcast.
#[derive(Clone)]
pub struct RedisClient {
    client: Client,
    manager: ConnectionManager,
}

impl RedisClient {
    pub async fn from_url(url: &str) -> RedisResult<Self> {
        let client = Client::open(url)?;
        let manager = ConnectionManager::new(client.clone()).await?;
        Ok(Self { client, manager })
    }

    /// Multiplexed connection for commands; cheap to clone per call.
    pub fn connection(&self) -> ConnectionManager {
        self.manager.clone()
    }

    /// Dedicated connection for `PSUBSCRIBE`, which cannot share the
    /// multiplexed one.
    pub async fn pubsub(&self) -> RedisResult<redis::aio::PubSub> {
        self.client.get_async_pubsub().await
    }
}
