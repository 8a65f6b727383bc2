use crate::error::AppError;
use deadpool_postgres::{Config as PoolConfig, ManagerConfig, Pool, RecyclingMethod, Runtime};
use tokio_postgres::NoTls;

const SCHEMA: &[&str] = &[
    include_str!("../migrations/0001_messages.sql"),
    include_str!("../migrations/0002_message_retention.sql"),
];

pub async fn init_pool(database_url: &str) -> Result<Pool, AppError> {
    let mut cfg = PoolConfig::new();
    cfg.url = Some(database_url.to_string());
    cfg.manager = Some(ManagerConfig {
        recycling_method: RecyclingMethod::Fast,
    });

    let pool = cfg
        .create_pool(Some(Runtime::Tokio1), NoTls)
        .map_err(|e| AppError::StartServer(format!("db pool: {e}")))?;

    let client = pool.get().await?;
    for statement in SCHEMA {
        client.batch_execute(statement).await?;
    }
    tracing::info!("message schema ready");

    Ok(pool)
}
