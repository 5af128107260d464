use std::sync::LazyLock;

use redis::aio::ConnectionManager;
use thiserror::Error;
use tokio::sync::OnceCell;
use tracing::instrument;

use crate::util::env::Var;
use crate::var;

static REDIS_POOL: LazyLock<OnceCell<RedisPool>> = LazyLock::new(OnceCell::new);
pub async fn redis_pool() -> RedisResult<&'static RedisPool> {
    REDIS_POOL
        .get_or_try_init(|| async { RedisPool::new().await })
        .await
}

pub struct RedisPool {
    pub manager: ConnectionManager,
}

impl RedisPool {
    #[instrument]
    pub async fn new() -> RedisResult<Self> {
        let redis_url = var!(Var::RedisUrl);
        tracing::debug!(redis_url, "connecting to redis server");

        let client = redis::Client::open(redis_url)?;
        let manager = ConnectionManager::new(client).await?;

        Ok(Self { manager })
    }
}

pub type RedisResult<T> = core::result::Result<T, RedisErr>;

#[derive(Debug, Error)]
pub enum RedisErr {
    #[error("redis client error: {0}")]
    RedisClientError(#[from] redis::RedisError),
}
