use std::sync::LazyLock;

use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;
use thiserror::Error;
use tokio::sync::OnceCell;

use crate::constants::PG_MAX_CONNECTIONS;
use crate::util::env::Var;
use crate::var;

pub mod models;
pub mod redis;
pub mod repositories;

pub mod prelude {
    pub use crate::db::models::outbox::{
        ClaimedEntry, EVENT_SCORE_DELTA, OutboxStatus, ScoreDelta, StatusCount,
    };
    pub use crate::db::models::score_event::ScoreEvent;
    pub use crate::db::redis::leaderboard::LeaderboardCache;
    pub use crate::db::repositories::ledger::LedgerRepository;
    pub use crate::db::repositories::outbox::OutboxRepository;
    pub use crate::db::{PgError, db_pool};
}

static DB_POOL: LazyLock<OnceCell<Db>> = LazyLock::new(OnceCell::new);
pub async fn db_pool() -> PgResult<&'static PgPool> {
    Ok(&DB_POOL
        .get_or_try_init(|| async { Db::new_pool().await })
        .await?
        .pool)
}

struct Db {
    pool: PgPool,
}

impl Db {
    /// Connects the shared pool and applies any pending migrations. The pool
    /// is shared by the submit handlers and the drain worker, so it is sized
    /// to keep the worker from starving submits.
    async fn new_pool() -> PgResult<Self> {
        let db_url = var!(Var::DatabaseUrl);
        tracing::debug!(db_url, "connecting to postgres");

        let pool = PgPoolOptions::new()
            .max_connections(PG_MAX_CONNECTIONS)
            .connect(db_url)
            .await?;
        sqlx::migrate!().run(&pool).await?;

        Ok(Self { pool })
    }
}

pub type PgResult<T> = core::result::Result<T, PgError>;

#[derive(Debug, Error)]
pub enum PgError {
    #[error(transparent)]
    SqlxError(#[from] sqlx::Error),

    #[error("migration error: {0}")]
    MigrateError(#[from] sqlx::migrate::MigrateError),
}
