use sqlx::{Pool, Postgres, Result as SqlxResult, Transaction};
use tracing::instrument;

use crate::db::models::score_event::ScoreEvent;

pub struct LedgerRepository {
    pool: &'static Pool<Postgres>,
}

impl LedgerRepository {
    pub fn new(pool: &'static Pool<Postgres>) -> Self {
        Self { pool }
    }

    /// Appends one immutable delta record inside the caller's transaction.
    #[instrument(skip(tx))]
    pub async fn append(
        tx: &mut Transaction<'_, Postgres>,
        season_id: &str,
        user_id: &str,
        delta: i64,
    ) -> SqlxResult<()> {
        sqlx::query(
            r#"
            INSERT INTO score_events (season_id, user_id, delta)
            VALUES ($1, $2, $3)
            "#,
        )
        .bind(season_id)
        .bind(user_id)
        .bind(delta)
        .execute(&mut **tx)
        .await?;

        Ok(())
    }

    #[instrument(skip(self))]
    pub async fn season_events(&self, season_id: &str, limit: i64) -> SqlxResult<Vec<ScoreEvent>> {
        sqlx::query_as::<_, ScoreEvent>(
            r#"
            SELECT id, season_id, user_id, delta, created_at
            FROM score_events
            WHERE season_id = $1
            ORDER BY created_at DESC
            LIMIT $2
            "#,
        )
        .bind(season_id)
        .bind(limit)
        .fetch_all(self.pool)
        .await
    }

    #[instrument(skip(self))]
    pub async fn user_events(
        &self,
        season_id: &str,
        user_id: &str,
        limit: i64,
    ) -> SqlxResult<Vec<ScoreEvent>> {
        sqlx::query_as::<_, ScoreEvent>(
            r#"
            SELECT id, season_id, user_id, delta, created_at
            FROM score_events
            WHERE season_id = $1 AND user_id = $2
            ORDER BY created_at DESC
            LIMIT $3
            "#,
        )
        .bind(season_id)
        .bind(user_id)
        .bind(limit)
        .fetch_all(self.pool)
        .await
    }

    /// Sum of all recorded deltas for one user. The cache must converge to
    /// this value once the outbox is quiescent.
    #[instrument(skip(self))]
    pub async fn user_total(&self, season_id: &str, user_id: &str) -> SqlxResult<i64> {
        sqlx::query_scalar::<_, i64>(
            r#"
            SELECT COALESCE(SUM(delta), 0)::BIGINT
            FROM score_events
            WHERE season_id = $1 AND user_id = $2
            "#,
        )
        .bind(season_id)
        .bind(user_id)
        .fetch_one(self.pool)
        .await
    }

    #[instrument(skip(tx))]
    pub async fn delete_season(
        tx: &mut Transaction<'_, Postgres>,
        season_id: &str,
    ) -> SqlxResult<u64> {
        let result = sqlx::query("DELETE FROM score_events WHERE season_id = $1")
            .bind(season_id)
            .execute(&mut **tx)
            .await?;

        Ok(result.rows_affected())
    }
}
