use serde_json::json;
use sqlx::{Pool, Postgres, Result as SqlxResult, Transaction};
use tracing::instrument;

use crate::db::models::outbox::{ClaimedEntry, OutboxStatus, ScoreDelta, StatusCount};

pub struct OutboxRepository {
    pool: &'static Pool<Postgres>,
}

impl OutboxRepository {
    pub fn new(pool: &'static Pool<Postgres>) -> Self {
        Self { pool }
    }

    /// Inserts one pending intent inside the caller's transaction, alongside
    /// the ledger row it mirrors.
    #[instrument(skip(tx, delta))]
    pub async fn enqueue(
        tx: &mut Transaction<'_, Postgres>,
        event_type: &str,
        delta: &ScoreDelta,
    ) -> SqlxResult<()> {
        let payload = json!({
            "seasonId": delta.season_id,
            "userId": delta.user_id,
            "delta": delta.delta,
        });

        sqlx::query(
            r#"
            INSERT INTO outbox (event_type, payload, status)
            VALUES ($1, $2, $3)
            "#,
        )
        .bind(event_type)
        .bind(payload)
        .bind(OutboxStatus::Pending.as_str())
        .execute(&mut **tx)
        .await?;

        Ok(())
    }

    /// Claims up to `limit` pending rows in ascending id order and bumps them
    /// to `processing`, incrementing attempts once per claim.
    ///
    /// `FOR UPDATE SKIP LOCKED` keeps concurrent workers from ever holding
    /// the same row: rows locked by another claim are passed over rather than
    /// waited on. The row locks live until the caller commits or rolls back,
    /// so an aborted cycle releases its whole batch back to `pending`.
    #[instrument(skip(tx))]
    pub async fn claim_batch(
        tx: &mut Transaction<'_, Postgres>,
        limit: i64,
    ) -> SqlxResult<Vec<ClaimedEntry>> {
        let claimed = sqlx::query_as::<_, ClaimedEntry>(
            r#"
            SELECT id, event_type, payload
            FROM outbox
            WHERE status = $1
            ORDER BY id
            FOR UPDATE SKIP LOCKED
            LIMIT $2
            "#,
        )
        .bind(OutboxStatus::Pending.as_str())
        .bind(limit)
        .fetch_all(&mut **tx)
        .await?;

        if claimed.is_empty() {
            return Ok(claimed);
        }

        let ids: Vec<i64> = claimed.iter().map(|entry| entry.id).collect();
        sqlx::query(
            r#"
            UPDATE outbox
            SET status = $1, attempts = attempts + 1
            WHERE id = ANY($2)
            "#,
        )
        .bind(OutboxStatus::Processing.as_str())
        .bind(ids.as_slice())
        .execute(&mut **tx)
        .await?;

        Ok(claimed)
    }

    /// Terminal failure for a row the worker can never apply. Not retried.
    #[instrument(skip(tx))]
    pub async fn mark_failed(
        tx: &mut Transaction<'_, Postgres>,
        id: i64,
        error: &str,
    ) -> SqlxResult<()> {
        sqlx::query("UPDATE outbox SET status = $1, last_error = $2 WHERE id = $3")
            .bind(OutboxStatus::Failed.as_str())
            .bind(error)
            .bind(id)
            .execute(&mut **tx)
            .await?;

        Ok(())
    }

    #[instrument(skip(tx, ids), fields(rows = ids.len()))]
    pub async fn finalize_done(
        tx: &mut Transaction<'_, Postgres>,
        ids: &[i64],
    ) -> SqlxResult<()> {
        sqlx::query(
            r#"
            UPDATE outbox
            SET status = $1, processed_at = now(), last_error = NULL
            WHERE id = ANY($2)
            "#,
        )
        .bind(OutboxStatus::Done.as_str())
        .bind(ids)
        .execute(&mut **tx)
        .await?;

        Ok(())
    }

    /// Reverts rows whose cache effect failed back to `pending` with a note.
    /// Attempts are not touched here; the next claim increments them.
    #[instrument(skip(tx, ids), fields(rows = ids.len()))]
    pub async fn finalize_retry(
        tx: &mut Transaction<'_, Postgres>,
        ids: &[i64],
        error: &str,
    ) -> SqlxResult<()> {
        sqlx::query(
            r#"
            UPDATE outbox
            SET status = $1, last_error = $2
            WHERE id = ANY($3)
            "#,
        )
        .bind(OutboxStatus::Pending.as_str())
        .bind(error)
        .bind(ids)
        .execute(&mut **tx)
        .await?;

        Ok(())
    }

    #[instrument(skip(tx))]
    pub async fn delete_season(
        tx: &mut Transaction<'_, Postgres>,
        season_id: &str,
    ) -> SqlxResult<u64> {
        let result = sqlx::query("DELETE FROM outbox WHERE payload->>'seasonId' = $1")
            .bind(season_id)
            .execute(&mut **tx)
            .await?;

        Ok(result.rows_affected())
    }

    /// Row counts per status, the backlog signal operators watch.
    #[instrument(skip(self))]
    pub async fn status_counts(&self) -> SqlxResult<Vec<StatusCount>> {
        sqlx::query_as::<_, StatusCount>(
            r#"
            SELECT status, COUNT(*) AS count
            FROM outbox
            GROUP BY status
            ORDER BY status
            "#,
        )
        .fetch_all(self.pool)
        .await
    }
}
