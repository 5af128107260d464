use sqlx::{PgPool, Result as SqlxResult};
use tracing::instrument;

use crate::db::models::outbox::{EVENT_SCORE_DELTA, ScoreDelta};

pub mod ledger;
pub mod outbox;

/// The submit-path write: one ledger row and one outbox row, committed
/// together. Partial writes are impossible; any failure rolls the whole
/// transaction back.
#[instrument(skip(pool, delta), fields(season = %delta.season_id, user = %delta.user_id))]
pub async fn record_score_delta(pool: &PgPool, delta: &ScoreDelta) -> SqlxResult<()> {
    let mut tx = pool.begin().await?;

    ledger::LedgerRepository::append(&mut tx, &delta.season_id, &delta.user_id, delta.delta)
        .await?;
    outbox::OutboxRepository::enqueue(&mut tx, EVENT_SCORE_DELTA, delta).await?;

    tx.commit().await?;
    Ok(())
}

/// Removes every durable trace of a season. The caller drops the cache key
/// separately; only the two table deletes are atomic with each other.
#[instrument(skip(pool))]
pub async fn delete_season_records(pool: &PgPool, season_id: &str) -> SqlxResult<()> {
    let mut tx = pool.begin().await?;

    let outbox_rows = outbox::OutboxRepository::delete_season(&mut tx, season_id).await?;
    let ledger_rows = ledger::LedgerRepository::delete_season(&mut tx, season_id).await?;

    tx.commit().await?;
    tracing::debug!(season_id, ledger_rows, outbox_rows, "purged season records");
    Ok(())
}
