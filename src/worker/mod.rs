//! Outbox drain worker.
//!
//! Long-lived loop that moves pending outbox rows into the sorted index.
//! Each cycle claims a batch under row locks, applies the surviving effects
//! to redis in one pipelined burst, and finalizes every claimed row inside
//! the claiming transaction. A crash or deadline anywhere before commit
//! rolls the claim back, so every committed row is applied at least once.

use redis::Value;
use sqlx::PgPool;
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::instrument;

use crate::constants::{DRAIN_BATCH_SIZE, DRAIN_CYCLE_DEADLINE, DRAIN_TICK};
use crate::db::models::outbox::{ClaimedEntry, EVENT_SCORE_DELTA, ScoreDelta};
use crate::db::redis::leaderboard::LeaderboardCache;
use crate::db::redis::redis_pool::RedisErr;
use crate::db::repositories::outbox::OutboxRepository;

pub type DrainResult<T> = core::result::Result<T, DrainError>;

#[derive(Debug, Error)]
pub enum DrainError {
    #[error(transparent)]
    SqlxError(#[from] sqlx::Error),

    #[error("pipeline dispatch failed: {0}")]
    CacheError(#[from] RedisErr),
}

/// What one cycle did, for the worker log line.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CycleOutcome {
    pub claimed: usize,
    pub done: usize,
    pub retried: usize,
    pub poisoned: usize,
}

/// Spawns the drain loop. One cycle per tick; a cycle that outruns the tick
/// interval delays the next tick rather than stacking (missed ticks are
/// skipped, never queued). Worker errors are logged and never propagate.
pub fn start_drain_worker(
    pool: &'static PgPool,
    cache: LeaderboardCache,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::task::spawn(async move {
        tracing::info!(
            batch = DRAIN_BATCH_SIZE,
            tick_ms = DRAIN_TICK.as_millis() as u64,
            "drain worker started"
        );

        let mut tick = tokio::time::interval(DRAIN_TICK);
        tick.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    tracing::info!("drain worker stopping");
                    break;
                }
                _ = tick.tick() => {
                    match tokio::time::timeout(DRAIN_CYCLE_DEADLINE, drain_cycle(pool, &cache)).await {
                        Ok(Ok(outcome)) if outcome.claimed > 0 => {
                            tracing::debug!(?outcome, "drained outbox batch");
                        }
                        Ok(Ok(_)) => {}
                        Ok(Err(e)) => {
                            tracing::error!(error = ?e, "drain cycle failed; claims reverted");
                        }
                        Err(_) => {
                            tracing::error!("drain cycle exceeded deadline; claims reverted");
                        }
                    }
                }
            }
        }
    })
}

/// One claim-apply-finalize pass.
///
/// Poison rows (undecodable payload, unknown event type) are marked `failed`
/// before the pipeline is built and never block their neighbors. Rows whose
/// pipeline slot reports an error go back to `pending`; the rest commit as
/// `done`. Any error that escapes this function aborts the transaction and
/// reverts the entire claim.
#[instrument(skip(pool, cache))]
pub async fn drain_cycle(pool: &PgPool, cache: &LeaderboardCache) -> DrainResult<CycleOutcome> {
    let mut tx = pool.begin().await?;

    let claimed = OutboxRepository::claim_batch(&mut tx, DRAIN_BATCH_SIZE).await?;
    if claimed.is_empty() {
        tx.commit().await?;
        return Ok(CycleOutcome::default());
    }

    let mut outcome = CycleOutcome {
        claimed: claimed.len(),
        ..Default::default()
    };

    let mut ids = Vec::with_capacity(claimed.len());
    let mut deltas = Vec::with_capacity(claimed.len());
    for entry in &claimed {
        match decode_entry(entry) {
            Ok(delta) => {
                ids.push(entry.id);
                deltas.push(delta);
            }
            Err(reason) => {
                tracing::warn!(id = entry.id, reason, "poison outbox row");
                OutboxRepository::mark_failed(&mut tx, entry.id, &reason).await?;
                outcome.poisoned += 1;
            }
        }
    }

    if deltas.is_empty() {
        tx.commit().await?;
        return Ok(outcome);
    }

    let results = cache.apply(&deltas).await?;
    let (done, retry) = partition_results(&ids, &results);
    outcome.done = done.len();
    outcome.retried = retry.len();

    if !done.is_empty() {
        OutboxRepository::finalize_done(&mut tx, &done).await?;
    }
    if !retry.is_empty() {
        OutboxRepository::finalize_retry(&mut tx, &retry, "redis cmd error").await?;
    }

    tx.commit().await?;
    Ok(outcome)
}

/// Rejects rows the worker can never apply; the error string becomes the
/// row's durable `last_error`. The payload is decoded before the event type
/// is checked, so a row that is broken both ways records the decode error.
fn decode_entry(entry: &ClaimedEntry) -> Result<ScoreDelta, String> {
    let delta: ScoreDelta = serde_json::from_value(entry.payload.clone())
        .map_err(|e| format!("json error: {e}"))?;

    if entry.event_type != EVENT_SCORE_DELTA {
        return Err(format!("unknown event_type: {}", entry.event_type));
    }

    Ok(delta)
}

/// Pairs claimed ids with their pipeline reply slots. A slot that does not
/// parse as a score, or a missing slot, sends that row back to `pending`.
fn partition_results(ids: &[i64], results: &[Value]) -> (Vec<i64>, Vec<i64>) {
    let mut done = Vec::with_capacity(ids.len());
    let mut retry = Vec::new();

    for (idx, id) in ids.iter().enumerate() {
        match results.get(idx) {
            Some(value) if redis::from_redis_value::<f64>(value).is_ok() => done.push(*id),
            _ => retry.push(*id),
        }
    }

    (done, retry)
}

#[cfg(test)]
mod test {
    use serde_json::json;

    use super::*;

    fn entry(id: i64, event_type: &str, payload: serde_json::Value) -> ClaimedEntry {
        ClaimedEntry {
            id,
            event_type: event_type.into(),
            payload,
        }
    }

    #[test]
    fn decodes_well_formed_payload() {
        let delta = decode_entry(&entry(
            1,
            EVENT_SCORE_DELTA,
            json!({"seasonId": "s1", "userId": "u1", "delta": 10}),
        ))
        .unwrap();

        assert_eq!(
            delta,
            ScoreDelta {
                season_id: "s1".into(),
                user_id: "u1".into(),
                delta: 10,
            }
        );
    }

    #[test]
    fn rejects_unknown_event_type() {
        let err = decode_entry(&entry(
            2,
            "season_reset",
            json!({"seasonId": "s1", "userId": "u1", "delta": 1}),
        ))
        .unwrap_err();

        assert!(err.contains("unknown event_type"));
    }

    #[test]
    fn rejects_malformed_payload() {
        let err = decode_entry(&entry(
            3,
            EVENT_SCORE_DELTA,
            json!({"seasonId": "s1", "delta": "ten"}),
        ))
        .unwrap_err();

        assert!(err.starts_with("json error"));
    }

    #[test]
    fn malformed_payload_is_reported_before_event_type() {
        let err = decode_entry(&entry(4, "season_reset", json!({"seasonId": "s1"}))).unwrap_err();

        assert!(err.starts_with("json error"));
    }

    #[test]
    fn partitions_by_slot_outcome() {
        let ids = [11, 12, 13];
        let results = [
            Value::BulkString(b"8".to_vec()),
            Value::Nil,
            Value::Double(4.0),
        ];

        let (done, retry) = partition_results(&ids, &results);
        assert_eq!(done, vec![11, 13]);
        assert_eq!(retry, vec![12]);
    }

    #[test]
    fn missing_slots_are_retried() {
        let ids = [21, 22];
        let results = [Value::Double(1.0)];

        let (done, retry) = partition_results(&ids, &results);
        assert_eq!(done, vec![21]);
        assert_eq!(retry, vec![22]);
    }
}
