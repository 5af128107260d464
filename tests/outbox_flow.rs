//! End-to-end outbox pipeline tests against live Postgres and Redis.
//!
//! These need both services reachable via DATABASE_URL / REDIS_URL, so they
//! are ignored by default:
//!
//!     cargo test --test outbox_flow -- --ignored --test-threads=1
//!
//! Single-threaded because several tests assert on outbox row states while
//! holding no claim of their own.

use sqlx::PgPool;
use uuid::Uuid;

use leaderboard::db::db_pool;
use leaderboard::db::prelude::*;
use leaderboard::db::redis::redis_pool::redis_pool;
use leaderboard::db::repositories::{delete_season_records, record_score_delta};
use leaderboard::worker::drain_cycle;

async fn harness() -> (&'static PgPool, LeaderboardCache) {
    let pool = db_pool().await.unwrap();
    let redis = redis_pool().await.unwrap();

    (pool, LeaderboardCache::new(redis.manager.clone()))
}

fn fresh_season() -> String {
    format!("it-{}", Uuid::new_v4())
}

fn delta(season_id: &str, user_id: &str, delta: i64) -> ScoreDelta {
    ScoreDelta {
        season_id: season_id.into(),
        user_id: user_id.into(),
        delta,
    }
}

async fn season_unfinished(pool: &PgPool, season_id: &str) -> i64 {
    sqlx::query_scalar::<_, i64>(
        r#"
        SELECT COUNT(*)
        FROM outbox
        WHERE payload->>'seasonId' = $1 AND status IN ('pending', 'processing')
        "#,
    )
    .bind(season_id)
    .fetch_one(pool)
    .await
    .unwrap()
}

async fn drain_season(pool: &'static PgPool, cache: &LeaderboardCache, season_id: &str) {
    while season_unfinished(pool, season_id).await > 0 {
        drain_cycle(pool, cache).await.unwrap();
    }
}

async fn cleanup(pool: &'static PgPool, cache: &LeaderboardCache, season_id: &str) {
    cache.drop_season(season_id).await.unwrap();
    delete_season_records(pool, season_id).await.unwrap();
}

#[tokio::test]
#[ignore = "requires postgres and redis"]
async fn submit_is_visible_after_drain() {
    let (pool, cache) = harness().await;
    let season = fresh_season();

    record_score_delta(pool, &delta(&season, "u1", 10)).await.unwrap();
    drain_season(pool, &cache, &season).await;

    let top = cache.top(&season, 10).await.unwrap();
    assert_eq!(top, vec![("u1".to_string(), 10.0)]);

    let (rank, score) = cache.rank(&season, "u1").await.unwrap().unwrap();
    assert_eq!(rank, 0);
    assert_eq!(score, 10.0);

    let (status, attempts, processed) = sqlx::query_as::<_, (String, i32, bool)>(
        r#"
        SELECT status, attempts, processed_at IS NOT NULL
        FROM outbox
        WHERE payload->>'seasonId' = $1
        "#,
    )
    .bind(&season)
    .fetch_one(pool)
    .await
    .unwrap();
    assert_eq!(status, OutboxStatus::Done.as_str());
    assert_eq!(attempts, 1);
    assert!(processed);

    cleanup(pool, &cache, &season).await;
}

#[tokio::test]
#[ignore = "requires postgres and redis"]
async fn deltas_accumulate_across_submits() {
    let (pool, cache) = harness().await;
    let season = fresh_season();

    for d in [
        delta(&season, "u1", 5),
        delta(&season, "u1", 3),
        delta(&season, "u2", 4),
    ] {
        record_score_delta(pool, &d).await.unwrap();
    }
    drain_season(pool, &cache, &season).await;

    let top = cache.top(&season, 10).await.unwrap();
    assert_eq!(
        top,
        vec![("u1".to_string(), 8.0), ("u2".to_string(), 4.0)]
    );

    let (start, entries) = cache.around(&season, "u2", 1).await.unwrap().unwrap();
    assert_eq!(start, 0);
    assert_eq!(
        entries,
        vec![("u1".to_string(), 8.0), ("u2".to_string(), 4.0)]
    );

    cleanup(pool, &cache, &season).await;
}

#[tokio::test]
#[ignore = "requires postgres and redis"]
async fn aborted_claim_reverts_and_redrains() {
    let (pool, cache) = harness().await;
    let season = fresh_season();

    for i in 0..3 {
        record_score_delta(pool, &delta(&season, "u1", i + 1)).await.unwrap();
    }

    // Claim the batch, then abort before finalize. Ids must come back in
    // ascending order, and the rollback must release every row.
    {
        let mut tx = pool.begin().await.unwrap();
        let claimed = OutboxRepository::claim_batch(&mut tx, 500).await.unwrap();
        assert!(claimed.len() >= 3);
        assert!(claimed.windows(2).all(|w| w[0].id < w[1].id));

        tx.rollback().await.unwrap();
    }

    let statuses = sqlx::query_scalar::<_, String>(
        "SELECT status FROM outbox WHERE payload->>'seasonId' = $1",
    )
    .bind(&season)
    .fetch_all(pool)
    .await
    .unwrap();
    assert!(statuses.iter().all(|s| s == OutboxStatus::Pending.as_str()));

    drain_season(pool, &cache, &season).await;

    let ledger_total = LedgerRepository::new(pool)
        .user_total(&season, "u1")
        .await
        .unwrap();
    let (_, score) = cache.rank(&season, "u1").await.unwrap().unwrap();
    assert_eq!(score, ledger_total as f64);

    cleanup(pool, &cache, &season).await;
}

#[tokio::test]
#[ignore = "requires postgres and redis"]
async fn poison_rows_fail_without_blocking_neighbors() {
    let (pool, cache) = harness().await;
    let season = fresh_season();

    record_score_delta(pool, &delta(&season, "u1", 5)).await.unwrap();
    for (event_type, payload) in [
        (
            EVENT_SCORE_DELTA,
            serde_json::json!({"seasonId": season, "userId": "u1", "delta": "broken"}),
        ),
        (
            "season_reset",
            serde_json::json!({"seasonId": season, "userId": "u1", "delta": 1}),
        ),
    ] {
        sqlx::query("INSERT INTO outbox (event_type, payload, status) VALUES ($1, $2, 'pending')")
            .bind(event_type)
            .bind(payload)
            .execute(pool)
            .await
            .unwrap();
    }
    record_score_delta(pool, &delta(&season, "u2", 7)).await.unwrap();

    drain_season(pool, &cache, &season).await;

    let rows = sqlx::query_as::<_, (String, Option<String>)>(
        r#"
        SELECT status, last_error
        FROM outbox
        WHERE payload->>'seasonId' = $1
        ORDER BY id
        "#,
    )
    .bind(&season)
    .fetch_all(pool)
    .await
    .unwrap();
    assert_eq!(rows.len(), 4);
    assert_eq!(rows[0].0, OutboxStatus::Done.as_str());
    assert_eq!(rows[1].0, OutboxStatus::Failed.as_str());
    assert!(rows[1].1.as_deref().unwrap().starts_with("json error"));
    assert_eq!(rows[2].0, OutboxStatus::Failed.as_str());
    assert!(rows[2].1.as_deref().unwrap().starts_with("unknown event_type"));
    assert_eq!(rows[3].0, OutboxStatus::Done.as_str());

    let top = cache.top(&season, 10).await.unwrap();
    assert_eq!(
        top,
        vec![("u2".to_string(), 7.0), ("u1".to_string(), 5.0)]
    );

    cleanup(pool, &cache, &season).await;
}

#[tokio::test]
#[ignore = "requires postgres and redis"]
async fn purge_clears_cache_ledger_and_outbox() {
    let (pool, cache) = harness().await;
    let season = fresh_season();

    record_score_delta(pool, &delta(&season, "u1", 9)).await.unwrap();
    drain_season(pool, &cache, &season).await;
    assert!(cache.rank(&season, "u1").await.unwrap().is_some());

    cache.drop_season(&season).await.unwrap();
    delete_season_records(pool, &season).await.unwrap();

    assert!(cache.rank(&season, "u1").await.unwrap().is_none());

    let ledger_rows = sqlx::query_scalar::<_, i64>(
        "SELECT COUNT(*) FROM score_events WHERE season_id = $1",
    )
    .bind(&season)
    .fetch_one(pool)
    .await
    .unwrap();
    let outbox_rows = sqlx::query_scalar::<_, i64>(
        "SELECT COUNT(*) FROM outbox WHERE payload->>'seasonId' = $1",
    )
    .bind(&season)
    .fetch_one(pool)
    .await
    .unwrap();
    assert_eq!(ledger_rows, 0);
    assert_eq!(outbox_rows, 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
#[ignore = "requires postgres and redis"]
async fn concurrent_workers_apply_each_row_once() {
    let (pool, cache) = harness().await;
    let season = fresh_season();

    const ROWS: i64 = 1000;
    for _ in 0..ROWS {
        record_score_delta(pool, &delta(&season, "u1", 1)).await.unwrap();
    }

    let mut workers = Vec::new();
    for _ in 0..2 {
        let cache = cache.clone();
        let season = season.clone();
        workers.push(tokio::spawn(async move {
            while season_unfinished(pool, &season).await > 0 {
                drain_cycle(pool, &cache).await.unwrap();
            }
        }));
    }
    for worker in workers {
        worker.await.unwrap();
    }

    let (_, score) = cache.rank(&season, "u1").await.unwrap().unwrap();
    assert_eq!(score, ROWS as f64);

    cleanup(pool, &cache, &season).await;
}
