use std::sync::Arc;

use axum::Json;
use axum::body::Bytes;
use axum::extract::rejection::BytesRejection;
use axum::extract::{Path, Query, State};
use http::StatusCode;
use serde::{Deserialize, Serialize};
use tokio::time::timeout;
use tracing::instrument;

use crate::api::server::{AppState, JsonResult, RouteError};
use crate::constants::{PROBE_DEADLINE, READ_DEADLINE, SUBMIT_DEADLINE};
use crate::db::prelude::{
    LedgerRepository, OutboxRepository, ScoreDelta, ScoreEvent, StatusCount,
};
use crate::db::repositories::{delete_season_records, record_score_delta};

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ScoreUpdateRequest {
    #[serde(default)]
    pub user_id: String,
    #[serde(default)]
    pub delta: i64,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ScoreAccepted {
    pub season_id: String,
    pub user_id: String,
    pub queued: bool,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LeaderboardItem {
    pub user_id: String,
    pub score: f64,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TopResponse {
    pub season_id: String,
    pub items: Vec<LeaderboardItem>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RankResponse {
    pub season_id: String,
    pub user_id: String,
    /// 1-based
    pub rank: i64,
    pub score: f64,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AroundItem {
    /// 1-based
    pub rank: i64,
    pub user_id: String,
    pub score: f64,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AroundResponse {
    pub season_id: String,
    pub user_id: String,
    pub range: i64,
    pub items: Vec<AroundItem>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EventsResponse {
    pub season_id: String,
    pub items: Vec<ScoreEvent>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PurgeResponse {
    pub season_id: String,
    pub deleted: bool,
}

#[derive(Debug, Serialize)]
pub struct OutboxStatsResponse {
    pub counts: Vec<StatusCount>,
}

#[derive(Debug, Deserialize)]
pub struct TopParams {
    #[serde(default = "default_limit")]
    pub limit: i64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RankParams {
    #[serde(default)]
    pub user_id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AroundParams {
    #[serde(default)]
    pub user_id: String,
    #[serde(default = "default_range")]
    pub range: i64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventsParams {
    #[serde(default)]
    pub user_id: String,
    #[serde(default = "default_events_limit")]
    pub limit: i64,
}

#[inline]
const fn default_limit() -> i64 {
    10
}

#[inline]
const fn default_range() -> i64 {
    5
}

#[inline]
const fn default_events_limit() -> i64 {
    50
}

/// Accepts a delta and records it durably; the visible score moves only once
/// the drain worker applies the queued intent, so the response carries no
/// score and the status is 202.
///
/// The body extraction is intercepted so that a body past the 1 MiB cap is
/// answered like any other invalid input, a 400 with an `{error}` body.
#[instrument(skip(state, body))]
pub async fn submit_score(
    State(state): State<Arc<AppState>>,
    Path(season_id): Path<String>,
    body: Result<Bytes, BytesRejection>,
) -> Result<(StatusCode, Json<ScoreAccepted>), RouteError> {
    let Ok(body) = body else {
        return Err(RouteError::OversizedBody);
    };

    let req: ScoreUpdateRequest =
        serde_json::from_slice(&body).map_err(RouteError::InvalidJson)?;
    if req.user_id.is_empty() {
        return Err(RouteError::MissingUser);
    }
    if req.delta == 0 {
        return Err(RouteError::ZeroDelta);
    }

    let delta = ScoreDelta {
        season_id: season_id.clone(),
        user_id: req.user_id.clone(),
        delta: req.delta,
    };
    timeout(SUBMIT_DEADLINE, record_score_delta(state.db_pool, &delta)).await??;

    Ok((
        StatusCode::ACCEPTED,
        Json(ScoreAccepted {
            season_id,
            user_id: req.user_id,
            queued: true,
        }),
    ))
}

#[instrument(skip(state))]
pub async fn leaderboard_top(
    State(state): State<Arc<AppState>>,
    Path(season_id): Path<String>,
    Query(params): Query<TopParams>,
) -> JsonResult<TopResponse> {
    if !(1..=1000).contains(&params.limit) {
        return Err(RouteError::InvalidLimit);
    }

    let entries = timeout(READ_DEADLINE, state.cache.top(&season_id, params.limit)).await??;
    let items = entries
        .into_iter()
        .map(|(user_id, score)| LeaderboardItem { user_id, score })
        .collect();

    Ok(Json(TopResponse { season_id, items }))
}

#[instrument(skip(state))]
pub async fn leaderboard_rank(
    State(state): State<Arc<AppState>>,
    Path(season_id): Path<String>,
    Query(params): Query<RankParams>,
) -> JsonResult<RankResponse> {
    if params.user_id.is_empty() {
        return Err(RouteError::MissingUser);
    }

    let ranked = timeout(READ_DEADLINE, state.cache.rank(&season_id, &params.user_id)).await??;
    let Some((rank, score)) = ranked else {
        return Err(RouteError::UserNotRanked);
    };

    Ok(Json(RankResponse {
        season_id,
        user_id: params.user_id,
        rank: rank + 1,
        score,
    }))
}

#[instrument(skip(state))]
pub async fn leaderboard_around(
    State(state): State<Arc<AppState>>,
    Path(season_id): Path<String>,
    Query(params): Query<AroundParams>,
) -> JsonResult<AroundResponse> {
    if params.user_id.is_empty() {
        return Err(RouteError::MissingUser);
    }
    if !(0..=100).contains(&params.range) {
        return Err(RouteError::InvalidRange);
    }

    let window = timeout(
        READ_DEADLINE,
        state.cache.around(&season_id, &params.user_id, params.range),
    )
    .await??;
    let Some((start, entries)) = window else {
        return Err(RouteError::UserNotRanked);
    };

    let items = entries
        .into_iter()
        .enumerate()
        .map(|(i, (user_id, score))| AroundItem {
            rank: start + i as i64 + 1,
            user_id,
            score,
        })
        .collect();

    Ok(Json(AroundResponse {
        season_id,
        user_id: params.user_id,
        range: params.range,
        items,
    }))
}

/// Recent ledger rows for a season, newest first; pass `userId` to narrow to
/// one user's history.
#[instrument(skip(state))]
pub async fn season_events(
    State(state): State<Arc<AppState>>,
    Path(season_id): Path<String>,
    Query(params): Query<EventsParams>,
) -> JsonResult<EventsResponse> {
    if !(1..=1000).contains(&params.limit) {
        return Err(RouteError::InvalidLimit);
    }

    let ledger = LedgerRepository::new(state.db_pool);
    let items = timeout(READ_DEADLINE, async {
        if params.user_id.is_empty() {
            ledger.season_events(&season_id, params.limit).await
        } else {
            ledger
                .user_events(&season_id, &params.user_id, params.limit)
                .await
        }
    })
    .await??;

    Ok(Json(EventsResponse { season_id, items }))
}

/// Drops the cached index first, then deletes the season's ledger and outbox
/// rows in one transaction. The two stores are not atomic with each other.
#[instrument(skip(state))]
pub async fn purge_season(
    State(state): State<Arc<AppState>>,
    Path(season_id): Path<String>,
) -> JsonResult<PurgeResponse> {
    timeout(SUBMIT_DEADLINE, async {
        state.cache.drop_season(&season_id).await?;
        delete_season_records(state.db_pool, &season_id).await?;
        Ok::<_, RouteError>(())
    })
    .await??;

    Ok(Json(PurgeResponse {
        season_id,
        deleted: true,
    }))
}

#[instrument(skip(state))]
pub async fn outbox_stats(
    State(state): State<Arc<AppState>>,
) -> JsonResult<OutboxStatsResponse> {
    let counts = timeout(
        READ_DEADLINE,
        OutboxRepository::new(state.db_pool).status_counts(),
    )
    .await??;

    Ok(Json(OutboxStatsResponse { counts }))
}

pub async fn healthz() -> Json<serde_json::Value> {
    Json(serde_json::json!({"status": "ok"}))
}

#[derive(Debug, Serialize)]
pub struct ReadyzResponse {
    pub status: &'static str,
    pub redis: &'static str,
    pub postgres: &'static str,
    pub schema: &'static str,
}

/// Per-dependency readiness: redis, postgres, then the outbox schema. Each
/// probe gets its own short deadline so a hung dependency cannot stall the
/// probe endpoint.
#[instrument(skip(state))]
pub async fn readyz(State(state): State<Arc<AppState>>) -> (StatusCode, Json<ReadyzResponse>) {
    let redis_ok = matches!(timeout(PROBE_DEADLINE, state.cache.ping()).await, Ok(Ok(())));
    if !redis_ok {
        return (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(ReadyzResponse {
                status: "not_ready",
                redis: "down",
                postgres: "unknown",
                schema: "unknown",
            }),
        );
    }

    let pg_ok = matches!(
        timeout(
            PROBE_DEADLINE,
            sqlx::query_scalar::<_, i32>("SELECT 1").fetch_one(state.db_pool),
        )
        .await,
        Ok(Ok(1))
    );
    if !pg_ok {
        return (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(ReadyzResponse {
                status: "not_ready",
                redis: "ok",
                postgres: "down",
                schema: "unknown",
            }),
        );
    }

    let schema_ok = matches!(
        timeout(
            PROBE_DEADLINE,
            sqlx::query("SELECT 1 FROM outbox LIMIT 1").execute(state.db_pool),
        )
        .await,
        Ok(Ok(_))
    );
    if !schema_ok {
        return (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(ReadyzResponse {
                status: "not_ready",
                redis: "ok",
                postgres: "ok",
                schema: "missing",
            }),
        );
    }

    (
        StatusCode::OK,
        Json(ReadyzResponse {
            status: "ready",
            redis: "ok",
            postgres: "ok",
            schema: "ok",
        }),
    )
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn submit_body_fields_default_when_absent() {
        let req: ScoreUpdateRequest = serde_json::from_str("{}").unwrap();
        assert_eq!(req.user_id, "");
        assert_eq!(req.delta, 0);
    }

    #[test]
    fn submit_body_rejects_unknown_fields() {
        let result = serde_json::from_str::<ScoreUpdateRequest>(
            r#"{"userId": "u1", "delta": 1, "score": 99}"#,
        );
        assert!(result.is_err());
    }

    #[test]
    fn query_params_carry_documented_defaults() {
        let top: TopParams = serde_json::from_str("{}").unwrap();
        assert_eq!(top.limit, 10);

        let around: AroundParams = serde_json::from_str(r#"{"userId": "u1"}"#).unwrap();
        assert_eq!(around.range, 5);

        let events: EventsParams = serde_json::from_str("{}").unwrap();
        assert_eq!(events.limit, 50);
    }
}
