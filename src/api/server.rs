use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;

use axum::extract::{DefaultBodyLimit, MatchedPath, Request};
use axum::middleware::{Next, from_fn};
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use http::StatusCode;
use serde::Serialize;
use sqlx::PgPool;
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tower_http::trace::TraceLayer;
use tracing::instrument;

use crate::api::handler::*;
use crate::constants::{MAX_BODY_BYTES, SERVER_PORT};
use crate::db::prelude::LeaderboardCache;
use crate::db::redis::redis_pool::RedisErr;

pub type JsonResult<T> = core::result::Result<Json<T>, RouteError>;

#[derive(Clone)]
pub struct AppState {
    pub db_pool: &'static PgPool,
    pub cache: LeaderboardCache,
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        //
        // probes
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        //
        // write side
        .route("/v1/seasons/{sid}/scores", post(submit_score))
        .route("/v1/seasons/{sid}", delete(purge_season))
        //
        // read side, served from the sorted index
        .route("/v1/seasons/{sid}/leaderboard/top", get(leaderboard_top))
        .route("/v1/seasons/{sid}/leaderboard/rank", get(leaderboard_rank))
        .route(
            "/v1/seasons/{sid}/leaderboard/around",
            get(leaderboard_around),
        )
        //
        // ledger audit trail and operator visibility
        .route("/v1/seasons/{sid}/events", get(season_events))
        .route("/v1/outbox/stats", get(outbox_stats))
        .layer(DefaultBodyLimit::max(MAX_BODY_BYTES))
        .layer(
            TraceLayer::new_for_http().make_span_with(|req: &axum::http::Request<_>| {
                let method = req.method();
                let uri = req.uri();

                let matched_path = req
                    .extensions()
                    .get::<MatchedPath>()
                    .map(|matched| matched.as_str());

                tracing::debug_span!("api_request", ?method, ?uri, ?matched_path)
            }),
        )
        .layer(from_fn(log_route_errors))
        .with_state(state)
}

/// Custom error trace handler for `RouteError`-type responses; route handlers
/// stash the original error in response extensions on the way out.
#[instrument(skip(request, next), fields(uri = request.uri().to_string()))]
async fn log_route_errors(request: Request, next: Next) -> Response {
    let res = next.run(request).await;
    if let Some(err) = res.extensions().get::<Arc<RouteError>>() {
        tracing::error!(error = ?err, "error occurred inside route handler");
    }

    res
}

#[instrument(skip(state, shutdown))]
pub async fn start_server(
    state: Arc<AppState>,
    mut shutdown: watch::Receiver<bool>,
) -> std::io::Result<JoinHandle<()>> {
    let app = router(state);

    let socket_addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), SERVER_PORT);
    let listener = tokio::net::TcpListener::bind(socket_addr).await?;
    tracing::info!(
        server_url = &format!("http://127.0.0.1:{}", SERVER_PORT),
        "server ready"
    );

    let handle = tokio::task::spawn(async move {
        let drained = async move {
            _ = shutdown.changed().await;
        };

        if let Err(e) = axum::serve(listener, app).with_graceful_shutdown(drained).await {
            tracing::error!(error = ?e, "server exited with error");
        }
    });

    Ok(handle)
}

#[derive(Debug, Error)]
pub enum RouteError {
    #[error("invalid json")]
    InvalidJson(#[source] serde_json::Error),

    #[error("request body too large")]
    OversizedBody,

    #[error("userId is required")]
    MissingUser,

    #[error("delta must be non-zero")]
    ZeroDelta,

    #[error("limit must be 1..1000")]
    InvalidLimit,

    #[error("range must be 0..100")]
    InvalidRange,

    #[error("user not found in leaderboard")]
    UserNotRanked,

    #[error(transparent)]
    SqlxError(#[from] sqlx::Error),

    #[error("redis error: {0}")]
    RedisError(#[from] RedisErr),

    #[error("deadline exceeded")]
    DeadlineExceeded(#[from] tokio::time::error::Elapsed),
}

impl IntoResponse for RouteError {
    fn into_response(self) -> Response {
        #[derive(Serialize)]
        struct ErrorResponse {
            error: String,
        }

        let (status, error, err) = match &self {
            RouteError::InvalidJson(_) => {
                (StatusCode::BAD_REQUEST, self.to_string(), Some(self))
            }

            RouteError::OversizedBody | RouteError::MissingUser | RouteError::ZeroDelta => {
                (StatusCode::BAD_REQUEST, self.to_string(), None)
            }

            RouteError::InvalidLimit | RouteError::InvalidRange => {
                (StatusCode::BAD_REQUEST, self.to_string(), None)
            }

            RouteError::UserNotRanked => (StatusCode::NOT_FOUND, self.to_string(), None),

            RouteError::SqlxError(err) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                err.to_string(),
                Some(self),
            ),

            RouteError::RedisError(_) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                String::from("redis error"),
                Some(self),
            ),

            RouteError::DeadlineExceeded(_) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                self.to_string(),
                Some(self),
            ),
        };

        let mut response = (status, Json(ErrorResponse { error })).into_response();
        if let Some(err) = err {
            response.extensions_mut().insert(Arc::new(err));
        }

        response
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn client_faults_map_to_400() {
        for err in [
            RouteError::OversizedBody,
            RouteError::MissingUser,
            RouteError::ZeroDelta,
            RouteError::InvalidLimit,
            RouteError::InvalidRange,
        ] {
            assert_eq!(err.into_response().status(), StatusCode::BAD_REQUEST);
        }
    }

    #[test]
    fn unranked_user_maps_to_404() {
        let status = RouteError::UserNotRanked.into_response().status();
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[test]
    fn store_faults_map_to_500() {
        let err = RouteError::SqlxError(sqlx::Error::PoolTimedOut);
        assert_eq!(
            err.into_response().status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }
}
