use std::sync::Arc;

use futures::future::join_all;
use tokio::sync::watch;

use leaderboard::api::server::{AppState, start_server};
use leaderboard::constants::SHUTDOWN_GRACE;
use leaderboard::db::db_pool;
use leaderboard::db::prelude::LeaderboardCache;
use leaderboard::db::redis::redis_pool::redis_pool;
use leaderboard::util;
use leaderboard::worker::start_drain_worker;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    util::tracing::build_subscriber();
    tracing::info!("starting leaderboard service");

    let db_pool = db_pool().await?;
    let redis = redis_pool().await?;
    let cache = LeaderboardCache::new(redis.manager.clone());

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let worker_handle = start_drain_worker(db_pool, cache.clone(), shutdown_rx.clone());

    let state = Arc::new(AppState { db_pool, cache });
    let server_handle = start_server(state, shutdown_rx).await?;

    shutdown_signal().await;
    tracing::info!("shutdown signal received");
    _ = shutdown_tx.send(true);

    let drained = join_all([worker_handle, server_handle]);
    if tokio::time::timeout(SHUTDOWN_GRACE, drained).await.is_err() {
        tracing::warn!("shutdown grace period elapsed with tasks still running");
    } else {
        tracing::info!("server stopped gracefully");
    }

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = ?e, "failed to install ctrl-c handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{SignalKind, signal};

        match signal(SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::error!(error = ?e, "failed to install sigterm handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
