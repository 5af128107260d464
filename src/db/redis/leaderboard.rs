use redis::{AsyncCommands, Value, aio::ConnectionManager};
use tracing::instrument;

use crate::db::models::outbox::ScoreDelta;
use crate::db::redis::redis_pool::RedisResult;

/// Key of the per-season sorted set.
pub fn season_key(season_id: &str) -> String {
    format!("lb:{season_id}")
}

/// Bounds of the descending-rank window `around` reads, clipped at the top
/// of the board so the window never starts above rank 0.
fn window_bounds(rank: i64, radius: i64) -> (i64, i64) {
    ((rank - radius).max(0), rank + radius)
}

/// Per-season sorted index over cumulative scores. This is a fast mirror of
/// the ledger, not a source of truth; every write here originates from a
/// drained outbox row.
#[derive(Clone)]
pub struct LeaderboardCache {
    manager: ConnectionManager,
}

impl LeaderboardCache {
    pub fn new(manager: ConnectionManager) -> Self {
        Self { manager }
    }

    /// Adds `delta` to the user's score, creating the entry at zero first if
    /// absent. Returns the new cumulative score.
    #[instrument(skip(self))]
    pub async fn increment(
        &self,
        season_id: &str,
        user_id: &str,
        delta: i64,
    ) -> RedisResult<f64> {
        let mut conn = self.manager.clone();
        let score: f64 = conn.zincr(season_key(season_id), user_id, delta).await?;

        Ok(score)
    }

    /// Highest scores first, up to `limit` entries.
    #[instrument(skip(self))]
    pub async fn top(&self, season_id: &str, limit: i64) -> RedisResult<Vec<(String, f64)>> {
        let mut conn = self.manager.clone();
        let entries: Vec<(String, f64)> = conn
            .zrevrange_withscores(season_key(season_id), 0, (limit - 1) as isize)
            .await?;

        Ok(entries)
    }

    /// Zero-based descending rank and score, or `None` for an unranked user.
    #[instrument(skip(self))]
    pub async fn rank(&self, season_id: &str, user_id: &str) -> RedisResult<Option<(i64, f64)>> {
        let mut conn = self.manager.clone();
        let key = season_key(season_id);

        let mut pipe = redis::pipe();
        pipe.zrevrank(&key, user_id);
        pipe.zscore(&key, user_id);
        let (rank, score): (Option<i64>, Option<f64>) = pipe.query_async(&mut conn).await?;

        Ok(rank.zip(score))
    }

    /// Window of up to `2 * radius + 1` entries centered on the user. The
    /// returned offset is the zero-based rank of the first entry.
    #[instrument(skip(self))]
    pub async fn around(
        &self,
        season_id: &str,
        user_id: &str,
        radius: i64,
    ) -> RedisResult<Option<(i64, Vec<(String, f64)>)>> {
        let mut conn = self.manager.clone();
        let key = season_key(season_id);

        let rank: Option<i64> = conn.zrevrank(&key, user_id).await?;
        let Some(rank) = rank else {
            return Ok(None);
        };

        let (start, stop) = window_bounds(rank, radius);
        let entries: Vec<(String, f64)> = conn
            .zrevrange_withscores(&key, start as isize, stop as isize)
            .await?;

        Ok(Some((start, entries)))
    }

    #[instrument(skip(self))]
    pub async fn drop_season(&self, season_id: &str) -> RedisResult<()> {
        let mut conn = self.manager.clone();
        let _: () = conn.del(season_key(season_id)).await?;

        Ok(())
    }

    /// Dispatches one increment per delta as a single pipelined round trip.
    /// The reply holds one slot per operation, in dispatch order; callers
    /// account success per slot rather than per round trip.
    #[instrument(skip(self, deltas), fields(ops = deltas.len()))]
    pub async fn apply(&self, deltas: &[ScoreDelta]) -> RedisResult<Vec<Value>> {
        let mut conn = self.manager.clone();

        let mut pipe = redis::pipe();
        for delta in deltas {
            pipe.zincr(season_key(&delta.season_id), &delta.user_id, delta.delta);
        }
        let results: Vec<Value> = pipe.query_async(&mut conn).await?;

        Ok(results)
    }

    #[instrument(skip(self))]
    pub async fn ping(&self) -> RedisResult<()> {
        let mut conn = self.manager.clone();
        let _: String = redis::cmd("PING").query_async(&mut conn).await?;

        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn season_key_is_namespaced() {
        assert_eq!(season_key("s1"), "lb:s1");
    }

    #[test]
    fn window_clips_at_the_top() {
        assert_eq!(window_bounds(2, 5), (0, 7));
        assert_eq!(window_bounds(0, 5), (0, 5));
    }

    #[test]
    fn window_spans_both_sides_mid_board() {
        assert_eq!(window_bounds(10, 3), (7, 13));
        assert_eq!(window_bounds(10, 0), (10, 10));
    }
}
