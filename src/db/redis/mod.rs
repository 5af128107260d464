pub mod leaderboard;
pub mod redis_pool;
