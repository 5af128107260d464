use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Base ledger table model. Rows are written once on the submit path and only
/// ever removed by a season purge.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
#[serde(rename_all = "camelCase")]
pub struct ScoreEvent {
    pub id: i64,
    pub season_id: String,
    pub user_id: String,
    pub delta: i64,
    pub created_at: DateTime<Utc>,
}
