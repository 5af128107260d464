use serde::{Deserialize, Serialize};

pub const EVENT_SCORE_DELTA: &str = "score_delta";

/// Lifecycle of an outbox row. `done` and `failed` are terminal; a row moves
/// back from `processing` to `pending` when its cache effect must be retried
/// or its claiming transaction aborts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutboxStatus {
    Pending,
    Processing,
    Done,
    Failed,
}

impl OutboxStatus {
    pub const fn as_str(self) -> &'static str {
        match self {
            OutboxStatus::Pending => "pending",
            OutboxStatus::Processing => "processing",
            OutboxStatus::Done => "done",
            OutboxStatus::Failed => "failed",
        }
    }
}

/// Payload carried by a `score_delta` outbox row; exactly the three fields
/// the submit path accepted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScoreDelta {
    pub season_id: String,
    pub user_id: String,
    pub delta: i64,
}

/// Row shape returned by the claim query.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct ClaimedEntry {
    pub id: i64,
    pub event_type: String,
    pub payload: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct StatusCount {
    pub status: String,
    pub count: i64,
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn status_tags_match_stored_text() {
        assert_eq!(OutboxStatus::Pending.as_str(), "pending");
        assert_eq!(OutboxStatus::Processing.as_str(), "processing");
        assert_eq!(OutboxStatus::Done.as_str(), "done");
        assert_eq!(OutboxStatus::Failed.as_str(), "failed");
    }

    #[test]
    fn payload_uses_wire_field_names() {
        let delta: ScoreDelta =
            serde_json::from_str(r#"{"seasonId":"s1","userId":"u1","delta":-3}"#).unwrap();
        assert_eq!(delta.season_id, "s1");
        assert_eq!(delta.user_id, "u1");
        assert_eq!(delta.delta, -3);
    }
}
