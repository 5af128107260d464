pub mod outbox;
pub mod score_event;
