use std::time::Duration;

pub const SERVER_PORT: u16 = 8080;

/// Submit bodies past this point are cut off by the body-limit layer.
pub const MAX_BODY_BYTES: usize = 1 << 20; // 1 MiB

pub const PG_MAX_CONNECTIONS: u32 = 50;

pub const SUBMIT_DEADLINE: Duration = Duration::from_millis(800);
pub const READ_DEADLINE: Duration = Duration::from_millis(300);
pub const PROBE_DEADLINE: Duration = Duration::from_millis(200);

pub const DRAIN_TICK: Duration = Duration::from_millis(50);
pub const DRAIN_CYCLE_DEADLINE: Duration = Duration::from_secs(5);
pub const DRAIN_BATCH_SIZE: i64 = 500;

pub const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);
