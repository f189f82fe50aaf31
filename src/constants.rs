//! System-wide configuration defaults and fixed protocol timings.

/// Fixed PENDING_ACK reservation lifetime. Not configurable: the scheduler
/// reverts a reservation to QUEUED after this elapses regardless of the
/// configured tick interval.
pub const PENDING_ACK_TIMEOUT_SECS: i64 = 30;

/// Fixed debounce on agent `lastSeen` writes.
pub const HEARTBEAT_DEBOUNCE_SECS: i64 = 10;

pub const DEFAULT_SCHEDULER_TICK_SECS: u64 = 1;

pub const DEFAULT_WAIT_TIMEOUT_SECS: u64 = 290;
pub const MIN_WAIT_TIMEOUT_SECS: u64 = 1;
pub const MAX_WAIT_TIMEOUT_SECS: u64 = 3600;

pub const DEFAULT_LOG_RETENTION_DAYS: i64 = 7;

pub const MAX_PROMPT_LENGTH: usize = 10_000;
pub const MAX_CONTEXT_KEY_LENGTH: usize = 100;
pub const MAX_CONTEXT_VALUE_LENGTH: usize = 1_000;

/// Security events truncate the logged prompt to this many characters
/// per the data model's `prompt (≤500 chars)` field.
pub const SECURITY_EVENT_PROMPT_TRUNCATE_LEN: usize = 500;
