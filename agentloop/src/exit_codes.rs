//! Stable exit codes for `agentloop` commands.

/// Command succeeded (attempt made progress, checkpoint found, ...).
pub const OK: i32 = 0;
/// Invalid config, arguments or any other error.
pub const INVALID: i32 = 1;
/// The attempt ran and failed (or a task loop left tasks incomplete).
pub const FAILED: i32 = 2;
/// The attempt never started: circuit open or no concurrency slot.
pub const REJECTED: i32 = 3;
/// The attempt was killed after its timeout.
pub const TIMED_OUT: i32 = 4;
/// `resume`/`clear` found no checkpoint.
pub const NOT_FOUND: i32 = 5;
/// Interrupted (SIGINT/SIGTERM); running agents were stopped first.
pub const CANCELLED: i32 = 130;
