//! Stable exit codes for casework CLI commands.

/// Command succeeded; a processed request left no shortfalls.
pub const OK: i32 = 0;
/// Command failed due to invalid config, storage, or arguments.
pub const INVALID: i32 = 1;
/// `casework process` finished with shortfalls, rejected files, or a failed workflow.
pub const INCOMPLETE: i32 = 2;
/// `casework process` could not resolve the request and needs the caller.
pub const NEEDS_INPUT: i32 = 3;
