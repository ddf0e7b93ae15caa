//! Shared constants for end-to-end tests

// ============================================================================
// Test Identities
// ============================================================================

/// Regular test user id, sent as `x-user-id`
pub const TEST_USER: &str = "alice";

/// A second regular user, for ownership checks
pub const OTHER_USER: &str = "bob";

/// Admin user id, sent with `x-user-role: admin`
pub const ADMIN_USER: &str = "ops";

// ============================================================================
// Timeouts
// ============================================================================

/// Maximum time to wait for server to become ready (milliseconds)
pub const SERVER_READY_TIMEOUT_MS: u64 = 5000;

/// Interval between server readiness checks (milliseconds)
pub const SERVER_READY_POLL_INTERVAL_MS: u64 = 50;

/// Default timeout for HTTP requests (seconds)
pub const REQUEST_TIMEOUT_SECS: u64 = 10;

/// Maximum time to wait for a task to reach an expected status (milliseconds)
pub const TASK_SETTLE_TIMEOUT_MS: u64 = 5000;
