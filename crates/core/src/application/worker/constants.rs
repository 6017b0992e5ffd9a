// Controller constants (no magic values)
use std::time::Duration;

/// tracing target for per-window metrics records
pub const METRICS_TARGET: &str = "orderpool::metrics";

/// How long shutdown waits for consumers to drain in-flight messages (5s)
pub const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Malformed or failed messages are nacked without requeue
pub const REQUEUE_ON_FAILURE: bool = false;
