use std::time::SystemTime;
use std::time::UNIX_EPOCH;

/// Wall clock in milliseconds since the epoch.
///
/// Used for lock queue scores and liveness stamps, which are compared
/// across processes.
pub(crate) fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}
