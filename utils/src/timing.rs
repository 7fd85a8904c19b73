// Timekeeping helpers for logging and profiling

use std::time::{SystemTime, UNIX_EPOCH};

/// Returns the number of milliseconds since the unix epoch.
///
/// Used to stamp log lines and to measure coarse frame timings.
pub fn get_current_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("System time is before the unix epoch")
        .as_millis() as u64
}
