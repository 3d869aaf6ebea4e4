// Metrics for lock operations
// Recorded through the `metrics` facade; exporting them is up to the application

use metrics::{describe_counter, describe_histogram};

pub const LOCK_ACQUIRED_TOTAL: &str = "objsync_lock_acquired_total";
pub const LOCK_CONTENDED_TOTAL: &str = "objsync_lock_contended_total";
pub const LOCK_RELEASED_TOTAL: &str = "objsync_lock_released_total";
pub const LOCK_STALE_RELEASE_TOTAL: &str = "objsync_lock_stale_release_total";
pub const LOCK_RENEWED_TOTAL: &str = "objsync_lock_renewed_total";
pub const LOCK_WAIT_SECONDS: &str = "objsync_lock_wait_seconds";

/// Register metric descriptions
/// Should be called once at application startup, after installing a recorder
pub fn describe_metrics() {
    describe_counter!(
        LOCK_ACQUIRED_TOTAL,
        "Total number of successful lock acquisitions"
    );
    describe_counter!(
        LOCK_CONTENDED_TOTAL,
        "Total number of acquisition attempts lost to another holder or a concurrent writer"
    );
    describe_counter!(LOCK_RELEASED_TOTAL, "Total number of lock releases");
    describe_counter!(
        LOCK_STALE_RELEASE_TOTAL,
        "Total number of releases skipped because the lock had already been reassigned"
    );
    describe_counter!(LOCK_RENEWED_TOTAL, "Total number of lease extensions");
    describe_histogram!(
        LOCK_WAIT_SECONDS,
        "Time spent in blocking lock acquisition in seconds"
    );
}
