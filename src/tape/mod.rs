//! Tape library control engine.

use std::path::Path;
use std::time::Duration;

pub mod changer;
pub mod events;
pub mod library;
pub mod lock;
pub mod ltfs;
pub mod operations;
pub mod repository;
pub mod scheduler;

pub use library::Library;

/// Cache window for `mtx status` refreshes.
pub const STATUS_CACHE_WINDOW: Duration = Duration::from_secs(15);

/// How long a caller waits for an operation before getting an
/// `Ongoing` snapshot to poll.
pub const EARLY_REPLY_WINDOW: Duration = Duration::from_secs(15);

/// Advisory retry pause handed to callers on busy replies (seconds).
pub const WAIT_BEFORE_NEXT_SECS: u64 = 15;

/// Advisory poll interval for ongoing operations (seconds).
pub const TRACE_POLL_INTERVAL_SECS: u64 = 30;

pub const DRIVE_LOCK_TTL: Duration = Duration::from_secs(5 * 60);
pub const CHANGER_LOCK_TTL: Duration = Duration::from_secs(5 * 60);
/// Shorter TTL for robot motions known to be quick (transfer).
pub const CHANGER_LOCK_TTL_SHORT: Duration = Duration::from_secs(2 * 60);

/// Terminal operations are evicted this long after completion.
pub const OPERATION_RETENTION: Duration = Duration::from_secs(60 * 60);

/// Resolves a tool binary against its configured directory.
pub fn tool_path(base: &Option<String>, name: &str) -> String {
    match base {
        Some(dir) => Path::new(dir).join(name).to_string_lossy().into_owned(),
        None => name.to_string(),
    }
}
