use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use tracing::{debug, warn};

/// Conversion workers to use when the config asks for automatic sizing.
pub fn default_worker_count() -> usize {
    num_cpus::get().max(1)
}

/// Join `handle` if it finishes within `timeout`.
///
/// Returns false when the deadline passes first. The thread is then left
/// detached and teardown carries on without it.
pub fn join_with_timeout(handle: JoinHandle<()>, timeout: Duration, name: &str) -> bool {
    let deadline = Instant::now() + timeout;
    while !handle.is_finished() {
        if Instant::now() >= deadline {
            warn!("{} thread did not stop within {:?}, detaching", name, timeout);
            return false;
        }
        thread::sleep(Duration::from_millis(1));
    }
    if handle.join().is_err() {
        warn!("{} thread panicked", name);
    }
    debug!("{} thread stopped", name);
    true
}
