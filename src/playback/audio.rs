//! Audio side of playback: the clock the scheduler corrects video against.

use std::sync::atomic::{AtomicBool, AtomicI32, AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{debug, trace, warn};

use crate::playback::Reader;
use crate::utils;

/// Autonomous audio playback thread as seen by the scheduler.
pub trait AudioWorker: Send + Sync {
    fn set_reader(&self, reader: Arc<dyn Reader>);
    fn start(&self);
    /// Stop and join within `timeout`. Returns false if the join timed out.
    fn stop(&self, timeout: Duration) -> bool;
    fn is_running(&self) -> bool;
    fn seek(&self, position: i64);
    fn set_speed(&self, speed: i32);
    /// Frame number currently being heard.
    fn current_frame_position(&self) -> i64;
}

struct ClockShared {
    position: AtomicI64,
    speed: AtomicI32,
    interval_ns: AtomicU64,
}

/// Audio clock thread that advances `speed` frames per nominal frame
/// interval of the current reader.
pub struct ClockAudioWorker {
    shared: Arc<ClockShared>,
    /// Clock thread and the cancel flag only that thread watches
    thread: Mutex<Option<(JoinHandle<()>, Arc<AtomicBool>)>>,
}

const CLOCK_POLL: Duration = Duration::from_millis(2);

impl ClockAudioWorker {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(ClockShared {
                position: AtomicI64::new(0),
                speed: AtomicI32::new(1),
                interval_ns: AtomicU64::new(0),
            }),
            thread: Mutex::new(None),
        }
    }

    fn run(shared: Arc<ClockShared>, cancel: Arc<AtomicBool>) {
        trace!("Audio clock started");
        let mut carry = Duration::ZERO;
        let mut last = Instant::now();

        while !cancel.load(Ordering::Acquire) {
            thread::sleep(CLOCK_POLL);
            let now = Instant::now();
            carry += now - last;
            last = now;

            let interval = Duration::from_nanos(shared.interval_ns.load(Ordering::Acquire));
            if interval.is_zero() {
                carry = Duration::ZERO;
                continue;
            }
            while carry >= interval {
                carry -= interval;
                let speed = shared.speed.load(Ordering::Acquire) as i64;
                shared.position.fetch_add(speed, Ordering::AcqRel);
            }
        }
        trace!("Audio clock stopped");
    }
}

impl Default for ClockAudioWorker {
    fn default() -> Self {
        Self::new()
    }
}

impl AudioWorker for ClockAudioWorker {
    fn set_reader(&self, reader: Arc<dyn Reader>) {
        let interval = reader.info().frame_interval();
        self.shared
            .interval_ns
            .store(interval.as_nanos() as u64, Ordering::Release);
        debug!("Audio clock interval set to {:?}", interval);
    }

    fn start(&self) {
        let mut thread = self.thread.lock();
        if thread.is_some() {
            return;
        }
        let shared = Arc::clone(&self.shared);
        let cancel = Arc::new(AtomicBool::new(false));
        let token = Arc::clone(&cancel);
        match thread::Builder::new()
            .name("chronoframe-audio".into())
            .spawn(move || Self::run(shared, token))
        {
            Ok(handle) => *thread = Some((handle, cancel)),
            Err(e) => warn!("Failed to spawn audio thread: {}", e),
        }
    }

    fn stop(&self, timeout: Duration) -> bool {
        match self.thread.lock().take() {
            Some((handle, cancel)) => {
                cancel.store(true, Ordering::Release);
                utils::join_with_timeout(handle, timeout, "audio")
            }
            None => true,
        }
    }

    fn is_running(&self) -> bool {
        self.thread.lock().is_some()
    }

    fn seek(&self, position: i64) {
        self.shared.position.store(position, Ordering::Release);
    }

    fn set_speed(&self, speed: i32) {
        self.shared.speed.store(speed, Ordering::Release);
    }

    fn current_frame_position(&self) -> i64 {
        self.shared.position.load(Ordering::Acquire)
    }
}

impl Drop for ClockAudioWorker {
    fn drop(&mut self) {
        self.stop(Duration::from_millis(500));
    }
}
