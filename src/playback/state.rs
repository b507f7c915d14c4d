//! Playback state shared by the scheduler, its callers and the audio side.

use std::sync::atomic::{AtomicBool, AtomicI32, AtomicI64, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaybackStatus {
    Stopped,
    Running,
    /// Running with speed 0
    Paused,
}

/// Positions, speed and the run flag, each individually atomic.
///
/// Writers use `Release` and readers `Acquire`, so a position read on
/// another thread is never torn and never older than the store it follows.
///
/// Each run gets a generation number. A control loop only keeps going while
/// its own generation is current, so a loop left detached by a timed-out
/// join exits even after playback is started again.
pub struct PlaybackState {
    video_position: AtomicI64,
    audio_position: AtomicI64,
    speed: AtomicI32,
    running: AtomicBool,
    generation: AtomicU64,
    wake: Mutex<()>,
    wake_cv: Condvar,
}

impl PlaybackState {
    pub fn new(speed: i32) -> Self {
        Self {
            video_position: AtomicI64::new(0),
            audio_position: AtomicI64::new(0),
            speed: AtomicI32::new(speed),
            running: AtomicBool::new(false),
            generation: AtomicU64::new(0),
            wake: Mutex::new(()),
            wake_cv: Condvar::new(),
        }
    }

    pub fn video_position(&self) -> i64 {
        self.video_position.load(Ordering::Acquire)
    }

    pub fn set_video_position(&self, position: i64) {
        self.video_position.store(position, Ordering::Release);
    }

    /// Step the video position by `speed` and return the new value.
    pub fn advance_video(&self, speed: i32) -> i64 {
        self.video_position
            .fetch_add(speed as i64, Ordering::AcqRel)
            + speed as i64
    }

    /// Last audio position the scheduler observed.
    pub fn audio_position(&self) -> i64 {
        self.audio_position.load(Ordering::Acquire)
    }

    pub fn set_audio_position(&self, position: i64) {
        self.audio_position.store(position, Ordering::Release);
    }

    pub fn speed(&self) -> i32 {
        self.speed.load(Ordering::Acquire)
    }

    pub fn set_speed(&self, speed: i32) {
        self.speed.store(speed, Ordering::Release);
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    pub fn set_running(&self, running: bool) {
        self.running.store(running, Ordering::Release);
        if !running {
            let _guard = self.wake.lock();
            self.wake_cv.notify_all();
        }
    }

    /// Mark playback running under a fresh generation and return it.
    pub fn begin_run(&self) -> u64 {
        let generation = self.generation.fetch_add(1, Ordering::AcqRel) + 1;
        self.running.store(true, Ordering::Release);
        let _guard = self.wake.lock();
        self.wake_cv.notify_all();
        generation
    }

    /// Retire the current generation and stop.
    pub fn end_run(&self) {
        self.generation.fetch_add(1, Ordering::AcqRel);
        self.set_running(false);
    }

    /// True while running under `generation`.
    pub fn is_current(&self, generation: u64) -> bool {
        self.is_running() && self.generation.load(Ordering::Acquire) == generation
    }

    pub fn status(&self) -> PlaybackStatus {
        if !self.is_running() {
            PlaybackStatus::Stopped
        } else if self.speed() == 0 {
            PlaybackStatus::Paused
        } else {
            PlaybackStatus::Running
        }
    }

    /// Sleep for `duration` unless `generation` stops being current first.
    ///
    /// Returns true if the full duration elapsed with the generation still current.
    pub fn sleep_while_current(&self, generation: u64, duration: Duration) -> bool {
        let deadline = Instant::now() + duration;
        let mut guard = self.wake.lock();
        while self.is_current(generation) {
            if self.wake_cv.wait_until(&mut guard, deadline).timed_out() {
                return self.is_current(generation);
            }
        }
        false
    }
}
