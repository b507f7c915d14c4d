//! Playback scheduler: paces frames from a [`Reader`] to the render worker
//! at the source frame rate and corrects drift against the audio clock.
//!
//! # Tick
//!
//! 1. speed 0: wait one frame interval, position unchanged.
//! 2. Advance the video position by `speed` and fetch that frame. Reader
//!    failures are logged and nothing is rendered this tick.
//! 3. Hand the frame to the render worker and wait for its acknowledgement.
//! 4. With both streams present, `diff = video - audio` in frames.
//! 5. `sleep = interval - elapsed + diff * interval`, floored at zero.
//!
//! Cancellation is cooperative: the run generation is checked once per tick
//! and interrupts the inter-tick sleep. A control thread that outlives a
//! timed-out join exits at its next check instead of rejoining a later run.

use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{debug, info, instrument, trace, warn};

use crate::playback::{
    AudioWorker, PlaybackState, PlaybackStatus, Reader, Renderer, VideoRenderWorker,
};
use crate::{utils, PlaybackConfig};

/// Outcome of one scheduler tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TickReport {
    pub position: i64,
    pub rendered: bool,
    /// Video minus audio position, when both streams exist
    pub diff: Option<i64>,
    pub elapsed: Duration,
    pub sleep: Duration,
}

/// Time to wait before the next tick.
///
/// `diff` is video minus audio in frames: ahead waits longer, behind waits
/// less. Negative results become zero.
pub fn compute_sleep(frame_interval: Duration, elapsed: Duration, diff: Option<i64>) -> Duration {
    let interval = frame_interval.as_nanos() as i128;
    let mut sleep = interval - elapsed.as_nanos() as i128;
    if let Some(diff) = diff {
        sleep += diff as i128 * interval;
    }
    if sleep <= 0 {
        return Duration::ZERO;
    }
    Duration::from_nanos(sleep.min(u64::MAX as i128) as u64)
}

struct Shared {
    reader: Arc<dyn Reader>,
    audio: Arc<dyn AudioWorker>,
    video: VideoRenderWorker,
    state: PlaybackState,
    worker_timeout: Duration,
}

/// Drives playback of one reader on its own control thread.
pub struct PlaybackScheduler {
    shared: Arc<Shared>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl PlaybackScheduler {
    pub fn new(
        reader: Arc<dyn Reader>,
        audio: Arc<dyn AudioWorker>,
        renderer: impl Renderer + 'static,
        config: &PlaybackConfig,
    ) -> Self {
        audio.set_reader(Arc::clone(&reader));
        let video = VideoRenderWorker::new(renderer, Duration::from_millis(config.render_timeout_ms));
        Self {
            shared: Arc::new(Shared {
                reader,
                audio,
                video,
                state: PlaybackState::new(config.speed),
                worker_timeout: Duration::from_millis(config.stop_timeout_ms),
            }),
            thread: Mutex::new(None),
        }
    }

    pub fn state(&self) -> &PlaybackState {
        &self.shared.state
    }

    pub fn status(&self) -> PlaybackStatus {
        self.shared.state.status()
    }

    pub fn video_position(&self) -> i64 {
        self.shared.state.video_position()
    }

    pub fn speed(&self) -> i32 {
        self.shared.state.speed()
    }

    pub fn reader(&self) -> &Arc<dyn Reader> {
        &self.shared.reader
    }

    /// Frames the render worker has put on screen.
    pub fn rendered(&self) -> u64 {
        self.shared.video.rendered()
    }

    /// Start (or restart) playback. Refused while the video position is negative.
    pub fn start(&self) -> bool {
        if self.shared.state.video_position() < 0 {
            warn!(
                "Refusing to start playback at position {}",
                self.shared.state.video_position()
            );
            return false;
        }
        self.stop(self.shared.worker_timeout);

        let mut thread = self.thread.lock();
        let generation = self.shared.state.begin_run();
        let shared = Arc::clone(&self.shared);
        match thread::Builder::new()
            .name("chronoframe-player".into())
            .spawn(move || shared.run(generation))
        {
            Ok(handle) => {
                *thread = Some(handle);
                true
            }
            Err(e) => {
                warn!("Failed to spawn playback thread: {}", e);
                self.shared.state.end_run();
                false
            }
        }
    }

    /// Request stop and join the control thread within `timeout`.
    ///
    /// Teardown proceeds whether or not the join succeeds.
    pub fn stop(&self, timeout: Duration) -> bool {
        self.shared.state.end_run();
        let joined = match self.thread.lock().take() {
            Some(handle) => utils::join_with_timeout(handle, timeout, "playback"),
            None => true,
        };
        self.shared.stop_workers();
        joined
    }

    /// Jump to `position` (> 0) and tell the audio worker. Other values are ignored.
    pub fn seek(&self, position: i64) {
        self.shared.seek(position);
    }

    /// Change step size and direction without restarting any thread.
    pub fn set_speed(&self, speed: i32) {
        self.shared.set_speed(speed);
    }

    /// Run a single tick on the calling thread.
    pub fn tick(&self) -> TickReport {
        self.shared.tick()
    }

    /// Start the render and audio workers the source needs, without the control loop.
    pub fn start_workers(&self) {
        self.shared.start_workers();
    }

    pub fn stop_workers(&self) {
        self.shared.stop_workers();
    }
}

impl Shared {
    fn has_both_streams(&self) -> bool {
        let info = self.reader.info();
        info.has_audio && info.has_video
    }

    fn seek(&self, position: i64) {
        if position > 0 {
            self.state.set_video_position(position);
            self.audio.seek(position);
            debug!("Seek to frame {}", position);
        }
    }

    fn set_speed(&self, speed: i32) {
        self.state.set_speed(speed);
        if self.reader.info().has_audio {
            self.audio.set_speed(speed);
        }
        debug!("Playback speed set to {}", speed);
    }

    fn start_workers(&self) {
        let info = self.reader.info();
        self.audio.set_reader(Arc::clone(&self.reader));
        if info.has_audio {
            self.audio.start();
        }
        if info.has_video {
            self.video.start();
        }
    }

    fn stop_workers(&self) {
        if self.audio.is_running() {
            self.audio.stop(self.worker_timeout);
        }
        if self.video.is_running() {
            self.video.stop(self.worker_timeout);
        }
    }

    #[instrument(skip(self))]
    fn run(&self, generation: u64) {
        self.stop_workers();
        self.start_workers();

        let interval = self.reader.info().frame_interval();
        info!("Playback started at frame {}, {:?} per frame", self.state.video_position(), interval);

        while self.state.is_current(generation) {
            if self.state.speed() == 0 {
                self.state.sleep_while_current(generation, interval);
                continue;
            }
            let report = self.tick();
            if !report.sleep.is_zero() {
                self.state.sleep_while_current(generation, report.sleep);
            }
        }

        // Workers are torn down by stop(); by now they may belong to a newer run
        info!("Playback stopped at frame {}", self.state.video_position());
    }

    fn tick(&self) -> TickReport {
        let interval = self.reader.info().frame_interval();
        let speed = self.state.speed();
        if speed == 0 {
            return TickReport {
                position: self.state.video_position(),
                rendered: false,
                diff: None,
                elapsed: Duration::ZERO,
                sleep: interval,
            };
        }

        let started = Instant::now();
        let position = self.state.advance_video(speed);

        let rendered = match self.reader.frame_at(position) {
            Ok(frame) => match self.video.render(frame) {
                Ok(()) => true,
                Err(e) => {
                    warn!("Frame {} not rendered: {}", position, e);
                    false
                }
            },
            Err(e) => {
                debug!("No frame at {}: {}", position, e);
                false
            }
        };

        let diff = if self.has_both_streams() {
            let audio_position = self.audio.current_frame_position();
            self.state.set_audio_position(audio_position);
            let diff = self.state.video_position() - audio_position;
            metrics::histogram!("av_drift_frames").record(diff as f64);
            Some(diff)
        } else {
            None
        };

        let elapsed = started.elapsed();
        let sleep = compute_sleep(interval, elapsed, diff);
        metrics::histogram!("playback_sleep_ms").record(sleep.as_secs_f64() * 1000.0);
        trace!("Tick at {}: diff {:?}, render {:?}, sleep {:?}", position, diff, elapsed, sleep);

        TickReport {
            position,
            rendered,
            diff,
            elapsed,
            sleep,
        }
    }
}

impl Drop for PlaybackScheduler {
    fn drop(&mut self) {
        self.stop(self.shared.worker_timeout);
    }
}
