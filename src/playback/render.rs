//! Video render worker: receives one frame per scheduler tick over a
//! rendezvous channel and acknowledges once it is on screen.
//!
//! Every handoff carries a sequence number and its acknowledgement echoes
//! it, so a late ack from a handoff that already timed out is never taken
//! for the current one.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use flume::{Receiver, RecvTimeoutError, SendTimeoutError, Sender};
use parking_lot::Mutex;
use tracing::{debug, trace, warn};

use crate::error::RenderError;
use crate::utils;
use crate::Frame;

/// Surface that puts a frame on screen.
pub trait Renderer: Send {
    fn render(&mut self, frame: &Frame) -> Result<(), RenderError>;
}

impl<F> Renderer for F
where
    F: FnMut(&Frame) -> Result<(), RenderError> + Send,
{
    fn render(&mut self, frame: &Frame) -> Result<(), RenderError> {
        self(frame)
    }
}

type Ack = (u64, Result<(), RenderError>);

#[derive(Clone)]
struct Handoff {
    frame_tx: Sender<(u64, Arc<Frame>)>,
    done_rx: Receiver<Ack>,
}

/// Thread handle plus the cancel flag only that thread watches.
struct Running {
    handle: JoinHandle<()>,
    cancel: Arc<AtomicBool>,
}

const RECV_POLL: Duration = Duration::from_millis(20);

pub struct VideoRenderWorker {
    renderer: Arc<Mutex<Box<dyn Renderer>>>,
    handoff: Mutex<Option<Handoff>>,
    thread: Mutex<Option<Running>>,
    next_handoff: AtomicU64,
    rendered: Arc<AtomicU64>,
    timeout: Duration,
}

impl VideoRenderWorker {
    /// `timeout` bounds each half of the handoff.
    pub fn new(renderer: impl Renderer + 'static, timeout: Duration) -> Self {
        Self {
            renderer: Arc::new(Mutex::new(Box::new(renderer))),
            handoff: Mutex::new(None),
            thread: Mutex::new(None),
            next_handoff: AtomicU64::new(0),
            rendered: Arc::new(AtomicU64::new(0)),
            timeout,
        }
    }

    pub fn is_running(&self) -> bool {
        self.thread.lock().is_some()
    }

    /// Frames rendered since construction.
    pub fn rendered(&self) -> u64 {
        self.rendered.load(Ordering::Relaxed)
    }

    pub fn start(&self) {
        let mut thread = self.thread.lock();
        if thread.is_some() {
            return;
        }

        let (frame_tx, frame_rx) = flume::bounded(0);
        let (done_tx, done_rx) = flume::unbounded();
        let renderer = Arc::clone(&self.renderer);
        let cancel = Arc::new(AtomicBool::new(false));
        let rendered = Arc::clone(&self.rendered);

        let spawned = {
            let cancel = Arc::clone(&cancel);
            thread::Builder::new()
                .name("chronoframe-render".into())
                .spawn(move || Self::run(frame_rx, done_tx, renderer, cancel, rendered))
        };

        match spawned {
            Ok(handle) => {
                *self.handoff.lock() = Some(Handoff { frame_tx, done_rx });
                *thread = Some(Running { handle, cancel });
            }
            Err(e) => warn!("Failed to spawn render thread: {}", e),
        }
    }

    fn run(
        frame_rx: Receiver<(u64, Arc<Frame>)>,
        done_tx: Sender<Ack>,
        renderer: Arc<Mutex<Box<dyn Renderer>>>,
        cancel: Arc<AtomicBool>,
        rendered: Arc<AtomicU64>,
    ) {
        trace!("Render worker started");
        while !cancel.load(Ordering::Acquire) {
            let (seq, frame) = match frame_rx.recv_timeout(RECV_POLL) {
                Ok(handoff) => handoff,
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => break,
            };

            let started = Instant::now();
            let result = renderer.lock().render(&frame);
            metrics::histogram!("render_time_us").record(started.elapsed().as_micros() as f64);
            if result.is_ok() {
                rendered.fetch_add(1, Ordering::Relaxed);
            }
            // Receiver is gone once the worker has been stopped
            let _ = done_tx.send((seq, result));
        }
        trace!("Render worker stopped");
    }

    /// Hand `frame` over and block until the worker reports that very frame rendered.
    pub fn render(&self, frame: Arc<Frame>) -> Result<(), RenderError> {
        let Some(handoff) = self.handoff.lock().clone() else {
            return Err(RenderError::NotRunning);
        };
        let seq = self.next_handoff.fetch_add(1, Ordering::Relaxed);

        handoff
            .frame_tx
            .send_timeout((seq, frame), self.timeout)
            .map_err(|e| match e {
                SendTimeoutError::Timeout(_) => RenderError::Timeout(self.timeout),
                SendTimeoutError::Disconnected(_) => RenderError::NotRunning,
            })?;

        let deadline = Instant::now() + self.timeout;
        loop {
            match handoff.done_rx.recv_deadline(deadline) {
                Ok((acked, result)) if acked == seq => return result,
                Ok((acked, _)) => trace!("Discarding late ack for handoff {}", acked),
                Err(RecvTimeoutError::Timeout) => return Err(RenderError::Timeout(self.timeout)),
                Err(RecvTimeoutError::Disconnected) => return Err(RenderError::NotRunning),
            }
        }
    }

    /// Stop the worker, joining within `timeout`. Returns false if the join timed out.
    ///
    /// The stopped thread never renders another handoff, even if it outlives
    /// the join and a new worker thread is started.
    pub fn stop(&self, timeout: Duration) -> bool {
        self.handoff.lock().take();
        let Some(running) = self.thread.lock().take() else {
            return true;
        };
        running.cancel.store(true, Ordering::Release);
        let joined = utils::join_with_timeout(running.handle, timeout, "render");
        debug!("Render worker stopped after {} frames", self.rendered());
        joined
    }
}

impl Drop for VideoRenderWorker {
    fn drop(&mut self) {
        self.stop(Duration::from_millis(500));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::playback::{Fraction, PatternReader, Reader};

    fn frame(position: i64) -> Arc<Frame> {
        PatternReader::new(2, 2, Fraction::new(25, 1), 100, false)
            .frame_at(position)
            .unwrap()
    }

    #[test]
    fn render_requires_running_worker() {
        let worker = VideoRenderWorker::new(
            |_: &Frame| -> Result<(), RenderError> { Ok(()) },
            Duration::from_millis(50),
        );
        assert_eq!(worker.render(frame(1)), Err(RenderError::NotRunning));
    }

    #[test]
    fn handoff_is_synchronous_and_in_order() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let worker = {
            let seen = Arc::clone(&seen);
            VideoRenderWorker::new(
                move |f: &Frame| -> Result<(), RenderError> {
                    thread::sleep(Duration::from_millis(5));
                    seen.lock().push(f.id());
                    Ok(())
                },
                Duration::from_secs(1),
            )
        };
        worker.start();

        for position in 1..=5 {
            worker.render(frame(position)).unwrap();
            // Acknowledged means already rendered
            assert_eq!(seen.lock().last().copied(), Some(position as u64));
        }
        assert_eq!(worker.rendered(), 5);
        assert!(worker.stop(Duration::from_millis(500)));
        assert!(!worker.is_running());
    }

    #[test]
    fn backend_errors_are_reported() {
        let worker = VideoRenderWorker::new(
            |_: &Frame| -> Result<(), RenderError> { Err(RenderError::Backend("lost surface".into())) },
            Duration::from_secs(1),
        );
        worker.start();
        assert_eq!(
            worker.render(frame(1)),
            Err(RenderError::Backend("lost surface".into()))
        );
        assert_eq!(worker.rendered(), 0);
    }

    #[test]
    fn slow_render_times_out_and_recovers() {
        let worker = VideoRenderWorker::new(
            |f: &Frame| -> Result<(), RenderError> {
                if f.id() == 1 {
                    thread::sleep(Duration::from_millis(150));
                }
                Ok(())
            },
            Duration::from_millis(50),
        );
        worker.start();
        assert_eq!(
            worker.render(frame(1)),
            Err(RenderError::Timeout(Duration::from_millis(50)))
        );
        thread::sleep(Duration::from_millis(200));
        assert_eq!(worker.render(frame(2)), Ok(()));
        assert_eq!(worker.rendered(), 2);
    }

    #[test]
    fn late_ack_is_not_taken_for_next_frame() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let worker = {
            let seen = Arc::clone(&seen);
            VideoRenderWorker::new(
                move |f: &Frame| -> Result<(), RenderError> {
                    let cost = if f.id() == 1 { 150 } else { 50 };
                    thread::sleep(Duration::from_millis(cost));
                    seen.lock().push(f.id());
                    Ok(())
                },
                Duration::from_millis(100),
            )
        };
        worker.start();

        assert_eq!(
            worker.render(frame(1)),
            Err(RenderError::Timeout(Duration::from_millis(100)))
        );
        // No pause: the ack for frame 1 lands while frame 2 is in flight
        assert_eq!(worker.render(frame(2)), Ok(()));
        assert_eq!(*seen.lock(), vec![1, 2]);
    }

    #[test]
    fn stopped_thread_stays_stopped_after_restart() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let worker = {
            let seen = Arc::clone(&seen);
            VideoRenderWorker::new(
                move |f: &Frame| -> Result<(), RenderError> {
                    if f.id() == 1 {
                        thread::sleep(Duration::from_millis(200));
                    }
                    seen.lock().push((f.id(), thread::current().id()));
                    Ok(())
                },
                Duration::from_millis(50),
            )
        };
        worker.start();
        assert!(worker.render(frame(1)).is_err());
        // Render of frame 1 is still in progress
        assert!(!worker.stop(Duration::from_millis(10)));

        worker.start();
        assert!(worker.is_running());
        // Let the detached thread finish frame 1 and notice it was cancelled
        thread::sleep(Duration::from_millis(250));
        for position in 2..=4 {
            worker.render(frame(position)).unwrap();
        }
        worker.stop(Duration::from_millis(500));

        let seen = seen.lock();
        let restarted: Vec<_> = seen.iter().filter(|(id, _)| *id >= 2).map(|(_, t)| *t).collect();
        assert!(!restarted.is_empty());
        assert!(restarted.iter().all(|t| *t == restarted[0]));
        let old = seen.iter().find(|(id, _)| *id == 1).map(|(_, t)| *t).unwrap();
        assert_ne!(old, restarted[0]);
    }
}
