//! Capture producer: batches raw arrivals, converts them in parallel and
//! publishes each batch in one step through the reorder cache.
//!
//! Ids are assigned when a batch is dispatched, before any conversion task
//! runs, so out-of-order task completion cannot corrupt numbering. The
//! published count moves only after the whole batch has been written.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use crossbeam::utils::CachePadded;
use parking_lot::Mutex;
use tracing::{debug, info, instrument, trace, warn};

use crate::capture::convert::{PixelConverter, YuvToArgb};
use crate::capture::frame::{
    AudioBlock, Frame, FrameMetadata, InputFrame, PixelFormat, RawCaptureFrame,
    PLACEHOLDER_CHANNELS,
};
use crate::error::CaptureError;
use crate::pipeline::{CacheStats, GapReason, Lookup, PublishedCount, ReorderCache};
use crate::{utils, CacheConfig, CaptureConfig, Config};

/// Video mode reported by the device after an input change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FormatChange {
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
}

/// Callbacks the capture API invokes on its own thread.
///
/// Implementations must return quickly; buffers are only valid for the
/// duration of the call.
pub trait CaptureDelegate: Send + Sync {
    fn frame_arrived(&self, video: Option<&InputFrame<'_>>, audio: Option<&[u8]>);
    fn format_changed(&self, change: &FormatChange);
}

type FormatListener = Box<dyn Fn(&FormatChange) + Send + Sync>;

#[derive(Default)]
struct Stats {
    arrivals: AtomicU64,
    signal_lost: AtomicU64,
    batches: AtomicU64,
    frames_converted: AtomicU64,
    conversion_failed: AtomicU64,
    cache_misses: AtomicU64,
    fetch_timeouts: AtomicU64,
}

/// Point-in-time copy of the producer counters.
#[derive(Debug, Clone, Copy, Default)]
pub struct CaptureStats {
    pub arrivals: u64,
    pub signal_lost: u64,
    pub batches: u64,
    pub frames_converted: u64,
    pub conversion_failed: u64,
    pub cache_misses: u64,
    pub fetch_timeouts: u64,
    pub published: u64,
    pub pending: usize,
    pub cache: CacheStats,
}

/// Parallel capture producer.
///
/// Share it as `Arc<CaptureProducer>`: the capture thread, consumers and the
/// owner each hold a clone, and the last one dropped releases the pool and
/// the cache.
pub struct CaptureProducer {
    converter: Arc<dyn PixelConverter>,
    pool: rayon::ThreadPool,
    cache: Arc<ReorderCache>,
    published: PublishedCount,
    pending: Mutex<Vec<RawCaptureFrame>>,
    // Serialises batches so publish order always equals id order
    dispatch: Mutex<()>,
    next_sequence: AtomicU64,
    fetch_timeout: Duration,
    format_listener: Option<FormatListener>,
    stats: CachePadded<Stats>,
}

impl CaptureProducer {
    pub fn new(
        capture: &CaptureConfig,
        cache: &CacheConfig,
        converter: Arc<dyn PixelConverter>,
    ) -> Result<Self, CaptureError> {
        let workers = if capture.workers == 0 {
            utils::default_worker_count()
        } else {
            capture.workers
        };

        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(workers)
            .thread_name(|i| format!("chronoframe-convert-{}", i))
            .build()
            .map_err(|e| CaptureError::Pool(e.to_string()))?;

        info!(
            "Capture producer ready: {} workers, cache budget {} bytes ({:?})",
            pool.current_num_threads(),
            cache.max_bytes,
            cache.overflow
        );

        Ok(Self {
            converter,
            pool,
            cache: Arc::new(ReorderCache::new(cache.max_bytes, cache.overflow)),
            published: PublishedCount::new(),
            pending: Mutex::new(Vec::with_capacity(workers)),
            dispatch: Mutex::new(()),
            next_sequence: AtomicU64::new(0),
            fetch_timeout: Duration::from_millis(capture.fetch_timeout_ms),
            format_listener: None,
            stats: CachePadded::new(Stats::default()),
        })
    }

    /// Producer with the default YUV to ARGB converter.
    pub fn from_config(config: &Config) -> Result<Self, CaptureError> {
        Self::new(&config.capture, &config.cache, Arc::new(YuvToArgb::new()))
    }

    /// Forward device format changes to `listener`.
    pub fn with_format_listener<F>(mut self, listener: F) -> Self
    where
        F: Fn(&FormatChange) + Send + Sync + 'static,
    {
        self.format_listener = Some(Box::new(listener));
        self
    }

    /// Frames gathered before a batch is dispatched: one per worker.
    pub fn batch_size(&self) -> usize {
        self.pool.current_num_threads()
    }

    pub fn cache(&self) -> &Arc<ReorderCache> {
        &self.cache
    }

    pub fn pending_len(&self) -> usize {
        self.pending.lock().len()
    }

    /// Handle one arrival from the capture thread.
    ///
    /// Without a signal the arrival is logged and skipped and no id is
    /// consumed. Otherwise the buffer is copied right away; once a full batch
    /// is queued it is converted and published before this returns.
    pub fn on_frame_arrived(&self, input: &InputFrame<'_>, audio: Option<&[u8]>, has_signal: bool) {
        let arrival = self.stats.arrivals.fetch_add(1, Ordering::Relaxed);

        if !has_signal {
            warn!("Frame received (#{}) - No input signal detected", arrival);
            self.stats.signal_lost.fetch_add(1, Ordering::Relaxed);
            metrics::counter!("capture_signal_lost").increment(1);
            return;
        }

        let raw = RawCaptureFrame::copy_from(input, audio);
        let batch = {
            let mut pending = self.pending.lock();
            pending.push(raw);
            if pending.len() >= self.batch_size() {
                Some(std::mem::take(&mut *pending))
            } else {
                None
            }
        };

        if let Some(batch) = batch {
            self.dispatch_batch(batch);
        }
    }

    /// Dispatch whatever is queued, even if it is less than a full batch.
    pub fn flush(&self) {
        let batch = std::mem::take(&mut *self.pending.lock());
        if !batch.is_empty() {
            debug!("Flushing partial batch of {}", batch.len());
            self.dispatch_batch(batch);
        }
    }

    /// Release every blocked fetch; unpublished ids return empty from now on.
    pub fn close(&self) {
        self.published.close();
    }

    pub fn is_closed(&self) -> bool {
        self.published.is_closed()
    }

    #[instrument(skip(self, batch), fields(batch = batch.len()))]
    fn dispatch_batch(&self, batch: Vec<RawCaptureFrame>) {
        let _serial = self.dispatch.lock();
        let count = batch.len() as u64;
        let first = self.next_sequence.fetch_add(count, Ordering::AcqRel);

        // Join barrier: scope returns once every task has finished
        self.pool.scope(|scope| {
            for (offset, raw) in batch.into_iter().enumerate() {
                let id = first + offset as u64;
                scope.spawn(move |_| self.convert_one(id, raw));
            }
        });

        let published = self.published.advance(count);
        self.stats.batches.fetch_add(1, Ordering::Relaxed);
        trace!("Published frames {}..{} (total {})", first, first + count, published);
    }

    fn convert_one(&self, id: u64, raw: RawCaptureFrame) {
        let started = Instant::now();
        let format = self.converter.output_format();
        let mut pixels = vec![0u8; format.row_bytes(raw.width) * raw.height as usize];

        if let Err(e) = self.converter.convert(&raw, &mut pixels) {
            warn!("Dropping frame {}: {}", id, e);
            self.stats.conversion_failed.fetch_add(1, Ordering::Relaxed);
            metrics::counter!("capture_conversion_failed").increment(1);
            self.cache.mark_gap(id, GapReason::Dropped);
            return;
        }

        let audio = match raw.audio {
            Some(data) => pcm16_block(data),
            None => AudioBlock::placeholder(),
        };
        let meta = FrameMetadata {
            sequence: id,
            width: raw.width,
            height: raw.height,
            stride: format.row_bytes(raw.width) as u32,
            format,
            device_timestamp: raw.device_timestamp,
        };
        let frame = Arc::new(Frame::new(meta, Bytes::from(pixels), audio));

        if let Err(e) = self.cache.insert(frame) {
            warn!("Frame {} refused by cache: {}", id, e);
        }

        self.stats.frames_converted.fetch_add(1, Ordering::Relaxed);
        metrics::histogram!("conversion_time_us").record(started.elapsed().as_micros() as f64);
    }

    /// Highest published id, or 0 when nothing has been published yet.
    pub fn current_frame_number(&self) -> u64 {
        self.published.current_frame_number()
    }

    pub fn published(&self) -> u64 {
        self.published.published()
    }

    /// Blocking fetch of frame `requested`, bounded by the configured timeout.
    pub fn get_frame(&self, requested: u64) -> Option<Arc<Frame>> {
        self.get_frame_timeout(requested, self.fetch_timeout)
    }

    /// Wait until `requested` is published, then remove it from the cache.
    ///
    /// Empty results are soft errors: timeout, close, a known gap, or a
    /// published id that is not in the cache (logged with a cache dump).
    pub fn get_frame_timeout(&self, requested: u64, timeout: Duration) -> Option<Arc<Frame>> {
        if !self.published.wait_until_ready(requested, timeout) {
            if !self.published.is_closed() {
                warn!(
                    "Timed out after {:?} waiting for frame {}, current frame number {}",
                    timeout,
                    requested,
                    self.current_frame_number()
                );
                self.stats.fetch_timeouts.fetch_add(1, Ordering::Relaxed);
                metrics::counter!("capture_fetch_timeouts").increment(1);
            }
            return None;
        }

        match self.cache.take(requested) {
            Lookup::Ready(frame) => Some(frame),
            Lookup::Gap(reason) => {
                debug!("Frame {} has no image ({:?})", requested, reason);
                None
            }
            Lookup::Missing => {
                self.stats.cache_misses.fetch_add(1, Ordering::Relaxed);
                metrics::counter!("cache_misses").increment(1);
                warn!(
                    "Can't find frame {}, current frame number {}: {}",
                    requested,
                    self.current_frame_number(),
                    self.cache.describe()
                );
                None
            }
        }
    }

    pub fn stats(&self) -> CaptureStats {
        CaptureStats {
            arrivals: self.stats.arrivals.load(Ordering::Relaxed),
            signal_lost: self.stats.signal_lost.load(Ordering::Relaxed),
            batches: self.stats.batches.load(Ordering::Relaxed),
            frames_converted: self.stats.frames_converted.load(Ordering::Relaxed),
            conversion_failed: self.stats.conversion_failed.load(Ordering::Relaxed),
            cache_misses: self.stats.cache_misses.load(Ordering::Relaxed),
            fetch_timeouts: self.stats.fetch_timeouts.load(Ordering::Relaxed),
            published: self.published(),
            pending: self.pending_len(),
            cache: self.cache.stats(),
        }
    }
}

/// Interleaved 16-bit PCM packet from the device.
fn pcm16_block(data: Bytes) -> AudioBlock {
    let channels = PLACEHOLDER_CHANNELS;
    AudioBlock {
        channels,
        samples: data.len() / (channels as usize * 2),
        data,
    }
}

impl CaptureDelegate for CaptureProducer {
    fn frame_arrived(&self, video: Option<&InputFrame<'_>>, audio: Option<&[u8]>) {
        if let Some(video) = video {
            self.on_frame_arrived(video, audio, !video.no_input_source);
        }
    }

    fn format_changed(&self, change: &FormatChange) {
        debug!("Input format changed: {:?}", change);
        if let Some(listener) = &self.format_listener {
            listener(change);
        }
    }
}

impl Drop for CaptureProducer {
    fn drop(&mut self) {
        self.published.close();
        let stats = self.stats();
        debug!(
            "Capture producer released: {} published, {} still cached, {} pending",
            stats.published, stats.cache.resident_frames, stats.pending
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::OverflowPolicy;
    use std::sync::atomic::AtomicUsize;

    fn configs(workers: usize) -> (CaptureConfig, CacheConfig) {
        let capture = CaptureConfig {
            width: 2,
            height: 2,
            format: PixelFormat::Uyvy,
            workers,
            fetch_timeout_ms: 200,
        };
        let cache = CacheConfig {
            max_bytes: 1 << 20,
            overflow: OverflowPolicy::DropOldest,
        };
        (capture, cache)
    }

    fn producer(workers: usize) -> CaptureProducer {
        let (capture, cache) = configs(workers);
        CaptureProducer::new(&capture, &cache, Arc::new(YuvToArgb::new())).unwrap()
    }

    fn arrive(producer: &CaptureProducer, fill: u8, has_signal: bool) {
        let bytes = [fill; 8];
        let input = InputFrame {
            bytes: &bytes,
            width: 2,
            height: 2,
            row_bytes: 4,
            format: PixelFormat::Uyvy,
            device_timestamp: None,
            no_input_source: !has_signal,
        };
        producer.on_frame_arrived(&input, None, has_signal);
    }

    /// Fails on buffers starting with 0xFF.
    struct Picky;

    impl PixelConverter for Picky {
        fn output_format(&self) -> PixelFormat {
            PixelFormat::Argb
        }

        fn convert(&self, src: &RawCaptureFrame, dst: &mut [u8]) -> Result<(), CaptureError> {
            if src.data[0] == 0xFF {
                return Err(CaptureError::Conversion("bad frame".into()));
            }
            YuvToArgb::new().convert(src, dst)
        }
    }

    #[test]
    fn partial_batch_is_not_published() {
        let producer = producer(3);
        arrive(&producer, 128, true);
        arrive(&producer, 128, true);
        assert_eq!(producer.published(), 0);
        assert_eq!(producer.pending_len(), 2);

        arrive(&producer, 128, true);
        assert_eq!(producer.published(), 3);
        assert_eq!(producer.current_frame_number(), 2);
        assert_eq!(producer.pending_len(), 0);
    }

    #[test]
    fn signal_loss_consumes_no_id() {
        let producer = producer(2);
        arrive(&producer, 128, true);
        arrive(&producer, 128, false);
        arrive(&producer, 128, true);

        assert_eq!(producer.published(), 2);
        for id in 0..2 {
            assert_eq!(producer.get_frame(id).map(|f| f.id()), Some(id));
        }
        let stats = producer.stats();
        assert_eq!(stats.signal_lost, 1);
        assert_eq!(stats.arrivals, 3);
    }

    #[test]
    fn conversion_failure_leaves_a_gap_but_publishes_the_batch() {
        let (capture, cache) = configs(2);
        let producer = CaptureProducer::new(&capture, &cache, Arc::new(Picky)).unwrap();
        arrive(&producer, 128, true);
        arrive(&producer, 0xFF, true);

        assert_eq!(producer.published(), 2);
        assert!(producer.get_frame(0).is_some());
        assert!(producer.get_frame(1).is_none());

        let stats = producer.stats();
        assert_eq!(stats.conversion_failed, 1);
        assert_eq!(stats.cache_misses, 0);
    }

    #[test]
    fn second_fetch_of_an_id_is_a_miss() {
        let producer = producer(1);
        arrive(&producer, 128, true);
        assert!(producer.get_frame(0).is_some());
        assert!(producer.get_frame(0).is_none());
        assert_eq!(producer.stats().cache_misses, 1);
    }

    #[test]
    fn fetch_of_unpublished_id_times_out() {
        let producer = producer(4);
        arrive(&producer, 128, true);
        let start = Instant::now();
        assert!(producer
            .get_frame_timeout(0, Duration::from_millis(40))
            .is_none());
        assert!(start.elapsed() >= Duration::from_millis(40));
        assert_eq!(producer.stats().fetch_timeouts, 1);
    }

    #[test]
    fn flush_publishes_the_remainder() {
        let producer = producer(4);
        for _ in 0..3 {
            arrive(&producer, 128, true);
        }
        producer.flush();
        assert_eq!(producer.published(), 3);
        assert_eq!(producer.get_frame(2).map(|f| f.id()), Some(2));
    }

    #[test]
    fn converted_frame_carries_companion_audio() {
        let producer = producer(1);
        let bytes = [128u8, 235, 128, 235, 128, 235, 128, 235];
        let input = InputFrame {
            bytes: &bytes,
            width: 2,
            height: 2,
            row_bytes: 4,
            format: PixelFormat::Uyvy,
            device_timestamp: Some(Duration::from_millis(40)),
            no_input_source: false,
        };
        producer.frame_arrived(Some(&input), Some(&[0u8; 16]));

        let frame = producer.get_frame(0).unwrap();
        assert_eq!(frame.meta.format, PixelFormat::Argb);
        assert_eq!(frame.data.len(), 16);
        assert_eq!(frame.audio.samples, 4);
        assert_eq!(frame.meta.device_timestamp, Some(Duration::from_millis(40)));
    }

    #[test]
    fn format_changes_reach_the_listener() {
        let seen = Arc::new(AtomicUsize::new(0));
        let producer = {
            let seen = Arc::clone(&seen);
            producer(1).with_format_listener(move |change| {
                assert_eq!(change.width, 1280);
                seen.fetch_add(1, Ordering::SeqCst);
            })
        };
        producer.format_changed(&FormatChange {
            width: 1280,
            height: 720,
            format: PixelFormat::Uyvy,
        });
        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn timeout_is_not_close() {
        let producer = producer(2);
        assert!(producer.get_frame_timeout(0, Duration::from_millis(20)).is_none());
        assert!(!producer.is_closed());
        assert_eq!(producer.stats().fetch_timeouts, 1);

        arrive(&producer, 128, true);
        arrive(&producer, 128, true);
        producer.close();
        assert!(producer.is_closed());
        // Already published ids stay fetchable after close
        assert_eq!(producer.get_frame(0).map(|f| f.id()), Some(0));
        assert!(producer.get_frame(2).is_none());
    }
}
