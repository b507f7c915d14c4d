//! Chronoframe demo: synthetic capture through the parallel producer, plus
//! paced playback of a generated source against an audio clock.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chronoframe::capture::{InputFrame, PixelFormat};
use chronoframe::error::RenderError;
use chronoframe::playback::{ClockAudioWorker, Fraction, PatternReader, Reader};
use chronoframe::{CaptureProducer, Config, Frame, PlaybackScheduler};
use color_eyre::Result;
use tracing::{info, trace, warn};
use tracing_subscriber::prelude::*;
use tracing_subscriber::{fmt, EnvFilter};

const DEMO_FRAMES: u64 = 600;
const DEMO_RUNTIME: Duration = Duration::from_secs(10);

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("chronoframe=debug"));
    let registry = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_timer(fmt::time::uptime()));
    #[cfg(feature = "profiling")]
    let registry = registry.with(tracing_tracy::TracyLayer::default());
    registry.init();

    info!("Chronoframe launching...");

    let config = Config::load(std::env::args().nth(1).map(PathBuf::from).as_deref())?;
    chronoframe::CONFIG.store(Arc::new(config.clone()));

    let producer = Arc::new(CaptureProducer::from_config(&config)?);
    info!("Capture batch size {}", producer.batch_size());

    // Stands in for the device callback thread
    let capture = {
        let producer = Arc::clone(&producer);
        let (width, height) = (config.capture.width, config.capture.height);
        tokio::task::spawn_blocking(move || {
            let row_bytes = PixelFormat::Uyvy.row_bytes(width);
            for n in 0..DEMO_FRAMES {
                let bytes = vec![(n % 256) as u8; row_bytes * height as usize];
                let has_signal = n % 97 != 96;
                let input = InputFrame {
                    bytes: &bytes,
                    width,
                    height,
                    row_bytes,
                    format: PixelFormat::Uyvy,
                    device_timestamp: Some(Duration::from_micros(n * 16_683)),
                    no_input_source: !has_signal,
                };
                producer.on_frame_arrived(&input, None, has_signal);
                std::thread::sleep(Duration::from_millis(16));
            }
            producer.flush();
        })
    };

    let consumer = {
        let producer = Arc::clone(&producer);
        tokio::task::spawn_blocking(move || {
            let mut next = 0u64;
            let mut received = 0u64;
            loop {
                match producer.get_frame(next) {
                    Some(frame) => {
                        received += 1;
                        trace!("Consumed {:?}", frame);
                    }
                    // Nothing more will be published
                    None if producer.is_closed() && producer.published() <= next => break,
                    // Still unpublished after a timeout: ask for the same id again
                    None if producer.published() <= next => continue,
                    None => {}
                }
                next += 1;
            }
            received
        })
    };

    let reader: Arc<dyn Reader> = Arc::new(PatternReader::new(640, 360, Fraction::new(25, 1), 250, true));
    reader.info().log_summary();
    let renderer = |frame: &Frame| -> Result<(), RenderError> {
        if frame.id() % 25 == 0 {
            info!("Rendered frame {}", frame.id());
        }
        Ok(())
    };
    let scheduler = PlaybackScheduler::new(reader, Arc::new(ClockAudioWorker::new()), renderer, &config.playback);
    scheduler.seek(1);
    if !scheduler.start() {
        warn!("Playback did not start");
    }

    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("Interrupted"),
        _ = tokio::time::sleep(DEMO_RUNTIME) => {}
    }

    let stopped = scheduler.stop(Duration::from_millis(config.playback.stop_timeout_ms));
    info!("Playback stopped cleanly: {}, {} frames rendered", stopped, scheduler.rendered());

    capture.await?;
    producer.close();
    let received = consumer.await?;
    let stats = producer.stats();
    info!(
        "Capture done: {} received, {} published, {} without signal, {} evicted",
        received, stats.published, stats.signal_lost, stats.cache.frames_evicted
    );

    info!("Chronoframe shutting down");
    Ok(())
}
