pub mod capture;
pub mod error;
pub mod pipeline;
pub mod playback;
pub mod utils;

use std::path::Path;

use arc_swap::ArcSwap;
use capture::frame::PixelFormat;
use pipeline::OverflowPolicy;
use serde::{Deserialize, Serialize};

pub use capture::{CaptureProducer, Frame};
pub use playback::PlaybackScheduler;

/// Global configuration that can be atomically swapped at runtime
pub static CONFIG: once_cell::sync::Lazy<ArcSwap<Config>> =
    once_cell::sync::Lazy::new(|| ArcSwap::from_pointee(Config::default()));

/// Prefix for environment overrides, e.g. `CHRONOFRAME__CACHE__MAX_BYTES`
pub const ENV_PREFIX: &str = "CHRONOFRAME";

/// System configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub capture: CaptureConfig,
    pub cache: CacheConfig,
    pub playback: PlaybackConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureConfig {
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
    pub workers: usize,        // 0 = one per CPU
    pub fetch_timeout_ms: u64, // Upper bound for a blocking fetch
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub max_bytes: usize,
    pub overflow: OverflowPolicy,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PlaybackConfig {
    pub stop_timeout_ms: u64,
    pub render_timeout_ms: u64,
    pub speed: i32,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            width: 1920,
            height: 1080,
            format: PixelFormat::Uyvy,
            workers: 0,
            fetch_timeout_ms: 2000,
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            // 60 1080p ARGB frames plus one second of stereo audio
            max_bytes: 60 * 1920 * 1080 * 4 + (44100 * 2 * 4),
            overflow: OverflowPolicy::DropOldest,
        }
    }
}

impl Default for PlaybackConfig {
    fn default() -> Self {
        Self {
            stop_timeout_ms: 500,
            render_timeout_ms: 1000,
            speed: 1,
        }
    }
}

impl Config {
    /// Defaults, then the optional TOML file, then `CHRONOFRAME__*` env vars.
    pub fn load(path: Option<&Path>) -> Result<Self, ::config::ConfigError> {
        let mut builder =
            ::config::Config::builder().add_source(::config::Config::try_from(&Config::default())?);
        if let Some(path) = path {
            builder = builder.add_source(::config::File::from(path).required(true));
        }
        builder
            .add_source(
                ::config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__"),
            )
            .build()?
            .try_deserialize()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_match_budget() {
        let config = Config::default();
        assert_eq!(config.cache.max_bytes, 497_664_000 + 352_800);
        assert_eq!(config.cache.overflow, OverflowPolicy::DropOldest);
        assert_eq!(config.playback.speed, 1);
    }

    #[test]
    fn file_overrides_defaults() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            "[capture]\nworkers = 4\nformat = \"yuyv\"\n\n[cache]\nmax_bytes = 1024\noverflow = \"reject\""
        )
        .unwrap();

        let config = Config::load(Some(file.path())).unwrap();
        assert_eq!(config.capture.workers, 4);
        assert_eq!(config.capture.format, PixelFormat::Yuyv);
        assert_eq!(config.capture.width, 1920);
        assert_eq!(config.cache.max_bytes, 1024);
        assert_eq!(config.cache.overflow, OverflowPolicy::Reject);
    }

    #[test]
    fn missing_file_is_an_error() {
        assert!(Config::load(Some(Path::new("/nonexistent/chronoframe.toml"))).is_err());
    }

    #[test]
    fn global_config_can_be_swapped() {
        let mut config = Config::default();
        config.playback.speed = 2;
        CONFIG.store(std::sync::Arc::new(config));
        assert_eq!(CONFIG.load().playback.speed, 2);
        CONFIG.store(std::sync::Arc::new(Config::default()));
    }
}
