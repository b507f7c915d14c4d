//! Error types for the capture and playback pipelines.
//!
//! None of these are fatal: every one is caught where it is detected,
//! logged, and the pipeline keeps going.

use std::time::Duration;

use thiserror::Error;

use crate::capture::frame::PixelFormat;

/// Failures while turning a raw capture buffer into a [`Frame`](crate::Frame).
#[derive(Error, Debug)]
pub enum CaptureError {
    #[error("conversion failed: {0}")]
    Conversion(String),

    #[error("unsupported pixel format: {0:?}")]
    UnsupportedFormat(PixelFormat),

    #[error("buffer size mismatch: expected {expected} bytes, got {actual}")]
    BufferSize { expected: usize, actual: usize },

    #[error("failed to build conversion pool: {0}")]
    Pool(String),
}

/// Reasons the reorder cache refuses a frame.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CacheError {
    #[error("frame {id} ({bytes} bytes) does not fit: {resident} of {max} bytes resident")]
    OverBudget {
        id: u64,
        bytes: usize,
        resident: usize,
        max: usize,
    },

    #[error("frame {id} ({bytes} bytes) is larger than the whole cache budget ({max} bytes)")]
    TooLarge { id: u64, bytes: usize, max: usize },
}

/// Conditions raised by a [`Reader`](crate::playback::Reader) when asked for a frame.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ReaderError {
    #[error("reader is closed")]
    Closed,

    #[error("too many seeks while looking for frame {requested}")]
    TooManySeeks { requested: i64 },

    #[error("frame {requested} is outside 1..={length}")]
    OutOfBounds { requested: i64, length: i64 },
}

/// Failures on the video render side of the scheduler.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RenderError {
    #[error("render worker is not running")]
    NotRunning,

    #[error("render handoff timed out after {0:?}")]
    Timeout(Duration),

    #[error("render backend failed: {0}")]
    Backend(String),
}

/// Problems loading or updating a [`MediaInfo`](crate::playback::MediaInfo).
#[derive(Error, Debug)]
pub enum InfoError {
    #[error("JSON could not be parsed (or is invalid): {0}")]
    InvalidJson(#[from] serde_json::Error),

    #[error("JSON is invalid (missing keys or invalid data types): {0}")]
    InvalidValue(String),
}
