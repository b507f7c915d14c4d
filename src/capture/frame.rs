use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};

/// Audio samples per frame when the device delivers no companion packet.
pub const PLACEHOLDER_SAMPLES: usize = 2048;
/// Channel count of the placeholder audio block.
pub const PLACEHOLDER_CHANNELS: u16 = 2;

/// Converted frame, ready for consumers.
#[derive(Clone)]
pub struct Frame {
    /// Immutable pixel data - can be shared across threads without copying
    pub data: Bytes,

    /// Frame metadata
    pub meta: FrameMetadata,

    /// Audio travelling with this frame
    pub audio: AudioBlock,

    /// Time the frame finished conversion (or was produced by a reader)
    pub timestamp: Instant,
}

/// Frame metadata
#[derive(Debug, Clone)]
pub struct FrameMetadata {
    pub sequence: u64,
    pub width: u32,
    pub height: u32,
    pub stride: u32,
    pub format: PixelFormat,
    pub device_timestamp: Option<Duration>, // Hardware timestamp if available
}

/// Audio attached to a frame. Empty `data` means a placeholder.
#[derive(Debug, Clone)]
pub struct AudioBlock {
    pub channels: u16,
    pub samples: usize,
    pub data: Bytes,
}

impl AudioBlock {
    pub fn placeholder() -> Self {
        Self {
            channels: PLACEHOLDER_CHANNELS,
            samples: PLACEHOLDER_SAMPLES,
            data: Bytes::new(),
        }
    }

    pub fn is_placeholder(&self) -> bool {
        self.data.is_empty()
    }
}

impl Frame {
    pub fn new(meta: FrameMetadata, data: Bytes, audio: AudioBlock) -> Self {
        Self {
            data,
            meta,
            audio,
            timestamp: Instant::now(),
        }
    }

    /// Sequence number (frame id).
    pub fn id(&self) -> u64 {
        self.meta.sequence
    }

    /// Bytes this frame holds resident: pixels plus audio.
    pub fn byte_size(&self) -> usize {
        self.data.len() + self.audio.data.len()
    }
}

impl std::fmt::Debug for Frame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Frame")
            .field("id", &self.meta.sequence)
            .field("size", &(self.meta.width, self.meta.height))
            .field("format", &self.meta.format)
            .field("bytes", &self.byte_size())
            .finish()
    }
}

/// Pixel formats we support
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PixelFormat {
    /// 8-bit 4:2:2, byte order U Y0 V Y1 (device native)
    Uyvy,
    /// 8-bit 4:2:2, byte order Y0 U Y1 V
    Yuyv,
    /// 8-bit A R G B (processing format)
    Argb,
    Bgra,
    Rgb24,
}

impl PixelFormat {
    /// Average bytes per pixel for a tightly packed row.
    pub fn bytes_per_pixel(self) -> usize {
        match self {
            PixelFormat::Uyvy | PixelFormat::Yuyv => 2,
            PixelFormat::Rgb24 => 3,
            PixelFormat::Argb | PixelFormat::Bgra => 4,
        }
    }

    pub fn row_bytes(self, width: u32) -> usize {
        width as usize * self.bytes_per_pixel()
    }
}

/// Video buffer as handed over by the capture API.
///
/// Only valid for the duration of the arrival callback.
#[derive(Debug, Clone, Copy)]
pub struct InputFrame<'a> {
    pub bytes: &'a [u8],
    pub width: u32,
    pub height: u32,
    pub row_bytes: usize,
    pub format: PixelFormat,
    pub device_timestamp: Option<Duration>,
    /// Set by the device when nothing is plugged into the input
    pub no_input_source: bool,
}

/// Pre-conversion copy of an arrived buffer, owned by the producer until
/// its conversion task finishes.
#[derive(Debug, Clone)]
pub struct RawCaptureFrame {
    pub data: Bytes,
    pub audio: Option<Bytes>,
    pub width: u32,
    pub height: u32,
    pub row_bytes: usize,
    pub format: PixelFormat,
    pub device_timestamp: Option<Duration>,
    pub arrived: Instant,
}

impl RawCaptureFrame {
    /// Copy the transient device buffers out before the callback returns.
    pub fn copy_from(input: &InputFrame<'_>, audio: Option<&[u8]>) -> Self {
        let len = (input.row_bytes * input.height as usize).min(input.bytes.len());
        Self {
            data: Bytes::copy_from_slice(&input.bytes[..len]),
            audio: audio.map(Bytes::copy_from_slice),
            width: input.width,
            height: input.height,
            row_bytes: input.row_bytes,
            format: input.format,
            device_timestamp: input.device_timestamp,
            arrived: Instant::now(),
        }
    }
}
