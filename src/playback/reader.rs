//! Upstream frame sources queried by position, and their stream description.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::info;

use crate::capture::frame::{AudioBlock, FrameMetadata, PixelFormat};
use crate::error::{InfoError, ReaderError};
use crate::Frame;

/// A source the playback scheduler pulls frames from.
///
/// Positions are 1-based frame numbers. `frame_at` must be callable from the
/// scheduler thread while the audio worker reads `info()` concurrently.
pub trait Reader: Send + Sync {
    fn info(&self) -> &MediaInfo;
    fn frame_at(&self, position: i64) -> Result<Arc<Frame>, ReaderError>;
}

/// Rational number (frame rates, timebases, aspect ratios).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Fraction {
    pub num: i32,
    pub den: i32,
}

impl Fraction {
    pub const fn new(num: i32, den: i32) -> Self {
        Self { num, den }
    }

    pub fn to_f64(self) -> f64 {
        if self.den == 0 {
            return 0.0;
        }
        self.num as f64 / self.den as f64
    }

    pub fn reciprocal(self) -> Self {
        Self::new(self.den, self.num)
    }

    /// How long one frame stays on screen at this rate. Zero for an empty rate.
    pub fn frame_interval(self) -> Duration {
        let fps = self.to_f64();
        if fps <= 0.0 {
            return Duration::ZERO;
        }
        Duration::from_secs_f64(1.0 / fps)
    }
}

impl Default for Fraction {
    fn default() -> Self {
        Self::new(1, 1)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelLayout {
    #[default]
    Mono,
    Stereo,
    Surround,
    Surround51,
    Surround71,
}

/// Description of a source's streams.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MediaInfo {
    pub has_video: bool,
    pub has_audio: bool,
    pub has_single_image: bool,
    pub duration: f64,
    /// Serialised as a string to survive JSON consumers with 53-bit integers
    #[serde(with = "string_number")]
    pub file_size: i64,
    pub height: i32,
    pub width: i32,
    pub pixel_format: i32,
    pub fps: Fraction,
    pub video_bit_rate: i32,
    pub pixel_ratio: Fraction,
    pub display_ratio: Fraction,
    pub vcodec: String,
    #[serde(with = "string_number")]
    pub video_length: i64,
    pub video_stream_index: i32,
    pub video_timebase: Fraction,
    pub interlaced_frame: bool,
    pub top_field_first: bool,
    pub acodec: String,
    pub audio_bit_rate: i32,
    pub sample_rate: i32,
    pub channels: i32,
    pub channel_layout: ChannelLayout,
    pub audio_stream_index: i32,
    pub audio_timebase: Fraction,
}

impl Default for MediaInfo {
    fn default() -> Self {
        Self {
            has_video: false,
            has_audio: false,
            has_single_image: false,
            duration: 0.0,
            file_size: 0,
            height: 0,
            width: 0,
            pixel_format: -1,
            fps: Fraction::default(),
            video_bit_rate: 0,
            pixel_ratio: Fraction::default(),
            display_ratio: Fraction::default(),
            vcodec: String::new(),
            video_length: 0,
            video_stream_index: -1,
            video_timebase: Fraction::default(),
            interlaced_frame: false,
            top_field_first: true,
            acodec: String::new(),
            audio_bit_rate: 0,
            sample_rate: 0,
            channels: 0,
            channel_layout: ChannelLayout::Mono,
            audio_stream_index: -1,
            audio_timebase: Fraction::default(),
        }
    }
}

impl MediaInfo {
    /// Copy the stream description of `reader`.
    pub fn from_reader(reader: &dyn Reader) -> Self {
        reader.info().clone()
    }

    /// Nominal frame interval at the source frame rate.
    pub fn frame_interval(&self) -> Duration {
        self.fps.frame_interval()
    }

    pub fn to_json(&self) -> Result<String, InfoError> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Apply the keys present in `json`, leaving every other field as is.
    pub fn merge_json(&mut self, json: &str) -> Result<(), InfoError> {
        let patch: Value = serde_json::from_str(json)?;
        let Value::Object(patch) = patch else {
            return Err(InfoError::InvalidValue("expected a JSON object".into()));
        };

        let mut current = serde_json::to_value(&*self)?;
        if let Value::Object(fields) = &mut current {
            for (key, value) in patch {
                if value.is_null() {
                    continue;
                }
                match (fields.get_mut(&key), value) {
                    // Nested rationals may be patched one half at a time
                    (Some(Value::Object(existing)), Value::Object(part)) => {
                        for (k, v) in part {
                            if !v.is_null() {
                                existing.insert(k, v);
                            }
                        }
                    }
                    (Some(slot), value) => *slot = value,
                    (None, _) => {}
                }
            }
        }

        *self = serde_json::from_value(current)
            .map_err(|e| InfoError::InvalidValue(e.to_string()))?;
        Ok(())
    }

    /// Log a human readable summary of both streams.
    pub fn log_summary(&self) {
        info!("----- File Information -----");
        info!("--> Has Video: {}", self.has_video);
        info!("--> Has Audio: {}", self.has_audio);
        info!("--> Has Single Image: {}", self.has_single_image);
        info!("--> Duration: {:.2} Seconds", self.duration);
        info!("--> File Size: {:.2} MB", self.file_size as f64 / 1024.0 / 1024.0);
        info!("----- Video Attributes -----");
        info!("--> Width: {}", self.width);
        info!("--> Height: {}", self.height);
        info!("--> Pixel Format: {}", self.pixel_format);
        info!(
            "--> Frames Per Second: {:.2} ({}/{})",
            self.fps.to_f64(),
            self.fps.num,
            self.fps.den
        );
        info!("--> Video Bit Rate: {} kb/s", self.video_bit_rate / 1000);
        info!(
            "--> Pixel Ratio: {:.2} ({}/{})",
            self.pixel_ratio.to_f64(),
            self.pixel_ratio.num,
            self.pixel_ratio.den
        );
        info!(
            "--> Display Aspect Ratio: {:.2} ({}/{})",
            self.display_ratio.to_f64(),
            self.display_ratio.num,
            self.display_ratio.den
        );
        info!("--> Video Codec: {}", self.vcodec);
        info!("--> Video Length: {} Frames", self.video_length);
        info!("--> Video Stream Index: {}", self.video_stream_index);
        info!(
            "--> Video Timebase: {:.4} ({}/{})",
            self.video_timebase.to_f64(),
            self.video_timebase.num,
            self.video_timebase.den
        );
        info!("--> Interlaced: {}", self.interlaced_frame);
        info!("--> Interlaced: Top Field First: {}", self.top_field_first);
        info!("----- Audio Attributes -----");
        info!("--> Audio Codec: {}", self.acodec);
        info!("--> Audio Bit Rate: {} kb/s", self.audio_bit_rate / 1000);
        info!("--> Sample Rate: {} Hz", self.sample_rate);
        info!("--> # of Channels: {}", self.channels);
        info!("--> Channel Layout: {:?}", self.channel_layout);
        info!("--> Audio Stream Index: {}", self.audio_stream_index);
        info!(
            "--> Audio Timebase: {:.4} ({}/{})",
            self.audio_timebase.to_f64(),
            self.audio_timebase.num,
            self.audio_timebase.den
        );
    }
}

mod string_number {
    use serde::de::Error;
    use serde::{Deserialize, Deserializer, Serializer};
    use serde_json::Value;

    pub fn serialize<S: Serializer>(value: &i64, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&value.to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<i64, D::Error> {
        match Value::deserialize(deserializer)? {
            Value::String(s) => s.parse().map_err(D::Error::custom),
            Value::Number(n) => n
                .as_i64()
                .ok_or_else(|| D::Error::custom("expected an integer")),
            other => Err(D::Error::custom(format!("expected a number, got {}", other))),
        }
    }
}

/// Generated source: solid ARGB frames whose shade follows the position.
///
/// Useful for previews and tests; raises `OutOfBounds` outside
/// `1..=video_length` and `Closed` after [`PatternReader::close`].
pub struct PatternReader {
    info: MediaInfo,
    closed: AtomicBool,
}

impl PatternReader {
    pub fn new(width: u32, height: u32, fps: Fraction, video_length: i64, has_audio: bool) -> Self {
        let info = MediaInfo {
            has_video: true,
            has_audio,
            duration: video_length as f64 / fps.to_f64().max(f64::MIN_POSITIVE),
            width: width as i32,
            height: height as i32,
            fps,
            vcodec: "pattern".into(),
            video_length,
            video_stream_index: 0,
            video_timebase: fps.reciprocal(),
            sample_rate: if has_audio { 44100 } else { 0 },
            channels: if has_audio { 2 } else { 0 },
            channel_layout: if has_audio {
                ChannelLayout::Stereo
            } else {
                ChannelLayout::Mono
            },
            audio_stream_index: if has_audio { 1 } else { -1 },
            ..MediaInfo::default()
        };
        Self {
            info,
            closed: AtomicBool::new(false),
        }
    }

    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }
}

impl Reader for PatternReader {
    fn info(&self) -> &MediaInfo {
        &self.info
    }

    fn frame_at(&self, position: i64) -> Result<Arc<Frame>, ReaderError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(ReaderError::Closed);
        }
        if position < 1 || position > self.info.video_length {
            return Err(ReaderError::OutOfBounds {
                requested: position,
                length: self.info.video_length,
            });
        }

        let width = self.info.width.max(0) as u32;
        let height = self.info.height.max(0) as u32;
        let shade = (position % 256) as u8;
        let pixel = [255, shade, shade, shade];
        let data: Vec<u8> = pixel
            .iter()
            .copied()
            .cycle()
            .take(PixelFormat::Argb.row_bytes(width) * height as usize)
            .collect();

        let meta = FrameMetadata {
            sequence: position as u64,
            width,
            height,
            stride: PixelFormat::Argb.row_bytes(width) as u32,
            format: PixelFormat::Argb,
            device_timestamp: Some(self.info.frame_interval().mul_f64((position - 1) as f64)),
        };
        Ok(Arc::new(Frame::new(meta, Bytes::from(data), AudioBlock::placeholder())))
    }
}
