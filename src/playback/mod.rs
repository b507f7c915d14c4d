//! Frame-accurate playback: a scheduler paces frames from a [`Reader`] to a
//! render worker and keeps video in step with the audio clock.

pub mod audio;
pub mod reader;
pub mod render;
pub mod scheduler;
pub mod state;

pub use audio::{AudioWorker, ClockAudioWorker};
pub use reader::{ChannelLayout, Fraction, MediaInfo, PatternReader, Reader};
pub use render::{Renderer, VideoRenderWorker};
pub use scheduler::{compute_sleep, PlaybackScheduler, TickReport};
pub use state::{PlaybackState, PlaybackStatus};
