pub mod convert;
pub mod frame;
pub mod producer;

pub use convert::{Passthrough, PixelConverter, YuvToArgb};
pub use frame::{AudioBlock, Frame, FrameMetadata, InputFrame, PixelFormat, RawCaptureFrame};
pub use producer::{CaptureDelegate, CaptureProducer, CaptureStats, FormatChange};
