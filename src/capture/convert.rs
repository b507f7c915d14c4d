//! Device format to processing format conversion.
//!
//! Converters run inside the parallel batch tasks, one call per frame, so
//! they must be `Send + Sync` and must not keep per-frame state.

use crate::capture::frame::{PixelFormat, RawCaptureFrame};
use crate::error::CaptureError;

/// Synchronous pixel converter used by each conversion task.
pub trait PixelConverter: Send + Sync {
    /// Format written into the destination buffer.
    fn output_format(&self) -> PixelFormat;

    /// Convert `src` into `dst`, which is sized `width * height * bpp(output)`.
    fn convert(&self, src: &RawCaptureFrame, dst: &mut [u8]) -> Result<(), CaptureError>;
}

/// 8-bit 4:2:2 YUV (UYVY or YUYV) to 32-bit ARGB/BGRA, BT.601 studio range.
#[derive(Debug, Clone, Copy)]
pub struct YuvToArgb {
    output: PixelFormat,
}

impl YuvToArgb {
    pub fn new() -> Self {
        Self {
            output: PixelFormat::Argb,
        }
    }

    pub fn bgra() -> Self {
        Self {
            output: PixelFormat::Bgra,
        }
    }
}

impl Default for YuvToArgb {
    fn default() -> Self {
        Self::new()
    }
}

#[inline]
fn clamp8(v: i32) -> u8 {
    v.clamp(0, 255) as u8
}

#[inline]
fn yuv_to_rgb(y: u8, u: u8, v: u8) -> [u8; 3] {
    let c = y as i32 - 16;
    let d = u as i32 - 128;
    let e = v as i32 - 128;
    [
        clamp8((298 * c + 409 * e + 128) >> 8),
        clamp8((298 * c - 100 * d - 208 * e + 128) >> 8),
        clamp8((298 * c + 516 * d + 128) >> 8),
    ]
}

impl PixelConverter for YuvToArgb {
    fn output_format(&self) -> PixelFormat {
        self.output
    }

    fn convert(&self, src: &RawCaptureFrame, dst: &mut [u8]) -> Result<(), CaptureError> {
        // Byte offsets of (Y0, U, Y1, V) inside each 4-byte macropixel
        let (y0, u, y1, v) = match src.format {
            PixelFormat::Uyvy => (1, 0, 3, 2),
            PixelFormat::Yuyv => (0, 1, 2, 3),
            other => return Err(CaptureError::UnsupportedFormat(other)),
        };
        if src.width % 2 != 0 {
            return Err(CaptureError::Conversion(format!(
                "4:2:2 input needs an even width, got {}",
                src.width
            )));
        }

        let width = src.width as usize;
        let height = src.height as usize;
        let in_row = src.row_bytes.max(width * 2);
        check_len(in_row * height, src.data.len())?;
        let out_row = width * 4;
        check_len(out_row * height, dst.len())?;

        for (src_row, dst_row) in src
            .data
            .chunks(in_row)
            .zip(dst.chunks_mut(out_row))
            .take(height)
        {
            for (mp, out) in src_row[..width * 2]
                .chunks_exact(4)
                .zip(dst_row.chunks_exact_mut(8))
            {
                let left = yuv_to_rgb(mp[y0], mp[u], mp[v]);
                let right = yuv_to_rgb(mp[y1], mp[u], mp[v]);
                write_pixel(self.output, left, &mut out[..4]);
                write_pixel(self.output, right, &mut out[4..]);
            }
        }
        Ok(())
    }
}

#[inline]
fn write_pixel(format: PixelFormat, [r, g, b]: [u8; 3], out: &mut [u8]) {
    match format {
        PixelFormat::Bgra => out.copy_from_slice(&[b, g, r, 255]),
        _ => out.copy_from_slice(&[255, r, g, b]),
    }
}

fn check_len(expected: usize, actual: usize) -> Result<(), CaptureError> {
    if actual < expected {
        return Err(CaptureError::BufferSize { expected, actual });
    }
    Ok(())
}

/// Copies frames that already arrive in the processing format, dropping row padding.
#[derive(Debug, Clone, Copy)]
pub struct Passthrough(pub PixelFormat);

impl PixelConverter for Passthrough {
    fn output_format(&self) -> PixelFormat {
        self.0
    }

    fn convert(&self, src: &RawCaptureFrame, dst: &mut [u8]) -> Result<(), CaptureError> {
        if src.format != self.0 {
            return Err(CaptureError::UnsupportedFormat(src.format));
        }
        let row = self.0.row_bytes(src.width);
        let in_row = src.row_bytes.max(row);
        let height = src.height as usize;
        check_len(in_row * height, src.data.len())?;
        check_len(row * height, dst.len())?;

        for (src_row, dst_row) in src.data.chunks(in_row).zip(dst.chunks_mut(row)).take(height) {
            dst_row.copy_from_slice(&src_row[..row]);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use std::time::Instant;

    fn raw(format: PixelFormat, width: u32, height: u32, row_bytes: usize, data: Vec<u8>) -> RawCaptureFrame {
        RawCaptureFrame {
            data: Bytes::from(data),
            audio: None,
            width,
            height,
            row_bytes,
            format,
            device_timestamp: None,
            arrived: Instant::now(),
        }
    }

    #[test]
    fn uyvy_black_and_white() {
        // U Y0 V Y1: left pixel black, right pixel white
        let src = raw(PixelFormat::Uyvy, 2, 1, 4, vec![128, 16, 128, 235]);
        let mut dst = vec![0u8; 8];
        YuvToArgb::new().convert(&src, &mut dst).unwrap();
        assert_eq!(&dst[..4], &[255, 0, 0, 0]);
        assert_eq!(&dst[4..], &[255, 255, 255, 255]);
    }

    #[test]
    fn yuyv_to_bgra_keeps_alpha_last() {
        let src = raw(PixelFormat::Yuyv, 2, 1, 4, vec![235, 128, 235, 128]);
        let mut dst = vec![0u8; 8];
        YuvToArgb::bgra().convert(&src, &mut dst).unwrap();
        assert_eq!(dst, vec![255; 8]);
    }

    #[test]
    fn padded_rows_are_skipped() {
        let mut data = vec![128, 16, 128, 16, 9, 9];
        data.extend_from_slice(&[128, 235, 128, 235, 9, 9]);
        let src = raw(PixelFormat::Uyvy, 2, 2, 6, data);
        let mut dst = vec![0u8; 16];
        YuvToArgb::new().convert(&src, &mut dst).unwrap();
        assert_eq!(&dst[..8], &[255, 0, 0, 0, 255, 0, 0, 0]);
        assert_eq!(&dst[8..], &[255; 8]);
    }

    #[test]
    fn short_buffer_is_rejected() {
        let src = raw(PixelFormat::Uyvy, 4, 2, 8, vec![0; 10]);
        let mut dst = vec![0u8; 32];
        let err = YuvToArgb::new().convert(&src, &mut dst).unwrap_err();
        assert!(matches!(
            err,
            CaptureError::BufferSize {
                expected: 16,
                actual: 10
            }
        ));
    }

    #[test]
    fn rgb_input_is_not_yuv() {
        let src = raw(PixelFormat::Rgb24, 2, 1, 6, vec![0; 6]);
        let mut dst = vec![0u8; 8];
        assert!(matches!(
            YuvToArgb::new().convert(&src, &mut dst),
            Err(CaptureError::UnsupportedFormat(PixelFormat::Rgb24))
        ));
    }

    #[test]
    fn passthrough_compacts_rows() {
        let src = raw(PixelFormat::Rgb24, 1, 2, 4, vec![1, 2, 3, 0, 4, 5, 6, 0]);
        let mut dst = vec![0u8; 6];
        Passthrough(PixelFormat::Rgb24).convert(&src, &mut dst).unwrap();
        assert_eq!(dst, vec![1, 2, 3, 4, 5, 6]);
    }
}
