//! Frame types shared by the conditioner and the encoder session.
//!
//! [`RawFrame`] is what the capture collaborator hands in; it may use
//! any [`PixelFormat`] and carry row padding. [`EncoderSample`] is the
//! conditioner's output: tightly packed, 16-aligned, timestamped, and in
//! one of the [`SampleFormat`]s an encoder accepts.

use std::time::{Duration, Instant};

// ── PixelFormat ──────────────────────────────────────────────────

/// Pixel layout of frames produced by the capture source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub enum PixelFormat {
    /// 4 bytes per pixel: Blue, Green, Red, Alpha.
    Bgra8,
    /// 4 bytes per pixel: Red, Green, Blue, Alpha.
    Rgba8,
    /// 3 bytes per pixel: Red, Green, Blue.
    Rgb8,
    /// Luma plane followed by one interleaved UV plane (4:2:0).
    Nv12,
    /// Luma plane followed by separate U and V planes (4:2:0).
    I420,
}

impl PixelFormat {
    /// Bytes per pixel for packed formats, `1` (luma) for planar ones.
    pub const fn bytes_per_pixel(self) -> usize {
        match self {
            PixelFormat::Bgra8 | PixelFormat::Rgba8 => 4,
            PixelFormat::Rgb8 => 3,
            PixelFormat::Nv12 | PixelFormat::I420 => 1,
        }
    }

    /// Whether this is a 4:2:0 YUV layout.
    pub const fn is_yuv(self) -> bool {
        matches!(self, PixelFormat::Nv12 | PixelFormat::I420)
    }

    /// The encoder sample format this layout can pass through as, if any.
    pub const fn native_sample_format(self) -> Option<SampleFormat> {
        match self {
            PixelFormat::I420 => Some(SampleFormat::I420),
            PixelFormat::Bgra8 => Some(SampleFormat::Bgra),
            _ => None,
        }
    }

    /// Row stride of the chroma plane(s) for a frame `width` pixels wide
    /// with luma / packed row stride `stride`. Zero for packed layouts.
    ///
    /// NV12 chroma rows carry `ceil(width / 2)` interleaved UV pairs, which
    /// for an odd width is one byte more than a tight luma row.
    pub fn chroma_stride(self, width: u32, stride: u32) -> usize {
        let stride = stride as usize;
        match self {
            PixelFormat::Bgra8 | PixelFormat::Rgba8 | PixelFormat::Rgb8 => 0,
            PixelFormat::Nv12 => stride.max(2 * (width as usize).div_ceil(2)),
            PixelFormat::I420 => stride.div_ceil(2).max((width as usize).div_ceil(2)),
        }
    }

    /// Minimum number of bytes a frame of this layout needs, given the
    /// luma / packed row stride.
    pub fn required_len(self, width: u32, height: u32, stride: u32) -> usize {
        let chroma_stride = self.chroma_stride(width, stride);
        let luma = stride as usize * height as usize;
        let chroma_rows = (height as usize).div_ceil(2);
        match self {
            PixelFormat::Bgra8 | PixelFormat::Rgba8 | PixelFormat::Rgb8 => luma,
            PixelFormat::Nv12 => luma + chroma_stride * chroma_rows,
            PixelFormat::I420 => luma + 2 * chroma_stride * chroma_rows,
        }
    }
}

// ── SampleFormat ─────────────────────────────────────────────────

/// Pixel layouts accepted by encoder backends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub enum SampleFormat {
    /// Planar YUV 4:2:0, BT.709 limited range. Preferred.
    I420,
    /// Packed BGRA. Fallback.
    Bgra,
}

impl SampleFormat {
    /// Preference order used by the conditioner.
    pub const PREFERENCE: [SampleFormat; 2] = [SampleFormat::I420, SampleFormat::Bgra];

    /// Byte size of a tightly packed image of this format.
    pub fn frame_len(self, width: u32, height: u32) -> usize {
        let (w, h) = (width as usize, height as usize);
        match self {
            SampleFormat::I420 => w * h + 2 * w.div_ceil(2) * h.div_ceil(2),
            SampleFormat::Bgra => w * h * 4,
        }
    }

    /// The flag for this format in a [`SampleFormats`] set.
    pub const fn flag(self) -> SampleFormats {
        match self {
            SampleFormat::I420 => SampleFormats::I420,
            SampleFormat::Bgra => SampleFormats::BGRA,
        }
    }
}

bitflags::bitflags! {
    /// Set of sample formats currently allowed as conditioner output.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct SampleFormats: u8 {
        const I420 = 0b0000_0001;
        const BGRA = 0b0000_0010;
    }
}

impl SampleFormats {
    /// Allowed formats in preference order.
    pub fn ordered(self) -> impl Iterator<Item = SampleFormat> {
        SampleFormat::PREFERENCE
            .into_iter()
            .filter(move |f| self.contains(f.flag()))
    }
}

// ── RawFrame ─────────────────────────────────────────────────────

/// An uncompressed frame produced by the capture collaborator.
///
/// Packed formats hold `height` rows of `stride` bytes. Planar formats
/// hold the luma plane (`stride * height`) followed by the chroma
/// plane(s); I420 chroma rows are `ceil(stride / 2)` bytes, NV12's
/// interleaved UV rows are `stride` bytes.
#[derive(Debug, Clone)]
pub struct RawFrame {
    /// Frame width in pixels.
    pub width: u32,
    /// Frame height in pixels.
    pub height: u32,
    /// Row pitch in **bytes** of the packed / luma plane.
    pub stride: u32,
    /// Pixel layout.
    pub format: PixelFormat,
    /// Pixel data.
    pub data: Vec<u8>,
    /// Capture timestamp.
    pub timestamp: Instant,
}

impl RawFrame {
    /// Build a frame with tightly packed rows.
    pub fn packed(format: PixelFormat, width: u32, height: u32, data: Vec<u8>) -> Self {
        Self {
            width,
            height,
            stride: width * format.bytes_per_pixel() as u32,
            format,
            data,
            timestamp: Instant::now(),
        }
    }

    /// Bytes this frame must hold for its declared geometry.
    pub fn required_len(&self) -> usize {
        self.format.required_len(self.width, self.height, self.stride)
    }

    /// Row `y` of the packed / luma plane, without padding.
    pub(crate) fn row(&self, y: u32) -> &[u8] {
        let start = y as usize * self.stride as usize;
        let len = self.width as usize * self.format.bytes_per_pixel();
        &self.data[start..start + len]
    }
}

// ── EncoderSample ────────────────────────────────────────────────

/// A conditioned, encoder-ready frame.
///
/// `data` is tightly packed: for I420 the Y plane is followed by U then
/// V; for BGRA rows are `width * 4` bytes.
#[derive(Debug, Clone)]
pub struct EncoderSample {
    pub format: SampleFormat,
    /// Multiple of 16.
    pub width: u32,
    /// Multiple of 16.
    pub height: u32,
    pub data: Vec<u8>,
    /// Presentation timestamp on the shared media clock.
    pub pts: Duration,
    /// Display duration (1 / frame rate).
    pub duration: Duration,
    /// Sequential number assigned by the conditioner.
    pub frame_number: u64,
}

impl EncoderSample {
    /// A solid-colour sample used to prime encoder sessions.
    pub fn solid(format: SampleFormat, width: u32, height: u32, pts: Duration) -> Self {
        let len = format.frame_len(width, height);
        let data = match format {
            SampleFormat::I420 => {
                // Mid grey: Y=126, U=V=128.
                let luma = width as usize * height as usize;
                let mut data = vec![128u8; len];
                data[..luma].fill(126);
                data
            }
            SampleFormat::Bgra => [0x80, 0x80, 0x80, 0xFF].repeat(len / 4),
        };
        Self {
            format,
            width,
            height,
            data,
            pts,
            duration: Duration::ZERO,
            frame_number: 0,
        }
    }

    /// Byte ranges of the Y, U and V planes (I420 only).
    pub fn planes(&self) -> Option<[std::ops::Range<usize>; 3]> {
        if self.format != SampleFormat::I420 {
            return None;
        }
        let luma = self.width as usize * self.height as usize;
        let chroma = (self.width as usize).div_ceil(2) * (self.height as usize).div_ceil(2);
        Some([0..luma, luma..luma + chroma, luma + chroma..luma + 2 * chroma])
    }
}

/// A tightly packed intermediate image between pipeline stages.
#[derive(Debug)]
pub(crate) struct Image {
    pub format: SampleFormat,
    pub width: u32,
    pub height: u32,
    pub data: Vec<u8>,
}

// ── Tests ────────────────────────────────────────────────────────
