//! Pixel-format conversion strategies.
//!
//! Each [`ConversionStrategy`] produces one [`SampleFormat`] from any
//! [`PixelFormat`]. The conditioner tries them in preference order and
//! keeps the first success, so a frame that cannot become I420 still
//! reaches the encoder as BGRA.
//!
//! Colour math is ITU-R BT.709, limited range, 8-bit fixed point:
//!
//! ```text
//! Y =  16 + ( 47 R + 157 G +  16 B) / 256
//! U = 128 + (-26 R -  86 G + 112 B) / 256
//! V = 128 + (112 R - 102 G -  10 B) / 256
//! ```

use crate::error::ConditionError;
use crate::frame::types::{Image, PixelFormat, RawFrame, SampleFormat};

// ── ConversionStrategy ───────────────────────────────────────────

/// One tier of the format fallback chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConversionStrategy {
    /// Planar YUV 4:2:0. Needs even dimensions.
    PlanarI420,
    /// Packed BGRA. Accepts any geometry.
    PackedBgra,
}

impl ConversionStrategy {
    /// The strategy producing `format`.
    pub fn for_format(format: SampleFormat) -> Self {
        match format {
            SampleFormat::I420 => Self::PlanarI420,
            SampleFormat::Bgra => Self::PackedBgra,
        }
    }

    /// Format this strategy emits.
    pub fn output(self) -> SampleFormat {
        match self {
            Self::PlanarI420 => SampleFormat::I420,
            Self::PackedBgra => SampleFormat::Bgra,
        }
    }

    /// Convert `frame` into a tightly packed image, reusing `buf`.
    ///
    /// On failure `buf` is dropped; the caller hands the next strategy a
    /// fresh buffer from its pool.
    pub(crate) fn apply(self, frame: &RawFrame, buf: Vec<u8>) -> Result<Image, ConditionError> {
        match self {
            Self::PlanarI420 => to_i420(frame, buf),
            Self::PackedBgra => to_bgra(frame, buf),
        }
    }
}

// ── BT.709 helpers ───────────────────────────────────────────────

#[inline]
fn clamp_u8(v: i32) -> u8 {
    v.clamp(0, 255) as u8
}

/// BT.709 limited-range luma for an RGB pixel.
#[inline]
pub fn rgb_to_y(r: i32, g: i32, b: i32) -> u8 {
    clamp_u8(((47 * r + 157 * g + 16 * b + 128) >> 8) + 16)
}

/// BT.709 limited-range chroma `(U, V)` for an RGB pixel.
#[inline]
pub fn rgb_to_uv(r: i32, g: i32, b: i32) -> (u8, u8) {
    let u = ((-26 * r - 86 * g + 112 * b + 128) >> 8) + 128;
    let v = ((112 * r - 102 * g - 10 * b + 128) >> 8) + 128;
    (clamp_u8(u), clamp_u8(v))
}

#[inline]
pub(crate) fn yuv_to_rgb(y: u8, u: u8, v: u8) -> (u8, u8, u8) {
    let c = y as i32 - 16;
    let d = u as i32 - 128;
    let e = v as i32 - 128;
    let r = (298 * c + 459 * e + 128) >> 8;
    let g = (298 * c - 55 * d - 136 * e + 128) >> 8;
    let b = (298 * c + 541 * d + 128) >> 8;
    (clamp_u8(r), clamp_u8(g), clamp_u8(b))
}

/// `(r, g, b)` of pixel `x` in a packed row.
#[inline]
fn packed_rgb(format: PixelFormat, row: &[u8], x: usize) -> (i32, i32, i32) {
    match format {
        PixelFormat::Bgra8 => {
            let p = &row[x * 4..x * 4 + 3];
            (p[2] as i32, p[1] as i32, p[0] as i32)
        }
        PixelFormat::Rgba8 => {
            let p = &row[x * 4..x * 4 + 3];
            (p[0] as i32, p[1] as i32, p[2] as i32)
        }
        PixelFormat::Rgb8 => {
            let p = &row[x * 3..x * 3 + 3];
            (p[0] as i32, p[1] as i32, p[2] as i32)
        }
        PixelFormat::Nv12 | PixelFormat::I420 => (0, 0, 0),
    }
}

/// Chroma sample `(u, v)` at chroma coordinates `(cx, cy)` of a raw
/// planar frame.
#[inline]
fn raw_chroma(frame: &RawFrame, cx: usize, cy: usize) -> Result<(u8, u8), ConditionError> {
    let cs = frame.format.chroma_stride(frame.width, frame.stride);
    let luma_len = frame.stride as usize * frame.height as usize;
    let (u, v) = match frame.format {
        PixelFormat::Nv12 => {
            let at = luma_len + cy * cs + cx * 2;
            (at, at + 1)
        }
        _ => {
            let chroma_rows = (frame.height as usize).div_ceil(2);
            let u = luma_len + cy * cs + cx;
            (u, u + cs * chroma_rows)
        }
    };
    match (frame.data.get(u), frame.data.get(v)) {
        (Some(&u), Some(&v)) => Ok((u, v)),
        _ => Err(ConditionError::ConversionFailed(format!(
            "chroma ({cx}, {cy}) outside {}-byte {:?} buffer",
            frame.data.len(),
            frame.format
        ))),
    }
}

// ── → I420 ───────────────────────────────────────────────────────

fn to_i420(frame: &RawFrame, mut out: Vec<u8>) -> Result<Image, ConditionError> {
    let (w, h) = (frame.width as usize, frame.height as usize);
    if w % 2 != 0 || h % 2 != 0 {
        return Err(ConditionError::ConversionFailed(format!(
            "4:2:0 needs even dimensions, got {w}x{h}"
        )));
    }

    let luma = w * h;
    let (cw, ch) = (w / 2, h / 2);
    out.clear();
    out.resize(luma + 2 * cw * ch, 0);
    let (y_plane, chroma) = out.split_at_mut(luma);
    let (u_plane, v_plane) = chroma.split_at_mut(cw * ch);

    match frame.format {
        PixelFormat::I420 | PixelFormat::Nv12 => {
            for y in 0..h {
                y_plane[y * w..(y + 1) * w].copy_from_slice(frame.row(y as u32));
            }
            for cy in 0..ch {
                for cx in 0..cw {
                    let (u, v) = raw_chroma(frame, cx, cy)?;
                    u_plane[cy * cw + cx] = u;
                    v_plane[cy * cw + cx] = v;
                }
            }
        }
        format => {
            for cy in 0..ch {
                let top = frame.row((cy * 2) as u32);
                let bottom = frame.row((cy * 2 + 1) as u32);
                for cx in 0..cw {
                    let (mut rs, mut gs, mut bs) = (0, 0, 0);
                    for (dy, row) in [top, bottom].into_iter().enumerate() {
                        for dx in 0..2 {
                            let x = cx * 2 + dx;
                            let (r, g, b) = packed_rgb(format, row, x);
                            y_plane[(cy * 2 + dy) * w + x] = rgb_to_y(r, g, b);
                            rs += r;
                            gs += g;
                            bs += b;
                        }
                    }
                    let (u, v) = rgb_to_uv((rs + 2) / 4, (gs + 2) / 4, (bs + 2) / 4);
                    u_plane[cy * cw + cx] = u;
                    v_plane[cy * cw + cx] = v;
                }
            }
        }
    }

    Ok(Image {
        format: SampleFormat::I420,
        width: frame.width,
        height: frame.height,
        data: out,
    })
}

// ── → BGRA ───────────────────────────────────────────────────────

fn to_bgra(frame: &RawFrame, mut out: Vec<u8>) -> Result<Image, ConditionError> {
    let (w, h) = (frame.width as usize, frame.height as usize);
    out.clear();
    out.resize(w * h * 4, 0);

    for y in 0..h {
        let dst = &mut out[y * w * 4..(y + 1) * w * 4];
        match frame.format {
            PixelFormat::Bgra8 => dst.copy_from_slice(frame.row(y as u32)),
            PixelFormat::Rgba8 | PixelFormat::Rgb8 => {
                let row = frame.row(y as u32);
                for x in 0..w {
                    let (r, g, b) = packed_rgb(frame.format, row, x);
                    let a = if frame.format == PixelFormat::Rgba8 {
                        row[x * 4 + 3]
                    } else {
                        0xFF
                    };
                    dst[x * 4..x * 4 + 4].copy_from_slice(&[b as u8, g as u8, r as u8, a]);
                }
            }
            PixelFormat::Nv12 | PixelFormat::I420 => {
                let luma = frame.row(y as u32);
                for x in 0..w {
                    let (u, v) = raw_chroma(frame, x / 2, y / 2)?;
                    let (r, g, b) = yuv_to_rgb(luma[x], u, v);
                    dst[x * 4..x * 4 + 4].copy_from_slice(&[b, g, r, 0xFF]);
                }
            }
        }
    }

    Ok(Image {
        format: SampleFormat::Bgra,
        width: frame.width,
        height: frame.height,
        data: out,
    })
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn solid_bgra(w: u32, h: u32, bgra: [u8; 4]) -> RawFrame {
        RawFrame::packed(
            PixelFormat::Bgra8,
            w,
            h,
            bgra.repeat((w * h) as usize),
        )
    }

    #[test]
    fn bt709_reference_points() {
        assert_eq!(rgb_to_y(0, 0, 0), 16);
        assert_eq!(rgb_to_y(255, 255, 255), 235);
        assert_eq!(rgb_to_uv(255, 255, 255), (128, 128));
        assert_eq!(rgb_to_uv(0, 0, 0), (128, 128));
        // Pure blue pushes U towards its maximum.
        let (u, _) = rgb_to_uv(0, 0, 255);
        assert!(u > 230);
    }

    #[test]
    fn yuv_roundtrip_is_close() {
        for (r, g, b) in [(200, 30, 60), (10, 220, 90), (128, 128, 128)] {
            let y = rgb_to_y(r, g, b);
            let (u, v) = rgb_to_uv(r, g, b);
            let (r2, g2, b2) = yuv_to_rgb(y, u, v);
            assert!((r - r2 as i32).abs() <= 4, "r {r} vs {r2}");
            assert!((g - g2 as i32).abs() <= 4, "g {g} vs {g2}");
            assert!((b - b2 as i32).abs() <= 4, "b {b} vs {b2}");
        }
    }

    #[test]
    fn bgra_to_i420_solid_white() {
        let frame = solid_bgra(4, 2, [255, 255, 255, 255]);
        let img = ConversionStrategy::PlanarI420.apply(&frame, Vec::new()).unwrap();
        assert_eq!(img.format, SampleFormat::I420);
        assert_eq!(img.data.len(), 8 + 2 + 2);
        assert!(img.data[..8].iter().all(|&y| y == 235));
        assert!(img.data[8..].iter().all(|&c| c == 128));
    }

    #[test]
    fn i420_rejects_odd_dimensions() {
        let frame = solid_bgra(5, 4, [0, 0, 0, 255]);
        let err = ConversionStrategy::PlanarI420
            .apply(&frame, Vec::new())
            .unwrap_err();
        assert!(matches!(err, ConditionError::ConversionFailed(_)));

        // The BGRA tier accepts the same frame.
        let img = ConversionStrategy::PackedBgra.apply(&frame, Vec::new()).unwrap();
        assert_eq!(img.data.len(), 5 * 4 * 4);
    }

    #[test]
    fn nv12_deinterleaves_chroma() {
        // 2x2 luma + one UV pair.
        let frame = RawFrame {
            width: 2,
            height: 2,
            stride: 2,
            format: PixelFormat::Nv12,
            data: vec![16, 17, 18, 19, 100, 200],
            timestamp: std::time::Instant::now(),
        };
        let img = ConversionStrategy::PlanarI420.apply(&frame, Vec::new()).unwrap();
        assert_eq!(img.data, vec![16, 17, 18, 19, 100, 200]);
    }

    #[test]
    fn padded_stride_is_dropped() {
        // 2 pixels wide, 12-byte stride (4 bytes of padding per row).
        let mut data = Vec::new();
        for _ in 0..2 {
            data.extend_from_slice(&[1, 2, 3, 4, 5, 6, 7, 8, 0xEE, 0xEE, 0xEE, 0xEE]);
        }
        let frame = RawFrame {
            width: 2,
            height: 2,
            stride: 12,
            format: PixelFormat::Bgra8,
            data,
            timestamp: std::time::Instant::now(),
        };
        let img = ConversionStrategy::PackedBgra.apply(&frame, Vec::new()).unwrap();
        assert_eq!(img.data.len(), 16);
        assert!(!img.data.contains(&0xEE));
    }

    #[test]
    fn rgb8_to_bgra_swizzles() {
        let frame = RawFrame::packed(PixelFormat::Rgb8, 1, 1, vec![10, 20, 30]);
        let img = ConversionStrategy::PackedBgra.apply(&frame, Vec::new()).unwrap();
        assert_eq!(img.data, vec![30, 20, 10, 255]);
    }

    /// Planar frame whose every chroma sample is `(u, v)`.
    fn flat_yuv(format: PixelFormat, w: u32, h: u32, y: u8, u: u8, v: u8) -> RawFrame {
        let luma = (w * h) as usize;
        let chroma_rows = h.div_ceil(2) as usize;
        let mut data = vec![y; luma];
        match format {
            PixelFormat::Nv12 => {
                let row = format.chroma_stride(w, w);
                for _ in 0..chroma_rows * row / 2 {
                    data.extend_from_slice(&[u, v]);
                }
            }
            _ => {
                let plane = format.chroma_stride(w, w) * chroma_rows;
                data.extend(std::iter::repeat_n(u, plane));
                data.extend(std::iter::repeat_n(v, plane));
            }
        }
        RawFrame {
            width: w,
            height: h,
            stride: w,
            format,
            data,
            timestamp: std::time::Instant::now(),
        }
    }

    #[test]
    fn odd_width_nv12_falls_back_to_bgra() {
        let frame = flat_yuv(PixelFormat::Nv12, 161, 120, 81, 90, 240);
        assert_eq!(frame.data.len(), frame.required_len());
        assert!(ConversionStrategy::PlanarI420.apply(&frame, Vec::new()).is_err());

        let img = ConversionStrategy::PackedBgra.apply(&frame, Vec::new()).unwrap();
        assert_eq!(img.data.len(), 161 * 120 * 4);
        // Last pixel reads the final UV pair of the last chroma row.
        let (r, g, b) = yuv_to_rgb(81, 90, 240);
        assert_eq!(&img.data[img.data.len() - 4..], &[b, g, r, 0xFF]);
    }

    #[test]
    fn odd_height_i420_falls_back_to_bgra() {
        let frame = flat_yuv(PixelFormat::I420, 160, 121, 120, 200, 60);
        assert_eq!(frame.data.len(), frame.required_len());
        assert!(ConversionStrategy::PlanarI420.apply(&frame, Vec::new()).is_err());

        let img = ConversionStrategy::PackedBgra.apply(&frame, Vec::new()).unwrap();
        assert_eq!(img.data.len(), 160 * 121 * 4);
        let (r, g, b) = yuv_to_rgb(120, 200, 60);
        assert_eq!(&img.data[..4], &[b, g, r, 0xFF]);
        assert_eq!(&img.data[img.data.len() - 4..], &[b, g, r, 0xFF]);
    }

    #[test]
    fn truncated_chroma_is_an_error() {
        let mut frame = flat_yuv(PixelFormat::Nv12, 5, 2, 16, 128, 128);
        frame.data.pop();
        let err = ConversionStrategy::PackedBgra
            .apply(&frame, Vec::new())
            .unwrap_err();
        assert!(matches!(err, ConditionError::ConversionFailed(_)));
    }
}
