//! Aspect-fill scaling.
//!
//! The output always covers the whole target: the source is scaled by
//! `max(tw / sw, th / sh)` and the overflow on the longer axis is cropped
//! symmetrically. The ingest side declares a fixed resolution, so there
//! is no letterboxing.

use crate::error::ConditionError;
use crate::frame::types::{Image, SampleFormat};

/// Source-space mapping of an aspect-fill transform.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FillMapping {
    /// Destination pixels per source pixel.
    pub scale: f64,
    /// Left edge of the visible source region.
    pub offset_x: f64,
    /// Top edge of the visible source region.
    pub offset_y: f64,
}

impl FillMapping {
    /// Compute the mapping from a `sw × sh` source into a `tw × th` target.
    pub fn new(sw: u32, sh: u32, tw: u32, th: u32) -> Self {
        let sx = tw as f64 / sw as f64;
        let sy = th as f64 / sh as f64;
        let scale = sx.max(sy);
        let visible_w = tw as f64 / scale;
        let visible_h = th as f64 / scale;
        Self {
            scale,
            offset_x: (sw as f64 - visible_w) / 2.0,
            offset_y: (sh as f64 - visible_h) / 2.0,
        }
    }

    /// Width and height of the source region that ends up visible.
    pub fn visible(&self, tw: u32, th: u32) -> (f64, f64) {
        (tw as f64 / self.scale, th as f64 / self.scale)
    }
}

/// Precomputed bilinear taps along one axis.
struct Taps {
    lo: Vec<usize>,
    hi: Vec<usize>,
    /// Weight of `hi` in 1/256ths.
    frac: Vec<u32>,
}

impl Taps {
    fn new(dst_len: usize, src_len: usize, scale: f64, offset: f64) -> Self {
        let mut taps = Taps {
            lo: Vec::with_capacity(dst_len),
            hi: Vec::with_capacity(dst_len),
            frac: Vec::with_capacity(dst_len),
        };
        let max = (src_len - 1) as f64;
        for d in 0..dst_len {
            let s = (offset + (d as f64 + 0.5) / scale - 0.5).clamp(0.0, max);
            let lo = s.floor();
            taps.lo.push(lo as usize);
            taps.hi.push((lo as usize + 1).min(src_len - 1));
            taps.frac.push(((s - lo) * 256.0) as u32);
        }
        taps
    }
}

/// Bilinear aspect-fill of one plane with `channels` interleaved bytes
/// per pixel, appending to `dst`.
fn fill_plane(
    src: &[u8],
    (sw, sh): (usize, usize),
    channels: usize,
    (tw, th): (usize, usize),
    dst: &mut Vec<u8>,
) {
    let map = FillMapping::new(sw as u32, sh as u32, tw as u32, th as u32);
    let xs = Taps::new(tw, sw, map.scale, map.offset_x);
    let ys = Taps::new(th, sh, map.scale, map.offset_y);
    let stride = sw * channels;

    dst.reserve(tw * th * channels);
    for y in 0..th {
        let row_lo = &src[ys.lo[y] * stride..(ys.lo[y] + 1) * stride];
        let row_hi = &src[ys.hi[y] * stride..(ys.hi[y] + 1) * stride];
        let fy = ys.frac[y];
        for x in 0..tw {
            let (x0, x1, fx) = (xs.lo[x] * channels, xs.hi[x] * channels, xs.frac[x]);
            for c in 0..channels {
                let top = row_lo[x0 + c] as u32 * (256 - fx) + row_lo[x1 + c] as u32 * fx;
                let bot = row_hi[x0 + c] as u32 * (256 - fx) + row_hi[x1 + c] as u32 * fx;
                let v = (top * (256 - fy) + bot * fy + (1 << 15)) >> 16;
                dst.push(v.min(255) as u8);
            }
        }
    }
}

/// Aspect-fill `image` into a `tw × th` image of the same format.
///
/// `out` is cleared and reused for the result.
pub(crate) fn aspect_fill(image: &Image, tw: u32, th: u32, mut out: Vec<u8>) -> Result<Image, ConditionError> {
    if image.width == 0 || image.height == 0 || tw == 0 || th == 0 {
        return Err(ConditionError::ScalingFailed(format!(
            "cannot scale {}x{} to {tw}x{th}",
            image.width, image.height
        )));
    }
    let expected = image.format.frame_len(image.width, image.height);
    if image.data.len() < expected {
        return Err(ConditionError::ScalingFailed(format!(
            "source holds {} bytes, {expected} needed",
            image.data.len()
        )));
    }

    let (sw, sh) = (image.width as usize, image.height as usize);
    let (dw, dh) = (tw as usize, th as usize);
    out.clear();

    match image.format {
        SampleFormat::Bgra => fill_plane(&image.data, (sw, sh), 4, (dw, dh), &mut out),
        SampleFormat::I420 => {
            let luma = sw * sh;
            let (scw, sch) = (sw.div_ceil(2), sh.div_ceil(2));
            let chroma = scw * sch;
            let (dcw, dch) = (dw.div_ceil(2), dh.div_ceil(2));
            fill_plane(&image.data[..luma], (sw, sh), 1, (dw, dh), &mut out);
            fill_plane(&image.data[luma..luma + chroma], (scw, sch), 1, (dcw, dch), &mut out);
            fill_plane(
                &image.data[luma + chroma..luma + 2 * chroma],
                (scw, sch),
                1,
                (dcw, dch),
                &mut out,
            );
        }
    }

    Ok(Image {
        format: image.format,
        width: tw,
        height: th,
        data: out,
    })
}

// ── Tests ────────────────────────────────────────────────────────
