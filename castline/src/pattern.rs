//! Synthetic colour-bar source.
//!
//! Seven SMPTE-style 75 % bars with a white bar sweeping across them,
//! so consecutive frames differ and motion is visible on the far end.

use castline_core::PixelFormat;
use castline_core::RawFrame;
use castline_core::frame::convert::{rgb_to_uv, rgb_to_y};

/// 75 % bars: white, yellow, cyan, green, magenta, red, blue.
const BARS: [[u8; 3]; 7] = [
    [191, 191, 191],
    [191, 191, 0],
    [0, 191, 191],
    [0, 191, 0],
    [191, 0, 191],
    [191, 0, 0],
    [0, 0, 191],
];

const SWEEP: [u8; 3] = [255, 255, 255];

pub struct TestPattern {
    format: PixelFormat,
    width: u32,
    height: u32,
    frame: u64,
}

impl TestPattern {
    /// YUV layouts are rounded down to even dimensions.
    pub fn new(format: PixelFormat, width: u32, height: u32) -> Self {
        let (width, height) = if format.is_yuv() {
            (width & !1, height & !1)
        } else {
            (width, height)
        };
        Self {
            format,
            width: width.max(2),
            height: height.max(2),
            frame: 0,
        }
    }

    pub fn dimensions(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    /// Render the next frame.
    pub fn next_frame(&mut self) -> RawFrame {
        let sweep_width = (self.width / 40).max(2);
        let sweep_x = (self.frame * 8 % u64::from(self.width)) as u32;
        self.frame += 1;

        let color_at = |x: u32| -> [u8; 3] {
            if x >= sweep_x && x < sweep_x + sweep_width {
                SWEEP
            } else {
                BARS[(x as usize * BARS.len()) / self.width as usize]
            }
        };

        let (w, h) = (self.width as usize, self.height as usize);
        let data = match self.format {
            PixelFormat::Bgra8 | PixelFormat::Rgba8 | PixelFormat::Rgb8 => {
                let row: Vec<u8> = (0..self.width)
                    .flat_map(|x| {
                        let [r, g, b] = color_at(x);
                        match self.format {
                            PixelFormat::Bgra8 => vec![b, g, r, 0xFF],
                            PixelFormat::Rgba8 => vec![r, g, b, 0xFF],
                            _ => vec![r, g, b],
                        }
                    })
                    .collect();
                row.repeat(h)
            }
            PixelFormat::I420 | PixelFormat::Nv12 => {
                let luma: Vec<u8> = (0..self.width)
                    .map(|x| {
                        let [r, g, b] = color_at(x);
                        rgb_to_y(r.into(), g.into(), b.into())
                    })
                    .collect();
                let chroma: Vec<(u8, u8)> = (0..self.width / 2)
                    .map(|cx| {
                        let [r, g, b] = color_at(cx * 2);
                        rgb_to_uv(r.into(), g.into(), b.into())
                    })
                    .collect();

                let mut data = luma.repeat(h);
                if self.format == PixelFormat::I420 {
                    let u: Vec<u8> = chroma.iter().map(|c| c.0).collect();
                    let v: Vec<u8> = chroma.iter().map(|c| c.1).collect();
                    data.extend(u.repeat(h / 2));
                    data.extend(v.repeat(h / 2));
                } else {
                    let uv: Vec<u8> = chroma.iter().flat_map(|&(u, v)| [u, v]).collect();
                    data.extend(uv.repeat(h / 2));
                }
                debug_assert_eq!(data.len(), w * h * 3 / 2);
                data
            }
        };

        RawFrame::packed(self.format, self.width, self.height, data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frames_fit_their_declared_geometry() {
        for format in [
            PixelFormat::Bgra8,
            PixelFormat::Rgba8,
            PixelFormat::Rgb8,
            PixelFormat::I420,
            PixelFormat::Nv12,
        ] {
            let mut pattern = TestPattern::new(format, 641, 361);
            let frame = pattern.next_frame();
            assert_eq!(frame.data.len(), frame.required_len(), "{format:?}");
        }
    }

    #[test]
    fn yuv_dimensions_are_even() {
        let pattern = TestPattern::new(PixelFormat::Nv12, 641, 361);
        assert_eq!(pattern.dimensions(), (640, 360));
        let pattern = TestPattern::new(PixelFormat::Bgra8, 641, 361);
        assert_eq!(pattern.dimensions(), (641, 361));
    }

    #[test]
    fn sweep_moves_between_frames() {
        let mut pattern = TestPattern::new(PixelFormat::Rgb8, 320, 16);
        let a = pattern.next_frame();
        let b = pattern.next_frame();
        assert_ne!(a.data, b.data);
    }

    #[test]
    fn first_bar_is_grey_white() {
        let mut pattern = TestPattern::new(PixelFormat::Bgra8, 700, 4);
        // Skip past the sweep.
        pattern.frame = 10;
        let frame = pattern.next_frame();
        assert_eq!(&frame.data[0..4], &[191, 191, 191, 0xFF]);
    }
}
