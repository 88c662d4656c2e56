//! Raw frame → encoder sample pipeline.
//!
//! Stages, each short-circuiting on failure:
//!
//! 1. **Validate** geometry and buffer size.
//! 2. **Normalize** the pixel format through the allowed
//!    [`ConversionStrategy`] tiers (I420, then BGRA).
//! 3. **Align & scale** to the 16-aligned target with aspect-fill.
//! 4. **Package** with a media-clock timestamp and frame duration.

use std::sync::Arc;
use std::time::Instant;

use tracing::debug;

use crate::error::ConditionError;
use crate::frame::convert::ConversionStrategy;
use crate::frame::pool::{BufferPool, MediaClock};
use crate::frame::scale::aspect_fill;
use crate::frame::types::{EncoderSample, Image, RawFrame, SampleFormat, SampleFormats};
use crate::settings::{MAX_HEIGHT, MAX_WIDTH, MIN_HEIGHT, MIN_WIDTH, Settings};

/// Stateful frame conditioner owned by the frame thread.
pub struct FrameConditioner {
    clock: Arc<MediaClock>,
    allowed: SampleFormats,
    pool: BufferPool,
    frame_number: u64,
    fallback_logged: bool,
}

impl FrameConditioner {
    pub fn new(clock: Arc<MediaClock>) -> Self {
        Self {
            clock,
            allowed: SampleFormats::all(),
            pool: BufferPool::default(),
            frame_number: 0,
            fallback_logged: false,
        }
    }

    /// Condition one frame for the stream described by `target`.
    ///
    /// `frame` is only borrowed for the duration of the call.
    pub fn condition(
        &mut self,
        frame: &RawFrame,
        target: &Settings,
    ) -> Result<EncoderSample, ConditionError> {
        validate(frame)?;
        let image = self.normalize(frame)?;
        let (tw, th) = target.target_dimensions();
        let image = self.align(image, tw, th)?;
        Ok(self.package(image, frame.timestamp, target))
    }

    /// Hand a sample's buffer back once the encoder is done with it.
    pub fn recycle(&mut self, sample: EncoderSample) {
        self.pool.give(sample.data);
    }

    /// Stop producing `format`. Returns `false` when no format is left.
    pub fn disable_format(&mut self, format: SampleFormat) -> bool {
        self.allowed.remove(format.flag());
        debug!(?format, remaining = ?self.allowed, "conditioner format disabled");
        !self.allowed.is_empty()
    }

    /// Re-allow every sample format.
    pub fn reset_formats(&mut self) {
        self.allowed = SampleFormats::all();
        self.fallback_logged = false;
    }

    /// The format most frames will come out as.
    pub fn preferred_format(&self) -> Option<SampleFormat> {
        self.allowed.ordered().next()
    }

    /// Drop pooled buffers. Returns the bytes released.
    pub fn relieve_memory(&mut self) -> usize {
        self.pool.shrink()
    }

    /// Number of samples produced so far.
    pub fn frames_conditioned(&self) -> u64 {
        self.frame_number
    }

    // ── Stages ───────────────────────────────────────────────────

    /// Strategies to try for this frame: the native layout first when it
    /// is already an allowed sample format, then the allowed formats in
    /// preference order.
    fn strategies(&self, frame: &RawFrame) -> Vec<ConversionStrategy> {
        let native = frame
            .format
            .native_sample_format()
            .filter(|f| self.allowed.contains(f.flag()));
        native
            .into_iter()
            .chain(self.allowed.ordered().filter(|f| Some(*f) != native))
            .map(ConversionStrategy::for_format)
            .collect()
    }

    fn normalize(&mut self, frame: &RawFrame) -> Result<Image, ConditionError> {
        let strategies = self.strategies(frame);
        let mut last_err = ConditionError::UnsupportedFormat(frame.format);

        for (tier, strategy) in strategies.into_iter().enumerate() {
            let buf = self
                .pool
                .take(strategy.output().frame_len(frame.width, frame.height));
            match strategy.apply(frame, buf) {
                Ok(image) => {
                    if tier > 0 && !self.fallback_logged {
                        debug!(
                            input = ?frame.format,
                            output = ?image.format,
                            "falling back to secondary sample format: {last_err}"
                        );
                        self.fallback_logged = true;
                    }
                    return Ok(image);
                }
                Err(e) => last_err = e,
            }
        }

        Err(last_err)
    }

    fn align(&mut self, image: Image, tw: u32, th: u32) -> Result<Image, ConditionError> {
        if image.width == tw && image.height == th {
            return Ok(image);
        }
        let out = self.pool.take(image.format.frame_len(tw, th));
        let scaled = aspect_fill(&image, tw, th, out);
        self.pool.give(image.data);
        scaled
    }

    fn package(&mut self, image: Image, captured: Instant, target: &Settings) -> EncoderSample {
        self.frame_number += 1;
        EncoderSample {
            format: image.format,
            width: image.width,
            height: image.height,
            data: image.data,
            pts: self.clock.stamp(captured),
            duration: target.frame_duration(),
            frame_number: self.frame_number,
        }
    }
}

fn validate(frame: &RawFrame) -> Result<(), ConditionError> {
    let (w, h) = (frame.width, frame.height);
    if !(MIN_WIDTH..=MAX_WIDTH).contains(&w) || !(MIN_HEIGHT..=MAX_HEIGHT).contains(&h) {
        return Err(ConditionError::InvalidDimensions {
            width: w,
            height: h,
        });
    }

    let min_stride = w as usize * frame.format.bytes_per_pixel();
    if (frame.stride as usize) < min_stride {
        return Err(ConditionError::BufferTooShort {
            expected: min_stride * h as usize,
            actual: frame.stride as usize * h as usize,
        });
    }

    let expected = frame.required_len();
    if frame.data.len() < expected {
        return Err(ConditionError::BufferTooShort {
            expected,
            actual: frame.data.len(),
        });
    }
    Ok(())
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::types::PixelFormat;

    fn target(w: u32, h: u32) -> Settings {
        Settings {
            video_width: w,
            video_height: h,
            ..Default::default()
        }
    }

    fn bgra(w: u32, h: u32) -> RawFrame {
        RawFrame::packed(PixelFormat::Bgra8, w, h, vec![0x40; (w * h * 4) as usize])
    }

    fn conditioner() -> FrameConditioner {
        FrameConditioner::new(Arc::new(MediaClock::new()))
    }

    #[test]
    fn rejects_out_of_range_dimensions() {
        let mut c = conditioner();
        for (w, h) in [(0, 0), (159, 720), (1280, 119), (3856, 720)] {
            let frame = RawFrame::packed(PixelFormat::Rgb8, w, h, vec![0; (w * h * 3) as usize]);
            assert!(matches!(
                c.condition(&frame, &target(1280, 720)),
                Err(ConditionError::InvalidDimensions { .. })
            ));
        }
    }

    #[test]
    fn rejects_short_buffer() {
        let mut c = conditioner();
        let mut frame = bgra(320, 240);
        frame.data.truncate(100);
        assert!(matches!(
            c.condition(&frame, &target(320, 240)),
            Err(ConditionError::BufferTooShort { .. })
        ));
    }

    #[test]
    fn output_is_always_sixteen_aligned() {
        let mut c = conditioner();
        for (w, h) in [(160, 120), (333, 211), (640, 480), (1920, 1080), (1001, 999)] {
            for (tw, th) in [(1280, 720), (1920, 1080), (854, 480), (160, 120)] {
                let frame = RawFrame::packed(
                    PixelFormat::Rgb8,
                    w,
                    h,
                    vec![0x7F; (w * h * 3) as usize],
                );
                let sample = c.condition(&frame, &target(tw, th)).unwrap();
                assert_eq!(sample.width % 16, 0, "{w}x{h} -> {tw}x{th}");
                assert_eq!(sample.height % 16, 0, "{w}x{h} -> {tw}x{th}");
                assert!(sample.width >= 160 && sample.height >= 120);
                assert_eq!(
                    sample.data.len(),
                    sample.format.frame_len(sample.width, sample.height)
                );
            }
        }
    }

    #[test]
    fn odd_frame_is_aspect_filled_to_target() {
        let mut c = conditioner();
        let frame = RawFrame::packed(PixelFormat::Rgba8, 1000, 563, vec![0x20; 1000 * 563 * 4]);
        let sample = c.condition(&frame, &target(1280, 720)).unwrap();
        assert_eq!((sample.width, sample.height), (1280, 720));
        // 563 rows cannot be 4:2:0, so the BGRA tier was used.
        assert_eq!(sample.format, SampleFormat::Bgra);
        assert_eq!(sample.data.len(), 1280 * 720 * 4);
    }

    #[test]
    fn native_formats_pass_through() {
        let mut c = conditioner();
        let sample = c.condition(&bgra(320, 240), &target(320, 240)).unwrap();
        assert_eq!(sample.format, SampleFormat::Bgra);

        let nv12 = RawFrame {
            width: 320,
            height: 240,
            stride: 320,
            format: PixelFormat::Nv12,
            data: vec![128; 320 * 240 * 3 / 2],
            timestamp: Instant::now(),
        };
        let sample = c.condition(&nv12, &target(320, 240)).unwrap();
        assert_eq!(sample.format, SampleFormat::I420);
    }

    #[test]
    fn odd_width_nv12_is_conditioned_not_dropped() {
        let mut c = conditioner();
        let mut frame = RawFrame {
            width: 161,
            height: 120,
            stride: 161,
            format: PixelFormat::Nv12,
            data: Vec::new(),
            timestamp: Instant::now(),
        };
        frame.data = vec![128; frame.required_len()];
        let sample = c.condition(&frame, &target(320, 240)).unwrap();
        assert_eq!((sample.width, sample.height), (320, 240));
        assert_eq!(sample.format, SampleFormat::Bgra);

        // One byte short of the last UV pair.
        frame.data.pop();
        assert!(matches!(
            c.condition(&frame, &target(320, 240)),
            Err(ConditionError::BufferTooShort { .. })
        ));
    }

    #[test]
    fn disabled_format_falls_back() {
        let mut c = conditioner();
        assert!(c.disable_format(SampleFormat::I420));
        assert_eq!(c.preferred_format(), Some(SampleFormat::Bgra));

        let frame = RawFrame::packed(PixelFormat::Rgb8, 320, 240, vec![1; 320 * 240 * 3]);
        let sample = c.condition(&frame, &target(320, 240)).unwrap();
        assert_eq!(sample.format, SampleFormat::Bgra);

        assert!(!c.disable_format(SampleFormat::Bgra));
        assert!(matches!(
            c.condition(&frame, &target(320, 240)),
            Err(ConditionError::UnsupportedFormat(PixelFormat::Rgb8))
        ));

        c.reset_formats();
        assert_eq!(c.preferred_format(), Some(SampleFormat::I420));
    }

    #[test]
    fn timestamps_increase_and_duration_follows_rate() {
        let mut c = conditioner();
        let mut settings = target(320, 240);
        settings.frame_rate = 25;
        let frame = bgra(320, 240);
        let a = c.condition(&frame, &settings).unwrap();
        let b = c.condition(&frame, &settings).unwrap();
        assert!(b.pts > a.pts);
        assert_eq!(a.duration, std::time::Duration::from_millis(40));
        assert_eq!(b.frame_number, a.frame_number + 1);
        assert_eq!(c.frames_conditioned(), b.frame_number);
    }

    #[test]
    fn recycled_buffers_are_reused() {
        let mut c = conditioner();
        let sample = c.condition(&bgra(320, 240), &target(320, 240)).unwrap();
        c.recycle(sample);
        assert!(c.relieve_memory() > 0);
        assert_eq!(c.relieve_memory(), 0);
    }
}
