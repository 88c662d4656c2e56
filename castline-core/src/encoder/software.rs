//! Software encoder backed by zstd.
//!
//! Intra-only: every unit is the zstd-compressed sample planes, so any
//! unit decodes on its own. The key-frame flag is carried through for
//! the downstream cadence. The zstd level follows the per-frame byte
//! budget: over budget raises it, under 80 % lowers it.

use bytes::Bytes;
use tracing::trace;

use crate::encoder::backend::{
    BackendError, EncodedUnit, EncoderBackend, EncoderConfig, EncoderFactory, EncoderFault,
    EncoderSelection,
};
use crate::frame::EncoderSample;

const MIN_LEVEL: i32 = 1;
const MAX_LEVEL: i32 = 9;

pub struct SoftwareEncoder {
    config: EncoderConfig,
    level: i32,
    compressor: Option<zstd::bulk::Compressor<'static>>,
    frames: u64,
}

impl SoftwareEncoder {
    pub fn new(config: EncoderConfig) -> Self {
        Self {
            config,
            level: MIN_LEVEL,
            compressor: None,
            frames: 0,
        }
    }

    /// Current zstd level.
    pub fn level(&self) -> i32 {
        self.level
    }

    /// Frames encoded by this instance.
    pub fn frames(&self) -> u64 {
        self.frames
    }

    fn compress(&mut self, input: &[u8]) -> std::io::Result<Vec<u8>> {
        let compressor = match self.compressor.take() {
            Some(c) => c,
            None => zstd::bulk::Compressor::new(self.level)?,
        };
        let compressor = self.compressor.insert(compressor);
        compressor.set_compression_level(self.level)?;
        compressor.compress(input)
    }

    fn check(&self, sample: &EncoderSample) -> Result<(), BackendError> {
        if sample.format != self.config.format {
            return Err(BackendError::new(
                EncoderFault::FormatUnsupported,
                format!("session opened for {:?}", self.config.format),
            ));
        }
        if sample.width != self.config.width || sample.height != self.config.height {
            return Err(BackendError::new(
                EncoderFault::Unknown,
                format!(
                    "sample is {}x{}, session is {}x{}",
                    sample.width, sample.height, self.config.width, self.config.height
                ),
            ));
        }
        let expected = sample.format.frame_len(sample.width, sample.height);
        if sample.data.len() < expected {
            return Err(BackendError::new(
                EncoderFault::Unknown,
                format!("sample holds {} bytes, {expected} needed", sample.data.len()),
            ));
        }
        Ok(())
    }

    fn adapt_level(&mut self, produced: usize) {
        let budget = self.config.frame_budget();
        if produced > budget {
            self.level = (self.level + 1).min(MAX_LEVEL);
        } else if produced < budget * 8 / 10 {
            self.level = (self.level - 1).max(MIN_LEVEL);
        }
    }
}

impl EncoderBackend for SoftwareEncoder {
    fn name(&self) -> &str {
        "zstd-software"
    }

    fn is_hardware(&self) -> bool {
        false
    }

    fn encode(
        &mut self,
        sample: &EncoderSample,
        keyframe: bool,
    ) -> Result<EncodedUnit, BackendError> {
        self.check(sample)?;
        let len = sample.format.frame_len(sample.width, sample.height);
        let keyframe = keyframe || self.frames == 0;

        let compressed = self.compress(&sample.data[..len]).map_err(|e| {
            let fault = if e.kind() == std::io::ErrorKind::OutOfMemory {
                EncoderFault::AllocationFailed
            } else {
                EncoderFault::Unknown
            };
            BackendError::new(fault, format!("zstd encode failed: {e}"))
        })?;

        self.frames += 1;
        self.adapt_level(compressed.len());
        trace!(
            frame = sample.frame_number,
            keyframe,
            bytes = compressed.len(),
            level = self.level,
            "software frame encoded"
        );

        Ok(EncodedUnit {
            frame_number: sample.frame_number,
            pts: sample.pts,
            duration: sample.duration,
            keyframe,
            width: sample.width,
            height: sample.height,
            data: Bytes::from(compressed),
        })
    }

    fn update_rate(&mut self, bitrate_kbps: u32, frame_rate: u32) -> bool {
        self.config.bitrate_kbps = bitrate_kbps;
        self.config.frame_rate = frame_rate.max(1);
        true
    }

    fn relieve_memory(&mut self) {
        self.compressor = None;
    }

    fn close(&mut self) {
        self.relieve_memory();
    }
}

/// Factory for [`SoftwareEncoder`]. Refuses the hardware-only tier.
#[derive(Debug, Default, Clone, Copy)]
pub struct SoftwareFactory;

impl EncoderFactory for SoftwareFactory {
    fn create(
        &self,
        config: &EncoderConfig,
        selection: EncoderSelection,
    ) -> Result<Box<dyn EncoderBackend>, BackendError> {
        match selection {
            EncoderSelection::RequireHardware => Err(BackendError::new(
                EncoderFault::Unavailable,
                "no hardware encoder on this host",
            )),
            EncoderSelection::PreferHardware | EncoderSelection::SoftwareOnly => {
                Ok(Box::new(SoftwareEncoder::new(config.clone())))
            }
        }
    }
}

// ── Tests ────────────────────────────────────────────────────────
