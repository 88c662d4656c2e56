//! Frame conditioning: raw capture frames in, encoder-ready samples out.
//!
//! | Module        | Purpose                                          |
//! |---------------|--------------------------------------------------|
//! | `types`       | Raw frame, sample and pixel-format types          |
//! | `convert`     | BT.709 format conversion strategies               |
//! | `scale`       | Aspect-fill bilinear scaler                       |
//! | `pool`        | Buffer recycling and the shared media clock       |
//! | `conditioner` | The validate → normalize → align → package chain  |

pub mod conditioner;
pub mod convert;
pub mod pool;
pub mod scale;
pub mod types;

// ── Re-exports ───────────────────────────────────────────────────

pub use conditioner::FrameConditioner;
pub use convert::ConversionStrategy;
pub use pool::{BufferPool, MediaClock};
pub use scale::FillMapping;
pub use types::{EncoderSample, PixelFormat, RawFrame, SampleFormat, SampleFormats};
