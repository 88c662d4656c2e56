//! Encoder sessions and the backend seam.

pub mod backend;
pub mod session;
pub mod software;

pub use backend::{
    BackendError, EncodedUnit, EncoderBackend, EncoderConfig, EncoderFactory, EncoderFault,
    EncoderSelection, Profile, RecoveryAction,
};
pub use session::{EncoderSession, SessionOptions};
pub use software::{SoftwareEncoder, SoftwareFactory};
