//! Vision encoders feeding the fusion wrappers.
//!
//! Pixels arrive already resized and normalized; this module only turns
//! them into patch features.

mod activation;
mod encoder;
mod projection;

pub use activation::Activation;
pub use encoder::{EncoderOutput, VisionConfig, VisionEncoder};
pub use projection::{FlamingoEncoder, FlamingoEncoderConfig};
