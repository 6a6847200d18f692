//! Wrappers that combine a vision encoder with a decoder.
//!
//! - [`ConcatFusion`] splices projected image features into the token
//!   embedding sequence (Llava).
//! - [`DeepFusion`] feeds encoder states to gated cross-attention layers
//!   inside the decoder (Flamingo).

mod concat;
mod deep;

pub use concat::{ConcatFusion, MultiModalProjector};
pub use deep::DeepFusion;

use crate::error::Result;
use candle_core::{Device, Tensor};

/// `0..len` as `u32` positions, used when a prefill omits `input_pos`.
pub(crate) fn prefill_positions(len: usize, device: &Device) -> Result<Tensor> {
    Ok(Tensor::arange(0u32, len as u32, device)?)
}
