//! Deep fusion: encoder states reach the decoder through cross-attention.

use super::prefill_positions;
use crate::error::Result;
use crate::model::{CrossInput, Decoder, StageInput};
use crate::vision::FlamingoEncoder;
use candle_core::Tensor;

/// Flamingo-style fusion of a vision encoder and a cross-attending decoder.
#[derive(Debug, Clone)]
pub struct DeepFusion {
    encoder: FlamingoEncoder,
    decoder: Decoder,
}

impl DeepFusion {
    /// Wrap an encoder and a decoder built with a `fusion_interval`.
    pub fn new(encoder: FlamingoEncoder, decoder: Decoder) -> Self {
        Self { encoder, decoder }
    }

    /// Run one call. Encoder states from an earlier call stay cached in the
    /// cross-attention layers until the caches are reset.
    ///
    /// `encoder_mask` is `[batch, seq, enc_len]`, 1 where a token may attend.
    pub fn forward(
        &mut self,
        tokens: &Tensor,
        encoder_input: Option<&Tensor>,
        encoder_mask: Option<&Tensor>,
        input_pos: Option<&Tensor>,
    ) -> Result<Tensor> {
        let states = encoder_input
            .map(|pixels| self.encoder.forward(pixels))
            .transpose()?;
        let cross = CrossInput {
            states: states.as_ref(),
            mask: encoder_mask,
        };
        let positions = match input_pos {
            Some(pos) => pos.clone(),
            None => {
                let len = tokens.dims().last().copied().unwrap_or(0);
                prefill_positions(len, tokens.device())?
            }
        };
        self.decoder
            .forward(StageInput::Tokens(tokens), &positions, Some(&cross))
    }

    /// Allocate decoder caches.
    pub fn setup_caches(&mut self, max_batch: usize, max_seq_len: usize) -> Result<()> {
        self.decoder.setup_caches(max_batch, max_seq_len)
    }

    /// Zero decoder caches and drop cached encoder states.
    pub fn reset_caches(&mut self) -> Result<()> {
        self.decoder.reset_caches()
    }

    /// The wrapped decoder.
    pub fn decoder(&self) -> &Decoder {
        &self.decoder
    }

    /// The wrapped encoder.
    pub fn encoder(&self) -> &FlamingoEncoder {
        &self.encoder
    }
}
