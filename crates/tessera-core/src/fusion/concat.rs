//! Concatenation fusion: `[pre-image text | projected image | post-image text]`.

use super::prefill_positions;
use crate::error::{Result, TesseraError};
use crate::model::{Decoder, StageInput};
use crate::vision::VisionEncoder;
use candle_core::{Module, Tensor};
use candle_nn::{embedding, linear, Embedding, Linear, VarBuilder};
use tracing::debug;

/// Two-layer projector from encoder width to decoder width.
#[derive(Debug, Clone)]
pub struct MultiModalProjector {
    linear_1: Linear,
    linear_2: Linear,
}

impl MultiModalProjector {
    /// Load `linear_1` / `linear_2` (with bias) from `vb`.
    pub fn new(in_channels: usize, out_channels: usize, vb: VarBuilder) -> Result<Self> {
        Ok(Self {
            linear_1: linear(in_channels, out_channels, vb.pp("linear_1"))?,
            linear_2: linear(out_channels, out_channels, vb.pp("linear_2"))?,
        })
    }

    /// `linear_2(gelu(linear_1(x)))`
    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let h = self.linear_1.forward(x)?.gelu_erf()?;
        Ok(self.linear_2.forward(&h)?)
    }
}

/// Llava-style fusion. Owns the token embedding; the wrapped decoder is
/// built without one.
#[derive(Debug, Clone)]
pub struct ConcatFusion {
    encoder: VisionEncoder,
    decoder: Decoder,
    tok_embeddings: Embedding,
    mm_projector: MultiModalProjector,
}

impl ConcatFusion {
    /// Wrap `encoder` and `decoder`, loading `tok_embeddings` and
    /// `mm_projector` from `vb`.
    pub fn new(encoder: VisionEncoder, decoder: Decoder, vb: VarBuilder) -> Result<Self> {
        if decoder.has_embedding() {
            return Err(TesseraError::ConfigError(
                "concat fusion needs a decoder built without token embeddings".to_string(),
            ));
        }
        let config = decoder.config();
        let tok_embeddings =
            embedding(config.embedding_rows(), config.dim, vb.pp("tok_embeddings"))?;
        let mm_projector =
            MultiModalProjector::new(encoder.output_dim(), config.dim, vb.pp("mm_projector"))?;
        Ok(Self {
            encoder,
            decoder,
            tok_embeddings,
            mm_projector,
        })
    }

    /// Run one call.
    ///
    /// # Arguments
    ///
    /// * `tokens` - Text before the image, `[seq]` or `[batch, seq]`
    /// * `encoder_input` - Normalized pixels, or `None` for text-only steps
    /// * `post_tokens` - Text after the image; requires `encoder_input`
    /// * `input_pos` - Positions of the fused sequence, `0..len` if omitted
    pub fn forward(
        &mut self,
        tokens: &Tensor,
        encoder_input: Option<&Tensor>,
        post_tokens: Option<&Tensor>,
        input_pos: Option<&Tensor>,
    ) -> Result<Tensor> {
        let image = encoder_input
            .map(|pixels| self.encode_image(pixels))
            .transpose()?;
        let hidden = self.decoder_input(tokens, image.as_ref(), post_tokens)?;

        let positions = match input_pos {
            Some(pos) => pos.clone(),
            None => prefill_positions(hidden.dim(1)?, hidden.device())?,
        };
        self.decoder
            .forward(StageInput::Hidden(&hidden), &positions, None)
    }

    /// Image features after feature selection: the first requested hidden
    /// state (or the final state) without its CLS token.
    fn encode_image(&self, pixels: &Tensor) -> Result<Tensor> {
        let output = self.encoder.forward(pixels)?;
        let selected = output
            .hidden_states
            .into_iter()
            .next()
            .unwrap_or(output.last_hidden_state);
        let seq = selected.dim(1)?;
        Ok(selected.narrow(1, 1, seq - 1)?)
    }

    fn embed(&self, tokens: &Tensor) -> Result<Tensor> {
        let tokens = match tokens.rank() {
            1 => tokens.unsqueeze(0)?,
            2 => tokens.clone(),
            _ => {
                return Err(TesseraError::ShapeError(format!(
                    "tokens must be [seq] or [batch, seq], got {:?}",
                    tokens.dims()
                )))
            }
        };
        Ok(self.tok_embeddings.forward(&tokens)?)
    }

    fn decoder_input(
        &self,
        tokens: &Tensor,
        image: Option<&Tensor>,
        post_tokens: Option<&Tensor>,
    ) -> Result<Tensor> {
        let Some(image) = image else {
            if post_tokens.is_some() {
                return Err(TesseraError::StateError(
                    "post_tokens given without an encoder input".to_string(),
                ));
            }
            return self.embed(tokens);
        };

        let pre = self.embed(tokens)?;
        let image = self.mm_projector.forward(&image.to_dtype(pre.dtype())?)?;
        if image.dim(0)? != pre.dim(0)? {
            return Err(TesseraError::ShapeError(format!(
                "image batch {} does not match text batch {}",
                image.dim(0)?,
                pre.dim(0)?
            )));
        }
        let mut parts = vec![pre, image];
        if let Some(post) = post_tokens {
            parts.push(self.embed(post)?);
        }
        debug!(
            segments = ?parts.iter().map(|p| p.dims()[1]).collect::<Vec<_>>(),
            "fusing text and image embeddings"
        );
        Ok(Tensor::cat(&parts, 1)?)
    }

    /// Allocate decoder caches.
    pub fn setup_caches(&mut self, max_batch: usize, max_seq_len: usize) -> Result<()> {
        self.decoder.setup_caches(max_batch, max_seq_len)
    }

    /// Zero decoder caches.
    pub fn reset_caches(&mut self) -> Result<()> {
        self.decoder.reset_caches()
    }

    /// The wrapped decoder.
    pub fn decoder(&self) -> &Decoder {
        &self.decoder
    }

    /// The wrapped encoder.
    pub fn encoder(&self) -> &VisionEncoder {
        &self.encoder
    }
}
