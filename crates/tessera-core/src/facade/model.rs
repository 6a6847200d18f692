//! [`Model`]: one architecture behind a single forward entry point.

use crate::config::{ModelConfig, ModelType};
use crate::error::{Result, TesseraError};
use crate::fusion::{ConcatFusion, DeepFusion};
use crate::model::{Decoder, ModelState, StageInput, TransformerConfig};
use crate::stats::{bytes_to_readable, format_param_count, ParamStats};
use candle_core::{Device, Tensor};
use tracing::{debug, instrument};

/// The fused module graph of a model.
#[derive(Debug, Clone)]
pub enum Architecture {
    /// Decoder-only.
    TextOnly(Decoder),
    /// Decoder-only with Llama 3.1 rope scaling.
    Llama3_1(Decoder),
    /// Vision encoder feeding cross-attention layers.
    Flamingo(DeepFusion),
    /// Vision features spliced into the embedding sequence.
    Llava(ConcatFusion),
}

impl Architecture {
    /// Model type of this architecture.
    pub fn model_type(&self) -> ModelType {
        match self {
            Architecture::TextOnly(_) => ModelType::TextOnly,
            Architecture::Llama3_1(_) => ModelType::Llama3_1,
            Architecture::Flamingo(_) => ModelType::Flamingo,
            Architecture::Llava(_) => ModelType::Llava,
        }
    }

    /// The decoder stack.
    pub fn decoder(&self) -> &Decoder {
        match self {
            Architecture::TextOnly(d) | Architecture::Llama3_1(d) => d,
            Architecture::Flamingo(f) => f.decoder(),
            Architecture::Llava(f) => f.decoder(),
        }
    }
}

/// Inputs of one forward call. The variant must match the model type.
#[derive(Debug, Clone, Copy)]
pub enum ModelInput<'a> {
    /// Text-only and Llama 3.1 models.
    Text {
        /// Token ids `[batch, seq]` or `[seq]`.
        tokens: &'a Tensor,
        /// Absolute positions `[seq]`; `0..seq` when omitted.
        input_pos: Option<&'a Tensor>,
    },
    /// Flamingo models.
    Flamingo {
        /// Token ids `[batch, seq]` or `[seq]`.
        tokens: &'a Tensor,
        /// Normalized pixels; only needed on the call that introduces the image.
        encoder_input: Option<&'a Tensor>,
        /// `[batch, seq, enc_len]`, 1 where a token may attend to the image.
        encoder_mask: Option<&'a Tensor>,
        /// Absolute positions `[seq]`; `0..seq` when omitted.
        input_pos: Option<&'a Tensor>,
    },
    /// Llava models.
    Llava {
        /// Token ids before the image (or of a text-only step).
        tokens: &'a Tensor,
        /// Normalized pixels.
        encoder_input: Option<&'a Tensor>,
        /// Token ids after the image.
        post_tokens: Option<&'a Tensor>,
        /// Absolute positions of the fused sequence; `0..len` when omitted.
        input_pos: Option<&'a Tensor>,
    },
}

impl ModelInput<'_> {
    fn tag(&self) -> &'static str {
        match self {
            ModelInput::Text { .. } => "text",
            ModelInput::Flamingo { .. } => "flamingo",
            ModelInput::Llava { .. } => "llava",
        }
    }
}

/// A built model.
#[derive(Debug, Clone)]
pub struct Model {
    config: ModelConfig,
    arch: Architecture,
    stats: ParamStats,
}

impl Model {
    pub(crate) fn new(config: ModelConfig, arch: Architecture, stats: ParamStats) -> Self {
        debug!(
            model_type = %arch.model_type(),
            params = %format_param_count(stats.num_params(false)),
            size = %bytes_to_readable(stats.size_bytes()),
            "assembled model"
        );
        Self {
            config,
            arch,
            stats,
        }
    }

    /// Run one forward call and return logits `[batch, seq, vocab]`.
    #[instrument(level = "trace", skip_all, fields(model = %self.model_type(), input = input.tag()))]
    pub fn forward(&mut self, input: ModelInput<'_>) -> Result<Tensor> {
        match (&mut self.arch, input) {
            (
                Architecture::TextOnly(decoder) | Architecture::Llama3_1(decoder),
                ModelInput::Text { tokens, input_pos },
            ) => {
                let positions = match input_pos {
                    Some(pos) => pos.clone(),
                    None => {
                        let len = tokens.dims().last().copied().unwrap_or(0);
                        Tensor::arange(0u32, len as u32, tokens.device())?
                    }
                };
                decoder.forward(StageInput::Tokens(tokens), &positions, None)
            }
            (
                Architecture::Flamingo(fusion),
                ModelInput::Flamingo {
                    tokens,
                    encoder_input,
                    encoder_mask,
                    input_pos,
                },
            ) => fusion.forward(tokens, encoder_input, encoder_mask, input_pos),
            (
                Architecture::Llava(fusion),
                ModelInput::Llava {
                    tokens,
                    encoder_input,
                    post_tokens,
                    input_pos,
                },
            ) => fusion.forward(tokens, encoder_input, post_tokens, input_pos),
            (arch, input) => Err(TesseraError::StateError(format!(
                "{} input given to a {} model",
                input.tag(),
                arch.model_type()
            ))),
        }
    }

    /// Allocate caches for `max_batch` sequences of up to `max_seq_len` tokens.
    pub fn setup_caches(&mut self, max_batch: usize, max_seq_len: usize) -> Result<()> {
        match &mut self.arch {
            Architecture::TextOnly(d) | Architecture::Llama3_1(d) => {
                d.setup_caches(max_batch, max_seq_len)
            }
            Architecture::Flamingo(f) => f.setup_caches(max_batch, max_seq_len),
            Architecture::Llava(f) => f.setup_caches(max_batch, max_seq_len),
        }
    }

    /// Zero every cache, keeping capacity.
    pub fn reset_caches(&mut self) -> Result<()> {
        match &mut self.arch {
            Architecture::TextOnly(d) | Architecture::Llama3_1(d) => d.reset_caches(),
            Architecture::Flamingo(f) => f.reset_caches(),
            Architecture::Llava(f) => f.reset_caches(),
        }
    }

    /// Cache lifecycle state.
    pub fn state(&self) -> ModelState {
        self.arch.decoder().state()
    }

    /// Model type.
    pub fn model_type(&self) -> ModelType {
        self.arch.model_type()
    }

    /// The configuration the model was built from.
    pub fn config(&self) -> &ModelConfig {
        &self.config
    }

    /// Decoder configuration.
    pub fn text_config(&self) -> &TransformerConfig {
        self.arch.decoder().config()
    }

    /// Cache capacity as `(max_batch, max_seq_len)`, once set up.
    pub fn cache_capacity(&self) -> Option<(usize, usize)> {
        self.arch.decoder().cache_capacity()
    }

    /// The module graph.
    pub fn architecture(&self) -> &Architecture {
        &self.arch
    }

    /// Parameters held by this participant.
    pub fn num_params(&self, exclude_embedding: bool) -> usize {
        self.stats.num_params(exclude_embedding)
    }

    /// Parameter bytes held by this participant.
    pub fn size_bytes(&self) -> usize {
        self.stats.size_bytes()
    }

    /// Device the decoder runs on.
    pub fn device(&self) -> &Device {
        self.arch.decoder().device()
    }
}
