//! Vision encoder with a projection head into the decoder width.

use super::activation::Activation;
use super::encoder::{EncoderLayer, EncoderOutput, VisionConfig, VisionEncoder};
use crate::error::{Result, TesseraError};
use candle_core::{Module, Tensor};
use candle_nn::{linear, Linear, VarBuilder};
use serde::Deserialize;
use serde_json::Value;

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct FlamingoEncoderParams {
    patch_size: usize,
    num_heads: usize,
    clip_embed_dim: usize,
    clip_num_layers: usize,
    #[serde(default)]
    clip_hidden_states: Vec<usize>,
    decoder_embed_dim: usize,
    #[serde(default)]
    num_layers_projection: usize,
    tile_size: usize,
    #[serde(default)]
    #[allow(dead_code)]
    max_num_tiles: Option<usize>,
    #[serde(default = "default_in_channels")]
    in_channels: usize,
}

fn default_in_channels() -> usize {
    3
}

/// Hyper-parameters of a [`FlamingoEncoder`].
#[derive(Debug, Clone, PartialEq)]
pub struct FlamingoEncoderConfig {
    /// The wrapped CLIP encoder.
    pub clip: VisionConfig,
    /// Layers in the projection head.
    pub num_layers_projection: usize,
    /// Output width, equal to the decoder's `dim`.
    pub decoder_embed_dim: usize,
}

impl FlamingoEncoderConfig {
    /// Resolve from a raw JSON parameter object.
    pub fn from_params(params: &Value) -> Result<Self> {
        let raw: FlamingoEncoderParams = serde_json::from_value(params.clone()).map_err(|e| {
            TesseraError::ConfigError(format!("invalid flamingo encoder params: {e}"))
        })?;
        let clip = VisionConfig {
            tile_size: raw.tile_size,
            patch_size: raw.patch_size,
            embed_dim: raw.clip_embed_dim,
            num_layers: raw.clip_num_layers,
            num_heads: raw.num_heads,
            out_indices: raw.clip_hidden_states,
            in_channels: raw.in_channels,
            activation: Activation::Gelu,
            intermediate_dim: 4 * raw.clip_embed_dim,
            norm_eps: 1e-5,
            cls_projection: None,
        };
        clip.validate()?;
        Ok(Self {
            clip,
            num_layers_projection: raw.num_layers_projection,
            decoder_embed_dim: raw.decoder_embed_dim,
        })
    }

    /// Input width of the final projection: the last hidden state
    /// concatenated with every selected CLIP hidden state.
    pub fn projection_in_dim(&self) -> usize {
        self.clip.embed_dim * (self.clip.out_indices.len() + 1)
    }
}

/// CLIP encoder followed by transformer layers and a linear projection.
#[derive(Debug, Clone)]
pub struct FlamingoEncoder {
    clip: VisionEncoder,
    layers: Vec<EncoderLayer>,
    output: Linear,
    config: FlamingoEncoderConfig,
}

impl FlamingoEncoder {
    /// Load from `vb`: `clip.*`, `projection.layers.{i}.*`, `projection.output.*`.
    pub fn new(config: &FlamingoEncoderConfig, vb: VarBuilder) -> Result<Self> {
        let clip = VisionEncoder::new(&config.clip, vb.pp("clip"))?;
        let head = vb.pp("projection");
        let dim = config.clip.embed_dim;
        let layers = (0..config.num_layers_projection)
            .map(|i| {
                EncoderLayer::new(
                    dim,
                    config.clip.num_heads,
                    4 * dim,
                    Activation::Gelu,
                    config.clip.norm_eps,
                    head.pp("layers").pp(i.to_string()),
                )
            })
            .collect::<Result<Vec<_>>>()?;
        let output = linear(
            config.projection_in_dim(),
            config.decoder_embed_dim,
            head.pp("output"),
        )?;
        Ok(Self {
            clip,
            layers,
            output,
            config: config.clone(),
        })
    }

    /// Encode pixels into `[batch, seq, decoder_embed_dim]` states.
    pub fn forward(&self, pixels: &Tensor) -> Result<Tensor> {
        let EncoderOutput {
            last_hidden_state,
            hidden_states,
        } = self.clip.forward(pixels)?;

        let mut x = last_hidden_state;
        for layer in &self.layers {
            x = layer.forward(&x)?;
        }
        let mut parts = Vec::with_capacity(hidden_states.len() + 1);
        parts.push(x);
        parts.extend(hidden_states);
        let x = Tensor::cat(&parts, 2)?;
        Ok(self.output.forward(&x)?)
    }

    /// Encoder configuration.
    pub fn config(&self) -> &FlamingoEncoderConfig {
        &self.config
    }
}
