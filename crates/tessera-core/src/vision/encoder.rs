//! CLIP-style vision transformer.

use super::activation::Activation;
use crate::error::{Result, TesseraError};
use crate::model::attention::scaled_dot_product_attention;
use candle_core::{Module, Tensor};
use candle_nn::{
    conv2d_no_bias, layer_norm, linear, linear_no_bias, Conv2d, Conv2dConfig, LayerNorm, Linear,
    VarBuilder,
};
use serde::Deserialize;
use serde_json::Value;
use tracing::debug;

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct ClipParams {
    tile_size: usize,
    patch_size: usize,
    embed_dim: usize,
    num_layers: usize,
    num_heads: usize,
    #[serde(default)]
    out_indices: Vec<usize>,
    #[serde(default = "default_in_channels")]
    in_channels: usize,
    #[serde(default)]
    intermediate_act: Option<String>,
    #[serde(default)]
    intermediate_dim: Option<usize>,
    #[serde(default)]
    norm_eps: Option<f64>,
    #[serde(default)]
    output_cls_projection: bool,
    #[serde(default)]
    cls_output_dim: Option<usize>,
    // Only single-tile input is supported; the key is accepted and ignored.
    #[serde(default)]
    #[allow(dead_code)]
    max_num_tiles: Option<usize>,
}

fn default_in_channels() -> usize {
    3
}

/// Hyper-parameters of a [`VisionEncoder`].
#[derive(Debug, Clone, PartialEq)]
pub struct VisionConfig {
    /// Square input side in pixels.
    pub tile_size: usize,
    /// Square patch side in pixels.
    pub patch_size: usize,
    /// Encoder width.
    pub embed_dim: usize,
    /// Number of encoder layers.
    pub num_layers: usize,
    /// Attention heads per layer.
    pub num_heads: usize,
    /// Layers whose input hidden state is returned alongside the output.
    pub out_indices: Vec<usize>,
    /// Pixel channels.
    pub in_channels: usize,
    /// MLP activation.
    pub activation: Activation,
    /// MLP inner width.
    pub intermediate_dim: usize,
    /// Layer norm epsilon.
    pub norm_eps: f64,
    /// When set, only the CLS token is returned, projected to this width.
    pub cls_projection: Option<usize>,
}

impl VisionConfig {
    /// Resolve from a raw JSON parameter object.
    pub fn from_params(params: &Value) -> Result<Self> {
        let raw: ClipParams = serde_json::from_value(params.clone())
            .map_err(|e| TesseraError::ConfigError(format!("invalid encoder params: {e}")))?;
        let activation = match raw.intermediate_act.as_deref() {
            Some(name) => name.parse()?,
            None => Activation::Gelu,
        };
        let cls_projection = match (raw.output_cls_projection, raw.cls_output_dim) {
            (false, _) => None,
            (true, Some(dim)) => Some(dim),
            (true, None) => Some(512),
        };
        let config = Self {
            tile_size: raw.tile_size,
            patch_size: raw.patch_size,
            embed_dim: raw.embed_dim,
            num_layers: raw.num_layers,
            num_heads: raw.num_heads,
            out_indices: raw.out_indices,
            in_channels: raw.in_channels,
            activation,
            intermediate_dim: raw.intermediate_dim.unwrap_or(4 * raw.embed_dim),
            norm_eps: raw.norm_eps.unwrap_or(1e-5),
            cls_projection,
        };
        config.validate()?;
        Ok(config)
    }

    /// Check structural constraints.
    pub fn validate(&self) -> Result<()> {
        if self.patch_size == 0 || self.tile_size % self.patch_size != 0 {
            return Err(TesseraError::ConfigError(format!(
                "tile_size {} is not a multiple of patch_size {}",
                self.tile_size, self.patch_size
            )));
        }
        if self.num_heads == 0 || self.embed_dim % self.num_heads != 0 {
            return Err(TesseraError::ConfigError(format!(
                "embed_dim {} is not divisible by num_heads {}",
                self.embed_dim, self.num_heads
            )));
        }
        if let Some(idx) = self.out_indices.iter().find(|i| **i >= self.num_layers) {
            return Err(TesseraError::ConfigError(format!(
                "out index {idx} out of range for {} layers",
                self.num_layers
            )));
        }
        Ok(())
    }

    /// Patches along one side.
    pub fn patch_grid(&self) -> usize {
        self.tile_size / self.patch_size
    }

    /// Tokens per image: one per patch plus CLS.
    pub fn seq_len(&self) -> usize {
        self.patch_grid() * self.patch_grid() + 1
    }
}

/// Result of encoding one batch of images.
#[derive(Debug, Clone)]
pub struct EncoderOutput {
    /// `[batch, seq, width]` after the final norm (and optional projection).
    pub last_hidden_state: Tensor,
    /// Inputs of the layers listed in `out_indices`, in layer order.
    pub hidden_states: Vec<Tensor>,
}

#[derive(Debug, Clone)]
struct SelfAttention {
    q_proj: Linear,
    k_proj: Linear,
    v_proj: Linear,
    output_proj: Linear,
    num_heads: usize,
    head_dim: usize,
}

impl SelfAttention {
    fn new(dim: usize, num_heads: usize, vb: VarBuilder) -> Result<Self> {
        Ok(Self {
            q_proj: linear(dim, dim, vb.pp("q_proj"))?,
            k_proj: linear(dim, dim, vb.pp("k_proj"))?,
            v_proj: linear(dim, dim, vb.pp("v_proj"))?,
            output_proj: linear(dim, dim, vb.pp("output_proj"))?,
            num_heads,
            head_dim: dim / num_heads,
        })
    }

    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let (batch, seq_len, dim) = x.dims3()?;
        let heads = |t: Tensor| -> Result<Tensor> {
            Ok(t.reshape((batch, seq_len, self.num_heads, self.head_dim))?
                .transpose(1, 2)?
                .contiguous()?)
        };
        let q = heads(self.q_proj.forward(x)?)?;
        let k = heads(self.k_proj.forward(x)?)?;
        let v = heads(self.v_proj.forward(x)?)?;

        let scale = 1.0 / (self.head_dim as f64).sqrt();
        let y = scaled_dot_product_attention(&q, &k, &v, None, scale)?
            .transpose(1, 2)?
            .reshape((batch, seq_len, dim))?;
        Ok(self.output_proj.forward(&y)?)
    }
}

/// Pre-norm encoder layer with a two-layer MLP.
#[derive(Debug, Clone)]
pub(crate) struct EncoderLayer {
    sa_norm: LayerNorm,
    attn: SelfAttention,
    mlp_norm: LayerNorm,
    fc1: Linear,
    fc2: Linear,
    activation: Activation,
}

impl EncoderLayer {
    pub(crate) fn new(
        dim: usize,
        num_heads: usize,
        intermediate_dim: usize,
        activation: Activation,
        norm_eps: f64,
        vb: VarBuilder,
    ) -> Result<Self> {
        let mlp = vb.pp("mlp");
        Ok(Self {
            sa_norm: layer_norm(dim, norm_eps, vb.pp("sa_norm"))?,
            attn: SelfAttention::new(dim, num_heads, vb.pp("attn"))?,
            mlp_norm: layer_norm(dim, norm_eps, vb.pp("mlp_norm"))?,
            fc1: linear(dim, intermediate_dim, mlp.pp("fc1"))?,
            fc2: linear(intermediate_dim, dim, mlp.pp("fc2"))?,
            activation,
        })
    }

    pub(crate) fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let h = (x + self.attn.forward(&self.sa_norm.forward(x)?)?)?;
        let mlp = self.fc1.forward(&self.mlp_norm.forward(&h)?)?;
        let mlp = self.fc2.forward(&self.activation.forward(&mlp)?)?;
        Ok((h + mlp)?)
    }
}

/// CLIP-style vision transformer over a single tile.
#[derive(Debug, Clone)]
pub struct VisionEncoder {
    conv: Conv2d,
    cls_token_embedding: Tensor,
    token_pos_embedding: Tensor,
    ln_pre: LayerNorm,
    layers: Vec<EncoderLayer>,
    ln_post: LayerNorm,
    cls_projection: Option<Linear>,
    config: VisionConfig,
}

impl VisionEncoder {
    /// Load the encoder from `vb`.
    pub fn new(config: &VisionConfig, vb: VarBuilder) -> Result<Self> {
        config.validate()?;
        let dim = config.embed_dim;
        let conv_config = Conv2dConfig {
            stride: config.patch_size,
            ..Default::default()
        };
        let conv = conv2d_no_bias(
            config.in_channels,
            dim,
            config.patch_size,
            conv_config,
            vb.pp("conv"),
        )?;
        let cls_token_embedding = vb.pp("cls_token_embedding").get(dim, "weight")?;
        let token_pos_embedding = vb
            .pp("token_pos_embedding")
            .get((config.seq_len(), dim), "positional_embedding")?;

        let layers_vb = vb.pp("layers");
        let layers = (0..config.num_layers)
            .map(|i| {
                EncoderLayer::new(
                    dim,
                    config.num_heads,
                    config.intermediate_dim,
                    config.activation,
                    config.norm_eps,
                    layers_vb.pp(i.to_string()),
                )
            })
            .collect::<Result<Vec<_>>>()?;

        let cls_projection = config
            .cls_projection
            .map(|out| linear_no_bias(dim, out, vb.pp("cls_projection")))
            .transpose()?;

        debug!(
            layers = config.num_layers,
            seq_len = config.seq_len(),
            dim,
            "built vision encoder"
        );
        Ok(Self {
            conv,
            cls_token_embedding,
            token_pos_embedding,
            ln_pre: layer_norm(dim, config.norm_eps, vb.pp("ln_pre"))?,
            layers,
            ln_post: layer_norm(dim, config.norm_eps, vb.pp("ln_post"))?,
            cls_projection,
            config: config.clone(),
        })
    }

    /// Encode normalized pixels.
    ///
    /// Accepts `[C, H, W]`, `[B, C, H, W]` or `[B, 1, C, H, W]` (one tile).
    pub fn forward(&self, pixels: &Tensor) -> Result<EncoderOutput> {
        let pixels = self.normalize_input(pixels)?;
        let dtype = self.cls_token_embedding.dtype();
        let pixels = pixels.to_dtype(dtype)?;
        let batch = pixels.dim(0)?;
        let dim = self.config.embed_dim;

        // [B, E, g, g] -> [B, g*g, E]
        let patches = self.conv.forward(&pixels)?.flatten_from(2)?.transpose(1, 2)?;
        let cls = self
            .cls_token_embedding
            .reshape((1, 1, dim))?
            .broadcast_as((batch, 1, dim))?;
        let x = Tensor::cat(&[&cls, &patches], 1)?;
        let x = x.broadcast_add(&self.token_pos_embedding)?;
        let mut x = self.ln_pre.forward(&x)?;

        let mut hidden_states = Vec::with_capacity(self.config.out_indices.len());
        for (idx, layer) in self.layers.iter().enumerate() {
            if self.config.out_indices.contains(&idx) {
                hidden_states.push(x.clone());
            }
            x = layer.forward(&x)?;
        }
        let x = self.ln_post.forward(&x)?;

        let last_hidden_state = match &self.cls_projection {
            Some(proj) => proj.forward(&x.narrow(1, 0, 1)?)?,
            None => x,
        };
        Ok(EncoderOutput {
            last_hidden_state,
            hidden_states,
        })
    }

    fn normalize_input(&self, pixels: &Tensor) -> Result<Tensor> {
        let pixels = match pixels.rank() {
            3 => pixels.unsqueeze(0)?,
            4 => pixels.clone(),
            5 if pixels.dim(1)? == 1 => pixels.squeeze(1)?,
            5 => {
                return Err(TesseraError::ShapeError(format!(
                    "only single-tile images are supported, got {} tiles",
                    pixels.dim(1)?
                )))
            }
            _ => {
                return Err(TesseraError::ShapeError(format!(
                    "pixels must be [C, H, W] or [B, C, H, W], got {:?}",
                    pixels.dims()
                )))
            }
        };
        let (_, c, h, w) = pixels.dims4()?;
        let tile = self.config.tile_size;
        if c != self.config.in_channels || h != tile || w != tile {
            return Err(TesseraError::ShapeError(format!(
                "expected [{}, {tile}, {tile}] pixels, got [{c}, {h}, {w}]",
                self.config.in_channels
            )));
        }
        Ok(pixels)
    }

    /// Encoder configuration.
    pub fn config(&self) -> &VisionConfig {
        &self.config
    }

    /// Width of `last_hidden_state`.
    pub fn output_dim(&self) -> usize {
        self.config.cls_projection.unwrap_or(self.config.embed_dim)
    }
}
