//! Gated cross-attention layer used by deep-fusion decoders.
//!
//! Text tokens attend to encoder states through a tanh-gated residual,
//! followed by a tanh-gated SwiGLU MLP. The encoder keys/values are
//! projected once when encoder states arrive and reused by later decode
//! steps until the caches are reset.

use super::attention::{mask_to_bias, repeat_kv, scaled_dot_product_attention};
use super::mlp::FeedForward;
use super::rmsnorm::RmsNorm;
use super::TransformerConfig;
use crate::distributed::ShardContext;
use crate::error::{Result, TesseraError};
use candle_core::{DType, Module, Tensor};
use candle_nn::{linear_no_bias, Init, Linear, VarBuilder};

/// Encoder context for the cross-attention layers of one forward call.
#[derive(Debug, Clone, Copy, Default)]
pub struct CrossInput<'a> {
    /// Encoder states `[batch, enc_len, dim]`; when absent, previously cached
    /// encoder keys/values are used.
    pub states: Option<&'a Tensor>,
    /// Boolean mask `[batch, seq, enc_len]`, 1 where a token may attend.
    pub mask: Option<&'a Tensor>,
}

impl CrossInput<'_> {
    /// Check encoder states and mask against `batch` x `seq_len` text tokens
    /// of width `dim`.
    ///
    /// `cached` is the `(batch, enc_len)` of encoder keys/values already held
    /// by a layer; it is what a call without states attends to.
    pub fn validate(
        &self,
        batch: usize,
        seq_len: usize,
        dim: usize,
        cached: Option<(usize, usize)>,
    ) -> Result<()> {
        let enc_len = match self.states {
            Some(states) => {
                let &[enc_batch, enc_len, width] = states.dims() else {
                    return Err(TesseraError::ShapeError(format!(
                        "encoder states must be [batch, enc_len, dim], got {:?}",
                        states.dims()
                    )));
                };
                if enc_batch != batch {
                    return Err(encoder_batch_mismatch(enc_batch, batch));
                }
                if width != dim {
                    return Err(TesseraError::ShapeError(format!(
                        "encoder width {width} does not match decoder dim {dim}"
                    )));
                }
                Some(enc_len)
            }
            None => match cached {
                Some((enc_batch, _)) if enc_batch != batch => {
                    return Err(encoder_batch_mismatch(enc_batch, batch))
                }
                Some((_, enc_len)) => Some(enc_len),
                None => None,
            },
        };
        if let (Some(mask), Some(enc_len)) = (self.mask, enc_len) {
            if mask.dims() != [batch, seq_len, enc_len] {
                return Err(TesseraError::ShapeError(format!(
                    "encoder mask must be [{batch}, {seq_len}, {enc_len}], got {:?}",
                    mask.dims()
                )));
            }
        }
        Ok(())
    }
}

fn encoder_batch_mismatch(encoder: usize, text: usize) -> TesseraError {
    TesseraError::ShapeError(format!(
        "encoder batch {encoder} does not match text batch {text}"
    ))
}

/// Residual gate `x * tanh(scale)`.
#[derive(Debug, Clone)]
struct TanhGate {
    scale: Tensor,
}

impl TanhGate {
    fn new(vb: VarBuilder) -> Result<Self> {
        // Zero-initialized so a fresh layer leaves the text stream untouched.
        let scale = vb.get_with_hints(1, "scale", Init::Const(0.0))?;
        Ok(Self { scale })
    }

    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let gate = self.scale.to_dtype(x.dtype())?.tanh()?;
        Ok(x.broadcast_mul(&gate)?)
    }
}

/// Multi-head attention from text queries to encoder keys/values.
#[derive(Debug, Clone)]
pub struct CrossAttention {
    wq: Linear,
    wk: Linear,
    wv: Linear,
    wo: Linear,
    q_norm: RmsNorm,
    k_norm: RmsNorm,
    n_heads: usize,
    n_local_heads: usize,
    head_dim: usize,
    encoder_kv: Option<(Tensor, Tensor)>,
    shard: Option<ShardContext>,
}

impl CrossAttention {
    /// Load projections from `vb`.
    pub fn new(
        config: &TransformerConfig,
        vb: VarBuilder,
        shard: Option<&ShardContext>,
    ) -> Result<Self> {
        let (n_heads, n_local_heads) = match shard {
            Some(s) => (
                s.local_size(config.n_heads, "n_heads")?,
                s.local_size(config.n_local_heads, "n_local_heads")?,
            ),
            None => (config.n_heads, config.n_local_heads),
        };
        let head_dim = config.head_dim;
        Ok(Self {
            wq: linear_no_bias(config.dim, n_heads * head_dim, vb.pp("wq"))?,
            wk: linear_no_bias(config.dim, n_local_heads * head_dim, vb.pp("wk"))?,
            wv: linear_no_bias(config.dim, n_local_heads * head_dim, vb.pp("wv"))?,
            wo: linear_no_bias(n_heads * head_dim, config.dim, vb.pp("wo"))?,
            q_norm: RmsNorm::load(head_dim, config.norm_eps, vb.pp("q_norm"))?,
            k_norm: RmsNorm::load(head_dim, config.norm_eps, vb.pp("k_norm"))?,
            n_heads,
            n_local_heads,
            head_dim,
            encoder_kv: None,
            shard: shard.cloned(),
        })
    }

    /// Project and cache encoder keys/values.
    pub fn cache_encoder(&mut self, states: &Tensor) -> Result<()> {
        self.encoder_kv = Some(self.project_encoder(states)?);
        Ok(())
    }

    /// Encoder keys `[batch, kv_heads, enc_len, head_dim]` and values.
    fn project_encoder(&self, states: &Tensor) -> Result<(Tensor, Tensor)> {
        let (batch, enc_len, _) = states.dims3()?;
        let k = self
            .wk
            .forward(states)?
            .reshape((batch, enc_len, self.n_local_heads, self.head_dim))?;
        let k = self.k_norm.forward(&k)?.transpose(1, 2)?.contiguous()?;
        let v = self
            .wv
            .forward(states)?
            .reshape((batch, enc_len, self.n_local_heads, self.head_dim))?
            .transpose(1, 2)?
            .contiguous()?;
        Ok((k, v))
    }

    /// Whether encoder keys/values are cached.
    pub fn has_encoder_kv(&self) -> bool {
        self.encoder_kv.is_some()
    }

    /// `(batch, enc_len)` of the cached encoder keys/values.
    pub fn encoder_shape(&self) -> Option<(usize, usize)> {
        self.encoder_kv.as_ref().map(|(k, _)| {
            let dims = k.dims();
            (dims[0], dims[2])
        })
    }

    /// Drop cached encoder keys/values.
    pub fn reset(&mut self) {
        self.encoder_kv = None;
    }

    /// Attend from `x` (`[batch, seq, dim]`, full sequence) to the cached
    /// encoder states. Rows where `keep` is 0 produce zeros.
    ///
    /// Returns this participant's partial output; the caller reduces it.
    fn forward(&self, x: &Tensor, mask: Option<&Tensor>, keep: Option<&Tensor>) -> Result<Tensor> {
        let (k, v) = self.encoder_kv.as_ref().ok_or_else(|| {
            TesseraError::StateError("cross-attention has no encoder states".to_string())
        })?;
        let (batch, seq_len, _) = x.dims3()?;
        if k.dim(0)? != batch {
            return Err(encoder_batch_mismatch(k.dim(0)?, batch));
        }

        let q = self
            .wq
            .forward(x)?
            .reshape((batch, seq_len, self.n_heads, self.head_dim))?;
        let q = self.q_norm.forward(&q)?.transpose(1, 2)?.contiguous()?;

        let n_rep = self.n_heads / self.n_local_heads;
        let k = repeat_kv(k, n_rep)?;
        let v = repeat_kv(v, n_rep)?;

        // [batch, seq, enc] -> [batch, 1, seq, enc]
        let bias = mask.map(|m| mask_to_bias(&m.unsqueeze(1)?)).transpose()?;
        let scale = 1.0 / (self.head_dim as f64).sqrt();
        let y = scaled_dot_product_attention(&q, &k, &v, bias.as_ref(), scale)?;

        // Fully masked rows come out of softmax as NaN; select zeros instead.
        let y = match keep {
            Some(keep) => {
                let keep = keep
                    .reshape((batch, 1, seq_len, 1))?
                    .broadcast_as(y.shape())?;
                keep.where_cond(&y, &y.zeros_like()?)?
            }
            None => y,
        };
        let y = y
            .transpose(1, 2)?
            .reshape((batch, seq_len, self.n_heads * self.head_dim))?;
        Ok(self.wo.forward(&y)?)
    }
}

/// Cross-attention sub-layer inserted ahead of a decoder block.
#[derive(Debug, Clone)]
pub struct CrossAttentionBlock {
    ca_norm: RmsNorm,
    attn: CrossAttention,
    ca_scale: TanhGate,
    mlp_norm: RmsNorm,
    mlp: FeedForward,
    mlp_scale: TanhGate,
    shard: Option<ShardContext>,
}

impl CrossAttentionBlock {
    /// Load the layer from `vb`.
    pub fn new(
        config: &TransformerConfig,
        vb: VarBuilder,
        shard: Option<&ShardContext>,
    ) -> Result<Self> {
        Ok(Self {
            ca_norm: RmsNorm::load(config.dim, config.norm_eps, vb.pp("ca_norm"))?,
            attn: CrossAttention::new(config, vb.pp("attn"), shard)?,
            ca_scale: TanhGate::new(vb.pp("ca_scale"))?,
            mlp_norm: RmsNorm::load(config.dim, config.norm_eps, vb.pp("mlp_norm"))?,
            mlp: FeedForward::new(config.dim, config.hidden_dim, vb.pp("mlp"), shard)?,
            mlp_scale: TanhGate::new(vb.pp("mlp_scale"))?,
            shard: shard.cloned(),
        })
    }

    /// Apply the layer. Without encoder states and without cached encoder
    /// keys/values the layer is skipped.
    pub fn forward(
        &mut self,
        x: &Tensor,
        cross: Option<&CrossInput<'_>>,
        sequence_sharded: bool,
    ) -> Result<Tensor> {
        if let Some(states) = cross.and_then(|c| c.states) {
            let kv = self.attn.project_encoder(states)?;
            let batch = x.dim(0)?;
            if kv.0.dim(0)? != batch {
                return Err(encoder_batch_mismatch(kv.0.dim(0)?, batch));
            }
            self.attn.encoder_kv = Some(kv);
        }
        if !self.attn.has_encoder_kv() {
            return Ok(x.clone());
        }
        let mask = cross.and_then(|c| c.mask);

        // 1 for tokens that can see at least one encoder position.
        let keep = mask
            .map(|m| -> Result<Tensor> { Ok(m.to_dtype(DType::U8)?.max_keepdim(2)?) })
            .transpose()?;

        let normed = self.ca_norm.forward(x)?;
        let attn_out = match &self.shard {
            Some(shard) => {
                let full = shard.enter(&normed, sequence_sharded)?;
                let partial = self.attn.forward(&full, mask, keep.as_ref())?;
                shard.reduce(&partial, sequence_sharded)?
            }
            None => self.attn.forward(&normed, mask, keep.as_ref())?,
        };
        let h = (self.ca_scale.forward(&attn_out)? + x)?;

        // An all-zero row through a bias-free SwiGLU stays zero.
        let mlp_in = self.mlp_norm.forward(&h)?;
        let mlp_in = match (&keep, &self.shard) {
            (Some(keep), Some(shard)) if sequence_sharded => {
                let keep = shard.scatter_sequence(keep)?;
                mlp_in.broadcast_mul(&keep.to_dtype(mlp_in.dtype())?)?
            }
            (Some(keep), _) => mlp_in.broadcast_mul(&keep.to_dtype(mlp_in.dtype())?)?,
            (None, _) => mlp_in,
        };
        let mlp_out = self.mlp.forward(&mlp_in, sequence_sharded)?;
        Ok((h + self.mlp_scale.forward(&mlp_out)?)?)
    }

    /// Drop cached encoder keys/values.
    pub fn reset(&mut self) {
        self.attn.reset();
    }

    /// Whether encoder keys/values are cached.
    pub fn has_encoder_kv(&self) -> bool {
        self.attn.has_encoder_kv()
    }

    /// `(batch, enc_len)` of the cached encoder keys/values.
    pub fn encoder_shape(&self) -> Option<(usize, usize)> {
        self.attn.encoder_shape()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;
    use candle_nn::VarMap;

    fn config() -> TransformerConfig {
        TransformerConfig {
            dim: 32,
            n_heads: 4,
            n_local_heads: 2,
            head_dim: 8,
            hidden_dim: 64,
            n_layers: 1,
            vocab_size: 16,
            ..TransformerConfig::default()
        }
    }

    fn block(varmap: &VarMap) -> CrossAttentionBlock {
        let vb = VarBuilder::from_varmap(varmap, DType::F32, &Device::Cpu);
        CrossAttentionBlock::new(&config(), vb, None).unwrap()
    }

    fn open_gates(varmap: &VarMap) {
        for (name, var) in varmap.data().lock().unwrap().iter() {
            if name.ends_with("scale") {
                var.set(&Tensor::new(&[1.0f32], &Device::Cpu).unwrap()).unwrap();
            }
        }
    }

    #[test]
    fn skipped_without_encoder() {
        let varmap = VarMap::new();
        let mut block = block(&varmap);
        let x = Tensor::randn(0.0f32, 1.0, &[1, 3, 32], &Device::Cpu).unwrap();
        let out = block.forward(&x, None, false).unwrap();
        let diff: f32 = (out - &x).unwrap().abs().unwrap().max_all().unwrap().to_scalar().unwrap();
        assert_eq!(diff, 0.0);
        assert!(!block.has_encoder_kv());
    }

    #[test]
    fn encoder_states_are_cached_for_decode_steps() {
        let varmap = VarMap::new();
        let mut block = block(&varmap);
        open_gates(&varmap);
        let dev = Device::Cpu;
        let states = Tensor::randn(0.0f32, 1.0, &[1, 6, 32], &dev).unwrap();
        let x = Tensor::randn(0.0f32, 1.0, &[1, 1, 32], &dev).unwrap();

        let with_states = block
            .forward(&x, Some(&CrossInput { states: Some(&states), mask: None }), false)
            .unwrap();
        assert!(block.has_encoder_kv());
        let from_cache = block.forward(&x, None, false).unwrap();

        let diff: f32 = (with_states - from_cache).unwrap().abs().unwrap().max_all().unwrap().to_scalar().unwrap();
        assert!(diff < 1e-6);

        block.reset();
        assert!(!block.has_encoder_kv());
    }

    #[test]
    fn mismatched_encoder_batch_is_not_cached() {
        let varmap = VarMap::new();
        let mut block = block(&varmap);
        let dev = Device::Cpu;
        let states = Tensor::randn(0.0f32, 1.0, &[2, 4, 32], &dev).unwrap();
        let x = Tensor::randn(0.0f32, 1.0, &[1, 3, 32], &dev).unwrap();

        let cross = CrossInput { states: Some(&states), mask: None };
        assert!(block.forward(&x, Some(&cross), false).unwrap_err().is_shape());
        assert!(!block.has_encoder_kv());
        assert!(block.forward(&x, None, false).is_ok());
    }

    #[test]
    fn validate_checks_states_and_mask() {
        let dev = Device::Cpu;
        let states = Tensor::zeros(&[1, 4, 32], DType::F32, &dev).unwrap();
        let good_mask = Tensor::ones(&[1, 3, 4], DType::U8, &dev).unwrap();
        let bad_mask = Tensor::ones(&[1, 3, 5], DType::U8, &dev).unwrap();

        let ok = CrossInput { states: Some(&states), mask: Some(&good_mask) };
        assert!(ok.validate(1, 3, 32, None).is_ok());
        assert!(ok.validate(2, 3, 32, None).unwrap_err().is_shape());
        assert!(ok.validate(1, 3, 16, None).unwrap_err().is_shape());

        let masked = CrossInput { states: Some(&states), mask: Some(&bad_mask) };
        assert!(masked.validate(1, 3, 32, None).unwrap_err().is_shape());

        // Without states the cached encoder shape decides.
        let cached_only = CrossInput { states: None, mask: Some(&good_mask) };
        assert!(cached_only.validate(1, 3, 32, Some((1, 4))).is_ok());
        assert!(cached_only.validate(1, 3, 32, Some((2, 4))).unwrap_err().is_shape());
        assert!(cached_only.validate(1, 3, 32, None).is_ok());
    }

    #[test]
    fn fully_masked_rows_pass_through() {
        let varmap = VarMap::new();
        let mut block = block(&varmap);
        open_gates(&varmap);
        let dev = Device::Cpu;
        let states = Tensor::randn(0.0f32, 1.0, &[1, 4, 32], &dev).unwrap();
        let x = Tensor::randn(0.0f32, 1.0, &[1, 2, 32], &dev).unwrap();
        // Token 0 sees nothing, token 1 sees everything.
        let mask = Tensor::new(&[[[0u8, 0, 0, 0], [1, 1, 1, 1]]], &dev).unwrap();

        let out = block
            .forward(&x, Some(&CrossInput { states: Some(&states), mask: Some(&mask) }), false)
            .unwrap();
        let row0: f32 = (out.narrow(1, 0, 1).unwrap() - x.narrow(1, 0, 1).unwrap())
            .unwrap()
            .abs()
            .unwrap()
            .max_all()
            .unwrap()
            .to_scalar()
            .unwrap();
        assert_eq!(row0, 0.0);

        let row1: f32 = out.narrow(1, 1, 1).unwrap().sum_all().unwrap().to_scalar().unwrap();
        assert!(row1.is_finite());
    }
}
