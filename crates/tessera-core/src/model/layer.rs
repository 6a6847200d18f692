//! Decoder block.
//!
//! A single pre-norm decoder layer combining:
//! - RMSNorm + causal self-attention with residual
//! - RMSNorm + SwiGLU feed-forward with residual

use super::attention::Attention;
use super::mlp::FeedForward;
use super::rmsnorm::RmsNorm;
use super::{StepContext, TransformerConfig};
use crate::distributed::ShardContext;
use crate::error::Result;
use candle_core::Tensor;
use candle_nn::VarBuilder;

/// A single decoder layer.
#[derive(Debug, Clone)]
pub struct TransformerBlock {
    attention: Attention,
    feed_forward: FeedForward,
    attention_norm: RmsNorm,
    ffn_norm: RmsNorm,
    /// Global layer index.
    layer_idx: usize,
}

impl TransformerBlock {
    /// Load layer `layer_idx` from `vb` (already scoped to `layers.{idx}`).
    pub fn new(
        config: &TransformerConfig,
        vb: VarBuilder,
        shard: Option<&ShardContext>,
        layer_idx: usize,
    ) -> Result<Self> {
        Ok(Self {
            attention: Attention::new(config, vb.pp("attention"), shard)?,
            feed_forward: FeedForward::new(
                config.dim,
                config.hidden_dim,
                vb.pp("feed_forward"),
                shard,
            )?,
            attention_norm: RmsNorm::load(config.dim, config.norm_eps, vb.pp("attention_norm"))?,
            ffn_norm: RmsNorm::load(config.dim, config.norm_eps, vb.pp("ffn_norm"))?,
            layer_idx,
        })
    }

    /// `h = x + attention(attention_norm(x))`, `out = h + feed_forward(ffn_norm(h))`
    pub fn forward(&mut self, x: &Tensor, ctx: &StepContext<'_>) -> Result<Tensor> {
        let normed = self.attention_norm.forward(x)?;
        let h = (x + self.attention.forward(&normed, ctx)?)?;

        let normed = self.ffn_norm.forward(&h)?;
        let out = (&h + self.feed_forward.forward(&normed, ctx.sequence_sharded)?)?;
        Ok(out)
    }

    /// Size the attention cache.
    pub fn setup_cache(&mut self, max_batch: usize, max_seq_len: usize) -> Result<()> {
        self.attention.setup_cache(max_batch, max_seq_len)
    }

    /// Zero the attention cache.
    pub fn reset_cache(&mut self) -> Result<()> {
        self.attention.reset_cache()
    }

    /// Get the layer index.
    pub fn layer_idx(&self) -> usize {
        self.layer_idx
    }

    /// Get the attention module.
    pub fn attention(&self) -> &Attention {
        &self.attention
    }
}
