//! SwiGLU feed-forward block.
//!
//! `FeedForward(x) = w2(silu(w1(x)) * w3(x))`
//!
//! # Reference
//!
//! [GLU Variants Improve Transformer](https://arxiv.org/abs/2002.05202)

use crate::distributed::ShardContext;
use crate::error::Result;
use candle_core::{Module, Tensor};
use candle_nn::ops::silu;
use candle_nn::{linear_no_bias, Linear, VarBuilder};

/// SwiGLU MLP block.
#[derive(Debug, Clone)]
pub struct FeedForward {
    /// Gate projection: dim -> hidden (column-sharded)
    w1: Linear,
    /// Down projection: hidden -> dim (row-sharded)
    w2: Linear,
    /// Up projection: dim -> hidden (column-sharded)
    w3: Linear,
    shard: Option<ShardContext>,
}

impl FeedForward {
    /// Load `w1`, `w2`, `w3` from `vb`. With a shard context the hidden
    /// width is this participant's share.
    pub fn new(
        dim: usize,
        hidden_dim: usize,
        vb: VarBuilder,
        shard: Option<&ShardContext>,
    ) -> Result<Self> {
        let local_hidden = match shard {
            Some(s) => s.local_size(hidden_dim, "hidden_dim")?,
            None => hidden_dim,
        };
        Ok(Self {
            w1: linear_no_bias(dim, local_hidden, vb.pp("w1"))?,
            w2: linear_no_bias(local_hidden, dim, vb.pp("w2"))?,
            w3: linear_no_bias(dim, local_hidden, vb.pp("w3"))?,
            shard: shard.cloned(),
        })
    }

    /// Forward pass over `[batch, seq, dim]`.
    ///
    /// `sequence_sharded` marks input that arrives chunked along the
    /// sequence axis; the output is chunked the same way.
    pub fn forward(&self, x: &Tensor, sequence_sharded: bool) -> Result<Tensor> {
        let x = match &self.shard {
            Some(shard) => shard.enter(x, sequence_sharded)?,
            None => x.clone(),
        };
        let gate = silu(&self.w1.forward(&x)?)?;
        let up = self.w3.forward(&x)?;
        let out = self.w2.forward(&(gate * up)?)?;
        match &self.shard {
            Some(shard) => shard.reduce(&out, sequence_sharded),
            None => Ok(out),
        }
    }

    /// Local hidden width.
    pub fn hidden_dim(&self) -> usize {
        self.w1.weight().dims()[0]
    }
}
