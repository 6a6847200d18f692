//! Decoder building blocks.
//!
//! Provides the pieces every recipe assembles:
//! - Decoder configuration and rope scaling
//! - Rotary tables and explicit token positions
//! - KV cache, self-attention and gated cross-attention
//! - Decoder blocks and the stage-aware [`Decoder`]
//! - Parameter sources and checkpoint key remapping

pub mod attention;
pub mod config;
pub mod cross_attention;
pub mod kv_cache;
pub mod layer;
pub mod loader;
pub mod mlp;
pub mod positions;
pub mod rmsnorm;
pub mod rope;
pub mod transformer;

pub use config::{find_multiple, RopeScaling, TransformerConfig};
pub use cross_attention::{CrossAttentionBlock, CrossInput};
pub use kv_cache::KvCache;
pub use layer::TransformerBlock;
pub use loader::{
    collect_vars, init_random_params, remap_params, split_fused_qkv, strip_model_prefix,
    ParamSource, QkvLayout,
};
pub use positions::Positions;
pub use rope::{RopeConvention, RotaryTable};
pub use transformer::{
    causal_mask, Decoder, DecoderLayer, DecoderOptions, EmbeddingOwnership, ModelState,
    StageInput,
};

use candle_core::Tensor;

/// Per-call inputs shared by every layer of one forward pass.
#[derive(Debug, Clone, Copy)]
pub struct StepContext<'a> {
    /// Absolute positions of the incoming tokens.
    pub positions: &'a Positions,
    /// Rotary table rows selected at those positions.
    pub rotary_rows: Option<&'a Tensor>,
    /// Additive attention bias `[seq, kv_len]`.
    pub mask: Option<&'a Tensor>,
    /// Whether activations arrive split along the sequence axis.
    pub sequence_sharded: bool,
}
