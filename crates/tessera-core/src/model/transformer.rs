//! Decoder stack with pipeline stages, cache setup and explicit positions.
//!
//! A [`Decoder`] holds the layers of one pipeline stage, keyed by their
//! global index. The first stage may own the token embedding and the last
//! stage owns the final norm and output head. Every forward call receives
//! the absolute positions of its tokens, whichever stage it runs on.

use super::attention::mask_to_bias;
use super::config::find_multiple;
use super::cross_attention::{CrossAttentionBlock, CrossInput};
use super::layer::TransformerBlock;
use super::positions::Positions;
use super::rmsnorm::RmsNorm;
use super::rope::RotaryTable;
use super::{StepContext, TransformerConfig};
use crate::distributed::ShardContext;
use crate::error::{Result, TesseraError};
use candle_core::{DType, Device, Module, Tensor};
use candle_nn::{embedding, linear_no_bias, Embedding, Linear, VarBuilder};
use std::collections::BTreeMap;
use tracing::debug;

/// Whether the decoder embeds tokens itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EmbeddingOwnership {
    /// The first stage holds `tok_embeddings`.
    #[default]
    Owned,
    /// A wrapping module embeds tokens and passes hidden states in.
    External,
}

/// Construction options for a [`Decoder`].
#[derive(Debug, Clone, Default)]
pub struct DecoderOptions {
    /// Token embedding ownership.
    pub embedding: EmbeddingOwnership,
    /// Tensor-parallel participant context.
    pub shard: Option<ShardContext>,
}

impl DecoderOptions {
    /// Leave token embedding to the caller.
    pub fn without_embedding(mut self) -> Self {
        self.embedding = EmbeddingOwnership::External;
        self
    }

    /// Build as one participant of a sharded model.
    pub fn with_shard(mut self, shard: Option<ShardContext>) -> Self {
        self.shard = shard;
        self
    }
}

/// Input to one pipeline stage.
#[derive(Debug, Clone, Copy)]
pub enum StageInput<'a> {
    /// Token ids `[batch, seq]` or `[seq]` (batch 1), embedded by this stage.
    Tokens(&'a Tensor),
    /// Hidden states `[batch, seq, dim]` from a previous stage or a fusion wrapper.
    Hidden(&'a Tensor),
}

/// Cache lifecycle of a decoder.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelState {
    /// Constructed, caches not allocated.
    Built,
    /// Caches allocated (or reset), no forward since.
    Ready,
    /// At least one forward call since setup/reset.
    Decoding,
}

/// One entry of the layer map.
#[derive(Debug, Clone)]
pub enum DecoderLayer {
    /// Plain decoder block.
    Block(TransformerBlock),
    /// Cross-attention layer followed by a decoder block.
    Fused {
        /// Gated cross-attention to encoder states.
        cross: CrossAttentionBlock,
        /// The regular decoder block.
        block: TransformerBlock,
    },
}

impl DecoderLayer {
    fn forward(
        &mut self,
        x: &Tensor,
        ctx: &StepContext<'_>,
        cross_input: Option<&CrossInput<'_>>,
    ) -> Result<Tensor> {
        match self {
            DecoderLayer::Block(block) => block.forward(x, ctx),
            DecoderLayer::Fused { cross, block } => {
                let h = cross.forward(x, cross_input, ctx.sequence_sharded)?;
                block.forward(&h, ctx)
            }
        }
    }

    fn block_mut(&mut self) -> &mut TransformerBlock {
        match self {
            DecoderLayer::Block(block) | DecoderLayer::Fused { block, .. } => block,
        }
    }

    /// The self-attention decoder block.
    pub fn block(&self) -> &TransformerBlock {
        match self {
            DecoderLayer::Block(block) | DecoderLayer::Fused { block, .. } => block,
        }
    }
}

/// Rotary table and causal mask sized for the current cache.
#[derive(Debug, Clone)]
struct CacheBuffers {
    max_batch: usize,
    max_seq_len: usize,
    rotary: RotaryTable,
    /// Lower-triangular `[max_seq_len, max_seq_len]`, `u8`.
    causal_mask: Tensor,
}

/// Decoder stack for one pipeline stage.
#[derive(Debug, Clone)]
pub struct Decoder {
    config: TransformerConfig,
    tok_embeddings: Option<Embedding>,
    layers: BTreeMap<usize, DecoderLayer>,
    norm: Option<RmsNorm>,
    output: Option<Linear>,
    shard: Option<ShardContext>,
    buffers: Option<CacheBuffers>,
    decoding: bool,
    device: Device,
}

impl Decoder {
    /// Build the stage described by `config.stage_idx` from `vb`.
    pub fn new(config: &TransformerConfig, vb: VarBuilder, options: DecoderOptions) -> Result<Self> {
        config.validate()?;
        let shard = options.shard.as_ref();

        let tok_embeddings = if config.is_first_stage()
            && options.embedding == EmbeddingOwnership::Owned
        {
            Some(embedding(
                config.embedding_rows(),
                config.dim,
                vb.pp("tok_embeddings"),
            )?)
        } else {
            None
        };

        let mut layers = BTreeMap::new();
        let layers_vb = vb.pp("layers");
        for idx in config.stage_layers() {
            let layer_vb = layers_vb.pp(idx.to_string());
            let block = TransformerBlock::new(config, layer_vb.clone(), shard, idx)?;
            let layer = if config.is_fusion_layer(idx) {
                DecoderLayer::Fused {
                    cross: CrossAttentionBlock::new(config, layer_vb.pp("fusion_layer"), shard)?,
                    block,
                }
            } else {
                DecoderLayer::Block(block)
            };
            layers.insert(idx, layer);
        }

        let (norm, output) = if config.is_last_stage() {
            let vocab = match shard {
                Some(s) => s.local_size(config.vocab_size, "vocab_size")?,
                None => config.vocab_size,
            };
            (
                Some(RmsNorm::load(config.dim, config.norm_eps, vb.pp("norm"))?),
                Some(linear_no_bias(config.dim, vocab, vb.pp("output"))?),
            )
        } else {
            (None, None)
        };

        debug!(
            stage = config.stage_idx,
            n_stages = config.n_stages,
            layers = layers.len(),
            embedding = tok_embeddings.is_some(),
            head = output.is_some(),
            "built decoder stage"
        );

        Ok(Self {
            config: config.clone(),
            tok_embeddings,
            layers,
            norm,
            output,
            shard: options.shard,
            buffers: None,
            decoding: false,
            device: vb.device().clone(),
        })
    }

    /// Allocate caches for `max_batch` sequences of up to `max_seq_len` tokens.
    ///
    /// No-op when the current caches already cover both sizes. Otherwise the
    /// sequence length is rounded up to a multiple of 8, both sizes grow to
    /// at least their previous values, and the rotary table and causal mask
    /// are rebuilt.
    pub fn setup_caches(&mut self, max_batch: usize, max_seq_len: usize) -> Result<()> {
        if max_batch == 0 || max_seq_len == 0 {
            return Err(TesseraError::ConfigError(format!(
                "cache sizes must be positive, got batch {max_batch} seq {max_seq_len}"
            )));
        }
        if let Some(buffers) = &self.buffers {
            if buffers.max_batch >= max_batch && buffers.max_seq_len >= max_seq_len {
                debug!(max_batch, max_seq_len, "caches already cover request");
                return Ok(());
            }
        }

        let rounded = find_multiple(max_seq_len, 8);
        let (batch, seq) = match &self.buffers {
            Some(b) => (b.max_batch.max(max_batch), b.max_seq_len.max(rounded)),
            None => (max_batch, rounded),
        };
        debug!(requested_seq = max_seq_len, batch, seq, "setting up caches");

        for layer in self.layers.values_mut() {
            if let DecoderLayer::Fused { cross, .. } = layer {
                cross.reset();
            }
            layer.block_mut().setup_cache(batch, seq)?;
        }

        let rotary = RotaryTable::new(
            self.config.head_dim,
            self.config.block_size.max(seq) * 2,
            self.config.rope_base,
            self.config.rope_scaling.as_ref(),
            self.config.rope_convention(),
            &self.device,
        )?;
        let causal_mask = causal_mask(seq, &self.device)?;

        self.buffers = Some(CacheBuffers {
            max_batch: batch,
            max_seq_len: seq,
            rotary,
            causal_mask,
        });
        self.decoding = false;
        Ok(())
    }

    /// Zero every cache and drop cached encoder states. Sizes are kept.
    pub fn reset_caches(&mut self) -> Result<()> {
        for layer in self.layers.values_mut() {
            if let DecoderLayer::Fused { cross, .. } = layer {
                cross.reset();
            }
            layer.block_mut().reset_cache()?;
        }
        self.decoding = false;
        Ok(())
    }

    /// Run this stage.
    ///
    /// # Arguments
    ///
    /// * `input` - Token ids (first stage) or hidden states
    /// * `input_pos` - Absolute positions `[seq]` of the incoming tokens
    /// * `cross` - Encoder context for cross-attention layers
    ///
    /// # Returns
    ///
    /// Logits `[batch, seq, vocab]` (f32) on the last stage, hidden states
    /// `[batch, seq, dim]` otherwise.
    pub fn forward(
        &mut self,
        input: StageInput<'_>,
        input_pos: &Tensor,
        cross: Option<&CrossInput<'_>>,
    ) -> Result<Tensor> {
        let buffers = self.buffers.as_ref().ok_or_else(|| {
            TesseraError::StateError("caches must be set up before forward".to_string())
        })?;
        let positions = Positions::new(&input_pos.to_device(&self.device)?)?;
        positions.check_below(buffers.max_seq_len, "cache")?;

        let x = match input {
            StageInput::Tokens(tokens) => {
                let embed = self.tok_embeddings.as_ref().ok_or_else(|| {
                    TesseraError::StateError(
                        "this decoder stage does not own a token embedding".to_string(),
                    )
                })?;
                match tokens.rank() {
                    1 => embed.forward(&tokens.unsqueeze(0)?)?,
                    2 => embed.forward(tokens)?,
                    _ => {
                        return Err(TesseraError::ShapeError(format!(
                            "tokens must be [seq] or [batch, seq], got {:?}",
                            tokens.dims()
                        )))
                    }
                }
            }
            StageInput::Hidden(hidden) => hidden.clone(),
        };

        let (batch, seq_len, dim) = x.dims3()?;
        if dim != self.config.dim {
            return Err(TesseraError::ShapeError(format!(
                "hidden width {dim} does not match decoder dim {}",
                self.config.dim
            )));
        }
        if seq_len != positions.len() {
            return Err(TesseraError::ShapeError(format!(
                "{} positions for {} tokens",
                positions.len(),
                seq_len
            )));
        }
        if batch > buffers.max_batch {
            return Err(TesseraError::ShapeError(format!(
                "batch {batch} exceeds cache capacity {}",
                buffers.max_batch
            )));
        }
        // Reject bad encoder input before any layer writes its cache.
        if let Some(cross) = cross {
            for layer in self.layers.values() {
                if let DecoderLayer::Fused { cross: block, .. } = layer {
                    cross.validate(batch, seq_len, dim, block.encoder_shape())?;
                }
            }
        }

        let rotary_rows = buffers.rotary.select(positions.tensor())?;
        let mask = mask_to_bias(&buffers.causal_mask.index_select(positions.tensor(), 0)?)?;

        let sequence_sharded = self
            .shard
            .as_ref()
            .map_or(false, |s| s.sequence_sharded(seq_len));
        let mut x = match (&self.shard, sequence_sharded) {
            (Some(shard), true) => shard.scatter_sequence(&x)?,
            _ => x,
        };

        let ctx = StepContext {
            positions: &positions,
            rotary_rows: Some(&rotary_rows),
            mask: Some(&mask),
            sequence_sharded,
        };
        for layer in self.layers.values_mut() {
            x = layer.forward(&x, &ctx, cross)?;
        }
        self.decoding = true;

        let gather = |x: Tensor| -> Result<Tensor> {
            match (&self.shard, sequence_sharded) {
                (Some(shard), true) => shard.gather_sequence(&x),
                _ => Ok(x),
            }
        };

        match (&self.norm, &self.output) {
            (Some(norm), Some(output)) => {
                let h = gather(norm.forward(&x)?)?;
                let logits = output.forward(&h)?;
                let logits = match &self.shard {
                    Some(shard) => shard.gather_features(&logits)?,
                    None => logits,
                };
                Ok(logits.to_dtype(DType::F32)?)
            }
            _ => gather(x),
        }
    }

    /// Current cache lifecycle state.
    pub fn state(&self) -> ModelState {
        match (&self.buffers, self.decoding) {
            (None, _) => ModelState::Built,
            (Some(_), false) => ModelState::Ready,
            (Some(_), true) => ModelState::Decoding,
        }
    }

    /// Whether caches are set up.
    pub fn is_ready(&self) -> bool {
        self.buffers.is_some()
    }

    /// Cache capacity as `(max_batch, max_seq_len)`.
    pub fn cache_capacity(&self) -> Option<(usize, usize)> {
        self.buffers.as_ref().map(|b| (b.max_batch, b.max_seq_len))
    }

    /// Embed token ids with this decoder's table.
    pub fn embed(&self, tokens: &Tensor) -> Result<Tensor> {
        let embed = self.tok_embeddings.as_ref().ok_or_else(|| {
            TesseraError::StateError("this decoder stage does not own a token embedding".to_string())
        })?;
        Ok(embed.forward(tokens)?)
    }

    /// The decoder configuration.
    pub fn config(&self) -> &TransformerConfig {
        &self.config
    }

    /// Model width.
    pub fn dim(&self) -> usize {
        self.config.dim
    }

    /// Layers of this stage, keyed by global index.
    pub fn layers(&self) -> &BTreeMap<usize, DecoderLayer> {
        &self.layers
    }

    /// Whether this stage embeds tokens.
    pub fn has_embedding(&self) -> bool {
        self.tok_embeddings.is_some()
    }

    /// Whether this stage produces logits.
    pub fn has_output(&self) -> bool {
        self.output.is_some()
    }

    /// Device the decoder lives on.
    pub fn device(&self) -> &Device {
        &self.device
    }
}

/// Lower-triangular boolean mask: `mask[i][j] = 1` iff `j <= i`.
pub fn causal_mask(seq_len: usize, device: &Device) -> Result<Tensor> {
    let data: Vec<u8> = (0..seq_len)
        .flat_map(|i| (0..seq_len).map(move |j| u8::from(j <= i)))
        .collect();
    Ok(Tensor::from_vec(data, (seq_len, seq_len), device)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_nn::VarMap;

    fn small_config() -> TransformerConfig {
        TransformerConfig {
            block_size: 32,
            vocab_size: 50,
            n_layers: 4,
            n_heads: 4,
            n_local_heads: 2,
            dim: 32,
            head_dim: 8,
            hidden_dim: 64,
            ..TransformerConfig::default()
        }
    }

    fn decoder(config: &TransformerConfig, varmap: &VarMap) -> Decoder {
        let vb = VarBuilder::from_varmap(varmap, DType::F32, &Device::Cpu);
        Decoder::new(config, vb, DecoderOptions::default()).unwrap()
    }

    fn tokens(ids: &[u32]) -> Tensor {
        Tensor::new(ids, &Device::Cpu).unwrap().unsqueeze(0).unwrap()
    }

    fn arange(start: u32, end: u32) -> Tensor {
        Tensor::arange(start, end, &Device::Cpu).unwrap()
    }

    #[test]
    fn causal_mask_values() {
        let mask = causal_mask(4, &Device::Cpu).unwrap();
        let vals: Vec<Vec<u8>> = mask.to_vec2().unwrap();
        assert_eq!(vals[0], vec![1, 0, 0, 0]);
        assert_eq!(vals[3], vec![1, 1, 1, 1]);
    }

    #[test]
    fn forward_before_setup_is_state_error() {
        let varmap = VarMap::new();
        let mut dec = decoder(&small_config(), &varmap);
        assert_eq!(dec.state(), ModelState::Built);
        let err = dec
            .forward(StageInput::Tokens(&tokens(&[1, 2])), &arange(0, 2), None)
            .unwrap_err();
        assert!(err.is_state());
    }

    #[test]
    fn setup_rounds_and_never_shrinks() {
        let varmap = VarMap::new();
        let mut dec = decoder(&small_config(), &varmap);
        dec.setup_caches(1, 13).unwrap();
        assert_eq!(dec.cache_capacity(), Some((1, 16)));

        dec.setup_caches(1, 8).unwrap();
        assert_eq!(dec.cache_capacity(), Some((1, 16)));

        dec.setup_caches(2, 4).unwrap();
        assert_eq!(dec.cache_capacity(), Some((2, 16)));

        let cache = dec.layers()[&0].block().attention().cache().unwrap();
        assert_eq!(cache.keys().dims(), &[2, 2, 16, 8]);
    }

    #[test]
    fn covered_setup_keeps_cache_contents() {
        let varmap = VarMap::new();
        let mut dec = decoder(&small_config(), &varmap);
        dec.setup_caches(1, 16).unwrap();
        dec.forward(StageInput::Tokens(&tokens(&[3, 4, 5])), &arange(0, 3), None)
            .unwrap();
        let before = dec.layers()[&0].block().attention().cache().unwrap().keys().clone();

        dec.setup_caches(1, 10).unwrap();
        let after = dec.layers()[&0].block().attention().cache().unwrap().keys().clone();
        let diff: f32 = (before - after).unwrap().abs().unwrap().max_all().unwrap().to_scalar().unwrap();
        assert_eq!(diff, 0.0);
        assert_eq!(dec.state(), ModelState::Decoding);
    }

    #[test]
    fn incremental_decode_matches_prefill() {
        let varmap = VarMap::new();
        let config = small_config();
        let mut dec = decoder(&config, &varmap);
        dec.setup_caches(1, 16).unwrap();

        let ids = [7u32, 1, 9, 4, 2];
        let full = dec
            .forward(StageInput::Tokens(&tokens(&ids)), &arange(0, 5), None)
            .unwrap();
        assert_eq!(full.dims(), &[1, 5, 50]);

        dec.reset_caches().unwrap();
        assert_eq!(dec.state(), ModelState::Ready);
        dec.forward(StageInput::Tokens(&tokens(&ids[..4])), &arange(0, 4), None)
            .unwrap();
        let step = dec
            .forward(StageInput::Tokens(&tokens(&ids[4..])), &arange(4, 5), None)
            .unwrap();
        assert_eq!(step.dims(), &[1, 1, 50]);

        let diff: f32 = (full.narrow(1, 4, 1).unwrap() - step)
            .unwrap()
            .abs()
            .unwrap()
            .max_all()
            .unwrap()
            .to_scalar()
            .unwrap();
        assert!(diff < 1e-4, "diff {diff}");
    }

    #[test]
    fn out_of_range_position_is_shape_error() {
        let varmap = VarMap::new();
        let mut dec = decoder(&small_config(), &varmap);
        dec.setup_caches(1, 8).unwrap();
        let err = dec
            .forward(StageInput::Tokens(&tokens(&[1])), &arange(8, 9), None)
            .unwrap_err();
        assert!(err.is_shape());
    }

    #[test]
    fn position_count_mismatch_is_shape_error() {
        let varmap = VarMap::new();
        let mut dec = decoder(&small_config(), &varmap);
        dec.setup_caches(1, 8).unwrap();
        let err = dec
            .forward(StageInput::Tokens(&tokens(&[1, 2, 3])), &arange(0, 2), None)
            .unwrap_err();
        assert!(err.is_shape());
    }

    #[test]
    fn external_embedding_requires_hidden_input() {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let mut dec =
            Decoder::new(&small_config(), vb, DecoderOptions::default().without_embedding())
                .unwrap();
        assert!(!dec.has_embedding());
        dec.setup_caches(1, 8).unwrap();

        let err = dec
            .forward(StageInput::Tokens(&tokens(&[1])), &arange(0, 1), None)
            .unwrap_err();
        assert!(err.is_state());

        let hidden = Tensor::randn(0.0f32, 1.0, &[1, 2, 32], &Device::Cpu).unwrap();
        let logits = dec
            .forward(StageInput::Hidden(&hidden), &arange(0, 2), None)
            .unwrap();
        assert_eq!(logits.dims(), &[1, 2, 50]);
    }

    #[test]
    fn stages_split_layers_and_chain() {
        let config = small_config();
        let varmap = VarMap::new();
        let mut whole = decoder(&config, &varmap);

        // Stage modules built over the same variables share weights.
        let mut first = decoder(&config.for_stage(2, 0).unwrap(), &varmap);
        let mut second = decoder(&config.for_stage(2, 1).unwrap(), &varmap);
        assert_eq!(first.layers().keys().copied().collect::<Vec<_>>(), vec![0, 1]);
        assert_eq!(second.layers().keys().copied().collect::<Vec<_>>(), vec![2, 3]);
        assert!(first.has_embedding() && !first.has_output());
        assert!(!second.has_embedding() && second.has_output());

        for dec in [&mut whole, &mut first, &mut second] {
            dec.setup_caches(1, 8).unwrap();
        }
        let ids = tokens(&[5, 6, 7]);
        let pos = arange(0, 3);
        let expected = whole.forward(StageInput::Tokens(&ids), &pos, None).unwrap();
        let hidden = first.forward(StageInput::Tokens(&ids), &pos, None).unwrap();
        assert_eq!(hidden.dims(), &[1, 3, 32]);
        let logits = second.forward(StageInput::Hidden(&hidden), &pos, None).unwrap();

        let diff: f32 = (expected - logits).unwrap().abs().unwrap().max_all().unwrap().to_scalar().unwrap();
        assert!(diff < 1e-5);
    }

    #[test]
    fn fusion_interval_inserts_cross_layers() {
        let config = TransformerConfig {
            fusion_interval: Some(2),
            ..small_config()
        };
        let varmap = VarMap::new();
        let dec = decoder(&config, &varmap);
        let fused: Vec<usize> = dec
            .layers()
            .iter()
            .filter(|(_, l)| matches!(l, DecoderLayer::Fused { .. }))
            .map(|(i, _)| *i)
            .collect();
        assert_eq!(fused, vec![1, 3]);
    }

    fn fused_decoder(varmap: &VarMap) -> Decoder {
        let config = TransformerConfig {
            fusion_interval: Some(2),
            ..small_config()
        };
        decoder(&config, varmap)
    }

    fn layer0_key_mass(dec: &Decoder) -> f32 {
        let keys = dec.layers()[&0].block().attention().cache().unwrap().keys();
        keys.abs().unwrap().sum_all().unwrap().to_scalar().unwrap()
    }

    fn any_encoder_kv(dec: &Decoder) -> bool {
        dec.layers().values().any(|l| match l {
            DecoderLayer::Fused { cross, .. } => cross.has_encoder_kv(),
            DecoderLayer::Block(_) => false,
        })
    }

    #[test]
    fn rejected_cross_input_leaves_caches_untouched() {
        let varmap = VarMap::new();
        let mut dec = fused_decoder(&varmap);
        dec.setup_caches(2, 16).unwrap();
        let dev = Device::Cpu;
        let ids = tokens(&[3, 4, 5]);

        let wide_batch = Tensor::randn(0.0f32, 1.0, &[2, 4, 32], &dev).unwrap();
        let narrow = Tensor::randn(0.0f32, 1.0, &[1, 4, 16], &dev).unwrap();
        let states = Tensor::randn(0.0f32, 1.0, &[1, 4, 32], &dev).unwrap();
        let bad_mask = Tensor::ones(&[1, 3, 5], DType::U8, &dev).unwrap();
        let rejected = [
            CrossInput { states: Some(&wide_batch), mask: None },
            CrossInput { states: Some(&narrow), mask: None },
            CrossInput { states: Some(&states), mask: Some(&bad_mask) },
        ];
        for cross in &rejected {
            let err = dec
                .forward(StageInput::Tokens(&ids), &arange(0, 3), Some(cross))
                .unwrap_err();
            assert!(err.is_shape(), "{err}");
            assert_eq!(layer0_key_mass(&dec), 0.0);
            assert!(!any_encoder_kv(&dec));
            assert_eq!(dec.state(), ModelState::Ready);
        }

        let logits = dec
            .forward(StageInput::Tokens(&ids), &arange(0, 3), None)
            .unwrap();
        assert_eq!(logits.dims(), &[1, 3, 50]);
    }

    #[test]
    fn cached_encoder_batch_is_checked_on_decode_steps() {
        let varmap = VarMap::new();
        let mut dec = fused_decoder(&varmap);
        dec.setup_caches(2, 16).unwrap();
        let states = Tensor::randn(0.0f32, 1.0, &[1, 4, 32], &Device::Cpu).unwrap();
        let cross = CrossInput { states: Some(&states), mask: None };
        dec.forward(StageInput::Tokens(&tokens(&[3, 4])), &arange(0, 2), Some(&cross))
            .unwrap();
        let mass = layer0_key_mass(&dec);

        let pair = Tensor::new(&[[1u32], [2]], &Device::Cpu).unwrap();
        let err = dec
            .forward(StageInput::Tokens(&pair), &arange(2, 3), Some(&CrossInput::default()))
            .unwrap_err();
        assert!(err.is_shape());
        assert_eq!(layer0_key_mass(&dec), mass);
    }

    #[test]
    fn growing_caches_drops_encoder_states() {
        let varmap = VarMap::new();
        let mut dec = fused_decoder(&varmap);
        dec.setup_caches(1, 8).unwrap();
        let states = Tensor::randn(0.0f32, 1.0, &[1, 4, 32], &Device::Cpu).unwrap();
        let cross = CrossInput { states: Some(&states), mask: None };
        dec.forward(StageInput::Tokens(&tokens(&[3, 4])), &arange(0, 2), Some(&cross))
            .unwrap();
        assert!(any_encoder_kv(&dec));

        dec.setup_caches(1, 4).unwrap();
        assert!(any_encoder_kv(&dec));

        dec.setup_caches(2, 32).unwrap();
        assert!(!any_encoder_kv(&dec));
        assert_eq!(dec.state(), ModelState::Ready);
    }

    #[test]
    fn unbatched_tokens_match_batch_of_one() {
        let varmap = VarMap::new();
        let mut dec = decoder(&small_config(), &varmap);
        dec.setup_caches(1, 8).unwrap();
        let flat = Tensor::new(&[7u32, 1, 9], &Device::Cpu).unwrap();
        let unbatched = dec
            .forward(StageInput::Tokens(&flat), &arange(0, 3), None)
            .unwrap();
        assert_eq!(unbatched.dims(), &[1, 3, 50]);

        dec.reset_caches().unwrap();
        let batched = dec
            .forward(StageInput::Tokens(&tokens(&[7, 1, 9])), &arange(0, 3), None)
            .unwrap();
        let diff: f32 = (unbatched - batched).unwrap().abs().unwrap().max_all().unwrap().to_scalar().unwrap();
        assert_eq!(diff, 0.0);

        let cube = Tensor::zeros(&[1, 1, 3], DType::U32, &Device::Cpu).unwrap();
        let err = dec
            .forward(StageInput::Tokens(&cube), &arange(0, 3), None)
            .unwrap_err();
        assert!(err.is_shape());
    }
}
