//! Causal self-attention with a KV cache, rotary embeddings and GQA.

use super::kv_cache::KvCache;
use super::rope::{apply_rotary, RopeConvention};
use super::{StepContext, TransformerConfig};
use crate::distributed::ShardContext;
use crate::error::{Result, TesseraError};
use candle_core::{DType, Module, Tensor};
use candle_nn::{linear_no_bias, Linear, VarBuilder};
use tracing::trace;

/// Self-attention module for decoder layers.
#[derive(Debug, Clone)]
pub struct Attention {
    /// Query projection: dim -> n_heads * head_dim
    wq: Linear,
    /// Key projection: dim -> n_local_heads * head_dim
    wk: Linear,
    /// Value projection: dim -> n_local_heads * head_dim
    wv: Linear,
    /// Output projection: n_heads * head_dim -> dim
    wo: Linear,
    /// Query heads held by this participant.
    n_heads: usize,
    /// Key/value heads held by this participant.
    n_local_heads: usize,
    head_dim: usize,
    rope: RopeConvention,
    kv_cache: Option<KvCache>,
    shard: Option<ShardContext>,
}

impl Attention {
    /// Load projections from `vb`. With a shard context, heads are split
    /// evenly between participants.
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
        let wq = linear_no_bias(config.dim, n_heads * head_dim, vb.pp("wq"))?;
        let wk = linear_no_bias(config.dim, n_local_heads * head_dim, vb.pp("wk"))?;
        let wv = linear_no_bias(config.dim, n_local_heads * head_dim, vb.pp("wv"))?;
        let wo = linear_no_bias(n_heads * head_dim, config.dim, vb.pp("wo"))?;
        Self::from_linears(wq, wk, wv, wo, head_dim, config.rope_convention(), shard)
    }

    /// Build from projections. Head counts are inferred from the projection
    /// output widths.
    pub fn from_linears(
        wq: Linear,
        wk: Linear,
        wv: Linear,
        wo: Linear,
        head_dim: usize,
        rope: RopeConvention,
        shard: Option<&ShardContext>,
    ) -> Result<Self> {
        let q_width = wq.weight().dim(0)?;
        let kv_width = wk.weight().dim(0)?;
        if q_width % head_dim != 0 || kv_width % head_dim != 0 {
            return Err(TesseraError::ShapeError(format!(
                "projection widths {q_width}/{kv_width} are not multiples of head_dim {head_dim}"
            )));
        }
        if wv.weight().dims() != wk.weight().dims() {
            return Err(TesseraError::ShapeError(format!(
                "wk {:?} and wv {:?} differ",
                wk.weight().dims(),
                wv.weight().dims()
            )));
        }
        if wo.weight().dim(1)? != q_width {
            return Err(TesseraError::ShapeError(format!(
                "wo expects {} inputs, attention produces {}",
                wo.weight().dim(1)?,
                q_width
            )));
        }
        let n_heads = q_width / head_dim;
        let n_local_heads = kv_width / head_dim;
        if n_local_heads == 0 || n_heads % n_local_heads != 0 {
            return Err(TesseraError::ShapeError(format!(
                "{n_heads} query heads cannot share {n_local_heads} key/value heads"
            )));
        }

        Ok(Self {
            wq,
            wk,
            wv,
            wo,
            n_heads,
            n_local_heads,
            head_dim,
            rope,
            kv_cache: None,
            shard: shard.cloned(),
        })
    }

    /// Make sure the cache holds at least `max_batch` x `max_seq_len`.
    ///
    /// A cache that already covers the request is kept as is. Otherwise a
    /// new zeroed cache is allocated at the element-wise maximum of the old
    /// and requested sizes.
    pub fn setup_cache(&mut self, max_batch: usize, max_seq_len: usize) -> Result<()> {
        let (batch, seq) = match &self.kv_cache {
            Some(cache) if cache.covers(max_batch, max_seq_len) => return Ok(()),
            Some(cache) => (
                cache.max_batch().max(max_batch),
                cache.max_seq_len().max(max_seq_len),
            ),
            None => (max_batch, max_seq_len),
        };
        let weight = self.wk.weight();
        trace!(batch, seq, heads = self.n_local_heads, "allocating kv cache");
        self.kv_cache = Some(KvCache::new(
            batch,
            seq,
            self.n_local_heads,
            self.head_dim,
            weight.dtype(),
            weight.device(),
        )?);
        Ok(())
    }

    /// Zero the cache contents.
    pub fn reset_cache(&mut self) -> Result<()> {
        match &mut self.kv_cache {
            Some(cache) => cache.reset(),
            None => Ok(()),
        }
    }

    /// Forward pass over `[batch, seq, dim]`.
    pub fn forward(&mut self, x: &Tensor, ctx: &StepContext<'_>) -> Result<Tensor> {
        let x = match &self.shard {
            Some(shard) => shard.enter(x, ctx.sequence_sharded)?,
            None => x.clone(),
        };
        let (batch, seq_len, _) = x.dims3()?;

        let q = self
            .wq
            .forward(&x)?
            .reshape((batch, seq_len, self.n_heads, self.head_dim))?;
        let k = self
            .wk
            .forward(&x)?
            .reshape((batch, seq_len, self.n_local_heads, self.head_dim))?;
        let v = self
            .wv
            .forward(&x)?
            .reshape((batch, seq_len, self.n_local_heads, self.head_dim))?;

        let (q, k) = match ctx.rotary_rows {
            Some(rows) => (
                apply_rotary(&q, rows, self.rope)?,
                apply_rotary(&k, rows, self.rope)?,
            ),
            None => (q, k),
        };

        // [batch, heads, seq, head_dim]
        let q = q.transpose(1, 2)?.contiguous()?;
        let k = k.transpose(1, 2)?.contiguous()?;
        let v = v.transpose(1, 2)?.contiguous()?;

        let (k, v) = match &mut self.kv_cache {
            Some(cache) => cache.update(ctx.positions, &k, &v)?,
            None => (k, v),
        };

        let n_rep = self.n_heads / self.n_local_heads;
        let k = repeat_kv(&k, n_rep)?;
        let v = repeat_kv(&v, n_rep)?;

        let scale = 1.0 / (self.head_dim as f64).sqrt();
        let y = scaled_dot_product_attention(&q, &k, &v, ctx.mask, scale)?;
        let y = y
            .transpose(1, 2)?
            .reshape((batch, seq_len, self.n_heads * self.head_dim))?;
        let y = self.wo.forward(&y)?;

        match &self.shard {
            Some(shard) => shard.reduce(&y, ctx.sequence_sharded),
            None => Ok(y),
        }
    }

    /// The cache, once set up.
    pub fn cache(&self) -> Option<&KvCache> {
        self.kv_cache.as_ref()
    }

    /// Get the number of query heads held locally.
    pub fn num_heads(&self) -> usize {
        self.n_heads
    }

    /// Get the number of key/value heads held locally.
    pub fn num_kv_heads(&self) -> usize {
        self.n_local_heads
    }

    /// Get the head dimension.
    pub fn head_dim(&self) -> usize {
        self.head_dim
    }
}

/// Repeat each key/value head `n_rep` times consecutively
/// (`[b, h, s, d] -> [b, h * n_rep, s, d]`).
pub fn repeat_kv(x: &Tensor, n_rep: usize) -> Result<Tensor> {
    if n_rep == 1 {
        return Ok(x.clone());
    }
    let (batch, num_kv_heads, seq_len, head_dim) = x.dims4()?;

    // [b, h, s, d] -> [b, h, 1, s, d] -> [b, h, n_rep, s, d] -> [b, h * n_rep, s, d]
    let x = x
        .unsqueeze(2)?
        .expand((batch, num_kv_heads, n_rep, seq_len, head_dim))?
        .reshape((batch, num_kv_heads * n_rep, seq_len, head_dim))?;
    Ok(x)
}

/// Softmax attention computed in f32, returned in the query dtype.
///
/// `mask` is additive and must broadcast to `[batch, heads, q_len, k_len]`.
pub fn scaled_dot_product_attention(
    q: &Tensor,
    k: &Tensor,
    v: &Tensor,
    mask: Option<&Tensor>,
    scale: f64,
) -> Result<Tensor> {
    let dtype = q.dtype();
    let q = q.to_dtype(DType::F32)?.contiguous()?;
    let k = k.to_dtype(DType::F32)?;
    let v = v.to_dtype(DType::F32)?.contiguous()?;

    let k_len = k.dim(2)?;
    let scores = (q.matmul(&k.t()?.contiguous()?)? * scale)?;
    let scores = match mask {
        Some(mask) => {
            let mask_len = mask.dim(mask.rank() - 1)?;
            if mask_len != k_len {
                return Err(TesseraError::ShapeError(format!(
                    "mask covers {mask_len} keys, attention has {k_len}"
                )));
            }
            scores.broadcast_add(&mask.to_dtype(DType::F32)?)?
        }
        None => scores,
    };
    let weights = candle_nn::ops::softmax_last_dim(&scores)?;
    Ok(weights.matmul(&v)?.to_dtype(dtype)?)
}

/// Convert a boolean (`u8`, 1 = attend) mask into an additive f32 mask.
pub fn mask_to_bias(mask: &Tensor) -> Result<Tensor> {
    let zeros = Tensor::zeros(mask.shape(), DType::F32, mask.device())?;
    let neg_inf = Tensor::full(f32::NEG_INFINITY, mask.shape(), mask.device())?;
    Ok(mask.to_dtype(DType::U8)?.where_cond(&zeros, &neg_inf)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::positions::Positions;
    use crate::model::rope::RotaryTable;
    use candle_core::Device;
    use candle_nn::VarMap;

    fn config() -> TransformerConfig {
        TransformerConfig {
            dim: 64,
            n_heads: 8,
            n_local_heads: 2,
            head_dim: 8,
            hidden_dim: 128,
            n_layers: 1,
            vocab_size: 32,
            ..TransformerConfig::default()
        }
    }

    fn attention(config: &TransformerConfig) -> Attention {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        Attention::new(config, vb, None).unwrap()
    }

    #[test]
    fn heads_inferred_from_projections() {
        let attn = attention(&config());
        assert_eq!(attn.num_heads(), 8);
        assert_eq!(attn.num_kv_heads(), 2);
        assert_eq!(attn.head_dim(), 8);
    }

    #[test]
    fn repeat_kv_expansion() {
        // [batch=1, num_kv_heads=2, seq=4, head_dim=64]
        let x = Tensor::randn(0.0f32, 1.0, &[1, 2, 4, 64], &Device::Cpu).unwrap();
        let repeated = repeat_kv(&x, 4).unwrap();
        assert_eq!(repeated.dims(), &[1, 8, 4, 64]);

        // Heads 0..4 are copies of kv head 0, heads 4..8 of kv head 1.
        let src: Vec<Vec<Vec<f32>>> = x.squeeze(0).unwrap().to_vec3().unwrap();
        let out: Vec<Vec<Vec<f32>>> = repeated.squeeze(0).unwrap().to_vec3().unwrap();
        for head in 0..8 {
            assert_eq!(out[head], src[head / 4]);
        }
    }

    #[test]
    fn gqa_heads_sharing_kv_agree() {
        let dev = Device::Cpu;
        // One query vector replicated over 8 heads, 2 distinct kv heads.
        let q = Tensor::randn(0.0f32, 1.0, &[1, 1, 5, 16], &dev)
            .unwrap()
            .repeat((1, 8, 1, 1))
            .unwrap();
        let k = Tensor::randn(0.0f32, 1.0, &[1, 2, 5, 16], &dev).unwrap();
        let v = Tensor::randn(0.0f32, 1.0, &[1, 2, 5, 16], &dev).unwrap();

        let y = scaled_dot_product_attention(
            &q,
            &repeat_kv(&k, 4).unwrap(),
            &repeat_kv(&v, 4).unwrap(),
            None,
            0.25,
        )
        .unwrap();
        let heads: Vec<Vec<Vec<f32>>> = y.squeeze(0).unwrap().to_vec3().unwrap();

        for group in 0..2 {
            for head in group * 4..group * 4 + 4 {
                assert_eq!(heads[head], heads[group * 4]);
            }
        }
        assert_ne!(heads[0], heads[4]);
    }

    #[test]
    fn masked_keys_are_ignored() {
        let dev = Device::Cpu;
        let q = Tensor::randn(0.0f32, 1.0, &[1, 1, 1, 4], &dev).unwrap();
        let k = Tensor::randn(0.0f32, 1.0, &[1, 1, 3, 4], &dev).unwrap();
        let v = Tensor::randn(0.0f32, 1.0, &[1, 1, 3, 4], &dev).unwrap();
        let mask = mask_to_bias(&Tensor::new(&[[1u8, 0, 0]], &dev).unwrap()).unwrap();

        let y = scaled_dot_product_attention(&q, &k, &v, Some(&mask), 0.5).unwrap();
        let expected = v.narrow(2, 0, 1).unwrap();
        let diff: f32 = (y - expected).unwrap().abs().unwrap().max_all().unwrap().to_scalar().unwrap();
        assert!(diff < 1e-6);
    }

    #[test]
    fn mask_width_mismatch_is_shape_error() {
        let dev = Device::Cpu;
        let q = Tensor::zeros(&[1, 1, 1, 4], DType::F32, &dev).unwrap();
        let k = Tensor::zeros(&[1, 1, 3, 4], DType::F32, &dev).unwrap();
        let mask = Tensor::zeros(&[1, 2], DType::F32, &dev).unwrap();
        let err = scaled_dot_product_attention(&q, &k, &k, Some(&mask), 1.0).unwrap_err();
        assert!(err.is_shape());
    }

    #[test]
    fn setup_cache_uses_local_kv_heads_and_grows() {
        let mut attn = attention(&config());
        attn.setup_cache(1, 16).unwrap();
        assert_eq!(attn.cache().unwrap().keys().dims(), &[1, 2, 16, 8]);

        // Covered request keeps the cache.
        attn.setup_cache(1, 8).unwrap();
        assert_eq!(attn.cache().unwrap().max_seq_len(), 16);

        // Growth takes the element-wise maximum.
        attn.setup_cache(2, 8).unwrap();
        let cache = attn.cache().unwrap();
        assert_eq!((cache.max_batch(), cache.max_seq_len()), (2, 16));
    }

    #[test]
    fn cached_forward_matches_full_recompute() {
        let config = config();
        let mut attn = attention(&config);
        attn.setup_cache(1, 8).unwrap();
        let dev = Device::Cpu;
        let rope = RotaryTable::new(8, 16, 10000.0, None, RopeConvention::Native, &dev).unwrap();
        let causal = {
            let rows: Vec<u8> = (0..8)
                .flat_map(|i| (0..8).map(move |j| u8::from(j <= i)))
                .collect();
            Tensor::from_vec(rows, (8, 8), &dev).unwrap()
        };
        let x = Tensor::randn(0.0f32, 1.0, &[1, 4, 64], &dev).unwrap();

        let run = |attn: &mut Attention, x: &Tensor, positions: Positions| -> Tensor {
            let rows = rope.select(positions.tensor()).unwrap();
            let mask = mask_to_bias(&causal.index_select(positions.tensor(), 0).unwrap()).unwrap();
            let ctx = StepContext {
                positions: &positions,
                rotary_rows: Some(&rows),
                mask: Some(&mask),
                sequence_sharded: false,
            };
            attn.forward(x, &ctx).unwrap()
        };

        let full = run(&mut attn, &x, Positions::range(0, 4, &dev).unwrap());
        attn.reset_cache().unwrap();
        run(&mut attn, &x.narrow(1, 0, 3).unwrap(), Positions::range(0, 3, &dev).unwrap());
        let last = run(&mut attn, &x.narrow(1, 3, 1).unwrap(), Positions::range(3, 1, &dev).unwrap());

        let diff: f32 = (full.narrow(1, 3, 1).unwrap() - last)
            .unwrap()
            .abs()
            .unwrap()
            .max_all()
            .unwrap()
            .to_scalar()
            .unwrap();
        assert!(diff < 1e-5, "diff {diff}");
    }
}
