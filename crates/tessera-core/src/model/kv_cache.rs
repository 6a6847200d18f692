//! Fixed-capacity KV cache for one attention module.
//!
//! Keys and values live in zero-initialized buffers of shape
//! `[max_batch, n_heads, max_seq_len, head_dim]`. Each forward call writes
//! its keys/values at absolute positions and reads back the whole sequence
//! axis, so masked slots beyond the current context stay zero.

use super::positions::Positions;
use crate::error::{Result, TesseraError};
use candle_core::{DType, Device, Tensor};

/// KV cache for a single attention module.
#[derive(Debug, Clone)]
pub struct KvCache {
    /// Cached keys: [max_batch, n_heads, max_seq_len, head_dim]
    k_cache: Tensor,
    /// Cached values: [max_batch, n_heads, max_seq_len, head_dim]
    v_cache: Tensor,
    max_batch: usize,
    max_seq_len: usize,
    n_heads: usize,
    head_dim: usize,
}

impl KvCache {
    /// Allocate zeroed buffers.
    pub fn new(
        max_batch: usize,
        max_seq_len: usize,
        n_heads: usize,
        head_dim: usize,
        dtype: DType,
        device: &Device,
    ) -> Result<Self> {
        let shape = (max_batch, n_heads, max_seq_len, head_dim);
        Ok(Self {
            k_cache: Tensor::zeros(shape, dtype, device)?,
            v_cache: Tensor::zeros(shape, dtype, device)?,
            max_batch,
            max_seq_len,
            n_heads,
            head_dim,
        })
    }

    /// Whether the cache already holds `batch` rows of `seq_len` positions.
    pub fn covers(&self, batch: usize, seq_len: usize) -> bool {
        self.max_batch >= batch && self.max_seq_len >= seq_len
    }

    /// Write `k`/`v` (`[batch, n_heads, S, head_dim]`) at `positions` (length `S`)
    /// and return the full key/value history for the first `batch` rows.
    ///
    /// Everything is validated before any write happens.
    pub fn update(
        &mut self,
        positions: &Positions,
        k: &Tensor,
        v: &Tensor,
    ) -> Result<(Tensor, Tensor)> {
        if k.dims() != v.dims() {
            return Err(TesseraError::ShapeError(format!(
                "key shape {:?} does not match value shape {:?}",
                k.dims(),
                v.dims()
            )));
        }
        let (batch, heads, seq_len, head_dim) = k.dims4()?;
        if positions.len() != seq_len {
            return Err(TesseraError::ShapeError(format!(
                "{} positions for {} new keys",
                positions.len(),
                seq_len
            )));
        }
        if heads != self.n_heads || head_dim != self.head_dim {
            return Err(TesseraError::ShapeError(format!(
                "cache holds {} heads of width {}, got {} of width {}",
                self.n_heads, self.head_dim, heads, head_dim
            )));
        }
        if batch > self.max_batch {
            return Err(TesseraError::ShapeError(format!(
                "batch {} exceeds cache capacity {}",
                batch, self.max_batch
            )));
        }
        positions.check_below(self.max_seq_len, "kv cache")?;

        let k = k.to_dtype(self.k_cache.dtype())?;
        let v = v.to_dtype(self.v_cache.dtype())?;
        for run in positions.runs() {
            let ranges = [
                0..batch,
                0..heads,
                run.start..run.start + run.len,
                0..head_dim,
            ];
            let k_run = k.narrow(2, run.offset, run.len)?.contiguous()?;
            let v_run = v.narrow(2, run.offset, run.len)?.contiguous()?;
            self.k_cache = self.k_cache.slice_assign(&ranges, &k_run)?;
            self.v_cache = self.v_cache.slice_assign(&ranges, &v_run)?;
        }

        Ok((
            self.k_cache.narrow(0, 0, batch)?,
            self.v_cache.narrow(0, 0, batch)?,
        ))
    }

    /// Zero the buffers, keeping capacity.
    pub fn reset(&mut self) -> Result<()> {
        self.k_cache = self.k_cache.zeros_like()?;
        self.v_cache = self.v_cache.zeros_like()?;
        Ok(())
    }

    /// Cached keys.
    pub fn keys(&self) -> &Tensor {
        &self.k_cache
    }

    /// Cached values.
    pub fn values(&self) -> &Tensor {
        &self.v_cache
    }

    /// Batch capacity.
    pub fn max_batch(&self) -> usize {
        self.max_batch
    }

    /// Sequence capacity.
    pub fn max_seq_len(&self) -> usize {
        self.max_seq_len
    }

    /// Number of cached heads.
    pub fn n_heads(&self) -> usize {
        self.n_heads
    }

    /// Get the head dimension.
    pub fn head_dim(&self) -> usize {
        self.head_dim
    }
}
