//! Parameter partitioning and activation exchange for sharded modules.

use super::collective::Collective;
use crate::error::{Result, TesseraError};
use candle_core::Tensor;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

/// How a parameter is partitioned across participants.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShardStrategy {
    /// Split output features (dim 0 of the weight).
    Column,
    /// Split input features (dim 1 of the weight); outputs need a reduction.
    Row,
    /// Every participant holds the full tensor.
    Replicate,
}

/// Activation layout between sharded sub-blocks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ParallelStyle {
    /// Activations are replicated; row-sharded outputs are all-reduced.
    #[default]
    Tensor,
    /// Activations are chunked along the sequence axis between sub-blocks;
    /// row-sharded outputs are reduce-scattered.
    Sequence,
}

/// Strategy for a parameter, decided by the module that owns it.
pub fn strategy_for_param(name: &str) -> ShardStrategy {
    let mut parts = name.rsplit('.');
    match (parts.next(), parts.next()) {
        (Some("weight"), Some("wq" | "wk" | "wv" | "w1" | "w3" | "output")) => {
            ShardStrategy::Column
        }
        (Some("weight"), Some("wo" | "w2")) => ShardStrategy::Row,
        _ => ShardStrategy::Replicate,
    }
}

/// Keep `rank`'s slice of every sharded parameter.
pub fn shard_params(
    params: HashMap<String, Tensor>,
    rank: usize,
    world_size: usize,
) -> Result<HashMap<String, Tensor>> {
    if world_size <= 1 {
        return Ok(params);
    }
    if rank >= world_size {
        return Err(TesseraError::ConfigError(format!(
            "rank {rank} out of range for world size {world_size}"
        )));
    }

    let mut sharded = HashMap::with_capacity(params.len());
    for (name, tensor) in params {
        let dim = match strategy_for_param(&name) {
            ShardStrategy::Column => 0,
            ShardStrategy::Row => 1,
            ShardStrategy::Replicate => {
                sharded.insert(name, tensor);
                continue;
            }
        };
        let len = tensor.dim(dim)?;
        if len % world_size != 0 {
            return Err(TesseraError::ConfigError(format!(
                "{name}: dim {dim} of length {len} does not split over {world_size} participants"
            )));
        }
        let chunk = len / world_size;
        let local = tensor.narrow(dim, rank * chunk, chunk)?.contiguous()?;
        sharded.insert(name, local);
    }
    debug!(rank, world_size, "sharded parameters");
    Ok(sharded)
}

/// One participant's view of a sharded model.
#[derive(Debug, Clone)]
pub struct ShardContext {
    collective: Arc<dyn Collective>,
    style: ParallelStyle,
}

impl ShardContext {
    /// Create a context over `collective`.
    pub fn new(collective: Arc<dyn Collective>, style: ParallelStyle) -> Self {
        Self { collective, style }
    }

    /// This participant's index.
    pub fn rank(&self) -> usize {
        self.collective.rank()
    }

    /// Number of participants.
    pub fn world_size(&self) -> usize {
        self.collective.world_size()
    }

    /// Activation layout.
    pub fn style(&self) -> ParallelStyle {
        self.style
    }

    /// The underlying collective.
    pub fn collective(&self) -> &Arc<dyn Collective> {
        &self.collective
    }

    /// Per-participant share of `total`, which must divide evenly.
    pub fn local_size(&self, total: usize, what: &str) -> Result<usize> {
        let world = self.world_size();
        if total % world != 0 {
            return Err(TesseraError::ConfigError(format!(
                "{what} = {total} is not divisible by world size {world}"
            )));
        }
        Ok(total / world)
    }

    /// Whether a sequence of `seq_len` tokens is chunked between sub-blocks.
    ///
    /// Lengths that do not divide evenly stay replicated for that call.
    pub fn sequence_sharded(&self, seq_len: usize) -> bool {
        self.style == ParallelStyle::Sequence && seq_len % self.world_size() == 0
    }

    /// This participant's chunk of the sequence axis (dim 1).
    pub fn scatter_sequence(&self, x: &Tensor) -> Result<Tensor> {
        let chunk = self.local_size(x.dim(1)?, "sequence length")?;
        Ok(x.narrow(1, self.rank() * chunk, chunk)?)
    }

    /// Reassemble the sequence axis (dim 1) from every participant's chunk.
    pub fn gather_sequence(&self, x: &Tensor) -> Result<Tensor> {
        self.collective.all_gather(&x.contiguous()?, 1)
    }

    /// Gather the sequence when activations arrive chunked.
    pub fn enter(&self, x: &Tensor, sequence_sharded: bool) -> Result<Tensor> {
        if sequence_sharded {
            self.gather_sequence(x)
        } else {
            Ok(x.clone())
        }
    }

    /// Combine partial sums from a row-sharded projection.
    pub fn reduce(&self, x: &Tensor, sequence_sharded: bool) -> Result<Tensor> {
        if sequence_sharded {
            self.collective.reduce_scatter(x, 1)
        } else {
            self.collective.all_reduce_sum(x)
        }
    }

    /// Reassemble column-sharded features along the last axis.
    pub fn gather_features(&self, x: &Tensor) -> Result<Tensor> {
        let last = x.rank() - 1;
        self.collective.all_gather(&x.contiguous()?, last)
    }
}
