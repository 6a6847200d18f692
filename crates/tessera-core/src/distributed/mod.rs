//! Tensor-parallel execution.
//!
//! Parameters are split across participants with [`shard_params`] before
//! module construction; modules then exchange activations through a
//! [`Collective`] held by a shared [`ShardContext`].
//!
//! - `wq`, `wk`, `wv`, `w1`, `w3` and the output head are column-sharded
//! - `wo` and `w2` are row-sharded and followed by a reduction
//! - everything else (embeddings, norms, encoders, projectors) is replicated

mod collective;
mod shard;

pub use collective::{Collective, LocalCollective, LocalGroup, SingleProcess};
pub use shard::{shard_params, strategy_for_param, ParallelStyle, ShardContext, ShardStrategy};
