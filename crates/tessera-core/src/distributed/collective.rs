//! Collective operations between shard participants.

use crate::error::{Result, TesseraError};
use candle_core::Tensor;
use parking_lot::Mutex;
use std::fmt;
use std::sync::{Arc, Barrier};

/// Lockstep communication between the participants of one sharded model.
///
/// Every participant must issue the same sequence of calls.
pub trait Collective: Send + Sync + fmt::Debug {
    /// This participant's index.
    fn rank(&self) -> usize;

    /// Number of participants.
    fn world_size(&self) -> usize;

    /// Element-wise sum over all participants.
    fn all_reduce_sum(&self, x: &Tensor) -> Result<Tensor>;

    /// Concatenate every participant's tensor along `dim`, in rank order.
    fn all_gather(&self, x: &Tensor, dim: usize) -> Result<Tensor>;

    /// Sum over participants, then keep this rank's chunk of `dim`.
    fn reduce_scatter(&self, x: &Tensor, dim: usize) -> Result<Tensor> {
        let world = self.world_size();
        let summed = self.all_reduce_sum(x)?;
        let len = summed.dim(dim)?;
        if len % world != 0 {
            return Err(TesseraError::ShapeError(format!(
                "cannot scatter dim {dim} of length {len} over {world} participants"
            )));
        }
        let chunk = len / world;
        Ok(summed.narrow(dim, self.rank() * chunk, chunk)?)
    }
}

/// The trivial single-participant collective.
#[derive(Debug, Default, Clone, Copy)]
pub struct SingleProcess;

impl Collective for SingleProcess {
    fn rank(&self) -> usize {
        0
    }

    fn world_size(&self) -> usize {
        1
    }

    fn all_reduce_sum(&self, x: &Tensor) -> Result<Tensor> {
        Ok(x.clone())
    }

    fn all_gather(&self, x: &Tensor, _dim: usize) -> Result<Tensor> {
        Ok(x.clone())
    }
}

/// Shared exchange state for in-process participants running on threads.
#[derive(Debug)]
pub struct LocalGroup {
    world_size: usize,
    slots: Mutex<Vec<Option<Tensor>>>,
    barrier: Barrier,
}

impl LocalGroup {
    /// Create a group and one handle per participant.
    pub fn new(world_size: usize) -> Result<Vec<LocalCollective>> {
        if world_size == 0 {
            return Err(TesseraError::ConfigError(
                "world size must be positive".to_string(),
            ));
        }
        let group = Arc::new(Self {
            world_size,
            slots: Mutex::new(vec![None; world_size]),
            barrier: Barrier::new(world_size),
        });
        Ok((0..world_size)
            .map(|rank| LocalCollective {
                rank,
                group: group.clone(),
            })
            .collect())
    }

    /// Publish `x` for `rank` and collect every participant's tensor.
    fn exchange(&self, rank: usize, x: &Tensor) -> Result<Vec<Tensor>> {
        self.slots.lock()[rank] = Some(x.clone());
        self.barrier.wait();
        let gathered: Option<Vec<Tensor>> = self.slots.lock().iter().cloned().collect();
        // Nobody may overwrite a slot until everyone has read it.
        self.barrier.wait();
        gathered.ok_or_else(|| {
            TesseraError::StateError("collective exchange missing a participant".to_string())
        })
    }
}

/// One participant's handle into a [`LocalGroup`].
#[derive(Debug, Clone)]
pub struct LocalCollective {
    rank: usize,
    group: Arc<LocalGroup>,
}

impl Collective for LocalCollective {
    fn rank(&self) -> usize {
        self.rank
    }

    fn world_size(&self) -> usize {
        self.group.world_size
    }

    fn all_reduce_sum(&self, x: &Tensor) -> Result<Tensor> {
        let parts = self.group.exchange(self.rank, x)?;
        // Fixed rank order keeps every participant's result identical.
        let mut acc = parts[0].clone();
        for part in &parts[1..] {
            acc = (acc + part)?;
        }
        Ok(acc)
    }

    fn all_gather(&self, x: &Tensor, dim: usize) -> Result<Tensor> {
        let parts = self.group.exchange(self.rank, x)?;
        Ok(Tensor::cat(&parts, dim)?)
    }
}
