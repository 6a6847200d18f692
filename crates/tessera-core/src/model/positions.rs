//! Absolute token positions for one forward call.

use crate::error::{Result, TesseraError};
use candle_core::{DType, Device, Tensor};

/// A run of consecutive positions inside a [`Positions`] list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PositionRun {
    /// Index of the first token of the run in the incoming sequence.
    pub offset: usize,
    /// First absolute position written by the run.
    pub start: usize,
    /// Number of tokens in the run.
    pub len: usize,
}

/// Positions as both a `u32` index tensor and host values.
#[derive(Debug, Clone)]
pub struct Positions {
    tensor: Tensor,
    values: Vec<usize>,
}

impl Positions {
    /// Read positions from a rank-1 integer tensor.
    pub fn new(input_pos: &Tensor) -> Result<Self> {
        if input_pos.rank() != 1 {
            return Err(TesseraError::ShapeError(format!(
                "input_pos must be rank 1, got shape {:?}",
                input_pos.dims()
            )));
        }
        let values: Vec<usize> = match input_pos.dtype() {
            DType::U32 => input_pos
                .to_vec1::<u32>()?
                .into_iter()
                .map(|p| p as usize)
                .collect(),
            DType::U8 => input_pos
                .to_vec1::<u8>()?
                .into_iter()
                .map(|p| p as usize)
                .collect(),
            DType::I64 => {
                let raw = input_pos.to_vec1::<i64>()?;
                if let Some(neg) = raw.iter().find(|p| **p < 0) {
                    return Err(TesseraError::ShapeError(format!(
                        "negative position {neg} in input_pos"
                    )));
                }
                raw.into_iter().map(|p| p as usize).collect()
            }
            other => {
                return Err(TesseraError::ShapeError(format!(
                    "input_pos must be an integer tensor, got {other:?}"
                )))
            }
        };
        Self::from_values(values, input_pos.device())
    }

    /// Positions `start..start + len`.
    pub fn range(start: usize, len: usize, device: &Device) -> Result<Self> {
        Self::from_values((start..start + len).collect(), device)
    }

    /// Positions from host values.
    pub fn from_values(values: Vec<usize>, device: &Device) -> Result<Self> {
        let as_u32: Vec<u32> = values.iter().map(|p| *p as u32).collect();
        let tensor = Tensor::from_vec(as_u32, values.len(), device)?;
        Ok(Self { tensor, values })
    }

    /// Number of positions.
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// Whether there are no positions.
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Index tensor (`u32`, shape `[len]`).
    pub fn tensor(&self) -> &Tensor {
        &self.tensor
    }

    /// Host values.
    pub fn values(&self) -> &[usize] {
        &self.values
    }

    /// Largest position, if any.
    pub fn max(&self) -> Option<usize> {
        self.values.iter().copied().max()
    }

    /// Fail with a shape error unless every position is below `limit`.
    pub fn check_below(&self, limit: usize, what: &str) -> Result<()> {
        match self.values.iter().find(|p| **p >= limit) {
            Some(p) => Err(TesseraError::ShapeError(format!(
                "position {p} out of range for {what} of length {limit}"
            ))),
            None => Ok(()),
        }
    }

    /// Split into maximal runs of consecutive ascending positions.
    pub fn runs(&self) -> Vec<PositionRun> {
        let mut runs: Vec<PositionRun> = Vec::new();
        for (offset, &pos) in self.values.iter().enumerate() {
            match runs.last_mut() {
                Some(run) if run.start + run.len == pos => run.len += 1,
                _ => runs.push(PositionRun {
                    offset,
                    start: pos,
                    len: 1,
                }),
            }
        }
        runs
    }
}
