//! Rotary Position Embeddings (RoPE).
//!
//! RoPE encodes position information by rotating query and key vectors
//! in the complex plane. The table is materialized once per cache setup and
//! rows are gathered at absolute positions on every forward call.
//!
//! Two layouts are supported:
//! - [`RopeConvention::Native`]: channels `(2i, 2i+1)` form a pair, the table
//!   holds `(cos, sin)` per pair, shape `[L, head_dim / 2, 2]`.
//! - [`RopeConvention::CrossCompatible`]: the first and second halves of the
//!   head form the pairs (`rotate_half`), the table holds `(cos, sin)` per
//!   channel, shape `[L, head_dim, 2]`.
//!
//! # Reference
//!
//! [RoFormer: Enhanced Transformer with Rotary Position Embedding](https://arxiv.org/abs/2104.09864)

use crate::error::{Result, TesseraError};
use crate::model::config::RopeScaling;
use candle_core::{DType, Device, Tensor};
use std::f64::consts::PI;

/// Channel pairing used by a rotary table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RopeConvention {
    /// Adjacent channels are rotated together.
    Native,
    /// Channel `i` is rotated with channel `i + head_dim / 2`.
    CrossCompatible,
}

/// Inverse frequencies `1 / base^(2i / head_dim)` for `i` in `[0, head_dim / 2)`.
pub fn base_frequencies(head_dim: usize, base: f64) -> Vec<f64> {
    (0..head_dim / 2)
        .map(|i| 1.0 / base.powf(2.0 * i as f64 / head_dim as f64))
        .collect()
}

/// Rescale a single frequency for long-context extension.
///
/// High frequencies (short wavelengths) are kept, low frequencies are
/// divided by `factor`, and the band in between is interpolated smoothly.
pub fn scale_frequency(freq: f64, scaling: &RopeScaling) -> f64 {
    let old_context = scaling.original_max_position_embeddings;
    let low_freq_wavelen = old_context / scaling.low_freq_factor;
    let high_freq_wavelen = old_context / scaling.high_freq_factor;
    let wavelen = 2.0 * PI / freq;

    if wavelen < high_freq_wavelen {
        freq
    } else if wavelen > low_freq_wavelen {
        freq / scaling.factor
    } else {
        let smooth = (old_context / wavelen - scaling.low_freq_factor)
            / (scaling.high_freq_factor - scaling.low_freq_factor);
        (1.0 - smooth) * freq / scaling.factor + smooth * freq
    }
}

/// Base frequencies with optional scaling applied.
pub fn frequencies(head_dim: usize, base: f64, scaling: Option<&RopeScaling>) -> Vec<f64> {
    let freqs = base_frequencies(head_dim, base);
    match scaling {
        Some(scaling) => freqs.into_iter().map(|f| scale_frequency(f, scaling)).collect(),
        None => freqs,
    }
}

/// Precomputed rotary table.
#[derive(Debug, Clone)]
pub struct RotaryTable {
    /// `[max_len, head_dim / 2, 2]` or `[max_len, head_dim, 2]`, f32.
    table: Tensor,
    convention: RopeConvention,
    head_dim: usize,
    max_len: usize,
}

impl RotaryTable {
    /// Build a table covering positions `0..max_len`.
    ///
    /// # Arguments
    ///
    /// * `head_dim` - Dimension of each attention head (must be even)
    /// * `max_len` - Number of positions to materialize
    /// * `base` - Base frequency (10000.0 for Llama-2, 500000.0 for Llama-3)
    /// * `scaling` - Optional Llama 3.1 frequency scaling
    /// * `convention` - Channel pairing layout
    /// * `device` - Device for the table
    pub fn new(
        head_dim: usize,
        max_len: usize,
        base: f64,
        scaling: Option<&RopeScaling>,
        convention: RopeConvention,
        device: &Device,
    ) -> Result<Self> {
        if head_dim == 0 || head_dim % 2 != 0 {
            return Err(TesseraError::ConfigError(format!(
                "rotary head_dim must be even and positive, got {head_dim}"
            )));
        }
        let freqs = frequencies(head_dim, base, scaling);
        let half = head_dim / 2;

        let table = match convention {
            RopeConvention::Native => {
                let mut data = Vec::with_capacity(max_len * half * 2);
                for pos in 0..max_len {
                    for freq in &freqs {
                        let angle = pos as f64 * freq;
                        data.push(angle.cos() as f32);
                        data.push(angle.sin() as f32);
                    }
                }
                Tensor::from_vec(data, (max_len, half, 2), device)?
            }
            RopeConvention::CrossCompatible => {
                let mut data = Vec::with_capacity(max_len * head_dim * 2);
                for pos in 0..max_len {
                    // cat(freqs, freqs)
                    for freq in freqs.iter().chain(freqs.iter()) {
                        let angle = pos as f64 * freq;
                        data.push(angle.cos() as f32);
                        data.push(angle.sin() as f32);
                    }
                }
                Tensor::from_vec(data, (max_len, head_dim, 2), device)?
            }
        };

        Ok(Self {
            table,
            convention,
            head_dim,
            max_len,
        })
    }

    /// Gather table rows at absolute positions (`u32`, shape `[S]`).
    pub fn select(&self, positions: &Tensor) -> Result<Tensor> {
        Ok(self.table.index_select(positions, 0)?)
    }

    /// Rotate `x` (`[batch, seq, heads, head_dim]`) by rows from [`select`](Self::select).
    pub fn apply(&self, x: &Tensor, rows: &Tensor) -> Result<Tensor> {
        apply_rotary(x, rows, self.convention)
    }

    /// Number of positions in the table.
    pub fn max_len(&self) -> usize {
        self.max_len
    }

    /// Get the head dimension.
    pub fn head_dim(&self) -> usize {
        self.head_dim
    }

    /// Get the channel layout.
    pub fn convention(&self) -> RopeConvention {
        self.convention
    }

    /// The raw table.
    pub fn table(&self) -> &Tensor {
        &self.table
    }
}

/// Apply a rotation to `x` (`[batch, seq, heads, head_dim]`) using table rows
/// for its `seq` positions. Computed in f32, returned in the input dtype.
pub fn apply_rotary(x: &Tensor, rows: &Tensor, convention: RopeConvention) -> Result<Tensor> {
    let (batch, seq_len, heads, head_dim) = x.dims4()?;
    if rows.dim(0)? != seq_len {
        return Err(TesseraError::ShapeError(format!(
            "rotary rows cover {} positions, input has {}",
            rows.dim(0)?,
            seq_len
        )));
    }
    let dtype = x.dtype();
    let x = x.to_dtype(DType::F32)?;
    let half = head_dim / 2;

    let out = match convention {
        RopeConvention::Native => {
            // [b, s, h, d/2, 2]
            let xs = x.reshape((batch, seq_len, heads, half, 2))?;
            let x0 = xs.narrow(4, 0, 1)?;
            let x1 = xs.narrow(4, 1, 1)?;

            let rows = rows.reshape((1, seq_len, 1, half, 2))?;
            let cos = rows.narrow(4, 0, 1)?;
            let sin = rows.narrow(4, 1, 1)?;

            let out0 = (x0.broadcast_mul(&cos)? - x1.broadcast_mul(&sin)?)?;
            let out1 = (x1.broadcast_mul(&cos)? + x0.broadcast_mul(&sin)?)?;
            Tensor::cat(&[out0, out1], 4)?.reshape((batch, seq_len, heads, head_dim))?
        }
        RopeConvention::CrossCompatible => {
            let rows = rows.reshape((1, seq_len, 1, head_dim, 2))?;
            let cos = rows.narrow(4, 0, 1)?.squeeze(4)?;
            let sin = rows.narrow(4, 1, 1)?.squeeze(4)?;

            let rotated = rotate_half(&x)?;
            (x.broadcast_mul(&cos)? + rotated.broadcast_mul(&sin)?)?
        }
    };

    Ok(out.to_dtype(dtype)?)
}

/// `[x1, x2] -> [-x2, x1]` over the last dimension.
fn rotate_half(x: &Tensor) -> Result<Tensor> {
    let last = x.rank() - 1;
    let half = x.dim(last)? / 2;
    let x1 = x.narrow(last, 0, half)?;
    let x2 = x.narrow(last, half, half)?;
    Ok(Tensor::cat(&[&x2.neg()?, &x1], last)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn positions(values: &[u32]) -> Tensor {
        Tensor::new(values, &Device::Cpu).unwrap()
    }

    #[test]
    fn table_shapes() {
        let native =
            RotaryTable::new(64, 128, 10000.0, None, RopeConvention::Native, &Device::Cpu)
                .unwrap();
        assert_eq!(native.table().dims(), &[128, 32, 2]);

        let hf = RotaryTable::new(
            64,
            128,
            10000.0,
            None,
            RopeConvention::CrossCompatible,
            &Device::Cpu,
        )
        .unwrap();
        assert_eq!(hf.table().dims(), &[128, 64, 2]);
    }

    #[test]
    fn odd_head_dim_rejected() {
        let err = RotaryTable::new(7, 16, 10000.0, None, RopeConvention::Native, &Device::Cpu)
            .unwrap_err();
        assert!(err.is_config());
    }

    #[test]
    fn position_zero_is_identity() {
        for convention in [RopeConvention::Native, RopeConvention::CrossCompatible] {
            let rope = RotaryTable::new(32, 16, 10000.0, None, convention, &Device::Cpu).unwrap();
            let x = Tensor::randn(0.0f32, 1.0, &[1, 1, 4, 32], &Device::Cpu).unwrap();
            let rows = rope.select(&positions(&[0])).unwrap();
            let out = rope.apply(&x, &rows).unwrap();

            let diff: f32 = (out - &x)
                .unwrap()
                .abs()
                .unwrap()
                .max_all()
                .unwrap()
                .to_scalar()
                .unwrap();
            assert!(diff < 1e-6, "{convention:?}: {diff}");
        }
    }

    #[test]
    fn scores_depend_on_relative_position() {
        let rope =
            RotaryTable::new(16, 64, 10000.0, None, RopeConvention::Native, &Device::Cpu).unwrap();
        let q = Tensor::randn(0.0f32, 1.0, &[1, 1, 1, 16], &Device::Cpu).unwrap();
        let k = Tensor::randn(0.0f32, 1.0, &[1, 1, 1, 16], &Device::Cpu).unwrap();

        let score = |qp: u32, kp: u32| -> f32 {
            let q = rope.apply(&q, &rope.select(&positions(&[qp])).unwrap()).unwrap();
            let k = rope.apply(&k, &rope.select(&positions(&[kp])).unwrap()).unwrap();
            (q * k).unwrap().sum_all().unwrap().to_scalar().unwrap()
        };

        assert!((score(5, 2) - score(13, 10)).abs() < 1e-4);
    }

    #[test]
    fn apply_preserves_shape_and_dtype() {
        let rope =
            RotaryTable::new(64, 256, 500000.0, None, RopeConvention::Native, &Device::Cpu)
                .unwrap();
        let x = Tensor::randn(0.0f32, 1.0, &[2, 3, 8, 64], &Device::Cpu)
            .unwrap()
            .to_dtype(DType::BF16)
            .unwrap();
        let rows = rope.select(&positions(&[7, 8, 9])).unwrap();
        let out = rope.apply(&x, &rows).unwrap();
        assert_eq!(out.dims(), &[2, 3, 8, 64]);
        assert_eq!(out.dtype(), DType::BF16);
    }

    #[test]
    fn row_count_mismatch_is_shape_error() {
        let rope =
            RotaryTable::new(16, 32, 10000.0, None, RopeConvention::Native, &Device::Cpu).unwrap();
        let x = Tensor::randn(0.0f32, 1.0, &[1, 3, 2, 16], &Device::Cpu).unwrap();
        let rows = rope.select(&positions(&[0, 1])).unwrap();
        assert!(rope.apply(&x, &rows).unwrap_err().is_shape());
    }

    #[test]
    fn scaling_bands() {
        let scaling = RopeScaling::llama3_1(8.0);
        // wavelen = 2π: far below the high-frequency threshold
        assert_eq!(scale_frequency(1.0, &scaling), 1.0);
        // wavelen = 2π * 1e5: far above the low-frequency threshold
        let low = 1e-5;
        assert!((scale_frequency(low, &scaling) - low / 8.0).abs() < 1e-15);
    }

    #[test]
    fn scaling_is_continuous_at_thresholds() {
        let scaling = RopeScaling::llama3_1(8.0);
        let old = scaling.original_max_position_embeddings;
        let freq_at = |wavelen: f64| 2.0 * PI / wavelen;

        for threshold in [old / scaling.high_freq_factor, old / scaling.low_freq_factor] {
            let below = scale_frequency(freq_at(threshold * (1.0 - 1e-9)), &scaling);
            let at = scale_frequency(freq_at(threshold), &scaling);
            let above = scale_frequency(freq_at(threshold * (1.0 + 1e-9)), &scaling);

            let tol = at.abs() * 1e-6;
            assert!((below - at).abs() < tol, "discontinuity below {threshold}");
            assert!((above - at).abs() < tol, "discontinuity above {threshold}");
        }
    }

    #[test]
    fn scaled_table_differs_only_in_low_frequencies() {
        let scaling = RopeScaling::llama3_1(8.0);
        let plain = frequencies(128, 500000.0, None);
        let scaled = frequencies(128, 500000.0, Some(&scaling));
        assert_eq!(plain[0], scaled[0]);
        assert!(scaled[63] < plain[63]);
    }
}
