//! Root Mean Square Layer Normalization.
//!
//! RMSNorm is a simpler alternative to LayerNorm that only
//! normalizes by the root mean square, without centering.
//!
//! # Formula
//!
//! `RMSNorm(x) = x * weight / sqrt(mean(x^2) + eps)`
//!
//! The normalization runs in f32 and is cast back before scaling.
//!
//! # Reference
//!
//! [Root Mean Square Layer Normalization](https://arxiv.org/abs/1910.07467)

use crate::error::Result;
use candle_core::{DType, Device, Tensor, D};
use candle_nn::{Init, VarBuilder};

/// RMS Layer Normalization.
#[derive(Debug, Clone)]
pub struct RmsNorm {
    /// Learnable scale parameter.
    weight: Tensor,
    /// Small constant for numerical stability.
    eps: f64,
}

impl RmsNorm {
    /// Create a new RMSNorm layer with given weight.
    pub fn new(weight: Tensor, eps: f64) -> Self {
        Self { weight, eps }
    }

    /// Load `weight` from `vb` (initialized to ones when generated).
    pub fn load(size: usize, eps: f64, vb: VarBuilder) -> Result<Self> {
        let weight = vb.get_with_hints(size, "weight", Init::Const(1.0))?;
        Ok(Self::new(weight, eps))
    }

    /// Create a new RMSNorm layer with ones (for testing).
    pub fn ones(size: usize, eps: f64, device: &Device) -> Result<Self> {
        Ok(Self::new(Tensor::ones(size, DType::F32, device)?, eps))
    }

    /// Forward pass over the last dimension.
    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let dtype = x.dtype();
        let xf = x.to_dtype(DType::F32)?;
        let mean_sq = xf.sqr()?.mean_keepdim(D::Minus1)?;
        let rsqrt = (mean_sq + self.eps)?.sqrt()?.recip()?;
        let normalized = xf.broadcast_mul(&rsqrt)?.to_dtype(dtype)?;
        Ok(normalized.broadcast_mul(&self.weight.to_dtype(dtype)?)?)
    }

    /// Normalized width.
    pub fn size(&self) -> usize {
        self.weight.dims()[0]
    }

    /// Get epsilon value.
    pub fn eps(&self) -> f64 {
        self.eps
    }

    /// Get the weight tensor.
    pub fn weight(&self) -> &Tensor {
        &self.weight
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rmsnorm_forward_3d() {
        let norm = RmsNorm::ones(64, 1e-5, &Device::Cpu).unwrap();
        let x = Tensor::randn(0.0f32, 1.0, &[2, 16, 64], &Device::Cpu).unwrap();
        let output = norm.forward(&x).unwrap();
        assert_eq!(output.dims(), x.dims());
    }

    #[test]
    fn rmsnorm_normalized_magnitude() {
        let norm = RmsNorm::ones(64, 1e-5, &Device::Cpu).unwrap();

        // All values = 2.0, so RMS = 2.0 and output ~ 1.0
        let x = (Tensor::ones(&[1, 64], DType::F32, &Device::Cpu).unwrap() * 2.0).unwrap();
        let output = norm.forward(&x).unwrap();

        let output_vec: Vec<f32> = output.flatten_all().unwrap().to_vec1().unwrap();
        for val in output_vec {
            assert!((val - 1.0).abs() < 1e-4, "Expected ~1.0, got {}", val);
        }
    }

    #[test]
    fn rmsnorm_keeps_input_dtype() {
        let norm = RmsNorm::ones(32, 1e-5, &Device::Cpu).unwrap();
        let x = Tensor::randn(0.0f32, 1.0, &[1, 4, 32], &Device::Cpu)
            .unwrap()
            .to_dtype(DType::BF16)
            .unwrap();
        assert_eq!(norm.forward(&x).unwrap().dtype(), DType::BF16);
    }

    #[test]
    fn rmsnorm_loads_ones_from_varmap() {
        let varmap = candle_nn::VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let norm = RmsNorm::load(16, 1e-6, vb.pp("norm")).unwrap();
        assert_eq!(norm.size(), 16);
        let total: f32 = norm.weight().sum_all().unwrap().to_scalar().unwrap();
        assert_eq!(total, 16.0);
    }
}
