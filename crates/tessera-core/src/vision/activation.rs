use crate::error::{Result, TesseraError};
use candle_core::Tensor;
use candle_nn::ops::silu;
use std::str::FromStr;

/// Encoder MLP activation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Activation {
    /// Erf-based GELU.
    #[default]
    Gelu,
    /// `x * sigmoid(1.702 * x)`.
    QuickGelu,
    /// `x * sigmoid(x)`.
    Silu,
}

impl Activation {
    /// Apply to `x`.
    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let y = match self {
            Activation::Gelu => x.gelu_erf()?,
            Activation::QuickGelu => (x * candle_nn::ops::sigmoid(&(x * 1.702)?)?)?,
            Activation::Silu => silu(x)?,
        };
        Ok(y)
    }
}

impl FromStr for Activation {
    type Err = TesseraError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "gelu" | "GELU" | "GELU()" => Ok(Activation::Gelu),
            // Checkpoint configs sometimes carry the module repr.
            "quick_gelu" | "QuickGELUActivation()" => Ok(Activation::QuickGelu),
            "silu" | "SiLU()" => Ok(Activation::Silu),
            other => Err(TesseraError::ConfigError(format!(
                "unknown activation {other:?}"
            ))),
        }
    }
}
