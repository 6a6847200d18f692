//! Decoder configuration.
//!
//! [`TransformerConfig`] is resolved from one module's raw JSON parameters.
//! Missing keys take the Llama-2 style defaults, `rope_theta` and
//! `n_kv_heads` are accepted as aliases, and unknown keys are rejected.

use crate::error::{Result, TesseraError};
use crate::model::rope::RopeConvention;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::ops::Range;

/// Frequency-dependent rope scaling used by Llama 3.1.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RopeScaling {
    /// Divisor applied to low frequencies.
    pub factor: f64,
    /// Wavelength threshold (as a fraction of the original context) above
    /// which frequencies are fully scaled.
    pub low_freq_factor: f64,
    /// Wavelength threshold below which frequencies are left untouched.
    pub high_freq_factor: f64,
    /// Context length the base model was trained with.
    pub original_max_position_embeddings: f64,
}

impl RopeScaling {
    /// Keys that must be present in a `rope_scaling` mapping.
    pub const REQUIRED_KEYS: [&'static str; 4] = [
        "factor",
        "low_freq_factor",
        "high_freq_factor",
        "original_max_position_embeddings",
    ];

    /// Llama 3.1 scaling with the given factor.
    pub fn llama3_1(factor: f64) -> Self {
        Self {
            factor,
            low_freq_factor: 1.0,
            high_freq_factor: 4.0,
            original_max_position_embeddings: 8192.0,
        }
    }

    /// Parse from a JSON mapping. Extra keys (e.g. `rope_type`) are ignored.
    pub fn from_map(map: &Map<String, Value>) -> Result<Self> {
        let missing: Vec<&str> = Self::REQUIRED_KEYS
            .iter()
            .copied()
            .filter(|key| !map.contains_key(*key))
            .collect();
        if !missing.is_empty() {
            return Err(TesseraError::ConfigError(format!(
                "rope_scaling is missing required keys {:?}, expected all of {:?}",
                missing,
                Self::REQUIRED_KEYS
            )));
        }

        let number = |key: &str| -> Result<f64> {
            map.get(key).and_then(Value::as_f64).ok_or_else(|| {
                TesseraError::ConfigError(format!("rope_scaling.{key} must be a number"))
            })
        };

        let scaling = Self {
            factor: number("factor")?,
            low_freq_factor: number("low_freq_factor")?,
            high_freq_factor: number("high_freq_factor")?,
            original_max_position_embeddings: number("original_max_position_embeddings")?,
        };
        scaling.validate()?;
        Ok(scaling)
    }

    fn validate(&self) -> Result<()> {
        if self.factor <= 0.0 || self.low_freq_factor <= 0.0 || self.high_freq_factor <= 0.0 {
            return Err(TesseraError::ConfigError(format!(
                "rope_scaling factors must be positive: {self:?}"
            )));
        }
        if self.low_freq_factor == self.high_freq_factor {
            return Err(TesseraError::ConfigError(
                "rope_scaling low_freq_factor and high_freq_factor must differ".to_string(),
            ));
        }
        Ok(())
    }
}

/// `use_tiktoken` shows up both as a bool and as the string `"True"`.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum Flag {
    Bool(bool),
    Text(String),
}

impl Flag {
    fn value(&self) -> bool {
        match self {
            Flag::Bool(b) => *b,
            Flag::Text(s) => s == "True",
        }
    }
}

/// Raw decoder parameters as they appear in JSON.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct TransformerParams {
    block_size: Option<usize>,
    vocab_size: Option<usize>,
    n_layers: Option<usize>,
    n_heads: Option<usize>,
    dim: Option<usize>,
    hidden_dim: Option<usize>,
    #[serde(alias = "n_kv_heads")]
    n_local_heads: Option<i64>,
    // Always recomputed from dim / n_heads.
    #[allow(dead_code)]
    head_dim: Option<usize>,
    #[serde(alias = "rope_theta")]
    rope_base: Option<f64>,
    norm_eps: Option<f64>,
    multiple_of: Option<usize>,
    ffn_dim_multiplier: Option<f64>,
    use_tiktoken: Option<Flag>,
    max_seq_length: Option<usize>,
    rope_scaling: Option<Map<String, Value>>,
    use_hf_rope: Option<bool>,
    n_stages: Option<usize>,
    stage_idx: Option<usize>,
    fusion_interval: Option<usize>,
    num_special_tokens: Option<usize>,
}

/// Hyper-parameters of a decoder stack.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TransformerConfig {
    /// Rotary table length is derived from this (doubled).
    pub block_size: usize,
    /// Vocabulary size.
    pub vocab_size: usize,
    /// Total number of decoder layers across all stages.
    pub n_layers: usize,
    /// Number of query heads.
    pub n_heads: usize,
    /// Model width.
    pub dim: usize,
    /// Feed-forward inner width.
    pub hidden_dim: usize,
    /// Number of key/value heads (for GQA).
    pub n_local_heads: usize,
    /// Per-head width, always `dim / n_heads`.
    pub head_dim: usize,
    /// Rope base frequency.
    pub rope_base: f64,
    /// RMS norm epsilon.
    pub norm_eps: f64,
    /// Rounding multiple for the derived hidden width.
    pub multiple_of: usize,
    /// Optional multiplier for the derived hidden width.
    pub ffn_dim_multiplier: Option<f64>,
    /// Whether the model pairs with a tiktoken tokenizer.
    pub use_tiktoken: bool,
    /// Maximum supported sequence length.
    pub max_seq_length: usize,
    /// Optional Llama 3.1 rope scaling.
    pub rope_scaling: Option<RopeScaling>,
    /// Use the rotate-half rotary layout instead of interleaved pairs.
    pub use_hf_rope: bool,
    /// Number of pipeline stages.
    pub n_stages: usize,
    /// Index of the stage this config builds.
    pub stage_idx: usize,
    /// Insert a cross-attention layer before every n-th decoder layer.
    pub fusion_interval: Option<usize>,
    /// Extra embedding rows beyond `vocab_size` (image/special tokens).
    pub num_special_tokens: usize,
}

impl Default for TransformerConfig {
    fn default() -> Self {
        // Llama-2-7B-like defaults
        Self {
            block_size: 2048,
            vocab_size: 32000,
            n_layers: 32,
            n_heads: 32,
            dim: 4096,
            hidden_dim: derive_hidden_dim(4096, 256, None),
            n_local_heads: 32,
            head_dim: 128,
            rope_base: 10000.0,
            norm_eps: 1e-5,
            multiple_of: 256,
            ffn_dim_multiplier: None,
            use_tiktoken: false,
            max_seq_length: 8192,
            rope_scaling: None,
            use_hf_rope: false,
            n_stages: 1,
            stage_idx: 0,
            fusion_interval: None,
            num_special_tokens: 0,
        }
    }
}

impl TransformerConfig {
    /// Resolve a config from a raw JSON parameter object.
    pub fn from_params(params: &Value) -> Result<Self> {
        let raw: TransformerParams = serde_json::from_value(params.clone())
            .map_err(|e| TesseraError::ConfigError(format!("invalid transformer params: {e}")))?;
        let defaults = Self::default();

        let n_heads = raw.n_heads.unwrap_or(defaults.n_heads);
        let dim = raw.dim.unwrap_or(defaults.dim);
        let multiple_of = raw.multiple_of.unwrap_or(defaults.multiple_of);
        let n_local_heads = match raw.n_local_heads {
            None | Some(-1) => n_heads,
            Some(n) if n > 0 => n as usize,
            Some(n) => {
                return Err(TesseraError::ConfigError(format!(
                    "n_local_heads must be positive or -1, got {n}"
                )))
            }
        };
        if multiple_of == 0 {
            return Err(TesseraError::ConfigError("multiple_of must be positive".to_string()));
        }
        let hidden_dim = raw
            .hidden_dim
            .unwrap_or_else(|| derive_hidden_dim(dim, multiple_of, raw.ffn_dim_multiplier));
        let rope_scaling = raw
            .rope_scaling
            .as_ref()
            .map(RopeScaling::from_map)
            .transpose()?;

        let config = Self {
            block_size: raw.block_size.unwrap_or(defaults.block_size),
            vocab_size: raw.vocab_size.unwrap_or(defaults.vocab_size),
            n_layers: raw.n_layers.unwrap_or(defaults.n_layers),
            n_heads,
            dim,
            hidden_dim,
            n_local_heads,
            head_dim: if n_heads > 0 { dim / n_heads } else { 0 },
            rope_base: raw.rope_base.unwrap_or(defaults.rope_base),
            norm_eps: raw.norm_eps.unwrap_or(defaults.norm_eps),
            multiple_of,
            ffn_dim_multiplier: raw.ffn_dim_multiplier,
            use_tiktoken: raw.use_tiktoken.map(|f| f.value()).unwrap_or(false),
            max_seq_length: raw.max_seq_length.unwrap_or(defaults.max_seq_length),
            rope_scaling,
            use_hf_rope: raw.use_hf_rope.unwrap_or(false),
            n_stages: raw.n_stages.unwrap_or(1),
            stage_idx: raw.stage_idx.unwrap_or(0),
            fusion_interval: raw.fusion_interval,
            num_special_tokens: raw.num_special_tokens.unwrap_or(0),
        };
        config.validate()?;
        Ok(config)
    }

    /// Check structural constraints between fields.
    pub fn validate(&self) -> Result<()> {
        let positive = [
            ("vocab_size", self.vocab_size),
            ("n_layers", self.n_layers),
            ("n_heads", self.n_heads),
            ("dim", self.dim),
            ("hidden_dim", self.hidden_dim),
            ("n_local_heads", self.n_local_heads),
            ("n_stages", self.n_stages),
            ("block_size", self.block_size),
        ];
        if let Some((name, _)) = positive.iter().find(|(_, v)| *v == 0) {
            return Err(TesseraError::ConfigError(format!("{name} must be positive")));
        }
        if self.dim % self.n_heads != 0 {
            return Err(TesseraError::ConfigError(format!(
                "dim {} is not divisible by n_heads {}",
                self.dim, self.n_heads
            )));
        }
        if self.head_dim % 2 != 0 {
            return Err(TesseraError::ConfigError(format!(
                "head_dim {} must be even for rotary embeddings",
                self.head_dim
            )));
        }
        if self.n_heads % self.n_local_heads != 0 {
            return Err(TesseraError::ConfigError(format!(
                "n_heads {} is not a multiple of n_local_heads {}",
                self.n_heads, self.n_local_heads
            )));
        }
        if self.stage_idx >= self.n_stages {
            return Err(TesseraError::ConfigError(format!(
                "stage_idx {} out of range for {} stages",
                self.stage_idx, self.n_stages
            )));
        }
        if self.n_layers % self.n_stages != 0 {
            return Err(TesseraError::ConfigError(format!(
                "n_layers {} is not divisible by n_stages {}",
                self.n_layers, self.n_stages
            )));
        }
        if self.fusion_interval == Some(0) {
            return Err(TesseraError::ConfigError(
                "fusion_interval must be positive".to_string(),
            ));
        }
        Ok(())
    }

    /// Same config, built for a different pipeline stage.
    pub fn for_stage(&self, n_stages: usize, stage_idx: usize) -> Result<Self> {
        let config = Self {
            n_stages,
            stage_idx,
            ..self.clone()
        };
        config.validate()?;
        Ok(config)
    }

    /// Get GQA ratio.
    pub fn gqa_ratio(&self) -> usize {
        self.n_heads / self.n_local_heads
    }

    /// Layers owned by each pipeline stage.
    pub fn layers_per_stage(&self) -> usize {
        self.n_layers / self.n_stages
    }

    /// Global indices of the layers owned by this stage.
    pub fn stage_layers(&self) -> Range<usize> {
        let per_stage = self.layers_per_stage();
        per_stage * self.stage_idx..per_stage * (self.stage_idx + 1)
    }

    /// Whether this stage holds the token embedding.
    pub fn is_first_stage(&self) -> bool {
        self.stage_idx == 0
    }

    /// Whether this stage holds the final norm and output head.
    pub fn is_last_stage(&self) -> bool {
        self.stage_idx + 1 == self.n_stages
    }

    /// Rows in the token embedding table.
    pub fn embedding_rows(&self) -> usize {
        self.vocab_size + self.num_special_tokens
    }

    /// Whether layer `idx` is preceded by a cross-attention layer.
    pub fn is_fusion_layer(&self, idx: usize) -> bool {
        self.fusion_interval
            .map_or(false, |interval| (idx + 1) % interval == 0)
    }

    /// Rotary layout selected by `use_hf_rope`.
    pub fn rope_convention(&self) -> RopeConvention {
        if self.use_hf_rope {
            RopeConvention::CrossCompatible
        } else {
            RopeConvention::Native
        }
    }
}

/// Round `n` up to the next multiple of `k`.
pub fn find_multiple(n: usize, k: usize) -> usize {
    if n % k == 0 {
        n
    } else {
        n + k - n % k
    }
}

fn derive_hidden_dim(dim: usize, multiple_of: usize, multiplier: Option<f64>) -> usize {
    let mut hidden = 2 * (4 * dim) / 3;
    if let Some(m) = multiplier {
        hidden = (m * hidden as f64) as usize;
    }
    find_multiple(hidden, multiple_of)
}
