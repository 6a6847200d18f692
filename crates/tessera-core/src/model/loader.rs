//! Named parameter sources and load-time key remapping.
//!
//! Reading checkpoints from disk is left to the caller. This module takes an
//! in-memory `name -> Tensor` map and rewrites it into the canonical
//! namespace before any module is constructed:
//!
//! 1. a leading `model.` prefix is stripped from every key,
//! 2. fused `attention.wqkv.weight` entries are split into `wq`/`wk`/`wv`.
//!
//! # Example
//!
//! ```ignore
//! use tessera_core::model::{remap_params, QkvLayout};
//!
//! let layouts = [QkvLayout::from_config("", &config)];
//! let params = remap_params(checkpoint, &layouts)?;
//! ```

use super::transformer::{Decoder, DecoderOptions};
use super::TransformerConfig;
use crate::error::{Result, TesseraError};
use candle_core::{DType, Device, Tensor};
use candle_nn::{VarBuilder, VarMap};
use std::collections::HashMap;
use tracing::debug;

const FUSED_QKV_SUFFIX: &str = "attention.wqkv.weight";

/// Where module parameters come from.
#[derive(Debug, Clone, Default)]
pub enum ParamSource {
    /// Freshly initialized parameters (tests, benchmarks, shape checks).
    #[default]
    Random,
    /// Named tensors, remapped before use.
    Tensors(HashMap<String, Tensor>),
}

impl ParamSource {
    /// Number of named tensors (zero for random init).
    pub fn len(&self) -> usize {
        match self {
            ParamSource::Random => 0,
            ParamSource::Tensors(t) => t.len(),
        }
    }

    /// Whether no named tensors are present.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Split sizes for fused QKV weights under one key prefix.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QkvLayout {
    /// Key prefix of the decoder (`""`, `"decoder."`, ...).
    pub prefix: String,
    /// Rows of `wq`: `n_heads * head_dim`.
    pub q_rows: usize,
    /// Rows of `wk` and `wv`: `n_local_heads * head_dim`.
    pub kv_rows: usize,
}

impl QkvLayout {
    /// Layout of a decoder whose parameters live under `prefix`.
    pub fn from_config(prefix: &str, config: &TransformerConfig) -> Self {
        Self {
            prefix: prefix.to_string(),
            q_rows: config.n_heads * config.head_dim,
            kv_rows: config.n_local_heads * config.head_dim,
        }
    }

    fn total_rows(&self) -> usize {
        self.q_rows + 2 * self.kv_rows
    }
}

/// Drop a leading `model.` from every key.
pub fn strip_model_prefix(params: HashMap<String, Tensor>) -> HashMap<String, Tensor> {
    params
        .into_iter()
        .map(|(name, tensor)| match name.strip_prefix("model.") {
            Some(stripped) => (stripped.to_string(), tensor),
            None => (name, tensor),
        })
        .collect()
}

/// Replace every `<prefix>attention.wqkv.weight` by `wq`/`wk`/`wv` slices.
///
/// The layout with the longest matching prefix decides the split sizes.
/// A fused key without a matching layout is a config error, and a row count
/// that does not equal `q + 2 * kv` is a shape error.
pub fn split_fused_qkv(
    params: HashMap<String, Tensor>,
    layouts: &[QkvLayout],
) -> Result<HashMap<String, Tensor>> {
    let mut out = HashMap::with_capacity(params.len() + params.len() / 4);
    for (name, tensor) in params {
        let Some(base) = name.strip_suffix(FUSED_QKV_SUFFIX) else {
            out.insert(name, tensor);
            continue;
        };
        let layout = layouts
            .iter()
            .filter(|l| base.starts_with(l.prefix.as_str()))
            .max_by_key(|l| l.prefix.len())
            .ok_or_else(|| {
                TesseraError::ConfigError(format!("no attention layout for fused weight {name}"))
            })?;

        let rows = tensor.dim(0)?;
        if rows != layout.total_rows() {
            return Err(TesseraError::ShapeError(format!(
                "{name} has {rows} rows, expected {} ({} + 2 * {})",
                layout.total_rows(),
                layout.q_rows,
                layout.kv_rows
            )));
        }
        debug!(name = %name, q = layout.q_rows, kv = layout.kv_rows, "splitting fused qkv");

        let wq = tensor.narrow(0, 0, layout.q_rows)?;
        let wk = tensor.narrow(0, layout.q_rows, layout.kv_rows)?;
        let wv = tensor.narrow(0, layout.q_rows + layout.kv_rows, layout.kv_rows)?;
        out.insert(format!("{base}attention.wq.weight"), wq);
        out.insert(format!("{base}attention.wk.weight"), wk);
        out.insert(format!("{base}attention.wv.weight"), wv);
    }
    Ok(out)
}

/// Both remapping passes in order.
pub fn remap_params(
    params: HashMap<String, Tensor>,
    layouts: &[QkvLayout],
) -> Result<HashMap<String, Tensor>> {
    split_fused_qkv(strip_model_prefix(params), layouts)
}

/// Snapshot every variable of `varmap` as a plain tensor map.
pub fn collect_vars(varmap: &VarMap) -> HashMap<String, Tensor> {
    // A poisoned lock still holds valid tensors.
    let vars = varmap.data().lock().unwrap_or_else(|e| e.into_inner());
    vars.iter()
        .map(|(name, var)| (name.clone(), var.as_tensor().clone()))
        .collect()
}

/// Randomly initialized parameters of a full single-stage decoder.
pub fn init_random_params(
    config: &TransformerConfig,
    device: &Device,
    dtype: DType,
) -> Result<HashMap<String, Tensor>> {
    let varmap = VarMap::new();
    let vb = VarBuilder::from_varmap(&varmap, dtype, device);
    let config = config.for_stage(1, 0)?;
    Decoder::new(&config, vb, DecoderOptions::default())?;
    Ok(collect_vars(&varmap))
}
