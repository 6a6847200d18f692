//! Decoder parameters written in torchtune's vocabulary.

use crate::error::{Result, TesseraError};
use crate::model::{find_multiple, RopeScaling, TransformerConfig};
use serde::Deserialize;
use serde_json::Value;

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct TorchtuneParams {
    vocab_size: usize,
    num_layers: usize,
    num_heads: usize,
    #[serde(default)]
    num_kv_heads: Option<usize>,
    embed_dim: usize,
    max_seq_len: usize,
    #[serde(default)]
    intermediate_dim: Option<usize>,
    #[serde(default)]
    norm_eps: Option<f64>,
    #[serde(default)]
    rope_base: Option<f64>,
    #[serde(default)]
    scale_factor: Option<f64>,
    #[serde(default)]
    fusion_interval: Option<usize>,
    #[serde(default)]
    num_special_tokens: Option<usize>,
    // Encoder sequence bound; cross-attention reads the encoder length from
    // the states it receives.
    #[serde(default)]
    #[allow(dead_code)]
    encoder_max_seq_len: Option<usize>,
}

const DEFAULT_ROPE_BASE: f64 = 500_000.0;
const DEFAULT_SCALE_FACTOR: f64 = 8.0;

fn resolve(params: &Value, what: &str) -> Result<TransformerConfig> {
    let raw: TorchtuneParams = serde_json::from_value(params.clone())
        .map_err(|e| TesseraError::ConfigError(format!("invalid {what} params: {e}")))?;
    if raw.num_heads == 0 {
        return Err(TesseraError::ConfigError(format!("{what}: num_heads must be positive")));
    }
    let hidden_dim = raw
        .intermediate_dim
        .unwrap_or_else(|| find_multiple(2 * (4 * raw.embed_dim) / 3, 256));

    let config = TransformerConfig {
        block_size: raw.max_seq_len,
        vocab_size: raw.vocab_size,
        n_layers: raw.num_layers,
        n_heads: raw.num_heads,
        dim: raw.embed_dim,
        hidden_dim,
        n_local_heads: raw.num_kv_heads.unwrap_or(raw.num_heads),
        head_dim: raw.embed_dim / raw.num_heads,
        rope_base: raw.rope_base.unwrap_or(DEFAULT_ROPE_BASE),
        norm_eps: raw.norm_eps.unwrap_or(1e-5),
        max_seq_length: raw.max_seq_len,
        rope_scaling: Some(RopeScaling::llama3_1(
            raw.scale_factor.unwrap_or(DEFAULT_SCALE_FACTOR),
        )),
        fusion_interval: raw.fusion_interval,
        num_special_tokens: raw.num_special_tokens.unwrap_or(0),
        ..TransformerConfig::default()
    };
    config.validate()?;
    Ok(config)
}

/// Llama 3.1 decoder: scaled rope, no cross-attention.
pub fn llama3_1_config(params: &Value) -> Result<TransformerConfig> {
    let config = resolve(params, "llama3_1")?;
    if config.fusion_interval.is_some() {
        return Err(TesseraError::ConfigError(
            "llama3_1 decoder does not take fusion_interval".to_string(),
        ));
    }
    Ok(config)
}

/// Cross-attending decoder of a deep-fusion model.
pub fn fusion_decoder_config(params: &Value) -> Result<TransformerConfig> {
    let config = resolve(params, "fusion decoder")?;
    if config.fusion_interval.is_none() {
        return Err(TesseraError::ConfigError(
            "fusion decoder requires fusion_interval".to_string(),
        ));
    }
    Ok(config)
}
