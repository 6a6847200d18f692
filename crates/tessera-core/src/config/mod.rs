//! Model-level configuration.
//!
//! A configuration document is a JSON object. With a `model_type` key it
//! maps module names to their raw parameter objects; without one the whole
//! document is the parameter object of a text-only model's `text` module.
//!
//! ```text
//! {"dim": 288, "n_layers": 6, ...}                        -> text_only
//! {"model_type": "llava", "encoder": {...}, "decoder": {...}}
//! ```

mod table;

pub use table::KnownConfigs;

use crate::error::{Result, TesseraError};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;
use std::str::FromStr;

/// Supported model families.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ModelType {
    /// Decoder-only text model.
    #[serde(rename = "text_only")]
    TextOnly,
    /// Decoder-only Llama 3.1 built from torchtune-style parameters.
    #[serde(rename = "llama3_1")]
    Llama3_1,
    /// Vision encoder + cross-attention decoder.
    #[serde(rename = "flamingo")]
    Flamingo,
    /// Vision encoder + decoder over concatenated embeddings.
    #[serde(rename = "llava")]
    Llava,
}

impl ModelType {
    /// Every supported model type.
    pub const ALL: [ModelType; 4] = [
        ModelType::TextOnly,
        ModelType::Llama3_1,
        ModelType::Flamingo,
        ModelType::Llava,
    ];

    /// Serialized tag.
    pub fn as_str(&self) -> &'static str {
        match self {
            ModelType::TextOnly => "text_only",
            ModelType::Llama3_1 => "llama3_1",
            ModelType::Flamingo => "flamingo",
            ModelType::Llava => "llava",
        }
    }
}

impl fmt::Display for ModelType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ModelType {
    type Err = TesseraError;

    fn from_str(s: &str) -> Result<Self> {
        ModelType::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| TesseraError::ConfigError(format!("unknown model type {s:?}")))
    }
}

/// A resolved model configuration: model type plus per-module parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct ModelConfig {
    /// Model family.
    pub model_type: ModelType,
    /// Raw parameters per module name.
    pub modules: BTreeMap<String, Value>,
    /// Whether the model pairs with a tiktoken tokenizer.
    pub use_tiktoken: bool,
}

impl ModelConfig {
    /// A text-only config whose `text` module uses `params`.
    pub fn text_only(params: Value) -> Self {
        let use_tiktoken = params
            .get("use_tiktoken")
            .map(truthy)
            .unwrap_or(false);
        let mut modules = BTreeMap::new();
        modules.insert("text".to_string(), params);
        Self {
            model_type: ModelType::TextOnly,
            modules,
            use_tiktoken,
        }
    }

    /// Interpret a JSON document.
    pub fn from_value(value: Value) -> Result<Self> {
        let Value::Object(mut map) = value else {
            return Err(TesseraError::ConfigError(
                "model config must be a JSON object".to_string(),
            ));
        };
        let Some(tag) = map.remove("model_type") else {
            return Ok(Self::text_only(Value::Object(map)));
        };
        let model_type = match tag {
            Value::String(s) => s.parse()?,
            other => {
                return Err(TesseraError::ConfigError(format!(
                    "model_type must be a string, got {other}"
                )))
            }
        };
        let use_tiktoken = map.remove("use_tiktoken").as_ref().map(truthy).unwrap_or(false);

        let modules = map
            .into_iter()
            .map(|(name, params)| match params {
                Value::Object(_) => Ok((name, params)),
                other => Err(TesseraError::ConfigError(format!(
                    "parameters of module {name:?} must be an object, got {other}"
                ))),
            })
            .collect::<Result<BTreeMap<_, _>>>()?;

        Ok(Self {
            model_type,
            modules,
            use_tiktoken,
        })
    }

    /// Parse a JSON string.
    pub fn from_json(json: &str) -> Result<Self> {
        Self::from_value(serde_json::from_str(json)?)
    }

    /// Read a JSON file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json(&text)
    }

    /// Parameters of module `name`.
    pub fn module(&self, name: &str) -> Result<&Value> {
        self.modules.get(name).ok_or_else(|| {
            TesseraError::ConfigError(format!(
                "{} config is missing parameters for module {name:?}",
                self.model_type
            ))
        })
    }

    /// Serialize back into the document layout accepted by [`Self::from_value`].
    pub fn to_value(&self) -> Value {
        let mut map: Map<String, Value> = self
            .modules
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        map.insert(
            "model_type".to_string(),
            Value::String(self.model_type.as_str().to_string()),
        );
        if self.use_tiktoken {
            map.insert("use_tiktoken".to_string(), Value::Bool(true));
        }
        Value::Object(map)
    }
}

// Checkpoint configs write the flag as a bool or as the string "True".
fn truthy(v: &Value) -> bool {
    match v {
        Value::Bool(b) => *b,
        Value::String(s) => s == "True" || s == "true",
        _ => false,
    }
}
