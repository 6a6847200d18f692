//! Named model configurations and fuzzy name lookup.

use super::ModelConfig;
use crate::error::{Result, TesseraError};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use tracing::debug;

const BUILTIN: [(&str, &str); 7] = [
    ("stories15M", include_str!("../../model_params/stories15M.json")),
    ("7B", include_str!("../../model_params/7B.json")),
    ("Mistral-7B", include_str!("../../model_params/Mistral-7B.json")),
    ("Meta-Llama-3-8B", include_str!("../../model_params/Meta-Llama-3-8B.json")),
    ("Meta-Llama-3.1-8B", include_str!("../../model_params/Meta-Llama-3.1-8B.json")),
    ("llava-1.5", include_str!("../../model_params/llava-1.5.json")),
    (
        "Llama-3.2-11B-Vision",
        include_str!("../../model_params/Llama-3.2-11B-Vision.json"),
    ),
];

/// A table of named configuration documents.
#[derive(Debug, Clone, Default)]
pub struct KnownConfigs {
    table: BTreeMap<String, Value>,
}

impl KnownConfigs {
    /// An empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// The configurations shipped with the crate.
    pub fn builtin() -> Result<Self> {
        let mut configs = Self::new();
        for (name, json) in BUILTIN {
            configs.insert(name, serde_json::from_str(json)?);
        }
        Ok(configs)
    }

    /// Load every `*.json` file in `dir`, named by file stem.
    pub fn from_dir(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref();
        let mut configs = Self::new();
        let mut paths = Vec::new();
        for entry in fs::read_dir(dir)? {
            let path = entry?.path();
            if path.extension().map_or(false, |e| e == "json") {
                paths.push(path);
            }
        }
        paths.sort();

        for path in paths {
            let Some(name) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            let value = serde_json::from_str(&fs::read_to_string(&path)?)?;
            configs.insert(name, value);
        }
        debug!(dir = %dir.display(), count = configs.table.len(), "loaded named configs");
        Ok(configs)
    }

    /// Add or replace a named document.
    pub fn insert(&mut self, name: impl Into<String>, document: Value) {
        self.table.insert(name.into(), document);
    }

    /// Known names in sorted order.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.table.keys().map(String::as_str)
    }

    /// Exact-name lookup.
    pub fn from_table(&self, name: &str) -> Result<ModelConfig> {
        let document = self.table.get(name).ok_or_else(|| {
            TesseraError::ConfigError(format!("unknown model config {name:?}"))
        })?;
        ModelConfig::from_value(document.clone())
    }

    /// Resolve `name` to a known name.
    ///
    /// An exact match wins. Otherwise every known name contained in `name`
    /// (or in its upper-cased form) is a candidate and the longest candidate
    /// is chosen; no candidate, or a tie for the longest, is an error.
    pub fn resolve(&self, name: &str) -> Result<&str> {
        if let Some((key, _)) = self.table.get_key_value(name) {
            return Ok(key.as_str());
        }
        let upper = name.to_uppercase();
        let mut candidates: Vec<&str> = self
            .names()
            .filter(|k| upper.contains(*k) || name.contains(*k))
            .collect();
        candidates.sort_by_key(|k| std::cmp::Reverse(k.len()));

        match candidates.as_slice() {
            [] => Err(TesseraError::ConfigError(format!(
                "no known model config matches {name:?}"
            ))),
            [first, second, ..] if first.len() == second.len() => {
                Err(TesseraError::ConfigError(format!(
                    "ambiguous model config {name:?}: {first:?} and {second:?} match equally"
                )))
            }
            [first, ..] => {
                debug!(name, resolved = *first, "resolved model config");
                Ok(*first)
            }
        }
    }

    /// Fuzzy lookup; see [`Self::resolve`].
    pub fn from_name(&self, name: &str) -> Result<ModelConfig> {
        let resolved = self.resolve(name)?;
        self.from_table(resolved)
    }
}
