//! Human-readable model size reporting.

use candle_core::Tensor;
use std::collections::BTreeMap;

/// Parameter counts and byte sizes per parameter name.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParamStats {
    counts: BTreeMap<String, (usize, usize)>,
}

impl ParamStats {
    /// Collect element counts and byte sizes of `params`.
    pub fn from_tensors<'a>(params: impl IntoIterator<Item = (&'a String, &'a Tensor)>) -> Self {
        let counts = params
            .into_iter()
            .map(|(name, t)| {
                let n = t.elem_count();
                (name.clone(), (n, n * t.dtype().size_in_bytes()))
            })
            .collect();
        Self { counts }
    }

    /// Total parameters, optionally leaving out token embedding tables.
    pub fn num_params(&self, exclude_embedding: bool) -> usize {
        self.counts
            .iter()
            .filter(|(name, _)| !(exclude_embedding && name.ends_with("tok_embeddings.weight")))
            .map(|(_, (n, _))| n)
            .sum()
    }

    /// Total parameter bytes.
    pub fn size_bytes(&self) -> usize {
        self.counts.values().map(|(_, bytes)| bytes).sum()
    }

    /// Number of named parameters.
    pub fn len(&self) -> usize {
        self.counts.len()
    }

    /// Whether no parameters were recorded.
    pub fn is_empty(&self) -> bool {
        self.counts.is_empty()
    }
}

/// `1.50B`, `12.30M` or a comma-grouped integer.
pub fn format_param_count(n: usize) -> String {
    if n >= 1_000_000_000 {
        format!("{:.2}B", n as f64 / 1e9)
    } else if n >= 1_000_000 {
        format!("{:.2}M", n as f64 / 1e6)
    } else {
        let digits = n.to_string();
        let mut out = String::with_capacity(digits.len() + digits.len() / 3);
        for (i, c) in digits.chars().enumerate() {
            if i > 0 && (digits.len() - i) % 3 == 0 {
                out.push(',');
            }
            out.push(c);
        }
        out
    }
}

/// Bytes as GiB (at least one GiB) or MiB, rounded to two decimals.
pub fn bytes_to_readable(bytes: usize) -> String {
    const GIB: f64 = (1u64 << 30) as f64;
    const MIB: f64 = (1u64 << 20) as f64;
    let (value, unit) = if bytes as f64 >= GIB {
        (bytes as f64 / GIB, "GiB")
    } else {
        (bytes as f64 / MIB, "MiB")
    };
    let mut text = format!("{value:.2}");
    while text.ends_with('0') {
        text.pop();
    }
    if text.ends_with('.') {
        text.push('0');
    }
    format!("{text} {unit}")
}
