//! # Tessera
//!
//! Assemble transformer models from interchangeable modules and decode
//! with them.
//!
//! Tessera builds four model families from one JSON config format:
//! - **Text-only** decoders with explicit-position KV caching
//! - **Llama 3.1** decoders with scaled rotary embeddings
//! - **Flamingo** models fusing vision through gated cross-attention
//! - **Llava** models splicing projected image patches into the prompt
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use tessera::prelude::*;
//!
//! fn main() -> anyhow::Result<()> {
//!     let config = KnownConfigs::builtin()?.from_name("stories15M")?;
//!     let model = ModelBuilder::new(config).build()?;
//!
//!     let mut session = DecodeSession::new(model, 1, 256)?;
//!     let prompt = Tensor::new(&[[1u32, 15043, 29892]], &Device::Cpu)?;
//!     let logits = session.prefill(ModelInput::Text { tokens: &prompt, input_pos: None })?;
//!     // pick the next token from `logits`, then:
//!     let next = Tensor::new(&[[3186u32]], &Device::Cpu)?;
//!     let logits = session.step(&next)?;
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(rustdoc::missing_crate_level_docs)]

// Re-export core crate
pub use tessera_core::*;

mod session;

pub use session::DecodeSession;

/// Commonly used types.
pub mod prelude {
    pub use crate::session::DecodeSession;
    pub use tessera_core::prelude::*;

    // Re-export useful external types
    pub use anyhow;
    pub use candle_core::{DType, Device, Tensor};
    pub use tracing;
}
