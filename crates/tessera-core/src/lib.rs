//! # Tessera Core
//!
//! Builds text-only and vision-fused decoder models from declarative
//! configuration and runs them with cached, incremental decoding.
//!
//! This crate provides:
//! - **Recipes** mapping each model type to its modules and fusion step
//! - **Decoder** stacks with KV caches, rotary positions and pipeline stages
//! - **Fusion** of vision encoders by concatenation or cross-attention
//! - **Sharding** of attention and feed-forward weights across participants
//! - **Named configs** with fuzzy lookup

#![warn(missing_docs)]
#![warn(rustdoc::missing_crate_level_docs)]

pub mod config;
pub mod distributed;
pub mod error;
pub mod facade;
pub mod fusion;
pub mod model;
pub mod recipe;
pub mod stats;
pub mod vision;

pub use config::{KnownConfigs, ModelConfig, ModelType};
pub use error::{Result, TesseraError};
pub use facade::{build, Architecture, Model, ModelBuilder, ModelInput};
pub use model::{ModelState, ParamSource, TransformerConfig};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::config::{KnownConfigs, ModelConfig, ModelType};
    pub use crate::distributed::{LocalGroup, ParallelStyle, ShardContext, SingleProcess};
    pub use crate::error::{Result, TesseraError};
    pub use crate::facade::{build, Model, ModelBuilder, ModelInput};
    pub use crate::model::{Decoder, ModelState, ParamSource, StageInput, TransformerConfig};
    pub use crate::recipe::ModelRecipe;
}
