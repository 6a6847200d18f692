//! The assembled, callable model.

mod builder;
mod model;

pub use builder::{build, ModelBuilder};
pub use model::{Architecture, Model, ModelInput};
