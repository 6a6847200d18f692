//! Model summary example.
//!
//! Resolves a model name against the built-in config table, builds the model
//! with random parameters and prints its size.
//!
//! Run with:
//! ```bash
//! cargo run -p tessera-core --example model_summary -- stories15M
//! ```

use candle_core::{DType, Device};
use std::time::Instant;
use tessera_core::recipe::ModelRecipe;
use tessera_core::stats::{bytes_to_readable, format_param_count};
use tessera_core::{KnownConfigs, ModelBuilder};

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();

    let args: Vec<String> = std::env::args().collect();
    let name = args.get(1).map(|s| s.as_str()).unwrap_or("stories15M");

    println!("Model Summary Example");
    println!("=====================\n");

    let table = KnownConfigs::builtin()?;
    println!("Known configs:");
    for known in table.names() {
        println!("  {known}");
    }

    let resolved = table.resolve(name)?.to_string();
    let config = table.from_name(name)?;
    let recipe = ModelRecipe::get(config.model_type);
    let text = recipe.text_config(&config)?;
    println!("\n{name:?} resolves to {resolved} ({})", config.model_type);
    println!(
        "  dim={} layers={} heads={} kv_heads={} vocab={}",
        text.dim, text.n_layers, text.n_heads, text.n_local_heads, text.vocab_size
    );

    println!("\nBuilding with random parameters...");
    let start = Instant::now();
    let model = ModelBuilder::new(config)
        .device(Device::Cpu)
        .dtype(DType::F32)
        .build()?;
    println!("  Built in {:.2?}", start.elapsed());
    println!(
        "  Parameters: {} ({} without embedding)",
        format_param_count(model.num_params(false)),
        format_param_count(model.num_params(true))
    );
    println!("  Size: {}", bytes_to_readable(model.size_bytes()));
    Ok(())
}
