//! Greedy decoding example.
//!
//! Builds a small randomly initialized text model, prefills a prompt and
//! greedily decodes a few tokens. Set `RUST_LOG=debug` to see cache setup.

use anyhow::Result;
use tessera::prelude::*;
use tracing_subscriber::EnvFilter;

fn argmax_last(logits: &Tensor) -> Result<u32> {
    let last = logits.squeeze(0)?.get(logits.dim(1)? - 1)?;
    Ok(last.argmax(0)?.to_scalar::<u32>()?)
}

fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let config = ModelConfig::from_json(
        r#"{"dim": 64, "n_heads": 4, "n_layers": 2, "vocab_size": 100, "multiple_of": 32}"#,
    )?;
    let model = ModelBuilder::new(config).build()?;
    println!(
        "Built {} model with {} parameters",
        model.model_type(),
        tessera::stats::format_param_count(model.num_params(false))
    );

    let mut session = DecodeSession::new(model, 1, 32)?;
    let prompt = Tensor::new(&[[1u32, 17, 42, 5, 9]], &Device::Cpu)?;
    let logits = session.prefill(ModelInput::Text {
        tokens: &prompt,
        input_pos: None,
    })?;

    let mut next = argmax_last(&logits)?;
    let mut generated = vec![next];
    for _ in 0..8 {
        let logits = session.step(&Tensor::new(&[[next]], &Device::Cpu)?)?;
        next = argmax_last(&logits)?;
        generated.push(next);
    }

    println!("Generated token ids: {generated:?}");
    println!("Final position: {}", session.position());
    Ok(())
}
