//! Llava prompt layout example.
//!
//! Shows how text before the image, image patches and text after the image
//! are spliced into one decoder sequence.

use anyhow::Result;
use tessera::prelude::*;

fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    let config = ModelConfig::from_json(
        r#"{
            "model_type": "llava",
            "encoder": {
                "tile_size": 56, "patch_size": 14, "embed_dim": 32,
                "num_layers": 2, "num_heads": 2, "out_indices": [1],
                "intermediate_act": "QuickGELUActivation()"
            },
            "decoder": {"dim": 64, "n_heads": 4, "n_layers": 2, "vocab_size": 100}
        }"#,
    )?;
    let model = ModelBuilder::new(config).build()?;
    let mut session = DecodeSession::new(model, 1, 64)?;

    let pre = Tensor::new(&[1u32, 2, 3], &Device::Cpu)?;
    let post = Tensor::new(&[7u32, 8], &Device::Cpu)?;
    let pixels = Tensor::randn(0f32, 1.0, (3, 56, 56), &Device::Cpu)?;

    let logits = session.prefill(ModelInput::Llava {
        tokens: &pre,
        encoder_input: Some(&pixels),
        post_tokens: Some(&post),
        input_pos: None,
    })?;
    println!(
        "3 text + 16 image + 2 text tokens -> logits {:?}, next position {}",
        logits.dims(),
        session.position()
    );
    Ok(())
}
