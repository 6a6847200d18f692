//! End-to-end checks across recipes, the facade and sharded execution.

use candle_core::{DType, Device, Tensor};
use candle_nn::VarBuilder;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use std::thread;
use tessera_core::distributed::{LocalGroup, ParallelStyle, ShardContext};
use tessera_core::model::{Decoder, DecoderOptions, StageInput};
use tessera_core::{
    KnownConfigs, Model, ModelBuilder, ModelConfig, ModelInput, ModelState, ModelType,
    ParamSource, TransformerConfig,
};

fn text_params() -> Value {
    json!({
        "dim": 64,
        "n_heads": 4,
        "n_local_heads": 2,
        "n_layers": 2,
        "vocab_size": 100,
        "hidden_dim": 128,
        "block_size": 64
    })
}

fn text_config() -> ModelConfig {
    ModelConfig::from_value(text_params()).unwrap()
}

fn max_abs_diff(a: &Tensor, b: &Tensor) -> f32 {
    (a - b)
        .unwrap()
        .abs()
        .unwrap()
        .max_all()
        .unwrap()
        .to_scalar()
        .unwrap()
}

fn text(model: &mut Model, tokens: &Tensor, pos: Option<&Tensor>) -> Tensor {
    model
        .forward(ModelInput::Text {
            tokens,
            input_pos: pos,
        })
        .unwrap()
}

#[test]
fn text_only_prefill_then_step() {
    let mut model = ModelBuilder::new(text_config()).build().unwrap();
    assert_eq!(model.model_type(), ModelType::TextOnly);
    model.setup_caches(1, 16).unwrap();

    let prompt = Tensor::new(&[[1u32, 2, 3, 4, 5]], &Device::Cpu).unwrap();
    let logits = text(&mut model, &prompt, None);
    assert_eq!(logits.dims(), &[1, 5, 100]);
    assert_eq!(logits.dtype(), DType::F32);

    let next = Tensor::new(&[[6u32]], &Device::Cpu).unwrap();
    let pos = Tensor::new(&[5u32], &Device::Cpu).unwrap();
    assert_eq!(text(&mut model, &next, Some(&pos)).dims(), &[1, 1, 100]);
    assert_eq!(model.state(), ModelState::Decoding);
}

#[test]
fn unbatched_prompt_reads_as_batch_of_one() {
    let mut model = ModelBuilder::new(text_config()).build().unwrap();
    model.setup_caches(1, 16).unwrap();

    let flat = Tensor::new(&[1u32, 2, 3, 4], &Device::Cpu).unwrap();
    let unbatched = text(&mut model, &flat, None);
    assert_eq!(unbatched.dims(), &[1, 4, 100]);

    model.reset_caches().unwrap();
    let batched = text(&mut model, &flat.unsqueeze(0).unwrap(), None);
    assert_eq!(max_abs_diff(&unbatched, &batched), 0.0);
}

#[test]
fn forward_before_setup_is_state_error() {
    let mut model = ModelBuilder::new(text_config()).build().unwrap();
    let tokens = Tensor::new(&[[1u32, 2]], &Device::Cpu).unwrap();
    let err = model
        .forward(ModelInput::Text {
            tokens: &tokens,
            input_pos: None,
        })
        .unwrap_err();
    assert!(err.is_state());
}

#[test]
fn cached_decode_matches_full_recompute() {
    let builder = ModelBuilder::new(text_config());
    let params = builder.random_params().unwrap();
    let mut cached = builder
        .clone()
        .params(ParamSource::Tensors(params.clone()))
        .build()
        .unwrap();
    let mut full = builder.params(ParamSource::Tensors(params)).build().unwrap();
    cached.setup_caches(1, 16).unwrap();
    full.setup_caches(1, 16).unwrap();

    let ids = [7u32, 3, 9, 1, 4, 8];
    let prompt = Tensor::new(&ids[..3], &Device::Cpu)
        .unwrap()
        .unsqueeze(0)
        .unwrap();
    text(&mut cached, &prompt, None);
    let mut last = None;
    for (i, id) in ids.iter().enumerate().skip(3) {
        let token = Tensor::new(&[[*id]], &Device::Cpu).unwrap();
        let pos = Tensor::new(&[i as u32], &Device::Cpu).unwrap();
        last = Some(text(&mut cached, &token, Some(&pos)));
    }

    let all = Tensor::new(&[ids], &Device::Cpu).unwrap();
    let reference = text(&mut full, &all, None).narrow(1, 5, 1).unwrap();
    assert!(max_abs_diff(&last.unwrap(), &reference) < 1e-4);
}

#[test]
fn fused_qkv_checkpoint_matches_split_one() {
    let builder = ModelBuilder::new(text_config());
    let params = builder.random_params().unwrap();

    let mut fused: HashMap<String, Tensor> = HashMap::new();
    for (name, tensor) in &params {
        if let Some(base) = name.strip_suffix("attention.wq.weight") {
            let k = &params[&format!("{base}attention.wk.weight")];
            let v = &params[&format!("{base}attention.wv.weight")];
            let qkv = Tensor::cat(&[tensor, k, v], 0).unwrap();
            fused.insert(format!("model.{base}attention.wqkv.weight"), qkv);
        } else if !name.ends_with("attention.wk.weight") && !name.ends_with("attention.wv.weight")
        {
            fused.insert(format!("model.{name}"), tensor.clone());
        }
    }

    let mut a = builder
        .clone()
        .params(ParamSource::Tensors(params))
        .build()
        .unwrap();
    let mut b = builder.params(ParamSource::Tensors(fused)).build().unwrap();
    a.setup_caches(1, 8).unwrap();
    b.setup_caches(1, 8).unwrap();

    let tokens = Tensor::new(&[[11u32, 12, 13]], &Device::Cpu).unwrap();
    let diff = max_abs_diff(&text(&mut a, &tokens, None), &text(&mut b, &tokens, None));
    assert_eq!(diff, 0.0);
}

fn sharded_matches_reference(style: ParallelStyle) {
    let builder = ModelBuilder::new(text_config());
    let params = builder.random_params().unwrap();
    let tokens = Tensor::new(&[[5u32, 17, 42, 8]], &Device::Cpu).unwrap();

    let mut reference = builder
        .clone()
        .params(ParamSource::Tensors(params.clone()))
        .build()
        .unwrap();
    reference.setup_caches(1, 8).unwrap();
    let expected = text(&mut reference, &tokens, None);

    let collectives = LocalGroup::new(2).unwrap();
    let outputs: Vec<Tensor> = thread::scope(|s| {
        let handles: Vec<_> = collectives
            .into_iter()
            .map(|collective| {
                let builder = builder.clone();
                let params = params.clone();
                let tokens = &tokens;
                s.spawn(move || {
                    let shard = ShardContext::new(Arc::new(collective), style);
                    let mut model = builder
                        .params(ParamSource::Tensors(params))
                        .shard(shard)
                        .build()
                        .unwrap();
                    model.setup_caches(1, 8).unwrap();
                    text(&mut model, tokens, None)
                })
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    });

    for logits in &outputs {
        assert_eq!(logits.dims(), &[1, 4, 100]);
        assert!(max_abs_diff(logits, &expected) < 1e-4);
    }
}

#[test]
fn tensor_parallel_matches_reference() {
    sharded_matches_reference(ParallelStyle::Tensor);
}

#[test]
fn sequence_parallel_matches_reference() {
    sharded_matches_reference(ParallelStyle::Sequence);
}

#[test]
fn pipeline_stages_chain_to_full_model() {
    let builder = ModelBuilder::new(text_config());
    let params = builder.random_params().unwrap();
    let config = TransformerConfig::from_params(&text_params()).unwrap();
    let vb = VarBuilder::from_tensors(params, DType::F32, &Device::Cpu);

    let mut full = Decoder::new(&config, vb.clone(), DecoderOptions::default()).unwrap();
    let mut first = Decoder::new(
        &config.for_stage(2, 0).unwrap(),
        vb.clone(),
        DecoderOptions::default(),
    )
    .unwrap();
    let mut last = Decoder::new(&config.for_stage(2, 1).unwrap(), vb, DecoderOptions::default())
        .unwrap();
    assert!(first.has_embedding() && !first.has_output());
    assert!(!last.has_embedding() && last.has_output());

    for decoder in [&mut full, &mut first, &mut last] {
        decoder.setup_caches(1, 8).unwrap();
    }
    let tokens = Tensor::new(&[[3u32, 1, 4, 1]], &Device::Cpu).unwrap();
    let pos = Tensor::arange(0u32, 4, &Device::Cpu).unwrap();

    let expected = full.forward(StageInput::Tokens(&tokens), &pos, None).unwrap();
    let hidden = first.forward(StageInput::Tokens(&tokens), &pos, None).unwrap();
    assert_eq!(hidden.dims(), &[1, 4, 64]);
    let logits = last.forward(StageInput::Hidden(&hidden), &pos, None).unwrap();
    assert!(max_abs_diff(&logits, &expected) < 1e-5);
}

#[test]
fn llava_splices_image_patches_into_prompt() {
    let config = ModelConfig::from_value(json!({
        "model_type": "llava",
        "encoder": {
            "tile_size": 336,
            "patch_size": 14,
            "embed_dim": 8,
            "num_layers": 1,
            "num_heads": 2,
            "out_indices": [0],
            "intermediate_act": "QuickGELUActivation()"
        },
        "decoder": {
            "dim": 32,
            "n_heads": 4,
            "n_layers": 1,
            "vocab_size": 64,
            "hidden_dim": 64
        }
    }))
    .unwrap();
    let mut model = ModelBuilder::new(config).build().unwrap();
    assert_eq!(model.model_type(), ModelType::Llava);
    model.setup_caches(1, 640).unwrap();

    let pre: Vec<u32> = (0..30).collect();
    let post: Vec<u32> = (30..50).collect();
    let pre = Tensor::new(pre.as_slice(), &Device::Cpu).unwrap();
    let post = Tensor::new(post.as_slice(), &Device::Cpu).unwrap();
    let pixels = Tensor::randn(0f32, 1.0, (3, 336, 336), &Device::Cpu).unwrap();

    let logits = model
        .forward(ModelInput::Llava {
            tokens: &pre,
            encoder_input: Some(&pixels),
            post_tokens: Some(&post),
            input_pos: None,
        })
        .unwrap();
    assert_eq!(logits.dims(), &[1, 30 + 576 + 20, 64]);
}

#[test]
fn flamingo_builds_and_decodes_with_cached_image() {
    let config = ModelConfig::from_value(json!({
        "model_type": "flamingo",
        "encoder": {
            "patch_size": 7,
            "num_heads": 2,
            "clip_embed_dim": 8,
            "clip_num_layers": 2,
            "clip_hidden_states": [0, 1],
            "decoder_embed_dim": 32,
            "num_layers_projection": 1,
            "tile_size": 14,
            "max_num_tiles": 1
        },
        "decoder": {
            "vocab_size": 48,
            "num_layers": 2,
            "num_heads": 4,
            "num_kv_heads": 2,
            "embed_dim": 32,
            "max_seq_len": 32,
            "intermediate_dim": 64,
            "fusion_interval": 1,
            "num_special_tokens": 8
        }
    }))
    .unwrap();
    let mut model = ModelBuilder::new(config).build().unwrap();
    assert_eq!(model.model_type(), ModelType::Flamingo);
    assert!(model.text_config().rope_scaling.is_some());
    model.setup_caches(1, 16).unwrap();

    let tokens = Tensor::new(&[[1u32, 2, 3]], &Device::Cpu).unwrap();
    let pixels = Tensor::randn(0f32, 1.0, (3, 14, 14), &Device::Cpu).unwrap();
    let logits = model
        .forward(ModelInput::Flamingo {
            tokens: &tokens,
            encoder_input: Some(&pixels),
            encoder_mask: None,
            input_pos: None,
        })
        .unwrap();
    assert_eq!(logits.dims(), &[1, 3, 48]);

    let step = Tensor::new(&[[4u32]], &Device::Cpu).unwrap();
    let pos = Tensor::new(&[3u32], &Device::Cpu).unwrap();
    let logits = model
        .forward(ModelInput::Flamingo {
            tokens: &step,
            encoder_input: None,
            encoder_mask: None,
            input_pos: Some(&pos),
        })
        .unwrap();
    assert_eq!(logits.dims(), &[1, 1, 48]);
}

#[test]
fn llama3_1_recipe_scales_rope() {
    let config = ModelConfig::from_value(json!({
        "model_type": "llama3_1",
        "text": {
            "vocab_size": 64,
            "num_layers": 1,
            "num_heads": 4,
            "num_kv_heads": 1,
            "embed_dim": 32,
            "max_seq_len": 64,
            "intermediate_dim": 64
        }
    }))
    .unwrap();
    let mut model = ModelBuilder::new(config).build().unwrap();
    let scaling = model.text_config().rope_scaling.unwrap();
    assert_eq!(scaling.factor, 8.0);
    assert_eq!(model.text_config().rope_base, 500_000.0);

    model.setup_caches(2, 8).unwrap();
    let tokens = Tensor::new(&[[1u32, 2], [3, 4]], &Device::Cpu).unwrap();
    assert_eq!(text(&mut model, &tokens, None).dims(), &[2, 2, 64]);
}

#[test]
fn builtin_configs_resolve_fuzzy_names() {
    let table = KnownConfigs::builtin().unwrap();
    assert_eq!(
        table.resolve("meta-llama/Meta-Llama-3.1-8B-Instruct").unwrap(),
        "Meta-Llama-3.1-8B"
    );
    assert_eq!(table.resolve("Mistral-7B-Instruct-v0.2").unwrap(), "Mistral-7B");
    assert_eq!(
        table.from_name("stories15M").unwrap().model_type,
        ModelType::TextOnly
    );
    assert_eq!(
        table.from_name("llava-1.5-7b-hf").unwrap().model_type,
        ModelType::Llava
    );
    assert!(table.resolve("gpt2").unwrap_err().is_config());
}
