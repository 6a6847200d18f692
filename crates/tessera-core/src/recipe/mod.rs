//! Recipe registry: which modules make up each model type, how each module
//! is built from its parameters, and how the built modules are fused.
//!
//! The table is static and total over [`ModelType`]. Module names match the
//! keys of a [`ModelConfig`] and `param_prefix` scopes each module's
//! parameters in the canonical namespace.

mod params;

pub use params::{fusion_decoder_config, llama3_1_config};

use crate::config::{ModelConfig, ModelType};
use crate::distributed::ShardContext;
use crate::error::{Result, TesseraError};
use crate::facade::Architecture;
use crate::fusion::{ConcatFusion, DeepFusion};
use crate::model::{Decoder, DecoderOptions, QkvLayout, TransformerConfig};
use crate::vision::{FlamingoEncoder, FlamingoEncoderConfig, VisionConfig, VisionEncoder};
use candle_nn::VarBuilder;
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;

/// Settings shared by every module builder of one model.
#[derive(Debug, Clone, Default)]
pub struct BuildContext {
    /// Tensor-parallel participant context for decoder modules.
    pub shard: Option<ShardContext>,
}

/// A constructed module, before fusion.
#[derive(Debug, Clone)]
pub enum BuiltModule {
    /// Decoder stack.
    Decoder(Decoder),
    /// CLIP-style encoder.
    Vision(VisionEncoder),
    /// CLIP encoder with projection head.
    FlamingoVision(FlamingoEncoder),
}

impl BuiltModule {
    fn kind(&self) -> &'static str {
        match self {
            BuiltModule::Decoder(_) => "decoder",
            BuiltModule::Vision(_) => "vision encoder",
            BuiltModule::FlamingoVision(_) => "flamingo encoder",
        }
    }
}

/// Builds one module from its raw parameters.
pub type ModuleBuilder = fn(&Value, VarBuilder, &BuildContext) -> Result<BuiltModule>;

/// Resolves a decoder module's parameters into a [`TransformerConfig`].
pub type ConfigResolver = fn(&Value) -> Result<TransformerConfig>;

/// Combines built modules into the final architecture.
pub type FusionBuilder = fn(BuiltModules, VarBuilder) -> Result<Architecture>;

/// One module slot of a recipe.
#[derive(Clone, Copy)]
pub struct RecipeModule {
    /// Key in the model config.
    pub name: &'static str,
    /// Parameter namespace (empty for the root).
    pub param_prefix: &'static str,
    /// Constructor.
    pub build: ModuleBuilder,
    /// Set for decoder modules, which are the ones that get sharded and
    /// carry fused-QKV weights.
    pub text_config: Option<ConfigResolver>,
}

impl RecipeModule {
    /// `param_prefix` with a trailing dot, or empty.
    pub fn key_prefix(&self) -> String {
        if self.param_prefix.is_empty() {
            String::new()
        } else {
            format!("{}.", self.param_prefix)
        }
    }

    /// Scope `vb` to this module's namespace.
    pub fn scope<'a>(&self, vb: &VarBuilder<'a>) -> VarBuilder<'a> {
        if self.param_prefix.is_empty() {
            vb.clone()
        } else {
            vb.pp(self.param_prefix)
        }
    }
}

impl fmt::Debug for RecipeModule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RecipeModule")
            .field("name", &self.name)
            .field("param_prefix", &self.param_prefix)
            .field("decoder", &self.text_config.is_some())
            .finish()
    }
}

/// The modules and fusion of one model type.
#[derive(Clone, Copy)]
pub struct ModelRecipe {
    /// Model type this recipe builds.
    pub model_type: ModelType,
    /// Module slots, in build order.
    pub modules: &'static [RecipeModule],
    /// Fusion step.
    pub fusion: FusionBuilder,
}

impl fmt::Debug for ModelRecipe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModelRecipe")
            .field("model_type", &self.model_type)
            .field("modules", &self.modules)
            .finish()
    }
}

static RECIPES: [ModelRecipe; 4] = [
    ModelRecipe {
        model_type: ModelType::TextOnly,
        modules: &[RecipeModule {
            name: "text",
            param_prefix: "",
            build: build_text_decoder,
            text_config: Some(TransformerConfig::from_params),
        }],
        fusion: fuse_text_only,
    },
    ModelRecipe {
        model_type: ModelType::Llama3_1,
        modules: &[RecipeModule {
            name: "text",
            param_prefix: "",
            build: build_llama3_1_decoder,
            text_config: Some(llama3_1_config),
        }],
        fusion: fuse_llama3_1,
    },
    ModelRecipe {
        model_type: ModelType::Flamingo,
        modules: &[
            RecipeModule {
                name: "encoder",
                param_prefix: "encoder",
                build: build_flamingo_encoder,
                text_config: None,
            },
            RecipeModule {
                name: "decoder",
                param_prefix: "decoder",
                build: build_fusion_decoder,
                text_config: Some(fusion_decoder_config),
            },
        ],
        fusion: fuse_deep,
    },
    ModelRecipe {
        model_type: ModelType::Llava,
        modules: &[
            RecipeModule {
                name: "encoder",
                param_prefix: "encoder",
                build: build_clip_encoder,
                text_config: None,
            },
            RecipeModule {
                name: "decoder",
                param_prefix: "decoder",
                build: build_llava_decoder,
                text_config: Some(TransformerConfig::from_params),
            },
        ],
        fusion: fuse_concat,
    },
];

impl ModelRecipe {
    /// The recipe for `model_type`.
    pub fn get(model_type: ModelType) -> &'static ModelRecipe {
        match model_type {
            ModelType::TextOnly => &RECIPES[0],
            ModelType::Llama3_1 => &RECIPES[1],
            ModelType::Flamingo => &RECIPES[2],
            ModelType::Llava => &RECIPES[3],
        }
    }

    /// The recipe for a serialized model type tag.
    pub fn lookup(tag: &str) -> Result<&'static ModelRecipe> {
        Ok(Self::get(tag.parse()?))
    }

    /// Module slot by name.
    pub fn module(&self, name: &str) -> Option<&'static RecipeModule> {
        self.modules.iter().find(|m| m.name == name)
    }

    /// The decoder slot.
    pub fn text_module(&self) -> Result<&'static RecipeModule> {
        self.modules
            .iter()
            .find(|m| m.text_config.is_some())
            .ok_or_else(|| {
                TesseraError::ConfigError(format!("{} recipe has no decoder", self.model_type))
            })
    }

    /// Resolved decoder configuration of `config`.
    pub fn text_config(&self, config: &ModelConfig) -> Result<TransformerConfig> {
        let module = self.text_module()?;
        match module.text_config {
            Some(resolve) => resolve(config.module(module.name)?),
            None => Err(TesseraError::ConfigError(format!(
                "{} recipe has no decoder",
                self.model_type
            ))),
        }
    }

    /// Fused-QKV split layouts for every decoder module.
    pub fn qkv_layouts(&self, config: &ModelConfig) -> Result<Vec<QkvLayout>> {
        self.modules
            .iter()
            .filter_map(|m| m.text_config.map(|resolve| (m, resolve)))
            .map(|(m, resolve)| {
                let text = resolve(config.module(m.name)?)?;
                Ok(QkvLayout::from_config(&m.key_prefix(), &text))
            })
            .collect()
    }

    /// Check that `config` is of this recipe's type and carries every module.
    pub fn check(&self, config: &ModelConfig) -> Result<()> {
        if config.model_type != self.model_type {
            return Err(TesseraError::ConfigError(format!(
                "{} config given to the {} recipe",
                config.model_type, self.model_type
            )));
        }
        for module in self.modules {
            config.module(module.name)?;
        }
        Ok(())
    }
}

/// Built modules keyed by recipe module name.
#[derive(Debug, Default)]
pub struct BuiltModules {
    modules: BTreeMap<&'static str, BuiltModule>,
}

impl BuiltModules {
    /// Empty set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a built module.
    pub fn insert(&mut self, name: &'static str, module: BuiltModule) {
        self.modules.insert(name, module);
    }

    fn take(&mut self, name: &str) -> Result<BuiltModule> {
        self.modules.remove(name).ok_or_else(|| {
            TesseraError::StateError(format!("module {name:?} was not built"))
        })
    }

    fn take_decoder(&mut self, name: &str) -> Result<Decoder> {
        match self.take(name)? {
            BuiltModule::Decoder(d) => Ok(d),
            other => Err(mismatch(name, "decoder", &other)),
        }
    }
}

fn mismatch(name: &str, expected: &str, got: &BuiltModule) -> TesseraError {
    TesseraError::StateError(format!(
        "module {name:?} must be a {expected}, got a {}",
        got.kind()
    ))
}

fn decoder_options(ctx: &BuildContext) -> DecoderOptions {
    DecoderOptions::default().with_shard(ctx.shard.clone())
}

fn build_text_decoder(params: &Value, vb: VarBuilder, ctx: &BuildContext) -> Result<BuiltModule> {
    let config = TransformerConfig::from_params(params)?;
    Ok(BuiltModule::Decoder(Decoder::new(&config, vb, decoder_options(ctx))?))
}

fn build_llama3_1_decoder(
    params: &Value,
    vb: VarBuilder,
    ctx: &BuildContext,
) -> Result<BuiltModule> {
    let config = llama3_1_config(params)?;
    Ok(BuiltModule::Decoder(Decoder::new(&config, vb, decoder_options(ctx))?))
}

fn build_fusion_decoder(params: &Value, vb: VarBuilder, ctx: &BuildContext) -> Result<BuiltModule> {
    let config = fusion_decoder_config(params)?;
    Ok(BuiltModule::Decoder(Decoder::new(&config, vb, decoder_options(ctx))?))
}

fn build_llava_decoder(params: &Value, vb: VarBuilder, ctx: &BuildContext) -> Result<BuiltModule> {
    let config = TransformerConfig::from_params(params)?;
    let options = decoder_options(ctx).without_embedding();
    Ok(BuiltModule::Decoder(Decoder::new(&config, vb, options)?))
}

fn build_clip_encoder(params: &Value, vb: VarBuilder, _ctx: &BuildContext) -> Result<BuiltModule> {
    let config = VisionConfig::from_params(params)?;
    Ok(BuiltModule::Vision(VisionEncoder::new(&config, vb)?))
}

fn build_flamingo_encoder(
    params: &Value,
    vb: VarBuilder,
    _ctx: &BuildContext,
) -> Result<BuiltModule> {
    let config = FlamingoEncoderConfig::from_params(params)?;
    Ok(BuiltModule::FlamingoVision(FlamingoEncoder::new(&config, vb)?))
}

fn fuse_text_only(mut modules: BuiltModules, _vb: VarBuilder) -> Result<Architecture> {
    Ok(Architecture::TextOnly(modules.take_decoder("text")?))
}

fn fuse_llama3_1(mut modules: BuiltModules, _vb: VarBuilder) -> Result<Architecture> {
    Ok(Architecture::Llama3_1(modules.take_decoder("text")?))
}

fn fuse_deep(mut modules: BuiltModules, _vb: VarBuilder) -> Result<Architecture> {
    let encoder = match modules.take("encoder")? {
        BuiltModule::FlamingoVision(e) => e,
        other => return Err(mismatch("encoder", "flamingo encoder", &other)),
    };
    let decoder = modules.take_decoder("decoder")?;
    Ok(Architecture::Flamingo(DeepFusion::new(encoder, decoder)))
}

fn fuse_concat(mut modules: BuiltModules, vb: VarBuilder) -> Result<Architecture> {
    let encoder = match modules.take("encoder")? {
        BuiltModule::Vision(e) => e,
        other => return Err(mismatch("encoder", "vision encoder", &other)),
    };
    let decoder = modules.take_decoder("decoder")?;
    Ok(Architecture::Llava(ConcatFusion::new(encoder, decoder, vb)?))
}
