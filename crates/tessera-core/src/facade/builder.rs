//! Model construction from a config and a parameter source.

use super::model::Model;
use crate::config::ModelConfig;
use crate::distributed::{shard_params, ShardContext};
use crate::error::Result;
use crate::model::{collect_vars, remap_params, ParamSource};
use crate::recipe::{BuildContext, BuiltModules, ModelRecipe};
use crate::stats::ParamStats;
use candle_core::{DType, Device, Tensor};
use candle_nn::{VarBuilder, VarMap};
use std::collections::HashMap;
use tracing::{debug, info};

/// Builder for a [`Model`].
///
/// # Example
///
/// ```ignore
/// let model = ModelBuilder::new(config)
///     .device(Device::Cpu)
///     .dtype(DType::F32)
///     .params(ParamSource::Tensors(checkpoint))
///     .build()?;
/// ```
#[derive(Debug, Clone)]
pub struct ModelBuilder {
    config: ModelConfig,
    device: Device,
    dtype: DType,
    params: ParamSource,
    shard: Option<ShardContext>,
}

impl ModelBuilder {
    /// Random parameters on CPU in f32 unless configured otherwise.
    pub fn new(config: ModelConfig) -> Self {
        Self {
            config,
            device: Device::Cpu,
            dtype: DType::F32,
            params: ParamSource::Random,
            shard: None,
        }
    }

    /// Target device.
    pub fn device(mut self, device: Device) -> Self {
        self.device = device;
        self
    }

    /// Parameter dtype.
    pub fn dtype(mut self, dtype: DType) -> Self {
        self.dtype = dtype;
        self
    }

    /// Parameter source.
    pub fn params(mut self, params: ParamSource) -> Self {
        self.params = params;
        self
    }

    /// Build as one participant of a tensor-parallel group. Named parameters
    /// are expected unsharded and are split for this participant.
    pub fn shard(mut self, shard: ShardContext) -> Self {
        self.shard = Some(shard);
        self
    }

    /// Build the model.
    pub fn build(self) -> Result<Model> {
        let recipe = ModelRecipe::get(self.config.model_type);
        recipe.check(&self.config)?;
        for extra in self
            .config
            .modules
            .keys()
            .filter(|name| recipe.module(name).is_none())
        {
            debug!(module = %extra, "ignoring module without a recipe slot");
        }

        let (vb, varmap, tensors) = match &self.params {
            ParamSource::Random => {
                let varmap = VarMap::new();
                let vb = VarBuilder::from_varmap(&varmap, self.dtype, &self.device);
                (vb, Some(varmap), None)
            }
            ParamSource::Tensors(params) => {
                let params = self.prepare(recipe, params.clone())?;
                let vb = VarBuilder::from_tensors(params.clone(), self.dtype, &self.device);
                (vb, None, Some(params))
            }
        };

        let ctx = BuildContext {
            shard: self.shard.clone(),
        };
        let mut built = BuiltModules::new();
        for module in recipe.modules {
            let params = self.config.module(module.name)?;
            built.insert(module.name, (module.build)(params, module.scope(&vb), &ctx)?);
        }
        let arch = (recipe.fusion)(built, vb)?;

        let stats = match (&varmap, &tensors) {
            (Some(varmap), _) => ParamStats::from_tensors(&collect_vars(varmap)),
            (None, Some(tensors)) => ParamStats::from_tensors(tensors),
            (None, None) => ParamStats::default(),
        };
        info!(
            model_type = %self.config.model_type,
            rank = self.shard.as_ref().map_or(0, |s| s.rank()),
            world_size = self.shard.as_ref().map_or(1, |s| s.world_size()),
            random = varmap.is_some(),
            "built model"
        );
        Ok(Model::new(self.config, arch, stats))
    }

    /// Randomly initialized, unsharded parameters for this config, in the
    /// canonical namespace. Feeding them back through [`ParamSource::Tensors`]
    /// reproduces the same model.
    pub fn random_params(&self) -> Result<HashMap<String, Tensor>> {
        let recipe = ModelRecipe::get(self.config.model_type);
        recipe.check(&self.config)?;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, self.dtype, &self.device);
        let ctx = BuildContext::default();
        let mut built = BuiltModules::new();
        for module in recipe.modules {
            let params = self.config.module(module.name)?;
            built.insert(module.name, (module.build)(params, module.scope(&vb), &ctx)?);
        }
        (recipe.fusion)(built, vb)?;
        Ok(collect_vars(&varmap))
    }

    /// Remap checkpoint keys, then keep this participant's shard of every
    /// decoder parameter.
    fn prepare(
        &self,
        recipe: &ModelRecipe,
        params: HashMap<String, Tensor>,
    ) -> Result<HashMap<String, Tensor>> {
        let layouts = recipe.qkv_layouts(&self.config)?;
        let params = remap_params(params, &layouts)?;
        let Some(shard) = &self.shard else {
            return Ok(params);
        };

        let prefix = recipe.text_module()?.key_prefix();
        let (decoder, rest): (HashMap<_, _>, HashMap<_, _>) = params
            .into_iter()
            .partition(|(name, _)| name.starts_with(&prefix));
        let mut params = shard_params(decoder, shard.rank(), shard.world_size())?;
        params.extend(rest);
        Ok(params)
    }
}

/// Build `config` with random parameters on CPU in f32.
pub fn build(config: &ModelConfig) -> Result<Model> {
    ModelBuilder::new(config.clone()).build()
}
