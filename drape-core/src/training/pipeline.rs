use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use candle_core::{DType, Device};
use candle_nn::{VarBuilder, VarMap};
use candle_transformers::models::stable_diffusion::{
    clip::ClipTextTransformer, unet_2d::UNet2DConditionModel, vae::AutoEncoderKL,
};
use hf_hub::api::tokio::Api;
use serde_json::json;

use super::NoiseScheduleConfig;
use crate::schedule::{load_schedule_config, SCHEDULER_CONFIG};
use crate::stable_diffusion::{load_text_conditioners, UNET_WEIGHTS, VAE_WEIGHTS};
use crate::{ModelFamily, ModelFiles, PromptTokenizer, ResolvedModel};

const TEXT_ENCODER_WEIGHTS: &str = "text_encoder/model.safetensors";

/// Copies tensors from a safetensors file into every variable of `varmap`,
/// converting to each variable's dtype.
pub fn load_varmap_weights(varmap: &VarMap, path: &Path, device: &Device) -> Result<()> {
    // SAFETY: the file is not modified while mapped.
    let weights = unsafe { candle_core::safetensors::MmapedSafetensors::new(path)? };
    let vars = varmap
        .data()
        .lock()
        .map_err(|_| anyhow::anyhow!("variable map lock poisoned"))?;
    for (name, var) in vars.iter() {
        let tensor = weights
            .load(name, device)
            .with_context(|| format!("{} has no tensor {name}", path.display()))?;
        var.set(&tensor.to_dtype(var.dtype())?)?;
    }
    tracing::debug!("Loaded {} tensors from {}", vars.len(), path.display());
    Ok(())
}

/// Builds a UNet whose weights live in the returned [`VarMap`], initialized
/// from `weights`.
pub fn load_trainable_unet(
    family: ModelFamily,
    weights: &Path,
    device: &Device,
) -> Result<(UNet2DConditionModel, VarMap)> {
    let params = VarMap::new();
    let vb = VarBuilder::from_varmap(&params, DType::F32, device);
    let unet = UNet2DConditionModel::new(vb, 4, 4, false, family.unet_config())
        .context("failed to build unet")?;
    load_varmap_weights(&params, weights, device)?;
    Ok((unet, params))
}

pub async fn load_vae(model: &ResolvedModel, api: &Api, device: &Device) -> Result<AutoEncoderKL> {
    let files = ModelFiles::new(&model.source, api);
    let weights = files.get(VAE_WEIGHTS).await.context("failed to get vae weights")?;
    let vae = model
        .family
        .sd_config()
        .build_vae(weights, device, DType::F32)
        .context("failed to load vae")?;
    Ok(vae)
}

/// Everything fine-tuning needs from a pretrained pipeline.
pub struct TrainingComponents {
    pub family: ModelFamily,
    pub tokenizer: PromptTokenizer,
    pub text_encoder: ClipTextTransformer,
    pub unet: UNet2DConditionModel,
    pub params: VarMap,
    pub schedule: NoiseScheduleConfig,
    pub text_encoder_weights: PathBuf,
    pub vae_weights: PathBuf,
}

pub async fn load_training_components(
    model: &ResolvedModel,
    api: &Api,
    device: &Device,
) -> Result<TrainingComponents> {
    let family = model.family;
    anyhow::ensure!(
        family != ModelFamily::Xl,
        "fine-tuning {} pipelines is not supported",
        family.pipeline_class()
    );
    tracing::info!("Loading training components from {}", model.source);
    let files = ModelFiles::new(&model.source, api);

    let conditioner = load_text_conditioners(&files, family, device)
        .await?
        .into_iter()
        .next()
        .context("model family has no text encoder")?;
    let text_encoder_weights = files.get(TEXT_ENCODER_WEIGHTS).await?;
    let vae_weights = files.get(VAE_WEIGHTS).await?;

    let unet_weights = files
        .get(UNET_WEIGHTS)
        .await
        .context("failed to get unet weights")?;
    let (unet, params) = load_trainable_unet(family, &unet_weights, device)?;

    let schedule = load_schedule_config(&files, model).await?;
    tracing::info!("Training target: {}", schedule.prediction_type);

    Ok(TrainingComponents {
        family,
        tokenizer: conditioner.tokenizer,
        text_encoder: conditioner.model,
        unet,
        params,
        schedule,
        text_encoder_weights,
        vae_weights,
    })
}

/// The parts of a fine-tuned pipeline written by [`export_pipeline`].
pub struct PipelineExport<'a> {
    pub family: ModelFamily,
    pub unet: &'a VarMap,
    pub tokenizer: &'a PromptTokenizer,
    pub text_encoder_weights: &'a Path,
    pub vae_weights: &'a Path,
    pub schedule: &'a NoiseScheduleConfig,
}

/// Writes a pipeline directory that the generator can load back.
pub fn export_pipeline(output_dir: &Path, export: &PipelineExport<'_>) -> Result<()> {
    for dir in ["unet", "vae", "text_encoder", "tokenizer", "scheduler"] {
        std::fs::create_dir_all(output_dir.join(dir))
            .with_context(|| format!("failed to create {}", output_dir.join(dir).display()))?;
    }

    export.unet.save(output_dir.join(UNET_WEIGHTS))?;
    let unet_config = json!({"_class_name": "UNet2DConditionModel", "family": export.family});
    std::fs::write(
        output_dir.join("unet/config.json"),
        serde_json::to_string_pretty(&unet_config)?,
    )?;

    export.tokenizer.save(output_dir.join("tokenizer/tokenizer.json"))?;
    copy_file(export.text_encoder_weights, &output_dir.join(TEXT_ENCODER_WEIGHTS))?;
    copy_file(export.vae_weights, &output_dir.join(VAE_WEIGHTS))?;
    export.schedule.save(&output_dir.join(SCHEDULER_CONFIG))?;

    let index = json!({
        "_class_name": export.family.pipeline_class(),
        "family": export.family,
    });
    std::fs::write(
        output_dir.join("model_index.json"),
        serde_json::to_string_pretty(&index)?,
    )?;
    tracing::info!("Saved pipeline to {}", output_dir.display());
    Ok(())
}

fn copy_file(from: &Path, to: &Path) -> Result<()> {
    std::fs::copy(from, to)
        .with_context(|| format!("failed to copy {} to {}", from.display(), to.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tokenizer::tests::word_tokenizer;
    use crate::training::tests::tiny_parts;
    use crate::{resolve, ModelSource};
    use candle_core::Tensor;

    #[test]
    fn varmap_weights_load_by_name() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("weights.safetensors");
        let (_, _, trained) = tiny_parts();
        trained.save(&path).unwrap();

        let (_, _, fresh) = tiny_parts();
        load_varmap_weights(&fresh, &path, &Device::Cpu).unwrap();
        let get = |m: &VarMap| {
            let data = m.data().lock().unwrap();
            data["proj.weight"].as_tensor().flatten_all().unwrap().to_vec1::<f32>().unwrap()
        };
        assert_eq!(get(&fresh), get(&trained));
    }

    #[test]
    fn missing_tensor_is_reported_by_name() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("empty.safetensors");
        let other = Tensor::zeros(2, DType::F32, &Device::Cpu).unwrap();
        candle_core::safetensors::save(&std::collections::HashMap::from([("other", other)]), &path)
            .unwrap();
        let (_, _, params) = tiny_parts();
        let err = load_varmap_weights(&params, &path, &Device::Cpu).unwrap_err();
        assert!(format!("{err:#}").contains("has no tensor proj."));
    }

    #[test]
    fn exported_pipeline_resolves_as_local_model() {
        let scratch = tempfile::tempdir().unwrap();
        let text_encoder = scratch.path().join("te.safetensors");
        let vae = scratch.path().join("vae.safetensors");
        std::fs::write(&text_encoder, b"te").unwrap();
        std::fs::write(&vae, b"vae").unwrap();
        let (_, _, params) = tiny_parts();
        let tokenizer = word_tokenizer(8);
        let schedule = NoiseScheduleConfig::default();

        let out = scratch.path().join("clothes-diffusion");
        export_pipeline(
            &out,
            &PipelineExport {
                family: ModelFamily::V2_1,
                unet: &params,
                tokenizer: &tokenizer,
                text_encoder_weights: &text_encoder,
                vae_weights: &vae,
                schedule: &schedule,
            },
        )
        .unwrap();

        assert!(out.join(UNET_WEIGHTS).is_file());
        assert_eq!(std::fs::read(out.join(VAE_WEIGHTS)).unwrap(), b"vae");
        assert_eq!(std::fs::read(out.join(TEXT_ENCODER_WEIGHTS)).unwrap(), b"te");
        assert!(out.join("tokenizer/tokenizer.json").is_file());
        let schedule_back = NoiseScheduleConfig::from_file(&out.join(SCHEDULER_CONFIG)).unwrap();
        assert_eq!(schedule_back, schedule);

        let resolved = resolve(Some(out.as_path()), Some("runwayml/stable-diffusion-v1-5"));
        assert_eq!(resolved.source, ModelSource::Local(out.clone()));
        assert_eq!(resolved.family, ModelFamily::V2_1);
    }
}
