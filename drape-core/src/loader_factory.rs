use std::future::Future;

use anyhow::Result;
use candle_transformers::models::stable_diffusion::{
    clip,
    unet_2d::{BlockConfig, UNet2DConditionModelConfig},
    StableDiffusionConfig,
};
use hf_hub::api::tokio::Api;
use serde::{Deserialize, Serialize};

use crate::{DeviceMap, Loader, ModelLike, ResolvedModel, StableDiffusionLoader};

/// Pipeline variants we know how to build.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ModelFamily {
    #[serde(rename = "v1-5")]
    V1_5,
    #[serde(rename = "v2-1")]
    V2_1,
    #[serde(rename = "xl")]
    Xl,
}

serde_plain::derive_display_from_serialize!(ModelFamily);
serde_plain::derive_fromstr_from_deserialize!(ModelFamily);

/// Known repository prefixes, checked before the name heuristic.
const FAMILY_PREFIXES: &[(&str, ModelFamily)] = &[
    ("stabilityai/stable-diffusion-xl", ModelFamily::Xl),
    ("stabilityai/sdxl", ModelFamily::Xl),
    ("stabilityai/stable-diffusion-2", ModelFamily::V2_1),
    ("runwayml/stable-diffusion-v1", ModelFamily::V1_5),
    ("compvis/stable-diffusion-v1", ModelFamily::V1_5),
];

impl ModelFamily {
    /// Classifies a hub id or path. Unknown names containing "xl" are SDXL,
    /// everything else is treated as a v1.5 derivative.
    pub fn detect(name: &str) -> Self {
        let lower = name.to_lowercase();
        if let Some((_, family)) = FAMILY_PREFIXES
            .iter()
            .find(|(prefix, _)| lower.starts_with(prefix))
        {
            return *family;
        }
        if lower.contains("xl") {
            ModelFamily::Xl
        } else {
            ModelFamily::V1_5
        }
    }

    /// UNet and VAE architecture. Its built-in scheduler is never used: the
    /// sampler comes from the pipeline's own scheduler config.
    pub fn sd_config(&self) -> StableDiffusionConfig {
        match self {
            Self::V1_5 => StableDiffusionConfig::v1_5(None, None, None),
            Self::V2_1 => StableDiffusionConfig::v2_1(None, None, None),
            Self::Xl => StableDiffusionConfig::sdxl(None, None, None),
        }
    }

    /// Text encoder configs in the order their embeddings are concatenated.
    pub fn clip_configs(&self) -> Vec<clip::Config> {
        match self {
            Self::V1_5 => vec![clip::Config::v1_5()],
            Self::V2_1 => vec![clip::Config::v2_1()],
            Self::Xl => vec![clip::Config::sdxl(), clip::Config::sdxl2()],
        }
    }

    /// (weights file, tokenizer dir) inside a pipeline, per text encoder.
    pub fn text_encoder_dirs(&self) -> &'static [(&'static str, &'static str)] {
        match self {
            Self::V1_5 | Self::V2_1 => &[("text_encoder", "tokenizer")],
            Self::Xl => &[
                ("text_encoder", "tokenizer"),
                ("text_encoder_2", "tokenizer_2"),
            ],
        }
    }

    /// Hub repositories providing a `tokenizer.json` for each text encoder.
    pub fn tokenizer_repos(&self) -> &'static [&'static str] {
        match self {
            Self::V1_5 | Self::V2_1 => &["openai/clip-vit-base-patch32"],
            Self::Xl => &[
                "openai/clip-vit-base-patch32",
                "laion/CLIP-ViT-bigG-14-laion2B-39B-b160k",
            ],
        }
    }

    /// Multiplier applied to VAE latents.
    pub fn vae_scale(&self) -> f64 {
        match self {
            Self::V1_5 | Self::V2_1 => 0.18215,
            Self::Xl => 0.13025,
        }
    }

    pub fn default_size(&self) -> usize {
        match self {
            Self::V1_5 => 512,
            Self::V2_1 => 768,
            Self::Xl => 1024,
        }
    }

    /// UNet architecture, needed when the UNet is built from trainable vars.
    pub fn unet_config(&self) -> UNet2DConditionModelConfig {
        let bc = |out_channels, use_cross_attn, attention_head_dim| BlockConfig {
            out_channels,
            use_cross_attn,
            attention_head_dim,
        };
        match self {
            Self::V1_5 => UNet2DConditionModelConfig {
                blocks: vec![
                    bc(320, Some(1), 8),
                    bc(640, Some(1), 8),
                    bc(1280, Some(1), 8),
                    bc(1280, None, 8),
                ],
                center_input_sample: false,
                cross_attention_dim: 768,
                downsample_padding: 1,
                flip_sin_to_cos: true,
                freq_shift: 0.,
                layers_per_block: 2,
                mid_block_scale_factor: 1.,
                norm_eps: 1e-5,
                norm_num_groups: 32,
                sliced_attention_size: None,
                use_linear_projection: false,
            },
            Self::V2_1 => UNet2DConditionModelConfig {
                blocks: vec![
                    bc(320, Some(1), 5),
                    bc(640, Some(1), 10),
                    bc(1280, Some(1), 20),
                    bc(1280, None, 20),
                ],
                center_input_sample: false,
                cross_attention_dim: 1024,
                downsample_padding: 1,
                flip_sin_to_cos: true,
                freq_shift: 0.,
                layers_per_block: 2,
                mid_block_scale_factor: 1.,
                norm_eps: 1e-5,
                norm_num_groups: 32,
                sliced_attention_size: None,
                use_linear_projection: true,
            },
            Self::Xl => UNet2DConditionModelConfig {
                blocks: vec![bc(320, None, 5), bc(640, Some(2), 10), bc(1280, Some(10), 20)],
                center_input_sample: false,
                cross_attention_dim: 2048,
                downsample_padding: 1,
                flip_sin_to_cos: true,
                freq_shift: 0.,
                layers_per_block: 2,
                mid_block_scale_factor: 1.,
                norm_eps: 1e-5,
                norm_num_groups: 32,
                sliced_attention_size: None,
                use_linear_projection: true,
            },
        }
    }

    pub fn pipeline_class(&self) -> &'static str {
        match self {
            Self::V1_5 | Self::V2_1 => "StableDiffusionPipeline",
            Self::Xl => "StableDiffusionXLPipeline",
        }
    }
}

/// Load a pipeline for the resolved model.
pub async fn load_model(
    model: ResolvedModel,
    api: Api,
    device_map: DeviceMap,
) -> Result<Box<dyn ModelLike>> {
    tracing::info!(
        "Loading model: {} (detected family: {})",
        model.source,
        model.family
    );
    let model = StableDiffusionLoader::load(model, api, device_map).await?;
    Ok(Box::new(model))
}

/// Runs `load` for `primary`; on failure retries once with the default
/// model and returns whichever succeeded together with what was loaded.
pub async fn load_with_fallback<M, F, Fut>(
    primary: ResolvedModel,
    mut load: F,
) -> Result<(M, ResolvedModel)>
where
    F: FnMut(ResolvedModel) -> Fut,
    Fut: Future<Output = Result<M>>,
{
    match load(primary.clone()).await {
        Ok(model) => Ok((model, primary)),
        Err(err) => {
            tracing::warn!("Error loading model {}: {err:#}", primary.source);
            let fallback = ResolvedModel::default_model();
            tracing::warn!("Falling back to {}", fallback.source);
            let model = load(fallback.clone()).await?;
            Ok((model, fallback))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ModelSource;

    #[test]
    fn detects_family_from_prefix_table_and_heuristic() {
        assert_eq!(
            ModelFamily::detect("stabilityai/stable-diffusion-xl-base-1.0"),
            ModelFamily::Xl
        );
        assert_eq!(
            ModelFamily::detect("stabilityai/stable-diffusion-2-1"),
            ModelFamily::V2_1
        );
        assert_eq!(ModelFamily::detect("someone/Juggernaut-XL"), ModelFamily::Xl);
        assert_eq!(ModelFamily::detect("Lykon/DreamShaper"), ModelFamily::V1_5);
        assert_eq!(ModelFamily::detect("./models/clothes-diffusion"), ModelFamily::V1_5);
    }

    #[test]
    fn family_parses_and_displays() {
        assert_eq!("xl".parse::<ModelFamily>().unwrap(), ModelFamily::Xl);
        assert_eq!(ModelFamily::V1_5.to_string(), "v1-5");
        assert!("v3".parse::<ModelFamily>().is_err());
    }

    #[tokio::test]
    async fn fallback_retries_once_with_default() {
        let mut attempts = Vec::new();
        let (loaded, resolved) = load_with_fallback(ResolvedModel::hub("broken/model"), |m| {
            attempts.push(m.source.clone());
            async move {
                match m.source {
                    ModelSource::Hub(ref id) if id == "broken/model" => anyhow::bail!("no such repo"),
                    _ => Ok(m.source.to_string()),
                }
            }
        })
        .await
        .unwrap();
        assert!(resolved.is_default());
        assert_eq!(loaded, crate::DEFAULT_MODEL_ID);
        assert_eq!(attempts.len(), 2);
    }

    #[tokio::test]
    async fn fallback_failure_propagates() {
        let result: Result<((), ResolvedModel)> =
            load_with_fallback(ResolvedModel::hub("broken/model"), |_| async {
                anyhow::bail!("offline")
            })
            .await;
        assert_eq!(result.unwrap_err().to_string(), "offline");
    }

    #[test]
    fn primary_success_skips_fallback() {
        let rt = tokio::runtime::Builder::new_current_thread().build().unwrap();
        let (_, resolved) = rt
            .block_on(load_with_fallback(ResolvedModel::hub("sdxl-base"), |_| async {
                Ok(())
            }))
            .unwrap();
        assert_eq!(resolved.family, ModelFamily::Xl);
    }
}
