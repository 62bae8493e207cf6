use anyhow::{Context, Result};
use candle_core::{DType, Device, IndexOp, Module, Tensor, D};
use candle_transformers::models::stable_diffusion::{
    self, clip::ClipTextTransformer, ddim::DDIMSchedulerConfig, schedulers::SchedulerConfig,
    unet_2d::UNet2DConditionModel, vae::AutoEncoderKL,
};
use hf_hub::api::tokio::Api;
use image::DynamicImage;
use rand::{rngs::StdRng, SeedableRng};

use crate::schedule::load_schedule_config;
use crate::{
    seeded_randn, select_best_device, tensor_to_image, DeviceMap, GenerationParams, Loader,
    ModelFamily, ModelFiles, ModelLike, PromptTokenizer, ResolvedModel,
};

pub(crate) const UNET_WEIGHTS: &str = "unet/diffusion_pytorch_model.safetensors";
pub(crate) const VAE_WEIGHTS: &str = "vae/diffusion_pytorch_model.safetensors";

/// One CLIP text encoder with the tokenizer it was trained with.
pub(crate) struct TextConditioner {
    pub tokenizer: PromptTokenizer,
    pub model: ClipTextTransformer,
}

impl TextConditioner {
    fn embed(&self, prompt: &str, device: &Device) -> Result<Tensor> {
        let tokens = self.tokenizer.encode(prompt, device)?;
        Ok(self.model.forward(&tokens)?)
    }
}

/// Loads the tokenizer and text encoder for every encoder of `family`.
pub(crate) async fn load_text_conditioners(
    files: &ModelFiles<'_>,
    family: ModelFamily,
    device: &Device,
) -> Result<Vec<TextConditioner>> {
    let mut conditioners = Vec::new();
    let configs = family.clip_configs();
    let layout = family.text_encoder_dirs().iter();
    let repos = family.tokenizer_repos().iter();
    for ((config, (encoder_dir, tokenizer_dir)), repo) in configs.iter().zip(layout).zip(repos) {
        let tokenizer_file = files
            .get_or_hub(&format!("{tokenizer_dir}/tokenizer.json"), repo, "tokenizer.json")
            .await?;
        let tokenizer = PromptTokenizer::from_file(tokenizer_file, config)?;
        let weights = files
            .get(&format!("{encoder_dir}/model.safetensors"))
            .await
            .context("failed to get text encoder weights")?;
        let model = stable_diffusion::build_clip_transformer(config, weights, device, DType::F32)
            .context("failed to load text encoder")?;
        conditioners.push(TextConditioner { tokenizer, model });
    }
    Ok(conditioners)
}

pub struct StableDiffusionModel {
    family: ModelFamily,
    device: Device,
    dtype: DType,
    text: Vec<TextConditioner>,
    unet: UNet2DConditionModel,
    vae: AutoEncoderKL,
    scheduler: DDIMSchedulerConfig,
}

impl StableDiffusionModel {
    pub fn family(&self) -> ModelFamily {
        self.family
    }

    /// Prompt embeddings, with the negative prompt's stacked in front when
    /// classifier-free guidance is on. SDXL joins both encoders on the last dim.
    fn text_embeddings(&self, params: &GenerationParams, guided: bool) -> Result<Tensor> {
        let negative = params.negative_prompt.as_deref().unwrap_or("");
        let mut per_encoder = Vec::with_capacity(self.text.len());
        for conditioner in &self.text {
            let cond = conditioner.embed(&params.prompt, &self.device)?;
            let emb = if guided {
                let uncond = conditioner.embed(negative, &self.device)?;
                Tensor::cat(&[uncond, cond], 0)?
            } else {
                cond
            };
            per_encoder.push(emb);
        }
        Ok(Tensor::cat(&per_encoder, D::Minus1)?.to_dtype(self.dtype)?)
    }
}

impl ModelLike for StableDiffusionModel {
    fn run(&mut self, params: &GenerationParams) -> Result<DynamicImage> {
        let mut scheduler = self.scheduler.build(params.steps)?;
        let guided = params.guidance_scale > 1.0;

        // --- Encode the prompt (and negative prompt) ---
        let text_embeddings = self.text_embeddings(params, guided)?;

        // --- Initial noise from a seeded host RNG ---
        let seed = params.seed.unwrap_or_else(rand::random);
        let mut rng = StdRng::seed_from_u64(seed);
        let latents = seeded_randn(
            (1, 4, params.height / 8, params.width / 8),
            &mut rng,
            &self.device,
        )?;
        let mut latents = (latents * scheduler.init_noise_sigma())?.to_dtype(self.dtype)?;

        // --- Denoise ---
        let timesteps = scheduler.timesteps().to_vec();
        for (index, &timestep) in timesteps.iter().enumerate() {
            let model_input = if guided {
                Tensor::cat(&[&latents, &latents], 0)?
            } else {
                latents.clone()
            };
            let model_input = scheduler.scale_model_input(model_input, timestep)?;
            let noise_pred = self
                .unet
                .forward(&model_input, timestep as f64, &text_embeddings)?;
            let noise_pred = if guided {
                let chunks = noise_pred.chunk(2, 0)?;
                let (uncond, cond) = (&chunks[0], &chunks[1]);
                (uncond + ((cond - uncond)? * params.guidance_scale)?)?
            } else {
                noise_pred
            };
            latents = scheduler.step(&noise_pred, timestep, &latents)?;
            tracing::debug!("step {}/{} done", index + 1, timesteps.len());
        }

        // --- Decode and convert to 8-bit RGB ---
        let decoded = self.vae.decode(&(latents / self.family.vae_scale())?)?;
        let img = ((decoded / 2.)? + 0.5)?.to_device(&Device::Cpu)?;
        let img = (img.clamp(0f32, 1.)? * 255.)?.to_dtype(DType::U8)?;
        tensor_to_image(&img.i(0)?)
    }
}

pub struct StableDiffusionLoader;

impl Loader for StableDiffusionLoader {
    type Model = StableDiffusionModel;

    async fn load(model: ResolvedModel, api: Api, device_map: DeviceMap) -> Result<Self::Model> {
        let device = select_best_device(device_map).context("failed to set up device")?;
        let dtype = if device.is_cpu() { DType::F32 } else { DType::F16 };
        tracing::info!("Device: {device:?}, Dtype: {dtype:?}");

        let family = model.family;
        let files = ModelFiles::new(&model.source, &api);
        let sd_config = family.sd_config();

        // --- Text encoders and tokenizers ---
        let text = load_text_conditioners(&files, family, &device).await?;

        // --- UNet ---
        let unet_weights = files
            .get(UNET_WEIGHTS)
            .await
            .context("failed to get unet weights")?;
        let use_flash_attn = cfg!(feature = "flash-attn");
        let unet = sd_config
            .build_unet(unet_weights, &device, 4, use_flash_attn, dtype)
            .context("failed to load unet")?;

        // --- VAE (the stock SDXL VAE overflows in f16) ---
        let vae_weights = if family == ModelFamily::Xl && dtype == DType::F16 {
            api.model("madebyollin/sdxl-vae-fp16-fix".to_string())
                .get("diffusion_pytorch_model.safetensors")
                .await
                .context("failed to get fp16 SDXL vae")?
        } else {
            files.get(VAE_WEIGHTS).await.context("failed to get vae weights")?
        };
        let vae = sd_config
            .build_vae(vae_weights, &device, dtype)
            .context("failed to load vae")?;

        // --- Sampler, with the prediction type the UNet was trained for ---
        let schedule = load_schedule_config(&files, &model).await?;
        let scheduler = schedule.ddim_config()?;
        tracing::info!("Scheduler prediction type: {}", schedule.prediction_type);

        tracing::info!("Loaded {} pipeline from {}", family.pipeline_class(), model.source);
        Ok(StableDiffusionModel {
            family,
            device,
            dtype,
            text,
            unet,
            vae,
            scheduler,
        })
    }
}
