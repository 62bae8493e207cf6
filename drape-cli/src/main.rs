use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use drape_core::dataset::{
    open_cache, open_images, preprocess, LiveLatents, TrainingDataset, DEFAULT_DATASET_ID,
};
use drape_core::registry::is_local_pipeline;
use drape_core::training::{
    export_pipeline, load_training_components, load_vae, NoiseSchedule, PipelineExport, Trainer,
    TrainingComponents, TrainingConfig,
};
use drape_core::{
    load_model, load_with_fallback, popular_models, resolve, select_best_device, DeviceMap,
    GenerationDefaults, GenerationRequest, Generator, ResolvedModel, DEFAULT_MODEL_ID,
};
use hf_hub::api::tokio::Api;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(author, version, about = "Generate and fine-tune clothing images with Stable Diffusion")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Generate one image from a text prompt
    Generate(GenerateArgs),
    /// Encode a dataset to latents once and cache them
    Preprocess(PreprocessArgs),
    /// Fine-tune the UNet on captioned clothing images
    Train(TrainArgs),
    /// List the model aliases accepted by --model-id
    Models,
}

#[derive(clap::Args, Debug)]
struct GenerateArgs {
    /// Text description of the clothing item
    #[arg(long)]
    prompt: String,

    /// Hugging Face model id or alias
    #[arg(long)]
    model_id: Option<String>,

    /// Local pipeline directory, e.g. the output of `drape train`
    #[arg(long)]
    model_path: Option<PathBuf>,

    /// Output directory
    #[arg(long, default_value = "./outputs")]
    output_path: PathBuf,

    #[arg(long, default_value_t = 50)]
    steps: usize,

    #[arg(long, default_value_t = 7.5)]
    guidance: f64,

    #[arg(long, default_value_t = 512)]
    height: usize,

    #[arg(long, default_value_t = 512)]
    width: usize,

    #[arg(long)]
    seed: Option<u64>,

    /// What the image should not contain
    #[arg(long)]
    negative_prompt: Option<String>,

    /// Use CPU instead of GPU
    #[arg(long)]
    cpu: bool,
}

#[derive(clap::Args, Debug)]
struct PreprocessArgs {
    /// Hugging Face dataset with `image` and `text` columns
    #[arg(long, default_value = DEFAULT_DATASET_ID)]
    dataset: String,

    /// Local image folder with a metadata.jsonl of {"file_name", "text"}
    /// records, used instead of --dataset
    #[arg(long)]
    dataset_dir: Option<PathBuf>,

    #[arg(long, default_value = DEFAULT_MODEL_ID)]
    pretrained_model: String,

    #[arg(long, default_value = "./data/cached_latents")]
    cache_dir: PathBuf,

    #[arg(long, default_value_t = 512)]
    resolution: usize,

    #[arg(long, default_value_t = 8)]
    batch_size: usize,

    /// Use CPU instead of GPU
    #[arg(long)]
    cpu: bool,
}

#[derive(clap::Args, Debug)]
struct TrainArgs {
    #[arg(long, default_value = DEFAULT_MODEL_ID)]
    pretrained_model: String,

    /// Hugging Face dataset, only read when no latent cache exists
    #[arg(long, default_value = DEFAULT_DATASET_ID)]
    dataset: String,

    /// Local image folder used instead of --dataset
    #[arg(long)]
    dataset_dir: Option<PathBuf>,

    #[arg(long, default_value = "./models/clothes-diffusion")]
    output_dir: PathBuf,

    #[arg(long, default_value_t = 1)]
    batch_size: usize,

    #[arg(long, default_value_t = 1e-5)]
    learning_rate: f64,

    #[arg(long, default_value_t = 1000)]
    max_steps: usize,

    #[arg(long, default_value_t = 512)]
    resolution: usize,

    #[arg(long, default_value = "./data/cached_latents")]
    cache_dir: PathBuf,

    #[arg(long, default_value_t = 4)]
    gradient_accumulation_steps: usize,

    #[arg(long, default_value_t = 42)]
    seed: u64,

    /// Use CPU instead of GPU
    #[arg(long)]
    cpu: bool,
}

/// A local pipeline directory when `name` is one, otherwise a hub id.
fn resolve_pretrained(name: &str) -> ResolvedModel {
    let path = Path::new(name);
    if is_local_pipeline(path) {
        ResolvedModel::local(path)
    } else {
        ResolvedModel::hub(name)
    }
}

async fn generate(args: GenerateArgs) -> Result<()> {
    let api = Api::new()?;
    let device_map = DeviceMap::from_cpu_flag(args.cpu);
    let requested = resolve(args.model_path.as_deref(), args.model_id.as_deref());
    let (model, _) = load_with_fallback(requested, |m| load_model(m, api.clone(), device_map))
        .await
        .context("failed to load any model")?;

    let request = GenerationRequest {
        prompt: args.prompt,
        steps: Some(args.steps),
        guidance_scale: Some(args.guidance),
        height: Some(args.height),
        width: Some(args.width),
        seed: args.seed,
        negative_prompt: args.negative_prompt,
    };
    let params = request.resolve(&GenerationDefaults::default())?;
    let generator = Generator::new(model, &args.output_path);
    let image = generator.generate(&params)?;
    println!("{}", image.path.display());
    Ok(())
}

async fn preprocess_dataset(args: PreprocessArgs) -> Result<()> {
    let device = select_best_device(DeviceMap::from_cpu_flag(args.cpu))?;
    let api = Api::new()?;
    let model = resolve_pretrained(&args.pretrained_model);
    let images = open_images(args.dataset_dir.as_deref(), &args.dataset, &api).await?;
    let vae = load_vae(&model, &api, &device).await?;
    preprocess(
        &*images,
        &vae,
        args.resolution,
        model.family.vae_scale(),
        args.batch_size,
        &device,
        &args.cache_dir,
    )?;
    Ok(())
}

async fn train(args: TrainArgs) -> Result<()> {
    let device = select_best_device(DeviceMap::from_cpu_flag(args.cpu))?;
    let api = Api::new()?;
    let model = resolve_pretrained(&args.pretrained_model);
    let TrainingComponents {
        family,
        tokenizer,
        text_encoder,
        unet,
        params,
        schedule,
        text_encoder_weights,
        vae_weights,
    } = load_training_components(&model, &api, &device).await?;

    let config = TrainingConfig {
        family,
        output_dir: args.output_dir.clone(),
        train_batch_size: args.batch_size,
        gradient_accumulation_steps: args.gradient_accumulation_steps,
        learning_rate: args.learning_rate,
        max_train_steps: args.max_steps,
        seed: args.seed,
        base_model: Some(model.source.to_pointer()),
    };
    let noise_schedule = NoiseSchedule::new(schedule.clone())?;
    let mut trainer = Trainer::new(config, unet, text_encoder, params, noise_schedule, device.clone())?;

    let summary = match open_cache(&args.cache_dir)? {
        Some(cache) => {
            tracing::info!("Using cached latents from {}", args.cache_dir.display());
            trainer.run(&TrainingDataset::new(cache, tokenizer.clone()))?
        }
        None => {
            tracing::warn!(
                "No cached latents at {}, encoding images on the fly (slower)",
                args.cache_dir.display()
            );
            let images = open_images(args.dataset_dir.as_deref(), &args.dataset, &api).await?;
            let vae = load_vae(&model, &api, &device).await?;
            let live = LiveLatents::new(images, vae, args.resolution, family.vae_scale(), device);
            trainer.run(&TrainingDataset::new(live, tokenizer.clone()))?
        }
    };
    tracing::info!(
        "Ran {} steps ({} optimizer updates) over {} epochs, {} checkpoints",
        summary.steps,
        summary.optimizer_steps,
        summary.epochs,
        summary.checkpoints.len()
    );

    export_pipeline(
        &args.output_dir,
        &PipelineExport {
            family,
            unet: trainer.params(),
            tokenizer: &tokenizer,
            text_encoder_weights: &text_encoder_weights,
            vae_weights: &vae_weights,
            schedule: &schedule,
        },
    )?;
    println!("{}", args.output_dir.display());
    Ok(())
}

fn list_models() {
    println!("{:<24} MODEL ID", "ALIAS");
    for (alias, model_id) in popular_models() {
        println!("{alias:<24} {model_id}");
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    match Cli::parse().command {
        Command::Generate(args) => generate(args).await,
        Command::Preprocess(args) => preprocess_dataset(args).await,
        Command::Train(args) => train(args).await,
        Command::Models => {
            list_models();
            Ok(())
        }
    }
}
