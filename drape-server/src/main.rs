use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::builder::FalseyValueParser;
use clap::{ArgAction, Parser};
use drape_core::{
    load_model, load_with_fallback, resolve, DeviceMap, GenerationDefaults, Generator,
    DEFAULT_MODEL_ID,
};
use hf_hub::api::tokio::Api;
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;

mod routes;

use routes::{router, AppState};

#[derive(Parser, Debug)]
#[command(author, version, about = "Clothing image generation server")]
struct Args {
    /// Use CPU instead of GPU
    #[arg(long)]
    cpu: bool,

    /// Hugging Face model id or alias
    #[arg(long, env = "MODEL_ID", default_value = DEFAULT_MODEL_ID)]
    model_id: String,

    /// Local pipeline directory, preferred over the model id when it exists
    #[arg(long, env = "MODEL_PATH")]
    model_path: Option<PathBuf>,

    /// Where generated images are written and served from
    #[arg(long, env = "OUTPUT_DIR", default_value = "./outputs")]
    output_dir: PathBuf,

    #[arg(long, env = "DEFAULT_STEPS", default_value_t = 30)]
    default_steps: usize,

    #[arg(long, env = "DEFAULT_GUIDANCE", default_value_t = 7.5)]
    default_guidance: f64,

    /// Host address to bind the server to
    #[arg(long, env = "HOST", default_value = "0.0.0.0")]
    host: String,

    /// Port to bind the server to
    #[arg(long, env = "PORT", default_value_t = 5001)]
    port: u16,

    /// Log at debug level. `DEBUG` is case-insensitive, so `True` and `FALSE` work
    #[arg(
        long,
        env = "DEBUG",
        action = ArgAction::SetTrue,
        value_parser = FalseyValueParser::new()
    )]
    debug: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    let args = Args::parse();

    let level = if args.debug { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level)))
        .init();

    // --- Load the model once, falling back to the default id ---
    let api = Api::new()?;
    let device_map = DeviceMap::from_cpu_flag(args.cpu);
    let requested = resolve(args.model_path.as_deref(), Some(&args.model_id));
    let (model, loaded) =
        load_with_fallback(requested, |m| load_model(m, api.clone(), device_map))
            .await
            .context("failed to load any model")?;
    tracing::info!("Model loaded successfully: {}", loaded.source);

    let state = AppState {
        generator: Arc::new(Generator::new(model, &args.output_dir)),
        defaults: GenerationDefaults {
            steps: args.default_steps,
            guidance_scale: args.default_guidance,
            ..Default::default()
        },
    };

    // --- Start the server ---
    let bind_address = format!("{}:{}", args.host, args.port);
    let listener = TcpListener::bind(&bind_address)
        .await
        .with_context(|| format!("failed to bind {bind_address}"))?;
    tracing::info!("Started server on {}", listener.local_addr()?);
    tracing::info!("Images are written to {}", args.output_dir.display());
    axum::serve(listener, router(state))
        .with_graceful_shutdown(async {
            tokio::signal::ctrl_c().await.ok();
            tracing::info!("Shutting down");
        })
        .await?;

    Ok(())
}
