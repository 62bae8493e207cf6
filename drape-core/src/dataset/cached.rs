use std::collections::HashMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use candle_core::{DType, Device, Tensor};
use indicatif::{ProgressBar, ProgressStyle};

use super::{CaptionedImages, ImageEncoder, LatentSource};
use crate::image_to_tensor;

pub const LATENTS_FILE: &str = "latents.safetensors";
pub const TEXTS_FILE: &str = "texts.json";
const LATENTS_KEY: &str = "latents";

#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("cache file {0} not found")]
    Missing(PathBuf),
    #[error("cache holds {latents} latents but {texts} texts")]
    LengthMismatch { latents: usize, texts: usize },
    #[error("cached latents must be (N, C, H, W), got {0:?}")]
    BadShape(Vec<usize>),
    #[error("failed to read cache {path}")]
    Read {
        path: PathBuf,
        #[source]
        source: anyhow::Error,
    },
}

/// Every latent and caption held in memory.
#[derive(Debug)]
pub struct CachedLatents {
    latents: Tensor,
    texts: Vec<String>,
}

impl CachedLatents {
    pub fn new(latents: Tensor, texts: Vec<String>) -> Result<Self, CacheError> {
        let dims = latents.dims().to_vec();
        if dims.len() != 4 {
            return Err(CacheError::BadShape(dims));
        }
        if dims[0] != texts.len() {
            return Err(CacheError::LengthMismatch {
                latents: dims[0],
                texts: texts.len(),
            });
        }
        Ok(Self { latents, texts })
    }

    pub fn latents(&self) -> &Tensor {
        &self.latents
    }

    pub fn texts(&self) -> &[String] {
        &self.texts
    }
}

impl LatentSource for CachedLatents {
    fn len(&self) -> usize {
        self.texts.len()
    }

    fn get(&self, index: usize) -> Result<(Tensor, String)> {
        let text = self
            .texts
            .get(index)
            .with_context(|| format!("index {index} out of range for {} cached examples", self.len()))?;
        Ok((self.latents.get(index)?, text.clone()))
    }
}

pub fn write_cache(dir: &Path, latents: &Tensor, texts: &[String]) -> Result<()> {
    std::fs::create_dir_all(dir)
        .with_context(|| format!("failed to create cache dir {}", dir.display()))?;
    let tensors = HashMap::from([(LATENTS_KEY.to_string(), latents.to_device(&Device::Cpu)?)]);
    candle_core::safetensors::save(&tensors, dir.join(LATENTS_FILE))?;
    let texts = serde_json::to_vec(texts)?;
    std::fs::write(dir.join(TEXTS_FILE), texts)?;
    Ok(())
}

/// Loads both cache files, rejecting a cache whose halves disagree.
pub fn load_cache(dir: &Path) -> Result<CachedLatents, CacheError> {
    let latents_path = dir.join(LATENTS_FILE);
    let texts_path = dir.join(TEXTS_FILE);
    for path in [&latents_path, &texts_path] {
        if !path.is_file() {
            return Err(CacheError::Missing(path.clone()));
        }
    }
    let read_err = |path: &Path| {
        let path = path.to_path_buf();
        move |source: anyhow::Error| CacheError::Read { path, source }
    };

    let mut tensors = candle_core::safetensors::load(&latents_path, &Device::Cpu)
        .map_err(anyhow::Error::from)
        .map_err(read_err(&latents_path))?;
    let latents = tensors
        .remove(LATENTS_KEY)
        .with_context(|| format!("missing tensor {LATENTS_KEY:?}"))
        .map_err(read_err(&latents_path))?
        .to_dtype(DType::F32)
        .map_err(anyhow::Error::from)
        .map_err(read_err(&latents_path))?;

    let raw = std::fs::read(&texts_path)
        .map_err(anyhow::Error::from)
        .map_err(read_err(&texts_path))?;
    let texts: Vec<String> = serde_json::from_slice(&raw)
        .map_err(anyhow::Error::from)
        .map_err(read_err(&texts_path))?;

    CachedLatents::new(latents, texts)
}

/// Like [`load_cache`], but a cache that was never written is `None`.
pub fn open_cache(dir: &Path) -> Result<Option<CachedLatents>, CacheError> {
    match load_cache(dir) {
        Ok(cache) => Ok(Some(cache)),
        Err(CacheError::Missing(path)) => {
            tracing::debug!("{} not found", path.display());
            Ok(None)
        }
        Err(err) => Err(err),
    }
}

/// Encodes every image of `images` and writes the cache to `cache_dir`.
pub fn preprocess<D: CaptionedImages + ?Sized, E: ImageEncoder>(
    images: &D,
    encoder: &E,
    resolution: usize,
    scale: f64,
    batch_size: usize,
    device: &Device,
    cache_dir: &Path,
) -> Result<CachedLatents> {
    anyhow::ensure!(!images.is_empty(), "dataset {} is empty", images.describe());
    anyhow::ensure!(batch_size > 0, "batch size must be positive");
    tracing::info!(
        "Encoding {} images from {} to latent space at {resolution}x{resolution}",
        images.len(),
        images.describe()
    );

    let progress = ProgressBar::new(images.len() as u64);
    progress.set_style(
        ProgressStyle::with_template("{bar:40} {pos}/{len} [{elapsed_precise}<{eta_precise}]")
            .unwrap_or_else(|_| ProgressStyle::default_bar()),
    );

    let mut all_latents = Vec::new();
    let mut all_texts = Vec::with_capacity(images.len());
    let indices: Vec<usize> = (0..images.len()).collect();
    for chunk in indices.chunks(batch_size) {
        let mut pixels = Vec::with_capacity(chunk.len());
        for &index in chunk {
            let (image, text) = images.get(index)?;
            pixels.push(image_to_tensor(&image, resolution, device)?);
            all_texts.push(text);
        }
        let batch = Tensor::stack(&pixels, 0)?;
        let latents = (encoder.encode_latents(&batch)? * scale)?;
        all_latents.push(latents.to_device(&Device::Cpu)?);
        progress.inc(chunk.len() as u64);
    }
    progress.finish_and_clear();

    let latents = Tensor::cat(&all_latents, 0)?;
    tracing::info!("Latent shape: {:?}", latents.dims());
    write_cache(cache_dir, &latents, &all_texts)?;
    tracing::info!("Cached {} images to {}", all_texts.len(), cache_dir.display());
    Ok(CachedLatents::new(latents, all_texts)?)
}
