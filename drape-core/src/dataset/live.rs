use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use candle_core::{Device, Tensor};
use candle_transformers::models::stable_diffusion::vae::AutoEncoderKL;
use image::DynamicImage;
use serde::{Deserialize, Serialize};

use super::{CaptionedImages, LatentSource};
use crate::image_to_tensor;

pub const METADATA_FILE: &str = "metadata.jsonl";

/// Maps a batch of pixels `(B, 3, H, W)` in [-1, 1] to unscaled latents.
pub trait ImageEncoder {
    fn encode_latents(&self, pixels: &Tensor) -> candle_core::Result<Tensor>;
}

impl ImageEncoder for AutoEncoderKL {
    fn encode_latents(&self, pixels: &Tensor) -> candle_core::Result<Tensor> {
        self.encode(pixels)?.sample()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FolderRecord {
    pub file_name: String,
    pub text: String,
}

/// Images and captions laid out as `metadata.jsonl` next to the image files,
/// one `{"file_name": ..., "text": ...}` object per line.
#[derive(Debug, Clone)]
pub struct ImageFolder {
    root: PathBuf,
    records: Vec<FolderRecord>,
}

impl ImageFolder {
    pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        let metadata = root.join(METADATA_FILE);
        let file = std::fs::File::open(&metadata)
            .with_context(|| format!("failed to open {}", metadata.display()))?;
        let mut records = Vec::new();
        for (line_no, line) in BufReader::new(file).lines().enumerate() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            let record: FolderRecord = serde_json::from_str(&line).with_context(|| {
                format!("{}:{}: malformed record", metadata.display(), line_no + 1)
            })?;
            records.push(record);
        }
        tracing::info!("Loaded {} examples from {}", records.len(), root.display());
        Ok(Self { root, records })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

impl CaptionedImages for ImageFolder {
    fn len(&self) -> usize {
        self.records.len()
    }

    fn get(&self, index: usize) -> Result<(DynamicImage, String)> {
        let record = self
            .records
            .get(index)
            .with_context(|| format!("index {index} out of range for {} examples", self.len()))?;
        let path = self.root.join(&record.file_name);
        let image =
            image::open(&path).with_context(|| format!("failed to open {}", path.display()))?;
        Ok((image, record.text.clone()))
    }

    fn describe(&self) -> String {
        self.root.display().to_string()
    }
}

/// Encodes each image through a frozen encoder when it is looked up.
pub struct LiveLatents<D, E> {
    images: D,
    encoder: E,
    resolution: usize,
    scale: f64,
    device: Device,
}

impl<D: CaptionedImages, E: ImageEncoder> LiveLatents<D, E> {
    pub fn new(images: D, encoder: E, resolution: usize, scale: f64, device: Device) -> Self {
        Self {
            images,
            encoder,
            resolution,
            scale,
            device,
        }
    }

    pub fn encoder(&self) -> &E {
        &self.encoder
    }
}

impl<D: CaptionedImages, E: ImageEncoder> LatentSource for LiveLatents<D, E> {
    fn len(&self) -> usize {
        self.images.len()
    }

    fn get(&self, index: usize) -> Result<(Tensor, String)> {
        let (image, text) = self.images.get(index)?;
        let pixels = image_to_tensor(&image, self.resolution, &self.device)?.unsqueeze(0)?;
        let latents = (self.encoder.encode_latents(&pixels)? * self.scale)?;
        Ok((latents.squeeze(0)?.to_device(&Device::Cpu)?, text))
    }
}
