//! Training examples as (latent, token ids) pairs.
//!
//! Latents come from a [`LatentSource`]: either [`CachedLatents`] loaded
//! from a preprocessed cache, or [`LiveLatents`] which encodes
//! [`CaptionedImages`] on every lookup. The caller picks one up front and
//! [`TrainingDataset`] tokenizes the paired captions the same way for both.
//!
//! Raw images come from the hub dataset ([`fetch_dataset`]) or a local
//! [`ImageFolder`].

use std::path::Path;

use anyhow::{Context, Result};
use candle_core::{Device, Tensor};
use hf_hub::api::tokio::Api;
use image::DynamicImage;

use crate::PromptTokenizer;

mod cached;
mod hub;
mod live;

pub use cached::{load_cache, open_cache, preprocess, write_cache, CacheError, CachedLatents};
pub use cached::{LATENTS_FILE, TEXTS_FILE};
pub use hub::{fetch_dataset, split_files, ParquetImages, DEFAULT_DATASET_ID, DEFAULT_SPLIT};
pub use live::{FolderRecord, ImageEncoder, ImageFolder, LiveLatents};

/// Images paired with their captions, before any encoding.
pub trait CaptionedImages {
    fn len(&self) -> usize;

    fn get(&self, index: usize) -> Result<(DynamicImage, String)>;

    /// Where the examples come from, for logs.
    fn describe(&self) -> String;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<T: CaptionedImages + ?Sized> CaptionedImages for Box<T> {
    fn len(&self) -> usize {
        (**self).len()
    }

    fn get(&self, index: usize) -> Result<(DynamicImage, String)> {
        (**self).get(index)
    }

    fn describe(&self) -> String {
        (**self).describe()
    }
}

/// The local folder when one is given, otherwise the train split of `dataset_id` on the hub.
pub async fn open_images(
    dataset_dir: Option<&Path>,
    dataset_id: &str,
    api: &Api,
) -> Result<Box<dyn CaptionedImages>> {
    match dataset_dir {
        Some(dir) => Ok(Box::new(ImageFolder::open(dir)?)),
        None => {
            tracing::info!("Loading dataset {dataset_id} from the hub");
            Ok(Box::new(fetch_dataset(api, dataset_id, DEFAULT_SPLIT).await?))
        }
    }
}

pub trait LatentSource {
    fn len(&self) -> usize;

    /// The latent for `index` without a batch dim, and its caption.
    fn get(&self, index: usize) -> Result<(Tensor, String)>;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// A collated batch: latents `(B, C, H, W)` and token ids `(B, max_len)`.
pub struct Batch {
    pub latents: Tensor,
    pub input_ids: Tensor,
}

impl Batch {
    pub fn size(&self) -> usize {
        self.latents.dim(0).unwrap_or(0)
    }
}

pub struct TrainingDataset<S> {
    source: S,
    tokenizer: PromptTokenizer,
}

impl<S: LatentSource> TrainingDataset<S> {
    pub fn new(source: S, tokenizer: PromptTokenizer) -> Self {
        Self { source, tokenizer }
    }

    pub fn len(&self) -> usize {
        self.source.len()
    }

    pub fn is_empty(&self) -> bool {
        self.source.is_empty()
    }

    pub fn tokenizer(&self) -> &PromptTokenizer {
        &self.tokenizer
    }

    /// The latent and its caption's token ids (exactly `max_len` long).
    pub fn get(&self, index: usize) -> Result<(Tensor, Tensor)> {
        let (latent, text) = self.source.get(index)?;
        let ids = self.tokenizer.encode_ids(&text)?;
        let ids = Tensor::new(ids.as_slice(), &Device::Cpu)?;
        Ok((latent, ids))
    }

    pub fn collate(&self, indices: &[usize]) -> Result<Batch> {
        anyhow::ensure!(!indices.is_empty(), "cannot collate an empty batch");
        let mut latents = Vec::with_capacity(indices.len());
        let mut input_ids = Vec::with_capacity(indices.len());
        for &index in indices {
            let (latent, ids) = self
                .get(index)
                .with_context(|| format!("failed to load example {index}"))?;
            latents.push(latent.to_device(&Device::Cpu)?);
            input_ids.push(ids);
        }
        Ok(Batch {
            latents: Tensor::stack(&latents, 0)?.contiguous()?,
            input_ids: Tensor::stack(&input_ids, 0)?,
        })
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::tokenizer::tests::word_tokenizer;
    use candle_core::{DType, IndexOp};

    pub(crate) fn small_cache(n: usize) -> CachedLatents {
        let latents = Tensor::arange(0f32, (n * 4 * 2 * 2) as f32, &Device::Cpu)
            .unwrap()
            .reshape((n, 4, 2, 2))
            .unwrap();
        let texts = (0..n)
            .map(|i| if i % 2 == 0 { "black boxer briefs" } else { "red dress" }.to_string())
            .collect();
        CachedLatents::new(latents, texts).unwrap()
    }

    #[test]
    fn lookup_pairs_latent_with_padded_ids() {
        let dataset = TrainingDataset::new(small_cache(3), word_tokenizer(8));
        let (latent, ids) = dataset.get(1).unwrap();
        assert_eq!(latent.dims(), &[4, 2, 2]);
        assert_eq!(ids.to_vec1::<u32>().unwrap(), vec![5, 6, 1, 1, 1, 1, 1, 1]);
        assert_eq!(latent.i((0, 0, 0)).unwrap().to_scalar::<f32>().unwrap(), 16.0);
    }

    #[test]
    fn collate_stacks_in_index_order() {
        let dataset = TrainingDataset::new(small_cache(4), word_tokenizer(5));
        let batch = dataset.collate(&[3, 0]).unwrap();
        assert_eq!(batch.size(), 2);
        assert_eq!(batch.latents.dims(), &[2, 4, 2, 2]);
        assert_eq!(batch.input_ids.dims(), &[2, 5]);
        assert_eq!(batch.input_ids.dtype(), DType::U32);
        let first = batch.latents.i((0, 0, 0, 0)).unwrap().to_scalar::<f32>().unwrap();
        assert_eq!(first, 48.0);
    }

    #[test]
    fn out_of_range_index_is_an_error() {
        let dataset = TrainingDataset::new(small_cache(2), word_tokenizer(5));
        assert!(dataset.get(2).is_err());
        assert!(dataset.collate(&[]).is_err());
    }
}
