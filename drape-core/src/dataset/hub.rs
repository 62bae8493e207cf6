//! Captioned image datasets hosted on the Hugging Face hub as parquet shards.

use std::path::PathBuf;

use anyhow::{Context, Result};
use hf_hub::api::tokio::Api;
use hf_hub::{Repo, RepoType};
use image::DynamicImage;
use parquet::file::reader::{FileReader, SerializedFileReader};
use parquet::record::{Field, Row};

use super::CaptionedImages;

pub const DEFAULT_DATASET_ID: &str = "wbensvage/clothes_desc";
pub const DEFAULT_SPLIT: &str = "train";

/// Branch where the hub keeps a parquet export of datasets stored in other formats.
const PARQUET_REVISION: &str = "refs/convert/parquet";

/// Encoded images and their captions, read from parquet rows with an
/// `image` column (`{bytes, path}` struct or plain binary) and a `text` column.
///
/// Images stay encoded in memory and are decoded on lookup.
pub struct ParquetImages {
    source: String,
    images: Vec<Vec<u8>>,
    texts: Vec<String>,
}

impl ParquetImages {
    pub fn open(files: &[PathBuf], source: impl Into<String>) -> Result<Self> {
        Self::with_columns(files, source, "image", "text")
    }

    pub fn with_columns(
        files: &[PathBuf],
        source: impl Into<String>,
        image_column: &str,
        text_column: &str,
    ) -> Result<Self> {
        let source = source.into();
        let mut images = Vec::new();
        let mut texts = Vec::new();
        for path in files {
            let file = std::fs::File::open(path)
                .with_context(|| format!("failed to open {}", path.display()))?;
            let reader = SerializedFileReader::new(file)
                .with_context(|| format!("{} is not a parquet file", path.display()))?;
            for (index, row) in reader.get_row_iter(None)?.enumerate() {
                let row = row?;
                let (image, text) = read_row(&row, image_column, text_column)
                    .with_context(|| format!("{}: row {index}", path.display()))?;
                images.push(image);
                texts.push(text);
            }
        }
        tracing::info!("Loaded {} examples from {source}", texts.len());
        Ok(Self {
            source,
            images,
            texts,
        })
    }

    pub fn texts(&self) -> &[String] {
        &self.texts
    }
}

fn read_row(row: &Row, image_column: &str, text_column: &str) -> Result<(Vec<u8>, String)> {
    let mut image = None;
    let mut text = None;
    for (name, field) in row.get_column_iter() {
        if name == image_column {
            image = image_bytes(field);
        } else if name == text_column {
            if let Field::Str(value) = field {
                text = Some(value.clone());
            }
        }
    }
    let image = image.with_context(|| format!("no image bytes in column {image_column:?}"))?;
    let text = text.with_context(|| format!("no caption in column {text_column:?}"))?;
    Ok((image, text))
}

fn image_bytes(field: &Field) -> Option<Vec<u8>> {
    match field {
        Field::Bytes(bytes) => Some(bytes.data().to_vec()),
        Field::Group(group) => group
            .get_column_iter()
            .find(|(name, _)| name.as_str() == "bytes")
            .and_then(|(_, field)| image_bytes(field)),
        _ => None,
    }
}

impl CaptionedImages for ParquetImages {
    fn len(&self) -> usize {
        self.texts.len()
    }

    fn get(&self, index: usize) -> Result<(DynamicImage, String)> {
        let bytes = self
            .images
            .get(index)
            .with_context(|| format!("index {index} out of range for {} examples", self.len()))?;
        let image = image::load_from_memory(bytes)
            .with_context(|| format!("failed to decode image {index} of {}", self.source))?;
        Ok((image, self.texts[index].clone()))
    }

    fn describe(&self) -> String {
        self.source.clone()
    }
}

/// Parquet shards of `split` in either hub layout:
/// `data/train-00000-of-00001.parquet` or `default/train/0000.parquet`.
pub fn split_files<'a>(names: impl IntoIterator<Item = &'a str>, split: &str) -> Vec<String> {
    let prefix = format!("{split}-");
    let mut files: Vec<String> = names
        .into_iter()
        .filter(|name| name.ends_with(".parquet"))
        .filter(|name| {
            let mut parts: Vec<&str> = name.split('/').collect();
            let file = parts.pop().unwrap_or_default();
            parts.contains(&split) || file.starts_with(&prefix) || file == format!("{split}.parquet")
        })
        .map(str::to_string)
        .collect();
    files.sort();
    files
}

/// Downloads the `split` shards of a hub dataset and reads them. Falls back
/// to the hub's parquet conversion branch when the main branch has none.
pub async fn fetch_dataset(api: &Api, dataset_id: &str, split: &str) -> Result<ParquetImages> {
    let mut repo = api.dataset(dataset_id.to_string());
    let info = repo
        .info()
        .await
        .with_context(|| format!("failed to list files of dataset {dataset_id}"))?;
    let mut files = split_files(info.siblings.iter().map(|s| s.rfilename.as_str()), split);

    if files.is_empty() {
        tracing::info!("{dataset_id} has no {split} parquet files, trying {PARQUET_REVISION}");
        repo = api.repo(Repo::with_revision(
            dataset_id.to_string(),
            RepoType::Dataset,
            PARQUET_REVISION.to_string(),
        ));
        let info = repo
            .info()
            .await
            .with_context(|| format!("failed to list {PARQUET_REVISION} of dataset {dataset_id}"))?;
        files = split_files(info.siblings.iter().map(|s| s.rfilename.as_str()), split);
    }
    anyhow::ensure!(
        !files.is_empty(),
        "dataset {dataset_id} has no parquet files for split {split:?}"
    );

    let mut paths = Vec::with_capacity(files.len());
    for file in &files {
        tracing::info!("Fetching {dataset_id}/{file}");
        let path = repo
            .get(file)
            .await
            .with_context(|| format!("failed to fetch {file} from dataset {dataset_id}"))?;
        paths.push(path);
    }
    ParquetImages::open(&paths, format!("{dataset_id} ({split})"))
}
