//! Where a pipeline's weights come from.
//!
//! A pipeline is either a local directory in the diffusers layout
//! (`unet/`, `vae/`, `text_encoder/`, `tokenizer/`, ...) or a repository on
//! the Hugging Face hub. [`resolve`] turns the user's optional path and
//! identifier into one [`ResolvedModel`], classifying its family once.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use hf_hub::api::tokio::Api;
use serde::Deserialize;

use crate::ModelFamily;

pub const DEFAULT_MODEL_ID: &str = "runwayml/stable-diffusion-v1-5";

/// Short names accepted wherever a hub identifier is expected.
pub const POPULAR_MODELS: &[(&str, &str)] = &[
    // Stable Diffusion v1.x
    ("stable-diffusion-v1-5", "runwayml/stable-diffusion-v1-5"),
    ("stable-diffusion-v1-4", "CompVis/stable-diffusion-v1-4"),
    ("stable-diffusion-v1-3", "CompVis/stable-diffusion-v1-3"),
    ("stable-diffusion-v1-2", "CompVis/stable-diffusion-v1-2"),
    ("stable-diffusion-v1-1", "CompVis/stable-diffusion-v1-1"),
    // Stable Diffusion v2.x
    ("stable-diffusion-v2-1", "stabilityai/stable-diffusion-2-1"),
    ("stable-diffusion-v2-1-base", "stabilityai/stable-diffusion-2-1-base"),
    ("stable-diffusion-v2", "stabilityai/stable-diffusion-2"),
    ("stable-diffusion-v2-base", "stabilityai/stable-diffusion-2-base"),
    // Stable Diffusion XL
    ("sdxl-base", "stabilityai/stable-diffusion-xl-base-1.0"),
    ("sdxl-refiner", "stabilityai/stable-diffusion-xl-refiner-1.0"),
    // Fine-tunes
    ("dreamshaper", "Lykon/DreamShaper"),
    ("realistic-vision", "SG161222/Realistic_Vision_V5.1_noVAE"),
    ("anything-v3", "Linaqruf/anything-v3.0"),
    ("waifu-diffusion", "hakurei/waifu-diffusion"),
    ("openjourney", "prompthero/openjourney"),
    ("redshift-diffusion", "nitrosocke/Redshift-Diffusion"),
    ("inkpunk-dream", "Envvi/Inkpunk-Diffusion"),
    ("arcane-diffusion", "nitrosocke/Arcane-Diffusion"),
    ("protogen", "darkstorm2150/Protogen_x3.4_Official_Release"),
    ("deliberate", "XpucT/Deliberate"),
];

pub fn popular_models() -> &'static [(&'static str, &'static str)] {
    POPULAR_MODELS
}

/// Expands an alias from [`POPULAR_MODELS`], leaving other ids untouched.
pub fn expand_alias(model_id: &str) -> &str {
    POPULAR_MODELS
        .iter()
        .find(|(alias, _)| alias.eq_ignore_ascii_case(model_id))
        .map(|(_, id)| *id)
        .unwrap_or(model_id)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ModelSource {
    Local(PathBuf),
    Hub(String),
}

impl std::fmt::Display for ModelSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Local(path) => write!(f, "{}", path.display()),
            Self::Hub(id) => f.write_str(id),
        }
    }
}

impl ModelSource {
    /// An existing directory, otherwise a hub id with aliases expanded.
    pub fn from_name(name: &str) -> Self {
        let path = Path::new(name);
        if path.is_dir() {
            Self::Local(path.to_path_buf())
        } else {
            Self::Hub(expand_alias(name).to_string())
        }
    }

    /// The form written to `model_index.json`, readable back by [`ModelSource::from_name`].
    pub fn to_pointer(&self) -> String {
        match self {
            Self::Local(path) => path
                .canonicalize()
                .unwrap_or_else(|_| path.clone())
                .display()
                .to_string(),
            Self::Hub(id) => id.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedModel {
    pub source: ModelSource,
    pub family: ModelFamily,
}

impl ResolvedModel {
    pub fn hub(model_id: &str) -> Self {
        let model_id = expand_alias(model_id);
        Self {
            source: ModelSource::Hub(model_id.to_string()),
            family: ModelFamily::detect(model_id),
        }
    }

    pub fn local(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let family = family_from_model_index(&path)
            .unwrap_or_else(|| ModelFamily::detect(&path.to_string_lossy()));
        Self {
            source: ModelSource::Local(path),
            family,
        }
    }

    pub fn default_model() -> Self {
        Self::hub(DEFAULT_MODEL_ID)
    }

    pub fn is_default(&self) -> bool {
        self.source == ModelSource::Hub(DEFAULT_MODEL_ID.to_string())
    }
}

/// True when `path` looks like a pipeline directory we can load from.
pub fn is_local_pipeline(path: &Path) -> bool {
    path.join("unet").is_dir()
}

/// Picks the pipeline to load: an existing local directory first, then the
/// hub identifier, then [`DEFAULT_MODEL_ID`].
pub fn resolve(model_path: Option<&Path>, model_id: Option<&str>) -> ResolvedModel {
    if let Some(path) = model_path {
        if is_local_pipeline(path) {
            tracing::info!("Loading model from local path: {}", path.display());
            return ResolvedModel::local(path);
        }
        tracing::warn!(
            "Local model {} not found or missing unet/, ignoring it",
            path.display()
        );
    }
    match model_id.map(str::trim).filter(|id| !id.is_empty()) {
        Some(id) => {
            tracing::info!("Loading model from Hugging Face: {}", expand_alias(id));
            ResolvedModel::hub(id)
        }
        None => {
            tracing::info!("No model specified, using default: {DEFAULT_MODEL_ID}");
            ResolvedModel::default_model()
        }
    }
}

#[derive(Deserialize)]
struct ModelIndex {
    #[serde(rename = "_class_name")]
    class_name: Option<String>,
    family: Option<ModelFamily>,
    base_model: Option<String>,
}

fn read_model_index(dir: &Path) -> Option<ModelIndex> {
    let raw = std::fs::read_to_string(dir.join("model_index.json")).ok()?;
    serde_json::from_str(&raw).ok()
}

fn family_from_model_index(dir: &Path) -> Option<ModelFamily> {
    let index = read_model_index(dir)?;
    index.family.or_else(|| {
        index
            .class_name
            .filter(|name| name.contains("XL"))
            .map(|_| ModelFamily::Xl)
    })
}

/// The pipeline a partial directory, such as a training checkpoint that only
/// holds `unet/`, takes its other components from.
pub fn base_model(dir: &Path) -> Option<ModelSource> {
    read_model_index(dir)?
        .base_model
        .map(|name| ModelSource::from_name(&name))
}

/// Fetches files of one pipeline by their path relative to its root.
///
/// Files missing from a local directory come from its `base_model` when
/// `model_index.json` names one.
pub struct ModelFiles<'a> {
    source: &'a ModelSource,
    api: &'a Api,
}

impl<'a> ModelFiles<'a> {
    pub fn new(source: &'a ModelSource, api: &'a Api) -> Self {
        Self { source, api }
    }

    pub async fn get(&self, file: &str) -> Result<PathBuf> {
        if let ModelSource::Local(dir) = self.source {
            if !dir.join(file).is_file() {
                if let Some(base) = base_model(dir) {
                    tracing::debug!("{file} is not in {}, using {base}", dir.display());
                    return self.fetch(&base, file).await;
                }
            }
        }
        self.fetch(self.source, file).await
    }

    async fn fetch(&self, source: &ModelSource, file: &str) -> Result<PathBuf> {
        match source {
            ModelSource::Local(dir) => {
                let path = dir.join(file);
                anyhow::ensure!(path.is_file(), "{} does not exist", path.display());
                Ok(path)
            }
            ModelSource::Hub(id) => self
                .api
                .model(id.clone())
                .get(file)
                .await
                .with_context(|| format!("failed to fetch {file} from {id}")),
        }
    }

    /// Like [`ModelFiles::get`] but falls back to `file` in the `fallback_repo`.
    pub async fn get_or_hub(&self, file: &str, fallback_repo: &str, fallback_file: &str) -> Result<PathBuf> {
        match self.get(file).await {
            Ok(path) => Ok(path),
            Err(err) => {
                tracing::debug!("{err:#}, using {fallback_repo}/{fallback_file}");
                self.api
                    .model(fallback_repo.to_string())
                    .get(fallback_file)
                    .await
                    .with_context(|| format!("failed to fetch {fallback_file} from {fallback_repo}"))
            }
        }
    }
}
