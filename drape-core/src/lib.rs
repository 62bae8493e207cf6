#[cfg(feature = "accelerate")]
extern crate accelerate_src;
#[cfg(feature = "mkl")]
extern crate intel_mkl_src;

pub mod dataset;
pub mod device_map;
pub mod generate;
pub mod loader;
mod loader_factory;
pub mod registry;
pub mod schedule;
mod stable_diffusion;
pub mod tokenizer;
pub mod training;
mod util;

pub use device_map::*;
pub use generate::{
    GenerateError, GeneratedImage, GenerationDefaults, GenerationParams, GenerationRequest,
    Generator,
};
use image::DynamicImage;
pub use loader::*;
pub use loader_factory::*;
pub use registry::{popular_models, resolve, ModelFiles, ModelSource, ResolvedModel, DEFAULT_MODEL_ID};
pub use stable_diffusion::{StableDiffusionLoader, StableDiffusionModel};
pub use tokenizer::PromptTokenizer;
pub use util::*;

/// Anything that turns fully resolved parameters into one image.
pub trait ModelLike: Send {
    fn run(&mut self, params: &GenerationParams) -> anyhow::Result<DynamicImage>;
}
