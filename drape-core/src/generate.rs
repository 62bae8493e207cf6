use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::Context;
use image::DynamicImage;
use serde::{Deserialize, Serialize};

use crate::{image_to_png_bytes, ModelLike};

/// A prompt plus optional inference parameters, as received from a client.
#[derive(Deserialize, Serialize, Debug, Clone, Default, PartialEq)]
pub struct GenerationRequest {
    pub prompt: String,
    pub steps: Option<usize>,
    #[serde(alias = "guidance")]
    pub guidance_scale: Option<f64>,
    pub height: Option<usize>,
    pub width: Option<usize>,
    pub seed: Option<u64>,
    pub negative_prompt: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GenerationDefaults {
    pub steps: usize,
    pub guidance_scale: f64,
    pub height: usize,
    pub width: usize,
}

impl Default for GenerationDefaults {
    fn default() -> Self {
        Self {
            steps: 50,
            guidance_scale: 7.5,
            height: 512,
            width: 512,
        }
    }
}

/// Fully specified parameters handed to a model.
#[derive(Debug, Clone, PartialEq)]
pub struct GenerationParams {
    pub prompt: String,
    pub negative_prompt: Option<String>,
    pub steps: usize,
    pub guidance_scale: f64,
    pub height: usize,
    pub width: usize,
    pub seed: Option<u64>,
}

#[derive(Debug, thiserror::Error)]
pub enum GenerateError {
    #[error("invalid request: {0}")]
    Invalid(String),
    #[error(transparent)]
    Failed(#[from] anyhow::Error),
}

impl GenerationRequest {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            ..Default::default()
        }
    }

    /// Fills unset fields from `defaults` and checks the result.
    pub fn resolve(self, defaults: &GenerationDefaults) -> Result<GenerationParams, GenerateError> {
        let params = GenerationParams {
            prompt: self.prompt,
            negative_prompt: self.negative_prompt.filter(|p| !p.is_empty()),
            steps: self.steps.unwrap_or(defaults.steps),
            guidance_scale: self.guidance_scale.unwrap_or(defaults.guidance_scale),
            height: self.height.unwrap_or(defaults.height),
            width: self.width.unwrap_or(defaults.width),
            seed: self.seed,
        };
        params.validate()?;
        Ok(params)
    }
}

impl GenerationParams {
    pub fn validate(&self) -> Result<(), GenerateError> {
        if self.steps == 0 {
            return Err(GenerateError::Invalid("steps must be positive".into()));
        }
        if !(self.guidance_scale.is_finite() && self.guidance_scale > 0.0) {
            return Err(GenerateError::Invalid(
                "guidance_scale must be a positive number".into(),
            ));
        }
        for (name, value) in [("height", self.height), ("width", self.width)] {
            if value == 0 || value % 8 != 0 {
                return Err(GenerateError::Invalid(format!(
                    "{name} must be a positive multiple of 8, got {value}"
                )));
            }
        }
        Ok(())
    }
}

pub struct GeneratedImage {
    pub image: DynamicImage,
    pub filename: String,
    pub path: PathBuf,
}

impl GeneratedImage {
    pub fn png_bytes(&self) -> anyhow::Result<Vec<u8>> {
        image_to_png_bytes(&self.image)
    }
}

/// Runs one loaded model and persists its output.
///
/// The model sits behind a mutex: concurrent callers are serialized so
/// only one denoising run touches it at a time.
pub struct Generator {
    model: Mutex<Box<dyn ModelLike>>,
    output_dir: PathBuf,
}

impl Generator {
    pub fn new(model: Box<dyn ModelLike>, output_dir: impl Into<PathBuf>) -> Self {
        Self {
            model: Mutex::new(model),
            output_dir: output_dir.into(),
        }
    }

    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    pub fn generate(&self, params: &GenerationParams) -> Result<GeneratedImage, GenerateError> {
        params.validate()?;
        let mut model = self.model.lock().unwrap_or_else(|poisoned| {
            tracing::warn!("A previous generation panicked, reusing the model");
            self.model.clear_poison();
            poisoned.into_inner()
        });

        tracing::info!("Generating image for prompt: '{}'", params.prompt);
        tracing::info!(
            "Steps: {}, Guidance: {}, Size: {}x{}, Seed: {:?}",
            params.steps,
            params.guidance_scale,
            params.width,
            params.height,
            params.seed
        );
        let image = model.run(params)?;

        // Saved while the lock is held so two requests cannot claim the same name.
        let (filename, path) = self.next_output_path()?;
        image
            .save(&path)
            .with_context(|| format!("failed to save image to {}", path.display()))?;
        tracing::info!("Image saved to {}", path.display());

        Ok(GeneratedImage {
            image,
            filename,
            path,
        })
    }

    /// Like [`Generator::generate`], also returning the saved image as PNG bytes.
    pub fn generate_png(
        &self,
        params: &GenerationParams,
    ) -> Result<(GeneratedImage, Vec<u8>), GenerateError> {
        let image = self.generate(params)?;
        let png = image.png_bytes()?;
        Ok((image, png))
    }

    fn next_output_path(&self) -> anyhow::Result<(String, PathBuf)> {
        std::fs::create_dir_all(&self.output_dir).with_context(|| {
            format!("failed to create output dir {}", self.output_dir.display())
        })?;
        let mut timestamp = chrono::Utc::now().timestamp();
        loop {
            let filename = output_filename(timestamp);
            let path = self.output_dir.join(&filename);
            if !path.exists() {
                return Ok((filename, path));
            }
            timestamp += 1;
        }
    }
}

pub fn output_filename(timestamp: i64) -> String {
    format!("generated_{timestamp}.png")
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::sync::Arc;

    /// Paints a solid color derived from the seed and remembers every call.
    pub(crate) struct SolidColor {
        pub calls: Arc<Mutex<Vec<GenerationParams>>>,
    }

    impl ModelLike for SolidColor {
        fn run(&mut self, params: &GenerationParams) -> anyhow::Result<DynamicImage> {
            self.calls.lock().unwrap().push(params.clone());
            let shade = params.seed.unwrap_or(0) as u8;
            Ok(DynamicImage::ImageRgb8(image::RgbImage::from_pixel(
                params.width as u32,
                params.height as u32,
                image::Rgb([shade, 255 - shade, 64]),
            )))
        }
    }

    struct Broken;

    impl ModelLike for Broken {
        fn run(&mut self, _: &GenerationParams) -> anyhow::Result<DynamicImage> {
            anyhow::bail!("CUDA out of memory")
        }
    }

    /// Panics on its first call, then behaves like [`SolidColor`].
    struct PanicsOnce {
        panicked: bool,
        inner: SolidColor,
    }

    impl ModelLike for PanicsOnce {
        fn run(&mut self, params: &GenerationParams) -> anyhow::Result<DynamicImage> {
            if !self.panicked {
                self.panicked = true;
                panic!("kernel launch failed");
            }
            self.inner.run(params)
        }
    }

    fn solid_generator(dir: &Path) -> (Generator, Arc<Mutex<Vec<GenerationParams>>>) {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let model = SolidColor {
            calls: calls.clone(),
        };
        (Generator::new(Box::new(model), dir), calls)
    }

    #[test]
    fn fills_defaults() {
        let defaults = GenerationDefaults {
            steps: 30,
            ..Default::default()
        };
        let params = GenerationRequest::new("Black boxer briefs")
            .resolve(&defaults)
            .unwrap();
        assert_eq!(params.steps, 30);
        assert_eq!(params.guidance_scale, 7.5);
        assert_eq!((params.width, params.height), (512, 512));
        assert_eq!(params.seed, None);
    }

    #[test]
    fn accepts_guidance_alias() {
        let req: GenerationRequest =
            serde_json::from_str(r#"{"prompt": "red dress", "guidance": 3.0}"#).unwrap();
        assert_eq!(req.guidance_scale, Some(3.0));
    }

    #[test]
    fn rejects_bad_dimensions_and_steps() {
        let defaults = GenerationDefaults::default();
        let mut req = GenerationRequest::new("x");
        req.height = Some(500);
        assert!(matches!(req.resolve(&defaults), Err(GenerateError::Invalid(_))));

        let mut req = GenerationRequest::new("x");
        req.steps = Some(0);
        assert!(matches!(req.resolve(&defaults), Err(GenerateError::Invalid(_))));

        let mut req = GenerationRequest::new("x");
        req.guidance_scale = Some(-1.0);
        assert!(matches!(req.resolve(&defaults), Err(GenerateError::Invalid(_))));
    }

    #[test]
    fn saves_timestamped_png() {
        let dir = tempfile::tempdir().unwrap();
        let (generator, _) = solid_generator(dir.path());
        let params = GenerationRequest::new("denim jacket")
            .resolve(&GenerationDefaults::default())
            .unwrap();
        let out = generator.generate(&params).unwrap();
        assert!(out.filename.starts_with("generated_") && out.filename.ends_with(".png"));
        assert!(dir.path().join(&out.filename).is_file());
        let reloaded = image::open(&out.path).unwrap();
        assert_eq!((reloaded.width(), reloaded.height()), (512, 512));
    }

    #[test]
    fn never_reuses_a_filename() {
        let dir = tempfile::tempdir().unwrap();
        let (generator, calls) = solid_generator(dir.path());
        let mut params = GenerationRequest::new("red dress")
            .resolve(&GenerationDefaults::default())
            .unwrap();
        params.width = 16;
        params.height = 16;
        let a = generator.generate(&params).unwrap();
        let b = generator.generate(&params).unwrap();
        assert_ne!(a.filename, b.filename);
        assert_eq!(calls.lock().unwrap().len(), 2);
    }

    #[test]
    fn seeded_runs_are_identical() {
        let dir = tempfile::tempdir().unwrap();
        let (generator, _) = solid_generator(dir.path());
        let mut params = GenerationRequest::new("red dress")
            .resolve(&GenerationDefaults::default())
            .unwrap();
        params.seed = Some(42);
        let (first, a) = generator.generate_png(&params).unwrap();
        let (second, b) = generator.generate_png(&params).unwrap();
        assert_eq!(a, b);
        assert_eq!(std::fs::read(&first.path).unwrap(), std::fs::read(&second.path).unwrap());
    }

    #[test]
    fn model_errors_surface_as_failed() {
        let dir = tempfile::tempdir().unwrap();
        let generator = Generator::new(Box::new(Broken), dir.path());
        let params = GenerationRequest::new("x")
            .resolve(&GenerationDefaults::default())
            .unwrap();
        let err = generator.generate(&params).err().unwrap();
        assert!(matches!(err, GenerateError::Failed(_)));
        assert_eq!(err.to_string(), "CUDA out of memory");
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[test]
    fn recovers_after_a_panicking_generation() {
        let dir = tempfile::tempdir().unwrap();
        let calls = Arc::new(Mutex::new(Vec::new()));
        let model = PanicsOnce {
            panicked: false,
            inner: SolidColor {
                calls: calls.clone(),
            },
        };
        let generator = Generator::new(Box::new(model), dir.path());
        let mut params = GenerationRequest::new("wool scarf")
            .resolve(&GenerationDefaults::default())
            .unwrap();
        params.width = 16;
        params.height = 16;

        let first = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            generator.generate(&params)
        }));
        assert!(first.is_err());
        assert!(generator.model.is_poisoned());

        let out = generator.generate(&params).unwrap();
        assert!(out.path.is_file());
        assert_eq!(calls.lock().unwrap().len(), 1);
        assert!(!generator.model.is_poisoned());
    }
}
