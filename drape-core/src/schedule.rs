//! Noise schedules read from a pipeline's `scheduler/scheduler_config.json`.
//!
//! The same config drives the DDIM sampler at generation time and the
//! forward process during fine-tuning, so both agree on what the UNet
//! predicts: the noise (`epsilon`), the velocity (`v_prediction`, the 768px
//! v2 checkpoints) or the clean latents (`sample`).

use std::path::Path;

use anyhow::{Context, Result};
use candle_core::{Device, Tensor};
use candle_transformers::models::stable_diffusion::{
    ddim::DDIMSchedulerConfig,
    schedulers::{BetaSchedule, PredictionType},
};
use serde::{Deserialize, Serialize};

use crate::{ModelFamily, ModelFiles, ResolvedModel};

pub(crate) const SCHEDULER_CONFIG: &str = "scheduler/scheduler_config.json";

/// The subset of a diffusers `scheduler_config.json` the sampler and trainer rely on.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NoiseScheduleConfig {
    #[serde(rename = "_class_name", default = "default_class_name")]
    pub class_name: String,
    #[serde(default = "default_train_timesteps")]
    pub num_train_timesteps: usize,
    #[serde(default = "default_beta_start")]
    pub beta_start: f64,
    #[serde(default = "default_beta_end")]
    pub beta_end: f64,
    #[serde(default = "default_beta_schedule")]
    pub beta_schedule: String,
    #[serde(default = "default_prediction_type")]
    pub prediction_type: String,
    #[serde(default = "default_steps_offset")]
    pub steps_offset: usize,
}

fn default_class_name() -> String {
    "DDPMScheduler".to_string()
}
fn default_train_timesteps() -> usize {
    1000
}
fn default_beta_start() -> f64 {
    0.00085
}
fn default_beta_end() -> f64 {
    0.012
}
fn default_beta_schedule() -> String {
    "scaled_linear".to_string()
}
fn default_prediction_type() -> String {
    "epsilon".to_string()
}
fn default_steps_offset() -> usize {
    1
}

impl Default for NoiseScheduleConfig {
    fn default() -> Self {
        Self {
            class_name: default_class_name(),
            num_train_timesteps: default_train_timesteps(),
            beta_start: default_beta_start(),
            beta_end: default_beta_end(),
            beta_schedule: default_beta_schedule(),
            prediction_type: default_prediction_type(),
            steps_offset: default_steps_offset(),
        }
    }
}

impl NoiseScheduleConfig {
    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        serde_json::from_str(&raw).with_context(|| format!("failed to parse {}", path.display()))
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        std::fs::write(path, serde_json::to_string_pretty(self)?)
            .with_context(|| format!("failed to write {}", path.display()))
    }

    /// Used when a pipeline ships no scheduler config. The 768px v2
    /// checkpoints predict velocity, their `-base` 512px siblings and every
    /// other family predict noise.
    pub fn fallback_for(model: &ResolvedModel) -> Self {
        let v_prediction =
            model.family == ModelFamily::V2_1 && !model.source.to_string().contains("base");
        Self {
            prediction_type: if v_prediction { "v_prediction" } else { "epsilon" }.to_string(),
            ..Default::default()
        }
    }

    pub fn prediction(&self) -> Result<PredictionType> {
        match self.prediction_type.as_str() {
            "epsilon" => Ok(PredictionType::Epsilon),
            "v_prediction" => Ok(PredictionType::VPrediction),
            "sample" => Ok(PredictionType::Sample),
            other => anyhow::bail!("unsupported prediction_type {other:?}"),
        }
    }

    pub fn betas(&self) -> Result<BetaSchedule> {
        match self.beta_schedule.as_str() {
            "scaled_linear" => Ok(BetaSchedule::ScaledLinear),
            "linear" => Ok(BetaSchedule::Linear),
            "squaredcos_cap_v2" => Ok(BetaSchedule::SquaredcosCapV2),
            other => anyhow::bail!("unsupported beta_schedule {other:?}"),
        }
    }

    /// The DDIM sampler for this schedule, whatever scheduler class the
    /// pipeline was saved with.
    pub fn ddim_config(&self) -> Result<DDIMSchedulerConfig> {
        Ok(DDIMSchedulerConfig {
            beta_start: self.beta_start,
            beta_end: self.beta_end,
            beta_schedule: self.betas()?,
            steps_offset: self.steps_offset,
            prediction_type: self.prediction()?,
            train_timesteps: self.num_train_timesteps,
            ..Default::default()
        })
    }
}

/// Reads the pipeline's scheduler config, or [`NoiseScheduleConfig::fallback_for`]
/// when it has none.
pub async fn load_schedule_config(
    files: &ModelFiles<'_>,
    model: &ResolvedModel,
) -> Result<NoiseScheduleConfig> {
    match files.get(SCHEDULER_CONFIG).await {
        Ok(path) => NoiseScheduleConfig::from_file(&path),
        Err(err) => {
            let fallback = NoiseScheduleConfig::fallback_for(model);
            tracing::warn!(
                "{err:#}, using the default {} noise schedule",
                fallback.prediction_type
            );
            Ok(fallback)
        }
    }
}

/// Forward diffusion: how much signal survives at each training timestep.
#[derive(Debug, Clone)]
pub struct NoiseSchedule {
    config: NoiseScheduleConfig,
    prediction: PredictionType,
    alphas_cumprod: Vec<f64>,
}

impl NoiseSchedule {
    pub fn new(config: NoiseScheduleConfig) -> Result<Self> {
        let n = config.num_train_timesteps;
        anyhow::ensure!(n > 0, "num_train_timesteps must be positive");
        let prediction = config.prediction()?;
        let betas: Vec<f64> = match config.beta_schedule.as_str() {
            "scaled_linear" => linspace(config.beta_start.sqrt(), config.beta_end.sqrt(), n)
                .into_iter()
                .map(|b| b * b)
                .collect(),
            "linear" => linspace(config.beta_start, config.beta_end, n),
            other => anyhow::bail!("unsupported beta_schedule {other:?} for training"),
        };
        let mut alphas_cumprod = Vec::with_capacity(n);
        let mut acc = 1.0;
        for beta in betas {
            acc *= 1.0 - beta;
            alphas_cumprod.push(acc);
        }
        Ok(Self {
            config,
            prediction,
            alphas_cumprod,
        })
    }

    pub fn config(&self) -> &NoiseScheduleConfig {
        &self.config
    }

    pub fn prediction(&self) -> PredictionType {
        self.prediction
    }

    pub fn num_train_timesteps(&self) -> usize {
        self.alphas_cumprod.len()
    }

    pub fn alpha_cumprod(&self, timestep: usize) -> f64 {
        self.alphas_cumprod[timestep]
    }

    /// `sqrt(ᾱ_t)` and `sqrt(1-ᾱ_t)` per example, shaped to broadcast over `original`.
    fn coefficients(&self, original: &Tensor, timesteps: &[usize]) -> Result<(Tensor, Tensor)> {
        let batch = original.dim(0)?;
        anyhow::ensure!(
            timesteps.len() == batch,
            "{} timesteps for a batch of {batch}",
            timesteps.len()
        );
        let mut signal = Vec::with_capacity(batch);
        let mut sigma = Vec::with_capacity(batch);
        for &t in timesteps {
            anyhow::ensure!(t < self.num_train_timesteps(), "timestep {t} out of range");
            let ac = self.alphas_cumprod[t];
            signal.push(ac.sqrt() as f32);
            sigma.push((1.0 - ac).sqrt() as f32);
        }
        let mut coeff_shape = vec![1; original.rank()];
        coeff_shape[0] = batch;
        let coeff = |values: Vec<f32>, device: &Device| -> Result<Tensor> {
            Ok(Tensor::from_vec(values, coeff_shape.as_slice(), device)?.to_dtype(original.dtype())?)
        };
        Ok((coeff(signal, original.device())?, coeff(sigma, original.device())?))
    }

    /// `sqrt(ᾱ_t)·x0 + sqrt(1-ᾱ_t)·noise`, with one timestep per example.
    pub fn add_noise(&self, original: &Tensor, noise: &Tensor, timesteps: &[usize]) -> Result<Tensor> {
        let (signal, sigma) = self.coefficients(original, timesteps)?;
        Ok((original.broadcast_mul(&signal)? + noise.broadcast_mul(&sigma)?)?)
    }

    /// What the UNet is trained to output for these noised examples.
    pub fn training_target(
        &self,
        original: &Tensor,
        noise: &Tensor,
        timesteps: &[usize],
    ) -> Result<Tensor> {
        match self.prediction {
            PredictionType::Epsilon => Ok(noise.clone()),
            PredictionType::Sample => Ok(original.clone()),
            // v = sqrt(ᾱ_t)·noise - sqrt(1-ᾱ_t)·x0
            PredictionType::VPrediction => {
                let (signal, sigma) = self.coefficients(original, timesteps)?;
                Ok((noise.broadcast_mul(&signal)? - original.broadcast_mul(&sigma)?)?)
            }
        }
    }
}

fn linspace(start: f64, end: f64, n: usize) -> Vec<f64> {
    if n == 1 {
        return vec![start];
    }
    let step = (end - start) / (n - 1) as f64;
    (0..n).map(|i| start + step * i as f64).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ModelSource;
    use candle_core::{DType, IndexOp};
    use hf_hub::api::tokio::Api;

    const SD2_BASE_SCHEDULER: &str = r#"{"_class_name": "PNDMScheduler", "_diffusers_version": "0.8.0",
        "beta_end": 0.012, "beta_schedule": "scaled_linear", "beta_start": 0.00085,
        "clip_sample": false, "num_train_timesteps": 1000, "prediction_type": "epsilon",
        "set_alpha_to_one": false, "skip_prk_steps": true, "steps_offset": 1, "trained_betas": null}"#;
    const SD2_768_SCHEDULER: &str = r#"{"_class_name": "DDIMScheduler", "_diffusers_version": "0.8.0",
        "beta_end": 0.012, "beta_schedule": "scaled_linear", "beta_start": 0.00085,
        "clip_sample": false, "num_train_timesteps": 1000, "prediction_type": "v_prediction",
        "set_alpha_to_one": false, "skip_prk_steps": true, "steps_offset": 1, "trained_betas": null}"#;

    #[test]
    fn scaled_linear_schedule_matches_reference_values() {
        let schedule = NoiseSchedule::new(NoiseScheduleConfig::default()).unwrap();
        assert_eq!(schedule.num_train_timesteps(), 1000);
        assert!((schedule.alpha_cumprod(0) - 0.99915).abs() < 1e-6);
        assert!((schedule.alpha_cumprod(999) - 0.0047).abs() < 1e-3);
    }

    #[test]
    fn parses_diffusers_config_with_extra_fields() {
        let cfg: NoiseScheduleConfig = serde_json::from_str(
            r#"{"_class_name": "PNDMScheduler", "beta_end": 0.012, "beta_schedule": "scaled_linear",
                "beta_start": 0.00085, "num_train_timesteps": 1000, "skip_prk_steps": true}"#,
        )
        .unwrap();
        assert_eq!(cfg.class_name, "PNDMScheduler");
        assert_eq!(cfg.prediction_type, "epsilon");
        assert_eq!(cfg.steps_offset, 1);
    }

    #[test]
    fn v2_configs_keep_their_prediction_type() {
        let base: NoiseScheduleConfig = serde_json::from_str(SD2_BASE_SCHEDULER).unwrap();
        assert!(matches!(base.prediction().unwrap(), PredictionType::Epsilon));
        assert!(matches!(base.ddim_config().unwrap().prediction_type, PredictionType::Epsilon));

        let v: NoiseScheduleConfig = serde_json::from_str(SD2_768_SCHEDULER).unwrap();
        let ddim = v.ddim_config().unwrap();
        assert!(matches!(ddim.prediction_type, PredictionType::VPrediction));
        assert!(matches!(ddim.beta_schedule, BetaSchedule::ScaledLinear));
        assert_eq!((ddim.steps_offset, ddim.train_timesteps), (1, 1000));

        let bad = NoiseScheduleConfig {
            prediction_type: "flow".into(),
            ..Default::default()
        };
        assert!(bad.ddim_config().is_err());
        assert!(NoiseSchedule::new(bad).is_err());
    }

    #[test]
    fn fallback_depends_on_v2_resolution() {
        let v2 = ResolvedModel::hub("stable-diffusion-v2-1");
        assert_eq!(NoiseScheduleConfig::fallback_for(&v2).prediction_type, "v_prediction");
        let v2_base = ResolvedModel::hub("stable-diffusion-v2-1-base");
        assert_eq!(NoiseScheduleConfig::fallback_for(&v2_base).prediction_type, "epsilon");
        let v1 = ResolvedModel::default_model();
        assert_eq!(NoiseScheduleConfig::fallback_for(&v1).prediction_type, "epsilon");
    }

    #[tokio::test]
    async fn loads_scheduler_config_from_pipeline_dir() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("scheduler")).unwrap();
        std::fs::write(dir.path().join(SCHEDULER_CONFIG), SD2_768_SCHEDULER).unwrap();
        let api = Api::new().unwrap();

        let model = ResolvedModel {
            source: ModelSource::Local(dir.path().to_path_buf()),
            family: ModelFamily::V2_1,
        };
        let files = ModelFiles::new(&model.source, &api);
        let cfg = load_schedule_config(&files, &model).await.unwrap();
        assert_eq!(cfg.prediction_type, "v_prediction");
        assert_eq!(cfg.class_name, "DDIMScheduler");

        let empty = tempfile::tempdir().unwrap();
        let model = ResolvedModel {
            source: ModelSource::Local(empty.path().join("sd2-base")),
            family: ModelFamily::V2_1,
        };
        let files = ModelFiles::new(&model.source, &api);
        let cfg = load_schedule_config(&files, &model).await.unwrap();
        assert_eq!(cfg.prediction_type, "epsilon");
    }

    #[test]
    fn add_noise_uses_each_examples_timestep() {
        let schedule = NoiseSchedule::new(NoiseScheduleConfig::default()).unwrap();
        let x0 = Tensor::ones((2, 1, 2, 2), DType::F32, &Device::Cpu).unwrap();
        let noise = Tensor::zeros_like(&x0).unwrap();
        let noisy = schedule.add_noise(&x0, &noise, &[0, 999]).unwrap();
        let first = noisy.i((0, 0, 0, 0)).unwrap().to_scalar::<f32>().unwrap();
        let last = noisy.i((1, 0, 0, 0)).unwrap().to_scalar::<f32>().unwrap();
        assert!((first as f64 - schedule.alpha_cumprod(0).sqrt()).abs() < 1e-5);
        assert!((last as f64 - schedule.alpha_cumprod(999).sqrt()).abs() < 1e-5);
    }

    #[test]
    fn training_target_follows_prediction_type() {
        let x0 = Tensor::full(2f32, (2, 1, 1, 1), &Device::Cpu).unwrap();
        let noise = Tensor::full(3f32, (2, 1, 1, 1), &Device::Cpu).unwrap();
        let values = |t: Tensor| t.flatten_all().unwrap().to_vec1::<f32>().unwrap();

        let eps = NoiseSchedule::new(NoiseScheduleConfig::default()).unwrap();
        assert_eq!(values(eps.training_target(&x0, &noise, &[10, 500]).unwrap()), vec![3., 3.]);

        let v = NoiseSchedule::new(NoiseScheduleConfig {
            prediction_type: "v_prediction".into(),
            ..Default::default()
        })
        .unwrap();
        let target = values(v.training_target(&x0, &noise, &[10, 500]).unwrap());
        for (got, t) in target.into_iter().zip([10, 500]) {
            let ac = v.alpha_cumprod(t);
            let expected = ac.sqrt() * 3.0 - (1.0 - ac).sqrt() * 2.0;
            assert!((got as f64 - expected).abs() < 1e-5, "t={t}: {got} vs {expected}");
        }

        let sample = NoiseSchedule::new(NoiseScheduleConfig {
            prediction_type: "sample".into(),
            ..Default::default()
        })
        .unwrap();
        assert_eq!(values(sample.training_target(&x0, &noise, &[1, 2]).unwrap()), vec![2., 2.]);
    }

    #[test]
    fn rejects_out_of_range_timesteps_and_unknown_schedules() {
        let schedule = NoiseSchedule::new(NoiseScheduleConfig::default()).unwrap();
        let x0 = Tensor::ones((1, 4), DType::F32, &Device::Cpu).unwrap();
        assert!(schedule.add_noise(&x0, &x0, &[1000]).is_err());
        assert!(schedule.add_noise(&x0, &x0, &[1, 2]).is_err());
        let cfg = NoiseScheduleConfig {
            beta_schedule: "squaredcos_cap_v2".into(),
            ..Default::default()
        };
        assert!(cfg.ddim_config().is_ok());
        assert!(NoiseSchedule::new(cfg).is_err());
    }
}
