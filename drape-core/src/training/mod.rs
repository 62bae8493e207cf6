//! UNet fine-tuning on (latent, caption) pairs.
//!
//! Each step noises a batch of latents at random timesteps, asks the
//! trainable network for the schedule's training target (the noise, or the
//! velocity for v-prediction pipelines) given the noisy latents and the
//! caption embeddings, and minimizes the mean squared error. Gradients are
//! summed over `gradient_accumulation_steps` micro-batches before AdamW
//! updates the weights.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use candle_core::backprop::GradStore;
use candle_core::{DType, Device, Module, Tensor};
use candle_nn::{AdamW, Optimizer, ParamsAdamW, VarMap};
use candle_transformers::models::stable_diffusion::unet_2d::UNet2DConditionModel;
use indicatif::{ProgressBar, ProgressStyle};
use rand::{rngs::StdRng, seq::SliceRandom, Rng, SeedableRng};
use serde_json::json;

use crate::dataset::{Batch, LatentSource, TrainingDataset};
use crate::{seeded_randn, ModelFamily};

mod pipeline;

pub use pipeline::{
    export_pipeline, load_trainable_unet, load_training_components, load_vae,
    load_varmap_weights, PipelineExport, TrainingComponents,
};
pub use crate::schedule::{NoiseSchedule, NoiseScheduleConfig};

pub const CHECKPOINT_WEIGHTS: &str = "unet/diffusion_pytorch_model.safetensors";

/// Predicts the noise mixed into `noisy_latents`, or whatever other target
/// the pipeline's prediction type asks for.
pub trait NoisePredictor {
    fn predict_noise(
        &self,
        noisy_latents: &Tensor,
        timesteps: &[usize],
        encoder_hidden_states: &Tensor,
    ) -> Result<Tensor>;
}

impl NoisePredictor for UNet2DConditionModel {
    // The candle UNet takes one timestep per call, so examples run one by one.
    fn predict_noise(
        &self,
        noisy_latents: &Tensor,
        timesteps: &[usize],
        encoder_hidden_states: &Tensor,
    ) -> Result<Tensor> {
        let mut preds = Vec::with_capacity(timesteps.len());
        for (i, &t) in timesteps.iter().enumerate() {
            let xs = noisy_latents.narrow(0, i, 1)?;
            let hidden = encoder_hidden_states.narrow(0, i, 1)?;
            preds.push(self.forward(&xs, t as f64, &hidden)?);
        }
        Ok(Tensor::cat(&preds, 0)?)
    }
}

#[derive(Debug, Clone)]
pub struct TrainingConfig {
    pub family: ModelFamily,
    pub output_dir: PathBuf,
    pub train_batch_size: usize,
    pub gradient_accumulation_steps: usize,
    pub learning_rate: f64,
    pub max_train_steps: usize,
    pub seed: u64,
    /// Recorded in each checkpoint so it loads with the base pipeline's
    /// text encoder, VAE, tokenizer and scheduler.
    pub base_model: Option<String>,
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            family: ModelFamily::V1_5,
            output_dir: PathBuf::from("./models/clothes-diffusion"),
            train_batch_size: 1,
            gradient_accumulation_steps: 4,
            learning_rate: 1e-5,
            max_train_steps: 1000,
            seed: 42,
            base_model: None,
        }
    }
}

/// Save at least every 100 steps, or every tenth of the run if that is longer.
pub fn checkpoint_interval(max_train_steps: usize) -> usize {
    100.max(max_train_steps / 10)
}

pub fn checkpoint_dir(output_dir: &Path, step: usize) -> PathBuf {
    output_dir.join(format!("checkpoint-{step}"))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrainingState {
    Idle,
    EncodingBatch,
    Noising,
    Predicting,
    LossComputed,
    OptimizerStepped,
    Checkpointing,
    Done,
}

#[derive(Debug, Clone)]
pub struct TrainingSummary {
    pub steps: usize,
    pub optimizer_steps: usize,
    pub epochs: usize,
    pub final_loss: f32,
    pub checkpoints: Vec<PathBuf>,
}

pub struct Trainer<P, E> {
    config: TrainingConfig,
    predictor: P,
    text_encoder: E,
    params: VarMap,
    schedule: NoiseSchedule,
    optimizer: AdamW,
    device: Device,
    rng: StdRng,
    state: TrainingState,
    global_step: usize,
    optimizer_steps: usize,
    pending: Option<GradStore>,
    pending_micro_batches: usize,
    checkpoints: Vec<PathBuf>,
}

impl<P: NoisePredictor, E: Module> Trainer<P, E> {
    /// `params` must hold exactly the trainable variables of `predictor`.
    pub fn new(
        config: TrainingConfig,
        predictor: P,
        text_encoder: E,
        params: VarMap,
        schedule: NoiseSchedule,
        device: Device,
    ) -> Result<Self> {
        anyhow::ensure!(config.max_train_steps > 0, "max_train_steps must be positive");
        anyhow::ensure!(config.train_batch_size > 0, "train_batch_size must be positive");
        anyhow::ensure!(
            config.gradient_accumulation_steps > 0,
            "gradient_accumulation_steps must be positive"
        );
        let optimizer = AdamW::new(
            params.all_vars(),
            ParamsAdamW {
                lr: config.learning_rate,
                ..Default::default()
            },
        )?;
        Ok(Self {
            rng: StdRng::seed_from_u64(config.seed),
            config,
            predictor,
            text_encoder,
            params,
            schedule,
            optimizer,
            device,
            state: TrainingState::Idle,
            global_step: 0,
            optimizer_steps: 0,
            pending: None,
            pending_micro_batches: 0,
            checkpoints: Vec::new(),
        })
    }

    pub fn state(&self) -> TrainingState {
        self.state
    }

    pub fn global_step(&self) -> usize {
        self.global_step
    }

    pub fn optimizer_steps(&self) -> usize {
        self.optimizer_steps
    }

    pub fn params(&self) -> &VarMap {
        &self.params
    }

    pub fn schedule(&self) -> &NoiseSchedule {
        &self.schedule
    }

    pub fn checkpoints(&self) -> &[PathBuf] {
        &self.checkpoints
    }

    /// One micro-batch: noise, predict, backpropagate, and step the
    /// optimizer or write a checkpoint when their turn comes. Returns the loss.
    pub fn train_step(&mut self, batch: &Batch) -> Result<f32> {
        self.state = TrainingState::EncodingBatch;
        let latents = batch.latents.to_device(&self.device)?.to_dtype(DType::F32)?;
        let input_ids = batch.input_ids.to_device(&self.device)?;
        let encoder_hidden_states = self.text_encoder.forward(&input_ids)?.detach();

        self.state = TrainingState::Noising;
        let noise = seeded_randn(latents.shape().clone(), &mut self.rng, &self.device)?;
        let num_timesteps = self.schedule.num_train_timesteps();
        let timesteps: Vec<usize> = (0..latents.dim(0)?)
            .map(|_| self.rng.gen_range(0..num_timesteps))
            .collect();
        let noisy_latents = self.schedule.add_noise(&latents, &noise, &timesteps)?;

        self.state = TrainingState::Predicting;
        let pred = self
            .predictor
            .predict_noise(&noisy_latents, &timesteps, &encoder_hidden_states)?;

        let target = self.schedule.training_target(&latents, &noise, &timesteps)?;
        let loss = candle_nn::loss::mse(&pred.to_dtype(DType::F32)?, &target)?;
        self.state = TrainingState::LossComputed;
        let loss_value = loss.to_scalar::<f32>()?;

        let scaled = (loss / self.config.gradient_accumulation_steps as f64)?;
        self.accumulate(scaled.backward()?)?;
        self.global_step += 1;

        let last_step = self.global_step >= self.config.max_train_steps;
        if self.pending_micro_batches == self.config.gradient_accumulation_steps || last_step {
            self.apply_gradients()?;
        }
        if self.global_step % checkpoint_interval(self.config.max_train_steps) == 0 {
            self.save_checkpoint(self.global_step)?;
        }
        Ok(loss_value)
    }

    fn accumulate(&mut self, grads: GradStore) -> Result<()> {
        self.pending_micro_batches += 1;
        let Some(mut acc) = self.pending.take() else {
            self.pending = Some(grads);
            return Ok(());
        };
        for var in self.params.all_vars() {
            let Some(grad) = grads.get(var.as_tensor()) else {
                continue;
            };
            let sum = match acc.get(var.as_tensor()) {
                Some(prev) => (prev + grad)?,
                None => grad.clone(),
            };
            acc.insert(var.as_tensor(), sum);
        }
        self.pending = Some(acc);
        Ok(())
    }

    fn apply_gradients(&mut self) -> Result<()> {
        if let Some(grads) = self.pending.take() {
            self.optimizer.step(&grads)?;
            self.optimizer_steps += 1;
        }
        self.pending_micro_batches = 0;
        self.state = TrainingState::OptimizerStepped;
        Ok(())
    }

    pub fn save_checkpoint(&mut self, step: usize) -> Result<PathBuf> {
        self.state = TrainingState::Checkpointing;
        let dir = checkpoint_dir(&self.config.output_dir, step);
        let weights = dir.join(CHECKPOINT_WEIGHTS);
        if let Some(parent) = weights.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        self.params
            .save(&weights)
            .with_context(|| format!("failed to save {}", weights.display()))?;
        let config = json!({
            "_class_name": "UNet2DConditionModel",
            "family": self.config.family,
            "global_step": step,
        });
        std::fs::write(
            dir.join("unet").join("config.json"),
            serde_json::to_string_pretty(&config)?,
        )?;
        let index = json!({
            "_class_name": self.config.family.pipeline_class(),
            "family": self.config.family,
            "base_model": self.config.base_model,
        });
        std::fs::write(
            dir.join("model_index.json"),
            serde_json::to_string_pretty(&index)?,
        )?;
        tracing::info!("Saved checkpoint at step {step} to {}", dir.display());
        self.checkpoints.push(dir.clone());
        Ok(dir)
    }

    /// Trains until `max_train_steps` micro-batches have run, reshuffling
    /// the dataset at every epoch boundary.
    pub fn run<S: LatentSource>(&mut self, dataset: &TrainingDataset<S>) -> Result<TrainingSummary> {
        anyhow::ensure!(!dataset.is_empty(), "the training dataset is empty");
        std::fs::create_dir_all(&self.config.output_dir).with_context(|| {
            format!("failed to create {}", self.config.output_dir.display())
        })?;
        let max_steps = self.config.max_train_steps;
        tracing::info!(
            "Starting training: {} examples, {max_steps} steps, batch size {}, accumulation {}",
            dataset.len(),
            self.config.train_batch_size,
            self.config.gradient_accumulation_steps
        );

        let progress = ProgressBar::new(max_steps as u64);
        progress.set_style(
            ProgressStyle::with_template("{prefix} {bar:40} {pos}/{len} {msg} [{elapsed_precise}]")
                .unwrap_or_else(|_| ProgressStyle::default_bar()),
        );

        let mut order: Vec<usize> = (0..dataset.len()).collect();
        let mut epochs = 0;
        let mut final_loss = f32::NAN;
        while self.global_step < max_steps {
            order.shuffle(&mut self.rng);
            progress.set_prefix(format!("Epoch {epochs}"));
            for chunk in order.chunks(self.config.train_batch_size) {
                let batch = dataset.collate(chunk)?;
                final_loss = self.train_step(&batch)?;
                progress.inc(1);
                progress.set_message(format!("loss: {final_loss:.4}"));
                if self.global_step >= max_steps {
                    break;
                }
            }
            epochs += 1;
        }
        progress.finish_and_clear();

        // A checkpoint-N left in output_dir by an earlier run is overwritten.
        let final_dir = checkpoint_dir(&self.config.output_dir, max_steps);
        if !self.checkpoints.contains(&final_dir) {
            self.save_checkpoint(max_steps)?;
        }
        self.state = TrainingState::Done;
        tracing::info!("Training complete after {max_steps} steps, final loss {final_loss:.4}");
        Ok(TrainingSummary {
            steps: self.global_step,
            optimizer_steps: self.optimizer_steps,
            epochs,
            final_loss,
            checkpoints: self.checkpoints.clone(),
        })
    }
}
