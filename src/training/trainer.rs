//! Training loop for the denoiser network.

use indicatif::{ProgressBar, ProgressStyle};
use tch::nn;
use tch::nn::OptimizerConfig;
use tracing::{debug, info};

use super::losses::{LossFunction, LossType};
use crate::data::DataLoader;
use crate::model::{Denoiser, Diffusion};

/// Training configuration.
#[derive(Debug, Clone)]
pub struct TrainingConfig {
    /// Number of epochs
    pub epochs: usize,
    /// Learning rate
    pub learning_rate: f64,
    /// Gradient clipping value
    pub grad_clip: f64,
    /// Log interval (epochs)
    pub log_interval: usize,
    /// Checkpoint interval (epochs)
    pub checkpoint_interval: usize,
    /// Checkpoint directory
    pub checkpoint_dir: String,
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            epochs: 100,
            learning_rate: 5e-5,
            grad_clip: 1.0,
            log_interval: 10,
            checkpoint_interval: 20,
            checkpoint_dir: "checkpoints".to_string(),
        }
    }
}

/// Trainer for the denoising diffusion objective.
///
/// Each step corrupts a clean batch through the forward process and fits the
/// denoiser to the injected noise under the selected loss. The loss function
/// is resolved once at construction, an unsupported selector fails before
/// any compute begins.
pub struct Trainer {
    denoiser: Denoiser,
    diffusion: Diffusion,
    loss_fn: LossFunction,
    config: TrainingConfig,
    optimizer: nn::Optimizer,
    best_loss: f64,
}

impl Trainer {
    /// Create a new trainer.
    pub fn new(
        denoiser: Denoiser,
        diffusion: Diffusion,
        loss_type: LossType,
        config: TrainingConfig,
    ) -> anyhow::Result<Self> {
        let optimizer = nn::Adam::default().build(denoiser.vs(), config.learning_rate)?;
        let loss_fn = LossFunction::new(loss_type);

        Ok(Self {
            denoiser,
            diffusion,
            loss_fn,
            config,
            optimizer,
            best_loss: f64::INFINITY,
        })
    }

    /// Get reference to the denoiser.
    pub fn denoiser(&self) -> &Denoiser {
        &self.denoiser
    }

    /// Best average epoch loss seen so far.
    pub fn best_loss(&self) -> f64 {
        self.best_loss
    }

    /// Train the denoiser, returning the per-epoch average losses.
    pub fn train(&mut self, train_loader: &mut DataLoader) -> anyhow::Result<Vec<f64>> {
        let mut losses = Vec::new();

        let pb = ProgressBar::new(self.config.epochs as u64);
        pb.set_style(
            ProgressStyle::default_bar()
                .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} ({eta}) {msg}")?
                .progress_chars("#>-"),
        );

        for epoch in 0..self.config.epochs {
            train_loader.reset();

            let mut epoch_losses = Vec::new();

            for images in train_loader.by_ref() {
                let (_, epsilon, pred_epsilon) = self.diffusion.forward(&self.denoiser, &images)?;
                let loss = self.loss_fn.compute(&pred_epsilon, &epsilon)?;

                self.optimizer.zero_grad();
                loss.backward();

                for (_, var) in self.denoiser.vs().variables() {
                    let _ = var.grad().clamp_(-self.config.grad_clip, self.config.grad_clip);
                }

                self.optimizer.step();

                epoch_losses.push(loss.double_value(&[]));
            }

            if epoch_losses.is_empty() {
                anyhow::bail!("data loader produced no batches; cannot train on an empty dataset");
            }

            let avg_loss = epoch_losses.iter().sum::<f64>() / epoch_losses.len() as f64;
            losses.push(avg_loss);

            if avg_loss < self.best_loss {
                self.best_loss = avg_loss;
            }

            if (epoch + 1) % self.config.log_interval == 0 {
                info!(
                    "Epoch {:>4}/{} | Loss: {:.6} | Best: {:.6}",
                    epoch + 1,
                    self.config.epochs,
                    avg_loss,
                    self.best_loss
                );
            }

            if (epoch + 1) % self.config.checkpoint_interval == 0 {
                let checkpoint_path = format!(
                    "{}/denoiser_epoch_{}.pt",
                    self.config.checkpoint_dir,
                    epoch + 1
                );

                if let Err(e) = std::fs::create_dir_all(&self.config.checkpoint_dir) {
                    debug!("Could not create checkpoint dir: {}", e);
                }

                if let Err(e) = self.denoiser.save(&checkpoint_path) {
                    debug!("Could not save checkpoint: {}", e);
                } else {
                    debug!("Saved checkpoint to {}", checkpoint_path);
                }
            }

            pb.set_message(format!("Loss: {:.6}", avg_loss));
            pb.inc(1);
        }

        pb.finish_with_message(format!("Training complete! Best loss: {:.6}", self.best_loss));

        // Save final model
        let final_path = format!("{}/denoiser_final.pt", self.config.checkpoint_dir);
        std::fs::create_dir_all(&self.config.checkpoint_dir)?;
        self.denoiser.save(&final_path)?;
        info!("Model saved to: {}", final_path);

        Ok(losses)
    }

    /// Average noise-prediction loss over a dataset.
    pub fn evaluate(&self, loader: &mut DataLoader) -> anyhow::Result<f64> {
        loader.reset();

        let mut total_loss = 0.0;
        let mut num_batches = 0;

        for images in loader.by_ref() {
            let (_, epsilon, pred_epsilon) = self.diffusion.forward(&self.denoiser, &images)?;
            let loss = self.loss_fn.compute(&pred_epsilon, &epsilon)?;
            total_loss += loss.double_value(&[]);
            num_batches += 1;
        }

        if num_batches == 0 {
            anyhow::bail!("data loader produced no batches; nothing to evaluate");
        }

        Ok(total_loss / num_batches as f64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::ImageDataset;
    use crate::model::NoiseSchedule;
    use tch::{Device, Kind, Tensor};

    fn tiny_trainer(loss_type: LossType, checkpoint_dir: String) -> Trainer {
        let schedule = NoiseSchedule::linear(1e-4, 2e-2, 10).unwrap();
        let diffusion = Diffusion::new(schedule, (4, 4, 1), Device::Cpu);
        let denoiser = Denoiser::new((4, 4, 1), 16, 8, 1, Device::Cpu);

        let config = TrainingConfig {
            epochs: 1,
            learning_rate: 1e-3,
            checkpoint_dir,
            ..Default::default()
        };

        Trainer::new(denoiser, diffusion, loss_type, config).unwrap()
    }

    #[test]
    fn test_one_epoch_of_training() {
        tch::manual_seed(21);
        let dir = std::env::temp_dir().join("diffusion_image_trainer_test");
        let mut trainer = tiny_trainer(LossType::PixelL2, dir.to_string_lossy().into_owned());

        let images = Tensor::rand(&[8, 1, 4, 4], (Kind::Float, Device::Cpu));
        let mut loader = DataLoader::new(ImageDataset::new(images), 4, true);

        let losses = trainer.train(&mut loader).unwrap();
        assert_eq!(losses.len(), 1);
        assert!(losses[0].is_finite());
        assert!(trainer.best_loss().is_finite());
    }

    #[test]
    fn test_empty_dataset_is_an_error_not_nan() {
        let dir = std::env::temp_dir().join("diffusion_image_empty_test");
        let mut trainer = tiny_trainer(LossType::PixelL2, dir.to_string_lossy().into_owned());

        let images = Tensor::zeros(&[0, 1, 4, 4], (Kind::Float, Device::Cpu));
        let mut loader = DataLoader::new(ImageDataset::new(images), 4, false);

        assert!(trainer.train(&mut loader).is_err());
        assert!(trainer.evaluate(&mut loader).is_err());
        // best loss untouched by the failed epoch
        assert_eq!(trainer.best_loss(), f64::INFINITY);
    }

    #[test]
    fn test_evaluate_returns_finite_loss() {
        tch::manual_seed(22);
        let dir = std::env::temp_dir().join("diffusion_image_eval_test");
        let trainer = tiny_trainer(LossType::PixelL1, dir.to_string_lossy().into_owned());

        let images = Tensor::rand(&[8, 1, 4, 4], (Kind::Float, Device::Cpu));
        let mut loader = DataLoader::new(ImageDataset::new(images), 4, false);

        let loss = trainer.evaluate(&mut loader).unwrap();
        assert!(loss.is_finite());
    }
}
