//! Checkpoint metadata for trained denoisers.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

/// JSON sidecar written next to saved denoiser weights.
///
/// Records enough to resume sampling without the original invocation: which
/// schedule the weights were trained against, the objective, and the loss
/// history, alongside the full configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Checkpoint {
    /// Denoiser weights path
    pub model_path: String,
    /// Training epochs completed
    pub epoch: usize,
    /// Best average epoch loss
    pub best_loss: f64,
    /// Schedule the weights were trained against (linear, cosine)
    pub noise_schedule: String,
    /// Diffusion steps the weights expect at sampling time
    pub n_timesteps: usize,
    /// Objective the denoiser was fit under
    pub loss_type: String,
    /// Full configuration used
    pub config: super::Config,
    /// Per-epoch average loss history
    pub losses: Vec<f64>,
}

impl Checkpoint {
    /// Create checkpoint metadata for a finished training run.
    ///
    /// The schedule, timestep count, and loss selector are lifted out of the
    /// config so a reader can sanity-check compatibility without parsing it.
    pub fn new(
        model_path: String,
        epoch: usize,
        best_loss: f64,
        config: super::Config,
        losses: Vec<f64>,
    ) -> Self {
        Self {
            model_path,
            epoch,
            best_loss,
            noise_schedule: config.model.noise_schedule.clone(),
            n_timesteps: config.model.n_timesteps,
            loss_type: config.model.loss_type.clone(),
            config,
            losses,
        }
    }

    /// Loss of the final epoch, if any epochs ran.
    pub fn final_loss(&self) -> Option<f64> {
        self.losses.last().copied()
    }

    /// Save checkpoint metadata.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> anyhow::Result<()> {
        let content = serde_json::to_string_pretty(self)?;
        fs::write(path, content)?;
        Ok(())
    }

    /// Load checkpoint metadata and verify the weights it points at exist.
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = fs::read_to_string(path)?;
        let checkpoint: Checkpoint = serde_json::from_str(&content)?;

        if !Path::new(&checkpoint.model_path).exists() {
            anyhow::bail!(
                "checkpoint references missing weights file: {}",
                checkpoint.model_path
            );
        }

        Ok(checkpoint)
    }
}
