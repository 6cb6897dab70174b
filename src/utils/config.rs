//! Configuration handling.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

/// Main configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub data: DataConfig,
    pub model: ModelConfig,
    pub training: TrainingConfig,
}

/// Data configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataConfig {
    /// Directory holding the MNIST ubyte files
    pub data_dir: String,
    /// Batch size
    pub batch_size: usize,
}

/// Model configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    /// Image height
    pub image_height: i64,
    /// Image width
    pub image_width: i64,
    /// Image channels
    pub image_channels: i64,
    /// Hidden dimension of the denoiser
    pub hidden_dim: i64,
    /// Timestep embedding dimension
    pub time_emb_dim: i64,
    /// Number of residual blocks in the denoiser
    pub n_layers: i64,
    /// Number of diffusion steps
    pub n_timesteps: usize,
    /// Schedule lower beta bound
    pub beta_min: f64,
    /// Schedule upper beta bound
    pub beta_max: f64,
    /// Noise schedule type (linear, cosine)
    pub noise_schedule: String,
    /// Loss selector (mse, mae, ssim)
    pub loss_type: String,
}

/// Training configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainingConfig {
    /// Number of epochs
    pub epochs: usize,
    /// Learning rate
    pub learning_rate: f64,
    /// Gradient clipping
    pub grad_clip: f64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data: DataConfig {
                data_dir: "data".to_string(),
                batch_size: 128,
            },
            model: ModelConfig {
                image_height: 28,
                image_width: 28,
                image_channels: 1,
                hidden_dim: 256,
                time_emb_dim: 256,
                n_layers: 8,
                n_timesteps: 1000,
                beta_min: 1e-4,
                beta_max: 2e-2,
                noise_schedule: "linear".to_string(),
                loss_type: "mse".to_string(),
            },
            training: TrainingConfig {
                epochs: 100,
                learning_rate: 5e-5,
                grad_clip: 1.0,
            },
        }
    }
}

impl Config {
    /// Image resolution as (height, width, channels).
    pub fn image_resolution(&self) -> (i64, i64, i64) {
        (
            self.model.image_height,
            self.model.image_width,
            self.model.image_channels,
        )
    }

    /// Load configuration from file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = fs::read_to_string(path)?;
        let config: Config = serde_json::from_str(&content)?;
        Ok(config)
    }

    /// Save configuration to file.
    pub fn to_file<P: AsRef<Path>>(&self, path: P) -> anyhow::Result<()> {
        let content = serde_json::to_string_pretty(self)?;
        fs::write(path, content)?;
        Ok(())
    }
}
