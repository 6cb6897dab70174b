//! # Denoising Diffusion for Images
//!
//! This library implements Denoising Diffusion Probabilistic Models (DDPM)
//! for image generation: a precomputed noise schedule, the closed-form
//! forward corruption process, the iterative reverse sampling process, and a
//! structural-similarity training objective.
//!
//! ## Features
//!
//! - Linear and cosine noise schedules with validated hyperparameters
//! - Closed-form forward corruption at arbitrary timesteps
//! - Full reverse sampling sweep over a pluggable denoiser network
//! - Pixel (L1/L2) and SSIM training losses
//! - Training pipeline with checkpointing
//!
//! ## Example
//!
//! ```rust,no_run
//! use diffusion_image::{
//!     model::{Denoiser, Diffusion, NoiseSchedule},
//!     training::{LossType, Trainer, TrainingConfig},
//! };
//!
//! fn main() -> anyhow::Result<()> {
//!     let device = tch::Device::Cpu;
//!     let schedule = NoiseSchedule::linear(1e-4, 2e-2, 1000)?;
//!     let diffusion = Diffusion::new(schedule, (28, 28, 1), device);
//!     let denoiser = Denoiser::new((28, 28, 1), 256, 256, 8, device);
//!
//!     let mut trainer = Trainer::new(
//!         denoiser,
//!         diffusion,
//!         LossType::PixelL2,
//!         TrainingConfig::default(),
//!     )?;
//!
//!     Ok(())
//! }
//! ```

pub mod data;
pub mod error;
pub mod model;
pub mod training;
pub mod utils;

pub use data::{DataLoader, ImageDataset};
pub use error::DiffusionError;
pub use model::{Denoiser, Diffusion, NoisePredictor, NoiseSchedule};
pub use training::{LossType, SsimLoss, Trainer, TrainingConfig};
pub use utils::{Checkpoint, Config};
