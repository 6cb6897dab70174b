//! Configuration and checkpoint utilities.

mod checkpoint;
mod config;

pub use checkpoint::Checkpoint;
pub use config::{Config, DataConfig, ModelConfig, TrainingConfig};
