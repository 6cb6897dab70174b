//! Training loop and loss functions.

mod losses;
mod trainer;

pub use losses::{LossFunction, LossType, SsimLoss};
pub use trainer::{Trainer, TrainingConfig};
