//! Dataset loading and batching.

mod mnist;

pub use mnist::{DataLoader, ImageDataset};
