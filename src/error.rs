//! Error types for the diffusion core.

use thiserror::Error;

/// Errors raised by the diffusion numeric core.
///
/// None of these are transient: every variant indicates a programmer or
/// configuration error and is surfaced synchronously to the caller.
#[derive(Error, Debug)]
pub enum DiffusionError {
    #[error("invalid hyperparameter: {0}")]
    InvalidHyperparameter(String),

    #[error("timestep {timestep} out of range [0, {n_steps})")]
    IndexOutOfRange { timestep: i64, n_steps: i64 },

    #[error("shape mismatch: expected {expected:?}, got {got:?}")]
    ShapeMismatch { expected: Vec<i64>, got: Vec<i64> },

    #[error("unsupported loss type: {0}")]
    UnsupportedLoss(String),
}

/// Result type alias for diffusion operations.
pub type Result<T> = std::result::Result<T, DiffusionError>;
