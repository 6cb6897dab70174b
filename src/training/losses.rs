//! Training objectives: pixel losses and structural similarity.

use std::str::FromStr;

use tch::{Device, Kind, Reduction, Tensor};

use crate::error::{DiffusionError, Result};

/// Selector for the noise-prediction training objective.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LossType {
    /// Pixelwise mean squared error
    PixelL2,
    /// Pixelwise mean absolute error
    PixelL1,
    /// Structural-similarity loss
    Ssim,
}

impl FromStr for LossType {
    type Err = DiffusionError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "mse" | "pixel-l2" => Ok(LossType::PixelL2),
            "mae" | "pixel-l1" => Ok(LossType::PixelL1),
            "ssim" | "structural-similarity" => Ok(LossType::Ssim),
            other => Err(DiffusionError::UnsupportedLoss(other.to_string())),
        }
    }
}

/// Resolved loss function, built once before training begins.
pub enum LossFunction {
    PixelL2,
    PixelL1,
    Ssim(SsimLoss),
}

impl LossFunction {
    pub fn new(loss_type: LossType) -> Self {
        match loss_type {
            LossType::PixelL2 => LossFunction::PixelL2,
            LossType::PixelL1 => LossFunction::PixelL1,
            LossType::Ssim => LossFunction::Ssim(SsimLoss::default()),
        }
    }

    /// Scalar loss between predicted and true noise.
    pub fn compute(&self, pred: &Tensor, target: &Tensor) -> Result<Tensor> {
        match self {
            LossFunction::PixelL2 => Ok(pred.mse_loss(target, Reduction::Mean)),
            LossFunction::PixelL1 => Ok(pred.l1_loss(target, Reduction::Mean)),
            LossFunction::Ssim(ssim) => ssim.loss(pred, target),
        }
    }
}

/// Generate a 1D Gaussian window normalized to sum to 1.
fn gaussian_window(size: i64, sigma: f64) -> Tensor {
    let coords = Tensor::arange(size, (Kind::Float, Device::Cpu)) - (size - 1) as f64 / 2.0;
    let g = (-(&coords * &coords) / (2.0 * sigma * sigma)).exp();
    &g / g.sum(Kind::Float)
}

/// Generate a 2D Gaussian window replicated per channel, shaped
/// `[channels, 1, size, size]` for grouped convolution.
fn create_window(window_size: i64, sigma: f64, channels: i64) -> Tensor {
    let one_d = gaussian_window(window_size, sigma);
    let two_d = one_d.unsqueeze(1).matmul(&one_d.unsqueeze(0));
    two_d
        .reshape(&[1, 1, window_size, window_size])
        .expand(&[channels, 1, window_size, window_size], false)
}

/// Windowed structural-similarity score and loss between image batches.
///
/// The smoothing kernel is built once at construction and never mutated; each
/// call derives a copy converted to the inputs' precision and device, so
/// concurrent callers under mixed-precision training never race on shared
/// state. Every operation participates in gradient propagation.
pub struct SsimLoss {
    window_size: i64,
    channels: i64,
    window: Tensor,
}

impl SsimLoss {
    pub fn new(window_size: i64, sigma: f64, channels: i64) -> Self {
        let window = create_window(window_size, sigma, channels);

        Self {
            window_size,
            channels,
            window,
        }
    }

    /// Mean SSIM score over all pixels and batch elements, in `[0, 1]`.
    ///
    /// Inputs are assumed normalized to `[0, 1]`; the stability constants
    /// are calibrated for that range and nothing is rescaled internally.
    pub fn score(&self, img1: &Tensor, img2: &Tensor) -> Result<Tensor> {
        if img1.size() != img2.size() {
            return Err(DiffusionError::ShapeMismatch {
                expected: img1.size(),
                got: img2.size(),
            });
        }

        let window = self.window.to_kind(img1.kind()).to_device(img1.device());
        let pad = self.window_size / 2;
        let conv = |x: &Tensor| {
            x.conv2d(
                &window,
                None::<Tensor>,
                &[1, 1],
                &[pad, pad],
                &[1, 1],
                self.channels,
            )
        };

        let mu1 = conv(img1);
        let mu2 = conv(img2);

        let mu1_sq = mu1.pow_tensor_scalar(2);
        let mu2_sq = mu2.pow_tensor_scalar(2);
        let mu1_mu2 = &mu1 * &mu2;

        let sigma1_sq = conv(&(img1 * img1)) - &mu1_sq;
        let sigma2_sq = conv(&(img2 * img2)) - &mu2_sq;
        let sigma12 = conv(&(img1 * img2)) - &mu1_mu2;

        const C1: f64 = 0.01 * 0.01;
        const C2: f64 = 0.03 * 0.03;

        let numerator: Tensor = (2.0 * mu1_mu2 + C1) * (2.0 * sigma12 + C2);
        let denominator: Tensor = (mu1_sq + mu2_sq + C1) * (sigma1_sq + sigma2_sq + C2);

        // clamp guards against numerical overshoot from the division
        let ssim_map: Tensor = (numerator / denominator).clamp(0.0, 1.0);
        Ok(ssim_map.mean(Kind::Float))
    }

    /// Loss variant suitable for minimization: `1 - score`.
    pub fn loss(&self, img1: &Tensor, img2: &Tensor) -> Result<Tensor> {
        Ok(1.0 - self.score(img1, img2)?)
    }
}

impl Default for SsimLoss {
    fn default() -> Self {
        Self::new(11, 1.5, 1)
    }
}
