//! Noise schedules for diffusion models.

use std::f64::consts::PI;

use tch::{Device, Kind, Tensor};

use crate::error::{DiffusionError, Result};

/// Noise schedule types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScheduleType {
    Linear,
    Cosine,
}

/// Precomputed variance schedule for a diffusion process.
///
/// Built once at construction and read-only afterwards. All derived arrays
/// have the same length `n_steps` and use a left-to-right cumulative product
/// so rounding stays stable across timesteps.
#[derive(Debug, Clone)]
pub struct NoiseSchedule {
    /// Number of diffusion steps
    pub n_steps: usize,
    /// Beta values (noise levels), non-decreasing in `(0, 1)`
    pub betas: Vec<f64>,
    /// Alpha values (1 - beta)
    pub alphas: Vec<f64>,
    /// Cumulative product of alphas, decreasing in t
    pub alphas_cumprod: Vec<f64>,
    /// Square root of betas
    pub sqrt_betas: Vec<f64>,
    /// Square root of alphas
    pub sqrt_alphas: Vec<f64>,
    /// Square root of cumulative alphas
    pub sqrt_alphas_cumprod: Vec<f64>,
    /// Square root of (1 - cumulative alphas)
    pub sqrt_one_minus_alphas_cumprod: Vec<f64>,
    /// Schedule type
    pub schedule_type: ScheduleType,
}

impl NoiseSchedule {
    /// Create a linear noise schedule.
    ///
    /// β increases linearly from `beta_min` to `beta_max` over `n_steps`.
    pub fn linear(beta_min: f64, beta_max: f64, n_steps: usize) -> Result<Self> {
        if n_steps == 0 {
            return Err(DiffusionError::InvalidHyperparameter(
                "n_steps must be at least 1".to_string(),
            ));
        }
        if !(beta_min > 0.0 && beta_min < beta_max && beta_max < 1.0) {
            return Err(DiffusionError::InvalidHyperparameter(format!(
                "beta bounds must satisfy 0 < beta_min < beta_max < 1, got ({}, {})",
                beta_min, beta_max
            )));
        }

        // linspace over [beta_min, beta_max]; a single step degenerates to beta_min
        let denom = n_steps.saturating_sub(1).max(1) as f64;
        let betas: Vec<f64> = (0..n_steps)
            .map(|i| beta_min + (beta_max - beta_min) * i as f64 / denom)
            .collect();

        Ok(Self::from_betas(betas, ScheduleType::Linear))
    }

    /// Create a cosine noise schedule.
    ///
    /// Pluggable alternative to the linear ramp; preserves the same
    /// downstream invariants (betas in `(0, 1)`, alpha_bar decreasing).
    pub fn cosine(n_steps: usize) -> Result<Self> {
        Self::cosine_with_params(n_steps, 0.008)
    }

    /// Create a cosine noise schedule with custom offset.
    pub fn cosine_with_params(n_steps: usize, s: f64) -> Result<Self> {
        if n_steps == 0 {
            return Err(DiffusionError::InvalidHyperparameter(
                "n_steps must be at least 1".to_string(),
            ));
        }

        let steps = n_steps + 1;
        let t: Vec<f64> = (0..steps).map(|i| i as f64 / n_steps as f64).collect();

        let alphas_cumprod: Vec<f64> = t
            .iter()
            .map(|&ti| ((ti + s) / (1.0 + s) * PI / 2.0).cos().powi(2))
            .collect();

        // Normalize so alpha_bar starts at 1
        let alpha_0 = alphas_cumprod[0];
        let alphas_cumprod: Vec<f64> = alphas_cumprod.iter().map(|&a| a / alpha_0).collect();

        let betas: Vec<f64> = (1..steps)
            .map(|i| {
                let beta = 1.0 - alphas_cumprod[i] / alphas_cumprod[i - 1];
                beta.clamp(0.0001, 0.9999)
            })
            .collect();

        Ok(Self::from_betas(betas, ScheduleType::Cosine))
    }

    /// Create a schedule from beta values.
    fn from_betas(betas: Vec<f64>, schedule_type: ScheduleType) -> Self {
        let n_steps = betas.len();

        let alphas: Vec<f64> = betas.iter().map(|b| 1.0 - b).collect();

        let mut alphas_cumprod = Vec::with_capacity(n_steps);
        let mut prod = 1.0;
        for &alpha in &alphas {
            prod *= alpha;
            alphas_cumprod.push(prod);
        }

        let sqrt_betas: Vec<f64> = betas.iter().map(|b| b.sqrt()).collect();
        let sqrt_alphas: Vec<f64> = alphas.iter().map(|a| a.sqrt()).collect();
        let sqrt_alphas_cumprod: Vec<f64> = alphas_cumprod.iter().map(|a| a.sqrt()).collect();
        let sqrt_one_minus_alphas_cumprod: Vec<f64> =
            alphas_cumprod.iter().map(|a| (1.0 - a).sqrt()).collect();

        Self {
            n_steps,
            betas,
            alphas,
            alphas_cumprod,
            sqrt_betas,
            sqrt_alphas,
            sqrt_alphas_cumprod,
            sqrt_one_minus_alphas_cumprod,
            schedule_type,
        }
    }

    /// Get tensors for the schedule on a specific device.
    pub fn to_tensors(&self, device: Device) -> ScheduleTensors {
        let to_tensor = |v: &[f64]| Tensor::from_slice(v).to_kind(Kind::Float).to(device);

        ScheduleTensors {
            n_steps: self.n_steps as i64,
            alphas: to_tensor(&self.alphas),
            sqrt_betas: to_tensor(&self.sqrt_betas),
            sqrt_alphas: to_tensor(&self.sqrt_alphas),
            sqrt_alphas_cumprod: to_tensor(&self.sqrt_alphas_cumprod),
            sqrt_one_minus_alphas_cumprod: to_tensor(&self.sqrt_one_minus_alphas_cumprod),
        }
    }
}

/// Tensor versions of the schedule parameters, kept on one device.
pub struct ScheduleTensors {
    pub n_steps: i64,
    pub alphas: Tensor,
    pub sqrt_betas: Tensor,
    pub sqrt_alphas: Tensor,
    pub sqrt_alphas_cumprod: Tensor,
    pub sqrt_one_minus_alphas_cumprod: Tensor,
}

impl ScheduleTensors {
    /// Gather per-sample coefficients at the given timesteps and reshape for
    /// broadcasting against a tensor of rank `target_rank`.
    ///
    /// Output shape is `[N, 1, 1, ...]` with `target_rank` dimensions, so the
    /// result combines elementwise with an image batch without replication.
    pub fn extract(&self, coeffs: &Tensor, t: &Tensor, target_rank: usize) -> Result<Tensor> {
        let lo = t.min().int64_value(&[]);
        let hi = t.max().int64_value(&[]);
        if lo < 0 || hi >= self.n_steps {
            return Err(DiffusionError::IndexOutOfRange {
                timestep: if lo < 0 { lo } else { hi },
                n_steps: self.n_steps,
            });
        }

        let batch = t.size()[0];
        let mut shape = vec![batch];
        shape.resize(target_rank, 1);
        Ok(coeffs.index_select(0, t).reshape(shape.as_slice()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_linear_schedule() {
        let schedule = NoiseSchedule::linear(1e-4, 2e-2, 100).unwrap();

        assert_eq!(schedule.n_steps, 100);
        assert!((schedule.betas[0] - 1e-4).abs() < 1e-12);
        assert!((schedule.betas[99] - 2e-2).abs() < 1e-12);

        // betas non-decreasing, alpha_bar strictly decreasing
        for t in 1..100 {
            assert!(schedule.betas[t] >= schedule.betas[t - 1]);
            assert!(schedule.alphas_cumprod[t] < schedule.alphas_cumprod[t - 1]);
        }
        assert!((schedule.alphas_cumprod[0] - schedule.alphas[0]).abs() < 1e-12);
    }

    #[test]
    fn test_sqrt_arrays_are_complementary() {
        let schedule = NoiseSchedule::linear(1e-4, 2e-2, 1000).unwrap();

        for t in 0..1000 {
            let a = schedule.sqrt_alphas_cumprod[t].powi(2);
            let b = schedule.sqrt_one_minus_alphas_cumprod[t].powi(2);
            assert!((a + b - 1.0).abs() < 1e-10, "t={} sum={}", t, a + b);
        }
    }

    #[test]
    fn test_single_step_schedule() {
        let schedule = NoiseSchedule::linear(1e-4, 2e-2, 1).unwrap();
        assert_eq!(schedule.n_steps, 1);
        assert!((schedule.betas[0] - 1e-4).abs() < 1e-12);
    }

    #[test]
    fn test_invalid_hyperparameters() {
        assert!(NoiseSchedule::linear(1e-4, 2e-2, 0).is_err());
        assert!(NoiseSchedule::linear(0.0, 2e-2, 10).is_err());
        assert!(NoiseSchedule::linear(-1e-4, 2e-2, 10).is_err());
        assert!(NoiseSchedule::linear(2e-2, 1e-4, 10).is_err());
        assert!(NoiseSchedule::linear(1e-4, 1.0, 10).is_err());
        assert!(NoiseSchedule::linear(1e-4, 1e-4, 10).is_err());
    }

    #[test]
    fn test_cosine_schedule() {
        let schedule = NoiseSchedule::cosine(100).unwrap();

        assert_eq!(schedule.n_steps, 100);
        for t in 0..100 {
            assert!(schedule.betas[t] > 0.0 && schedule.betas[t] < 1.0);
        }
        // Cosine schedule starts slower
        assert!(schedule.alphas_cumprod[0] > 0.99);
        assert!(schedule.alphas_cumprod[99] < 0.01);
    }

    #[test]
    fn test_extract_replicates_scalar() {
        let schedule = NoiseSchedule::linear(1e-4, 2e-2, 10).unwrap();
        let tensors = schedule.to_tensors(Device::Cpu);

        let t = Tensor::full(&[4], 3, (Kind::Int64, Device::Cpu));
        let out = tensors
            .extract(&tensors.sqrt_alphas_cumprod, &t, 4)
            .unwrap();

        assert_eq!(out.size(), vec![4, 1, 1, 1]);
        for i in 0..4 {
            let v = out.double_value(&[i, 0, 0, 0]);
            assert!((v - schedule.sqrt_alphas_cumprod[3]).abs() < 1e-6);
        }
    }

    #[test]
    fn test_extract_out_of_range() {
        let schedule = NoiseSchedule::linear(1e-4, 2e-2, 10).unwrap();
        let tensors = schedule.to_tensors(Device::Cpu);

        let too_high = Tensor::from_slice(&[10i64]);
        let err = tensors.extract(&tensors.alphas, &too_high, 4);
        assert!(matches!(err, Err(DiffusionError::IndexOutOfRange { .. })));

        let negative = Tensor::from_slice(&[-1i64]);
        let err = tensors.extract(&tensors.alphas, &negative, 4);
        assert!(matches!(err, Err(DiffusionError::IndexOutOfRange { .. })));
    }
}
