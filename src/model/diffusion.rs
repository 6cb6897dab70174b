//! Forward corruption and reverse sampling processes.

use tch::{Device, Kind, Tensor};
use tracing::debug;

use super::denoiser::NoisePredictor;
use super::schedule::{NoiseSchedule, ScheduleTensors};
use crate::error::{DiffusionError, Result};

/// Rescale an image batch from `[0, 1]` to the diffusion range `[-1, 1]`.
pub fn to_signal_range(x: &Tensor) -> Tensor {
    x * 2.0 - 1.0
}

/// Rescale a batch from the diffusion range `[-1, 1]` back to `[0, 1]`.
pub fn to_image_range(x: &Tensor) -> Tensor {
    (x + 1.0) * 0.5
}

/// DDPM forward corruption and reverse sampling over an immutable schedule.
///
/// Owns the schedule tensors; the denoiser network is passed in per call as a
/// [`NoisePredictor`] capability. Safe to share across concurrent forward
/// passes, the schedule is read-only after construction.
pub struct Diffusion {
    schedule: NoiseSchedule,
    tensors: ScheduleTensors,
    img_h: i64,
    img_w: i64,
    img_c: i64,
    device: Device,
}

impl Diffusion {
    /// Create a diffusion process from a schedule.
    ///
    /// `image_resolution` is (height, width, channels), matching what the
    /// denoiser network accepts.
    pub fn new(schedule: NoiseSchedule, image_resolution: (i64, i64, i64), device: Device) -> Self {
        let (img_h, img_w, img_c) = image_resolution;
        let tensors = schedule.to_tensors(device);

        Self {
            schedule,
            tensors,
            img_h,
            img_w,
            img_c,
            device,
        }
    }

    /// Number of diffusion steps.
    pub fn n_steps(&self) -> usize {
        self.schedule.n_steps
    }

    /// The underlying noise schedule.
    pub fn schedule(&self) -> &NoiseSchedule {
        &self.schedule
    }

    /// Draw one uniform timestep in `[0, n_steps)` per batch element.
    pub fn sample_timesteps(&self, batch: i64) -> Tensor {
        Tensor::randint(
            self.tensors.n_steps,
            &[batch],
            (Kind::Int64, self.device),
        )
    }

    /// Corrupt a clean batch (already in `[-1, 1]`) at the given timesteps,
    /// drawing a fresh unit-Gaussian noise tensor.
    ///
    /// Returns `(noisy, epsilon)`.
    pub fn make_noisy(&self, x_zeros: &Tensor, t: &Tensor) -> Result<(Tensor, Tensor)> {
        let epsilon = Tensor::randn_like(x_zeros);
        self.make_noisy_with(x_zeros, t, epsilon)
    }

    /// Corrupt a clean batch with a caller-supplied noise tensor.
    ///
    /// This is the closed-form marginal of the forward chain:
    /// `noisy = x0 * sqrt(alpha_bar[t]) + epsilon * sqrt(1 - alpha_bar[t])`.
    /// The noisy output is detached, the schedule coefficients are constants
    /// and nothing upstream of this point is differentiated.
    pub fn make_noisy_with(
        &self,
        x_zeros: &Tensor,
        t: &Tensor,
        epsilon: Tensor,
    ) -> Result<(Tensor, Tensor)> {
        if epsilon.size() != x_zeros.size() {
            return Err(DiffusionError::ShapeMismatch {
                expected: x_zeros.size(),
                got: epsilon.size(),
            });
        }

        let rank = x_zeros.size().len();
        let sqrt_alpha_bar = self
            .tensors
            .extract(&self.tensors.sqrt_alphas_cumprod, t, rank)?;
        let sqrt_one_minus_alpha_bar =
            self.tensors
                .extract(&self.tensors.sqrt_one_minus_alphas_cumprod, t, rank)?;

        let noisy = (x_zeros * sqrt_alpha_bar + &epsilon * sqrt_one_minus_alpha_bar).detach();
        Ok((noisy, epsilon))
    }

    /// Training forward pass: rescale to `[-1, 1]`, corrupt at uniformly
    /// sampled timesteps, and predict the injected noise.
    ///
    /// Returns `(noisy, epsilon, predicted_epsilon)`.
    pub fn forward<P: NoisePredictor>(
        &self,
        model: &P,
        x: &Tensor,
    ) -> Result<(Tensor, Tensor, Tensor)> {
        let x_zeros = to_signal_range(x);
        let batch = x_zeros.size()[0];

        let t = self.sample_timesteps(batch);
        let (noisy, epsilon) = self.make_noisy(&x_zeros, &t)?;

        let pred = model.predict(&noisy, &t);
        if pred.size() != noisy.size() {
            return Err(DiffusionError::ShapeMismatch {
                expected: noisy.size(),
                got: pred.size(),
            });
        }

        Ok((noisy, epsilon, pred))
    }

    /// One reverse update from `x_t` to `x_{t-1}` at scalar timestep `t`.
    ///
    /// Noise is injected only for `t > 1`: the final two updates are
    /// deterministic. The result is clamped to `[-1, 1]` to keep long
    /// sampling runs from diverging.
    pub fn denoise_at_t<P: NoisePredictor>(
        &self,
        model: &P,
        x_t: &Tensor,
        t: i64,
    ) -> Result<Tensor> {
        let batch = x_t.size()[0];
        let rank = x_t.size().len();
        let timestep = Tensor::full(&[batch], t, (Kind::Int64, self.device));

        let z = if t > 1 {
            Tensor::randn_like(x_t)
        } else {
            Tensor::zeros_like(x_t)
        };

        let epsilon_pred = model.predict(x_t, &timestep);
        if epsilon_pred.size() != x_t.size() {
            return Err(DiffusionError::ShapeMismatch {
                expected: x_t.size(),
                got: epsilon_pred.size(),
            });
        }

        let alpha = self.tensors.extract(&self.tensors.alphas, &timestep, rank)?;
        let sqrt_alpha = self
            .tensors
            .extract(&self.tensors.sqrt_alphas, &timestep, rank)?;
        let sqrt_one_minus_alpha_bar =
            self.tensors
                .extract(&self.tensors.sqrt_one_minus_alphas_cumprod, &timestep, rank)?;
        let sqrt_beta = self
            .tensors
            .extract(&self.tensors.sqrt_betas, &timestep, rank)?;

        let x_prev: Tensor =
            (x_t - (1.0 - alpha) / sqrt_one_minus_alpha_bar * epsilon_pred) / sqrt_alpha
                + sqrt_beta * z;

        Ok(x_prev.clamp(-1.0, 1.0))
    }

    /// Generate `n` images by running the full reverse sweep from pure noise.
    ///
    /// Strictly sequential over timesteps, each step consumes the previous
    /// step's output. Returns a batch in `[0, 1]`.
    pub fn sample<P: NoisePredictor>(&self, model: &P, n: i64) -> Result<Tensor> {
        let mut x_t = Tensor::randn(
            &[n, self.img_c, self.img_h, self.img_w],
            (Kind::Float, self.device),
        );

        for t in (0..self.tensors.n_steps).rev() {
            x_t = self.denoise_at_t(model, &x_t, t)?;
        }
        debug!("sampled {} images over {} steps", n, self.tensors.n_steps);

        Ok(to_image_range(&x_t))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Test double that always returns a fixed noise tensor.
    struct FixedNoise {
        eps: Tensor,
    }

    impl NoisePredictor for FixedNoise {
        fn predict(&self, _x: &Tensor, _t: &Tensor) -> Tensor {
            self.eps.shallow_clone()
        }
    }

    /// Test double that predicts zero noise.
    struct ZeroNoise;

    impl NoisePredictor for ZeroNoise {
        fn predict(&self, x: &Tensor, _t: &Tensor) -> Tensor {
            Tensor::zeros_like(x)
        }
    }

    /// Test double that returns the wrong shape.
    struct BadShape;

    impl NoisePredictor for BadShape {
        fn predict(&self, x: &Tensor, _t: &Tensor) -> Tensor {
            Tensor::zeros(&[x.size()[0], 1, 2, 2], (Kind::Float, x.device()))
        }
    }

    fn small_diffusion(n_steps: usize) -> Diffusion {
        let schedule = NoiseSchedule::linear(1e-4, 2e-2, n_steps).unwrap();
        Diffusion::new(schedule, (4, 4, 1), Device::Cpu)
    }

    fn max_abs_diff(a: &Tensor, b: &Tensor) -> f64 {
        (a - b).abs().max().double_value(&[])
    }

    #[test]
    fn test_forward_closed_form_on_zero_image() {
        // With an all-zero clean image, the signal term vanishes and the
        // noisy output is exactly epsilon * sqrt(1 - alpha_bar[t]).
        tch::manual_seed(42);
        let diffusion = small_diffusion(4);

        let x_zeros = Tensor::zeros(&[1, 1, 4, 4], (Kind::Float, Device::Cpu));
        let t = Tensor::from_slice(&[2i64]);
        let eps = Tensor::randn(&[1, 1, 4, 4], (Kind::Float, Device::Cpu));

        let (noisy, returned_eps) = diffusion
            .make_noisy_with(&x_zeros, &t, eps.shallow_clone())
            .unwrap();

        let coeff = diffusion.schedule().sqrt_one_minus_alphas_cumprod[2];
        let expected = &eps * coeff;

        assert!(max_abs_diff(&noisy, &expected) < 1e-6);
        assert!(max_abs_diff(&returned_eps, &eps) < 1e-12);
    }

    #[test]
    fn test_forward_then_reverse_at_t0_recovers_image() {
        // At t = 0 the reverse update is the exact algebraic inverse of the
        // forward corruption when the predictor returns the true epsilon.
        tch::manual_seed(7);
        let diffusion = small_diffusion(4);

        // clean image strictly inside [-1, 1] so the clamp is a no-op
        let x_zeros = Tensor::rand(&[2, 1, 4, 4], (Kind::Float, Device::Cpu)) * 1.8 - 0.9;
        let t = Tensor::from_slice(&[0i64, 0]);
        let eps = Tensor::randn(&[2, 1, 4, 4], (Kind::Float, Device::Cpu));

        let (noisy, _) = diffusion
            .make_noisy_with(&x_zeros, &t, eps.shallow_clone())
            .unwrap();

        let oracle = FixedNoise { eps };
        let recovered = diffusion.denoise_at_t(&oracle, &noisy, 0).unwrap();

        assert!(max_abs_diff(&recovered, &x_zeros) < 1e-4);
    }

    #[test]
    fn test_single_step_sampling_is_deterministic() {
        // With T = 1 the only update is at t = 0, which injects no noise, so
        // the sweep is a deterministic function of the initial draw.
        let diffusion = small_diffusion(1);

        tch::manual_seed(123);
        let a = diffusion.sample(&ZeroNoise, 3).unwrap();
        tch::manual_seed(123);
        let b = diffusion.sample(&ZeroNoise, 3).unwrap();

        assert_eq!(a.size(), vec![3, 1, 4, 4]);
        assert!(max_abs_diff(&a, &b) < 1e-12);

        // output rescaled to [0, 1]
        assert!(a.min().double_value(&[]) >= 0.0);
        assert!(a.max().double_value(&[]) <= 1.0);
    }

    #[test]
    fn test_noise_injection_cutoff_is_t_greater_than_one() {
        // The source formulation skips noise injection for both t = 1 and
        // t = 0, not just t = 0. Both of the last two updates must be
        // deterministic; earlier ones must not be.
        let diffusion = small_diffusion(4);
        let x_t = Tensor::rand(&[2, 1, 4, 4], (Kind::Float, Device::Cpu)) * 1.8 - 0.9;

        for t in [0, 1] {
            let a = diffusion.denoise_at_t(&ZeroNoise, &x_t, t).unwrap();
            let b = diffusion.denoise_at_t(&ZeroNoise, &x_t, t).unwrap();
            assert!(max_abs_diff(&a, &b) < 1e-12, "t={} should be deterministic", t);
        }

        tch::manual_seed(1);
        let a = diffusion.denoise_at_t(&ZeroNoise, &x_t, 2).unwrap();
        tch::manual_seed(2);
        let b = diffusion.denoise_at_t(&ZeroNoise, &x_t, 2).unwrap();
        assert!(max_abs_diff(&a, &b) > 1e-6, "t=2 should inject noise");
    }

    #[test]
    fn test_reverse_step_clamps_output() {
        let diffusion = small_diffusion(4);
        // huge magnitudes force the update outside [-1, 1]
        let x_t = Tensor::ones(&[1, 1, 4, 4], (Kind::Float, Device::Cpu)) * 50.0;

        let out = diffusion.denoise_at_t(&ZeroNoise, &x_t, 0).unwrap();
        assert!(out.max().double_value(&[]) <= 1.0);
        assert!(out.min().double_value(&[]) >= -1.0);
    }

    #[test]
    fn test_shape_mismatch_is_fatal() {
        let diffusion = small_diffusion(4);
        let x = Tensor::rand(&[2, 1, 4, 4], (Kind::Float, Device::Cpu));

        let err = diffusion.denoise_at_t(&BadShape, &x, 0);
        assert!(matches!(err, Err(DiffusionError::ShapeMismatch { .. })));

        let err = diffusion.forward(&BadShape, &x);
        assert!(matches!(err, Err(DiffusionError::ShapeMismatch { .. })));
    }

    #[test]
    fn test_forward_pass_shapes_and_detach() {
        tch::manual_seed(11);
        let diffusion = small_diffusion(10);
        let x = Tensor::rand(&[3, 1, 4, 4], (Kind::Float, Device::Cpu));

        let (noisy, eps, pred) = diffusion.forward(&ZeroNoise, &x).unwrap();
        assert_eq!(noisy.size(), x.size());
        assert_eq!(eps.size(), x.size());
        assert_eq!(pred.size(), x.size());
        assert!(!noisy.requires_grad());
    }

    #[test]
    fn test_scale_round_trip() {
        let x = Tensor::rand(&[2, 1, 4, 4], (Kind::Float, Device::Cpu));
        let back = to_image_range(&to_signal_range(&x));
        assert!(max_abs_diff(&back, &x) < 1e-6);
    }
}
