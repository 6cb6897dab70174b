//! Denoiser network and the capability the diffusion core depends on.

use tch::nn::Module;
use tch::{nn, Device, Kind, Tensor};

/// Capability the diffusion process needs from a denoiser: predict the noise
/// present in a corrupted image batch at the given timesteps.
///
/// The output must have exactly the shape of `x`; the sampling loop treats
/// any disagreement as a contract violation. Implemented by [`Denoiser`] and
/// by deterministic doubles in tests.
pub trait NoisePredictor {
    fn predict(&self, x: &Tensor, t: &Tensor) -> Tensor;
}

/// Sinusoidal features for a batch of timesteps, `[N, dim]`.
///
/// Frequencies decay geometrically from 1 to 1/10000 across `dim / 2`
/// channels; each contributes a sin and a cos column.
fn sinusoidal_embedding(timesteps: &Tensor, dim: i64) -> Tensor {
    let device = timesteps.device();
    let half_dim = dim / 2;

    // a single frequency channel (dim == 2) gets no decay
    let decay = 10000.0_f64.ln() / (half_dim - 1).max(1) as f64;
    let freqs = (Tensor::arange(half_dim, (Kind::Float, device)) * -decay).exp();
    let angles = timesteps.unsqueeze(-1).to_kind(Kind::Float) * freqs.unsqueeze(0);

    Tensor::cat(&[angles.sin(), angles.cos()], -1)
}

/// Timestep encoder: sinusoidal features refined by a two-layer MLP.
#[derive(Debug)]
struct TimeEmbedding {
    proj_in: nn::Linear,
    proj_out: nn::Linear,
    sin_dim: i64,
}

impl TimeEmbedding {
    fn new(vs: &nn::Path, sin_dim: i64, hidden_dim: i64) -> Self {
        Self {
            proj_in: nn::linear(vs / "time_in", sin_dim, hidden_dim, Default::default()),
            proj_out: nn::linear(vs / "time_out", hidden_dim, hidden_dim, Default::default()),
            sin_dim,
        }
    }

    fn forward(&self, t: &Tensor) -> Tensor {
        let feats = sinusoidal_embedding(t, self.sin_dim);
        self.proj_out.forward(&self.proj_in.forward(&feats).silu())
    }
}

/// Time-conditioned residual MLP denoiser for image batches.
///
/// Flattens `[N, C, H, W]` input, concatenates a timestep embedding, runs
/// residual Linear + LayerNorm + SiLU blocks, and projects back to the image
/// shape. Predicts the noise component of its input.
pub struct Denoiser {
    vs: nn::VarStore,
    time_embedding: TimeEmbedding,
    input_proj: nn::Linear,
    layers: Vec<(nn::Linear, nn::LayerNorm)>,
    output_proj: nn::Linear,
    img_c: i64,
    img_h: i64,
    img_w: i64,
}

impl Denoiser {
    /// Create a new denoiser.
    ///
    /// # Arguments
    /// * `image_resolution` - (height, width, channels) of the images
    /// * `hidden_dim` - Hidden dimension size
    /// * `time_emb_dim` - Sinusoidal timestep embedding dimension
    /// * `n_layers` - Number of residual blocks
    /// * `device` - Device to run on
    pub fn new(
        image_resolution: (i64, i64, i64),
        hidden_dim: i64,
        time_emb_dim: i64,
        n_layers: i64,
        device: Device,
    ) -> Self {
        let (img_h, img_w, img_c) = image_resolution;
        let flat_dim = img_c * img_h * img_w;

        let vs = nn::VarStore::new(device);
        let root = vs.root();

        let time_embedding = TimeEmbedding::new(&root, time_emb_dim, hidden_dim);

        // Input to the trunk: flattened noisy image + time embedding
        let input_proj = nn::linear(
            &root / "input_proj",
            flat_dim + hidden_dim,
            hidden_dim,
            Default::default(),
        );

        let mut layers = Vec::new();
        for i in 0..n_layers {
            let linear = nn::linear(
                &root / format!("layer_{}", i),
                hidden_dim,
                hidden_dim,
                Default::default(),
            );
            let norm = nn::layer_norm(
                &root / format!("norm_{}", i),
                vec![hidden_dim],
                Default::default(),
            );
            layers.push((linear, norm));
        }

        let output_proj = nn::linear(
            &root / "output_proj",
            hidden_dim,
            flat_dim,
            Default::default(),
        );

        Self {
            vs,
            time_embedding,
            input_proj,
            layers,
            output_proj,
            img_c,
            img_h,
            img_w,
        }
    }

    /// Get the variable store.
    pub fn vs(&self) -> &nn::VarStore {
        &self.vs
    }

    /// Save model weights to file.
    pub fn save(&self, path: &str) -> anyhow::Result<()> {
        self.vs.save(path)?;
        Ok(())
    }

    /// Load model weights from file.
    pub fn load(&mut self, path: &str) -> anyhow::Result<()> {
        self.vs.load(path)?;
        Ok(())
    }
}

impl NoisePredictor for Denoiser {
    fn predict(&self, x: &Tensor, t: &Tensor) -> Tensor {
        let batch = x.size()[0];
        let flat = x.reshape(&[batch, self.img_c * self.img_h * self.img_w]);

        let t_emb = self.time_embedding.forward(t);
        let combined = Tensor::cat(&[&flat, &t_emb], -1);

        let mut h = self.input_proj.forward(&combined);
        for (linear, norm) in &self.layers {
            let z = linear.forward(&h);
            let z = norm.forward(&z);
            // residual connection around each block
            h = z.silu() + h;
        }

        self.output_proj
            .forward(&h)
            .reshape(&[batch, self.img_c, self.img_h, self.img_w])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prediction_shape_matches_input() {
        let denoiser = Denoiser::new((8, 8, 1), 32, 16, 2, Device::Cpu);

        let x = Tensor::randn(&[4, 1, 8, 8], (Kind::Float, Device::Cpu));
        let t = Tensor::from_slice(&[0i64, 1, 2, 3]);

        let pred = denoiser.predict(&x, &t);
        assert_eq!(pred.size(), x.size());
    }

    #[test]
    fn test_sinusoidal_embedding_dim() {
        let t = Tensor::from_slice(&[0i64, 5, 9]);
        let emb = sinusoidal_embedding(&t, 16);
        assert_eq!(emb.size(), vec![3, 16]);
    }

    #[test]
    fn test_smallest_embedding_dim_is_finite() {
        let t = Tensor::from_slice(&[0i64, 7, 999]);
        let emb = sinusoidal_embedding(&t, 2);

        assert_eq!(emb.size(), vec![3, 2]);
        assert!(emb.sum(Kind::Float).double_value(&[]).is_finite());
        assert!(emb.abs().max().double_value(&[]) <= 1.0 + 1e-6);
    }
}
