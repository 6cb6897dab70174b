//! Image dataset and batching.

use rand::seq::SliceRandom;
use tch::{Device, Tensor};

/// A batch-indexable image dataset, `[N, C, H, W]` with values in `[0, 1]`.
pub struct ImageDataset {
    pub images: Tensor,
}

impl ImageDataset {
    /// Create a dataset from an image tensor of shape `[N, C, H, W]`.
    pub fn new(images: Tensor) -> Self {
        Self { images }
    }

    /// Load MNIST from a directory containing the ubyte files.
    ///
    /// Images come back as `[N, 1, 28, 28]` floats in `[0, 1]`.
    pub fn mnist(dir: &str, train: bool, device: Device) -> anyhow::Result<Self> {
        let mnist = tch::vision::mnist::load_dir(dir)?;
        let images = if train {
            mnist.train_images
        } else {
            mnist.test_images
        };

        let n = images.size()[0];
        let images = images.reshape(&[n, 1, 28, 28]).to(device);

        Ok(Self { images })
    }

    /// Get the number of samples.
    pub fn len(&self) -> i64 {
        self.images.size()[0]
    }

    /// Check if empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Get a batch of images by index.
    pub fn get_batch(&self, indices: &[i64]) -> Tensor {
        // index must live on the same device as the images
        let idx = Tensor::from_slice(indices).to_device(self.images.device());
        self.images.index_select(0, &idx)
    }
}

/// Data loader yielding shuffled image batches.
pub struct DataLoader {
    dataset: ImageDataset,
    batch_size: usize,
    shuffle: bool,
    indices: Vec<i64>,
    current_idx: usize,
}

impl DataLoader {
    /// Create a new data loader.
    pub fn new(dataset: ImageDataset, batch_size: usize, shuffle: bool) -> Self {
        let n = dataset.len();
        let indices: Vec<i64> = (0..n).collect();

        Self {
            dataset,
            batch_size,
            shuffle,
            indices,
            current_idx: 0,
        }
    }

    /// Reset the loader for a new epoch.
    pub fn reset(&mut self) {
        self.current_idx = 0;

        if self.shuffle {
            let mut rng = rand::thread_rng();
            self.indices.shuffle(&mut rng);
        }
    }

    /// Get the number of batches.
    pub fn num_batches(&self) -> usize {
        (self.indices.len() + self.batch_size - 1) / self.batch_size
    }
}

impl Iterator for DataLoader {
    type Item = Tensor;

    fn next(&mut self) -> Option<Self::Item> {
        if self.current_idx >= self.indices.len() {
            return None;
        }

        let end_idx = (self.current_idx + self.batch_size).min(self.indices.len());
        let batch_indices = &self.indices[self.current_idx..end_idx];

        self.current_idx = end_idx;

        Some(self.dataset.get_batch(batch_indices))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tch::Kind;

    #[test]
    fn test_loader_batching() {
        let images = Tensor::rand(&[10, 1, 4, 4], (Kind::Float, Device::Cpu));
        let mut loader = DataLoader::new(ImageDataset::new(images), 4, false);

        assert_eq!(loader.num_batches(), 3);

        let sizes: Vec<i64> = loader.by_ref().map(|b| b.size()[0]).collect();
        assert_eq!(sizes, vec![4, 4, 2]);

        // exhausted until reset
        assert!(loader.next().is_none());
        loader.reset();
        assert_eq!(loader.by_ref().count(), 3);
    }

    #[test]
    fn test_batch_lives_on_dataset_device() {
        let images = Tensor::rand(&[6, 1, 4, 4], (Kind::Float, Device::Cpu));
        let dataset = ImageDataset::new(images);

        let batch = dataset.get_batch(&[0, 3, 5]);
        assert_eq!(batch.device(), dataset.images.device());
        assert_eq!(batch.size(), vec![3, 1, 4, 4]);

        if tch::Cuda::is_available() {
            let gpu = ImageDataset::new(dataset.images.to_device(Device::Cuda(0)));
            let batch = gpu.get_batch(&[0, 1]);
            assert_eq!(batch.device(), Device::Cuda(0));
        }
    }

    #[test]
    fn test_loader_yields_every_sample_once() {
        let images = Tensor::arange(6, (Kind::Float, Device::Cpu)).reshape(&[6, 1, 1, 1]);
        let mut loader = DataLoader::new(ImageDataset::new(images), 2, true);
        loader.reset();

        let mut seen: Vec<i64> = loader
            .by_ref()
            .flat_map(|b| {
                let flat = b.reshape(&[-1]);
                let n = flat.size()[0];
                (0..n).map(move |i| flat.double_value(&[i]) as i64).collect::<Vec<_>>()
            })
            .collect();
        seen.sort_unstable();

        assert_eq!(seen, vec![0, 1, 2, 3, 4, 5]);
    }
}
