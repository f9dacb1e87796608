//! Batches and the loaders that produce them.

use candle::{Device, Result, Tensor};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;

/// A batch of inputs with their class targets.
#[derive(Clone, Debug)]
pub struct Batch {
    pub data: Tensor,
    pub target: Tensor,
}

impl Batch {
    pub fn new(data: Tensor, target: Tensor) -> Self {
        Self { data, target }
    }

    /// Number of samples in the batch.
    pub fn len(&self) -> Result<usize> {
        self.target.dim(0)
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    pub fn to_device(&self, device: &Device) -> Result<Self> {
        if self.data.device().same_device(device) && self.target.device().same_device(device) {
            return Ok(self.clone());
        }
        Ok(Self {
            data: self.data.to_device(device)?,
            target: self.target.to_device(device)?,
        })
    }
}

/// Source of batches for one pass over a dataset.
pub trait BatchLoader {
    /// Number of samples in the underlying dataset, including any the loader
    /// drops from an incomplete final batch.
    fn dataset_len(&self) -> Result<usize>;

    /// Batches for the next epoch.
    fn epoch_batches(&mut self) -> Result<Vec<Batch>>;
}

impl BatchLoader for [Batch] {
    fn dataset_len(&self) -> Result<usize> {
        self.iter().map(Batch::len).sum()
    }

    fn epoch_batches(&mut self) -> Result<Vec<Batch>> {
        Ok(self.to_vec())
    }
}

impl BatchLoader for Vec<Batch> {
    fn dataset_len(&self) -> Result<usize> {
        self.as_slice().dataset_len()
    }

    fn epoch_batches(&mut self) -> Result<Vec<Batch>> {
        Ok(self.clone())
    }
}

impl<L: BatchLoader + ?Sized> BatchLoader for &mut L {
    fn dataset_len(&self) -> Result<usize> {
        (**self).dataset_len()
    }

    fn epoch_batches(&mut self) -> Result<Vec<Batch>> {
        (**self).epoch_batches()
    }
}

/// Splits a pair of `(samples, ...)` / `(samples,)` tensors into batches,
/// optionally reshuffling samples at the start of every epoch.
pub struct DataLoader {
    data: Tensor,
    targets: Tensor,
    batch_size: usize,
    drop_last: bool,
    rng: Option<StdRng>,
}

impl DataLoader {
    pub fn new(data: Tensor, targets: Tensor, batch_size: usize) -> Result<Self> {
        if batch_size == 0 {
            candle::bail!("batch size must be non-zero")
        }
        let (n_data, n_targets) = (data.dim(0)?, targets.dim(0)?);
        if n_data != n_targets {
            candle::bail!("data has {n_data} samples but targets have {n_targets}")
        }
        Ok(Self {
            data,
            targets,
            batch_size,
            drop_last: false,
            rng: None,
        })
    }

    /// Reshuffle samples each epoch with a generator seeded from `seed`.
    pub fn shuffle(mut self, seed: u64) -> Self {
        self.rng = Some(StdRng::seed_from_u64(seed));
        self
    }

    /// Skip the final batch when it is smaller than `batch_size`.
    pub fn drop_last(mut self, drop_last: bool) -> Self {
        self.drop_last = drop_last;
        self
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    /// Number of batches yielded per epoch.
    pub fn num_batches(&self) -> Result<usize> {
        let n = self.data.dim(0)?;
        Ok(if self.drop_last {
            n / self.batch_size
        } else {
            n.div_ceil(self.batch_size)
        })
    }
}

impl BatchLoader for DataLoader {
    fn dataset_len(&self) -> Result<usize> {
        self.data.dim(0)
    }

    fn epoch_batches(&mut self) -> Result<Vec<Batch>> {
        let n = self.data.dim(0)?;
        let (data, targets) = match self.rng.as_mut() {
            Some(rng) => {
                let mut order: Vec<u32> = (0..n as u32).collect();
                order.shuffle(rng);
                let order = Tensor::from_vec(order, n, self.data.device())?;
                let targets_order = order.to_device(self.targets.device())?;
                (
                    self.data.index_select(&order, 0)?,
                    self.targets.index_select(&targets_order, 0)?,
                )
            }
            None => (self.data.clone(), self.targets.clone()),
        };

        let num_batches = self.num_batches()?;
        let mut batches = Vec::with_capacity(num_batches);
        for idx in 0..num_batches {
            let start = idx * self.batch_size;
            let len = self.batch_size.min(n - start);
            batches.push(Batch {
                data: data.narrow(0, start, len)?,
                target: targets.narrow(0, start, len)?,
            });
        }
        Ok(batches)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dataset(n: usize) -> Result<(Tensor, Tensor)> {
        let dev = Device::Cpu;
        let data = Tensor::arange(0f32, n as f32, &dev)?.reshape((n, 1))?;
        let targets = Tensor::arange(0u32, n as u32, &dev)?;
        Ok((data, targets))
    }

    #[test]
    fn keeps_the_partial_tail() -> Result<()> {
        let (data, targets) = dataset(10)?;
        let mut loader = DataLoader::new(data, targets, 4)?;
        let batches = loader.epoch_batches()?;
        let sizes = batches.iter().map(Batch::len).collect::<Result<Vec<_>>>()?;
        assert_eq!(sizes, [4, 4, 2]);
        assert_eq!(loader.dataset_len()?, 10);
        Ok(())
    }

    #[test]
    fn drop_last_still_reports_full_dataset() -> Result<()> {
        let (data, targets) = dataset(10)?;
        let mut loader = DataLoader::new(data, targets, 4)?.drop_last(true);
        assert_eq!(loader.epoch_batches()?.len(), 2);
        assert_eq!(loader.num_batches()?, 2);
        assert_eq!(loader.dataset_len()?, 10);
        Ok(())
    }

    #[test]
    fn shuffle_keeps_pairs_aligned() -> Result<()> {
        let (data, targets) = dataset(16)?;
        let mut loader = DataLoader::new(data, targets, 5)?.shuffle(1);
        let first = loader.epoch_batches()?;
        let second = loader.epoch_batches()?;

        let mut seen = Vec::new();
        for batch in &first {
            let xs = batch.data.flatten_all()?.to_vec1::<f32>()?;
            let ys = batch.target.to_vec1::<u32>()?;
            for (x, y) in xs.iter().zip(ys.iter()) {
                assert_eq!(*x as u32, *y);
            }
            seen.extend(ys);
        }
        seen.sort();
        assert_eq!(seen, (0..16).collect::<Vec<u32>>());

        let order = |bs: &[Batch]| -> Result<Vec<u32>> {
            let mut out = Vec::new();
            for b in bs {
                out.extend(b.target.to_vec1::<u32>()?);
            }
            Ok(out)
        };
        assert_ne!(order(&first)?, order(&second)?);
        Ok(())
    }

    #[test]
    fn rejects_bad_shapes() -> Result<()> {
        let (data, _) = dataset(4)?;
        let (_, targets) = dataset(3)?;
        assert!(DataLoader::new(data.clone(), targets, 2).is_err());
        let (_, targets) = dataset(4)?;
        assert!(DataLoader::new(data, targets, 0).is_err());
        Ok(())
    }

    #[test]
    fn vec_loader_counts_samples() -> Result<()> {
        let (data, targets) = dataset(5)?;
        let batches = vec![
            Batch::new(data.narrow(0, 0, 3)?, targets.narrow(0, 0, 3)?),
            Batch::new(data.narrow(0, 3, 2)?, targets.narrow(0, 3, 2)?),
        ];
        assert_eq!(batches.dataset_len()?, 5);
        Ok(())
    }
}
