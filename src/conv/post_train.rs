use super::BatchNorm;
use crate::{
    autodiff::constant,
    error::{Error, Result, ResultExt},
    ff::Batch,
    net::{Affine, Layer, Net},
    sgd::{Fetcher, SampleList},
    tensor::Tensor,
};

/// Replaces the [`BatchNorm`] layers of a trained network with fixed [`Affine`] transforms.
///
/// Each replacement normalizes with the mean and variance that the layer's input takes over the
/// whole sample list, so the network no longer depends on batch composition. Batch-norm layers
/// directly inside [`Residual`](super::Residual) blocks, or inside networks they wrap, are
/// replaced as well.
pub struct PostTrainer<'a, L, F> {
    /// Samples whose statistics are used.
    pub samples: &'a L,
    /// Turns ranges of samples into batches.
    pub fetcher: &'a F,
    /// Number of samples evaluated at once; zero means all of them.
    pub batch_size: usize,
    /// The network to rewrite.
    pub net: &'a mut Net,
}

impl<'a, L, F> PostTrainer<'a, L, F> {
    /// Create a post-trainer over a network.
    pub fn new(samples: &'a L, fetcher: &'a F, batch_size: usize, net: &'a mut Net) -> Self {
        Self {
            samples,
            fetcher,
            batch_size,
            net,
        }
    }
}

impl<L, F> PostTrainer<'_, L, F>
where
    L: SampleList,
    F: Fetcher<L, Batch = Batch>,
{
    /// Replace every batch-norm layer.
    ///
    /// Layers are processed in order; if a fetch fails, the layers replaced so far stay replaced.
    pub fn run(&mut self) -> Result<()> {
        let mut layers = std::mem::take(&mut self.net.0);
        let res = self.affinize(&mut layers, &[]);
        self.net.0 = layers;
        res
    }

    fn affinize(&self, layers: &mut [Layer], outer: &[Layer]) -> Result<()> {
        for i in 0..layers.len() {
            let (before, rest) = layers.split_at_mut(i);
            let prefix: Vec<Layer> = outer.iter().chain(before.iter()).cloned().collect();
            let replacement = match &mut rest[0] {
                Layer::BatchNorm(bn) => Some(self.fold(bn, &prefix)?),
                Layer::Residual(r) => {
                    let r: &mut super::Residual = r;
                    let parts = std::iter::once(&mut r.layer).chain(r.projection.as_mut());
                    for part in parts {
                        let folded = match part {
                            Layer::Net(n) => {
                                self.affinize(&mut n.0, &prefix)?;
                                None
                            }
                            Layer::BatchNorm(bn) => Some(self.fold(bn, &prefix)?),
                            _ => None,
                        };
                        if let Some(a) = folded {
                            *part = Layer::Affine(a);
                        }
                    }
                    None
                }
                _ => None,
            };
            if let Some(a) = replacement {
                rest[0] = Layer::Affine(a);
            }
        }
        Ok(())
    }

    fn fold(&self, bn: &BatchNorm, prefix: &[Layer]) -> Result<Affine> {
        let (mean, stddev) = self
            .moments(bn, &Net(prefix.to_vec()))
            .context("post train")?;
        let mut scalers = (*bn.scalers.value()).clone();
        for (s, d) in scalers.data_mut().iter_mut().zip(stddev.data()) {
            *s /= d;
        }
        let mut biases = (*bn.biases.value()).clone();
        biases -= &(&mean * &scalers);
        tracing::debug!(
            components = bn.input_count,
            prefix_layers = prefix.len(),
            "replacing batch norm with affine transform"
        );
        Ok(Affine::from_vectors(scalers, biases))
    }

    /// Mean and stabilized standard deviation of each component of `prefix`'s outputs.
    fn moments(&self, bn: &BatchNorm, prefix: &Net) -> Result<(Tensor, Tensor)> {
        let n = bn.input_count;
        let total = self.samples.len();
        let step = if self.batch_size == 0 { total } else { self.batch_size };
        let mut sum = Tensor::zeros(n);
        let mut sq_sum = Tensor::zeros(n);
        let mut count = 0;
        let mut start = 0;
        while start < total {
            let end = (start + step).min(total);
            let batch = self.fetcher.fetch(self.samples, start..end)?;
            let out = prefix.apply(constant(batch.inputs), batch.num);
            let y = out.output();
            count += y.len() / n;
            sum += &y.sum_rows(n);
            sq_sum += &y.map(|x| x * x).sum_rows(n);
            start = end;
        }
        if count == 0 {
            return Err(Error::InvalidData("no samples to average".into()));
        }
        sum.scale(1.0 / count as f64);
        sq_sum.scale(1.0 / count as f64);
        let eps = bn.effective_stabilizer();
        let mut variance = sq_sum;
        variance -= &(&sum * &sum);
        Ok((sum, variance.map(|v| (v + eps).sqrt())))
    }
}
