//! Training feed-forward networks on input/output pairs.

use std::ops::Range;

use rayon::prelude::*;

use crate::{
    autodiff::{constant, scale, sum, Grad, ResRef, Var},
    error::{Error, Result, ResultExt},
    net::{cost::Cost, Layer},
    sgd::{cost_gradient, Fetcher, Gradienter, SampleList},
    tensor::Tensor,
};

/// An input and its desired output.
#[derive(Clone, Debug, PartialEq)]
pub struct Sample {
    /// Network input.
    pub input: Tensor,
    /// Desired network output.
    pub output: Tensor,
}

/// A sample list held in memory.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct SliceSampleList(pub Vec<Sample>);

impl SampleList for SliceSampleList {
    type Sample = Sample;

    fn len(&self) -> usize {
        self.0.len()
    }

    fn swap(&mut self, i: usize, j: usize) {
        self.0.swap(i, j);
    }

    fn get(&self, i: usize) -> Result<Sample> {
        Ok(self.0[i].clone())
    }
}

/// Packed inputs and outputs of several samples.
#[derive(Clone, Debug, PartialEq)]
pub struct Batch {
    /// Concatenated inputs.
    pub inputs: Tensor,
    /// Concatenated desired outputs.
    pub outputs: Tensor,
    /// Number of samples.
    pub num: usize,
}

/// Load the samples in `range` on the rayon pool and pack them into a batch.
pub fn fetch_batch<L>(samples: &L, range: Range<usize>) -> Result<Batch>
where
    L: SampleList<Sample = Sample> + Sync,
{
    if range.is_empty() {
        return Err(Error::EmptyBatch).context("fetch batch");
    }
    let loaded = range
        .into_par_iter()
        .map(|i| samples.get(i))
        .collect::<Result<Vec<_>>>()
        .context("fetch batch")?;
    Ok(Batch {
        inputs: Tensor::concat(loaded.iter().map(|s| &s.input)),
        outputs: Tensor::concat(loaded.iter().map(|s| &s.output)),
        num: loaded.len(),
    })
}

/// Fetches batches and computes gradients for a feed-forward network.
pub struct Trainer {
    /// The trained network.
    pub net: Layer,
    /// Cost of each sample.
    pub cost: Box<dyn Cost>,
    /// Variables to differentiate.
    pub params: Vec<Var>,
    /// Average the per-sample costs instead of summing them.
    pub average: bool,
    /// Total cost of the last batch passed to [`Gradienter::gradient`].
    pub last_cost: f64,
}

impl Trainer {
    /// Create a trainer over all parameters of `net`, averaging the cost.
    pub fn new<C: Cost + 'static>(net: Layer, cost: C) -> Self {
        let params = net.parameters();
        Self {
            net,
            cost: Box::new(cost),
            params,
            average: true,
            last_cost: 0.0,
        }
    }

    /// Build the graph of the (possibly averaged) total cost of a batch.
    pub fn total_cost(&self, batch: &Batch) -> ResRef {
        let out = self.net.apply(constant(batch.inputs.clone()), batch.num);
        let cost = self.cost.cost(constant(batch.outputs.clone()), out, batch.num);
        let n = cost.output().len();
        let total = sum(cost);
        if self.average && n > 0 {
            scale(total, 1.0 / n as f64)
        } else {
            total
        }
    }
}

impl<L: SampleList<Sample = Sample> + Sync> Fetcher<L> for Trainer {
    type Batch = Batch;

    fn fetch(&self, samples: &L, range: Range<usize>) -> Result<Batch> {
        fetch_batch(samples, range)
    }
}

impl Gradienter<Batch> for Trainer {
    fn gradient(&mut self, batch: &Batch) -> Grad {
        let total = self.total_cost(batch);
        self.last_cost = total.output()[0];
        tracing::debug!(cost = self.last_cost, samples = batch.num, "feed-forward gradient");
        cost_gradient(&total, &self.params)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::{cost::Mse, Fc};

    struct Flaky(SliceSampleList);

    impl SampleList for Flaky {
        type Sample = Sample;

        fn len(&self) -> usize {
            self.0.len()
        }

        fn swap(&mut self, i: usize, j: usize) {
            self.0.swap(i, j);
        }

        fn get(&self, i: usize) -> Result<Sample> {
            if i == 1 {
                Err(Error::InvalidData("corrupt sample".into()))
            } else {
                self.0.get(i)
            }
        }
    }

    fn samples() -> SliceSampleList {
        SliceSampleList(
            (0..3)
                .map(|i| Sample {
                    input: Tensor::from(vec![i as f64, 1.0]),
                    output: Tensor::from(vec![2.0 * i as f64]),
                })
                .collect(),
        )
    }

    #[test]
    fn packs_in_order() {
        let b = fetch_batch(&samples(), 1..3).unwrap();
        assert_eq!(b.num, 2);
        assert_eq!(b.inputs.data(), &[1.0, 1.0, 2.0, 1.0]);
        assert_eq!(b.outputs.data(), &[2.0, 4.0]);
    }

    #[test]
    fn empty_batch_is_an_error() {
        let err = fetch_batch(&samples(), 2..2).unwrap_err();
        assert_eq!(err.to_string(), "fetch batch: empty batch");
    }

    #[test]
    fn sample_errors_propagate() {
        let err = fetch_batch(&Flaky(samples()), 0..3).unwrap_err();
        assert!(err.to_string().contains("corrupt sample"));
    }

    #[test]
    fn gradient_sets_last_cost() {
        let fc = Fc::zero(2, 1);
        fc.biases.set(Tensor::from(vec![1.0]));
        let mut t = Trainer::new(fc.into(), Mse);
        let batch = fetch_batch(&samples(), 0..3).unwrap();
        let grad = t.gradient(&batch);
        // Squared errors of 1, 1 and 9.
        assert!((t.last_cost - 11.0 / 3.0).abs() < 1e-12);
        assert_eq!(grad.len(), 2);
    }
}
