//! Training sequence-to-sequence models, where every input timestep has a desired output.

use std::ops::Range;

use rayon::prelude::*;

use crate::{
    autodiff::{constant, scale, Grad, ResRef, Var},
    error::{Error, Result, ResultExt},
    net::cost::Cost,
    rnn::{self, Block},
    seq::{self, SeqRef},
    sgd::{cost_gradient, Fetcher, Gradienter, SampleList},
    tensor::Tensor,
};

/// An input sequence and its desired output sequence, of the same length.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Sample {
    /// Input vectors, one per timestep.
    pub input: Vec<Tensor>,
    /// Desired output vectors, one per timestep.
    pub output: Vec<Tensor>,
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

/// A sample list which can report sequence lengths without loading samples.
pub trait SortableSampleList: SampleList {
    /// Return the length of sample `i`.
    fn len_at(&self, i: usize) -> usize;
}

impl SortableSampleList for SliceSampleList {
    fn len_at(&self, i: usize) -> usize {
        self.0[i].input.len()
    }
}

/// Sorts every batch-sized window of a list by sequence length after each shuffle, so that the
/// sequences of a batch end at similar times.
#[derive(Clone, Debug)]
pub struct SortSampleList<L> {
    /// The wrapped list.
    pub list: L,
    /// Window size; zero sorts the whole list.
    pub batch_size: usize,
}

impl<L: SortableSampleList> SampleList for SortSampleList<L> {
    type Sample = L::Sample;

    fn len(&self) -> usize {
        self.list.len()
    }

    fn swap(&mut self, i: usize, j: usize) {
        self.list.swap(i, j);
    }

    fn get(&self, i: usize) -> Result<L::Sample> {
        self.list.get(i)
    }

    fn post_shuffle(&mut self) {
        let n = self.list.len();
        let window = if self.batch_size == 0 { n.max(1) } else { self.batch_size };
        for start in (0..n).step_by(window) {
            let end = (start + window).min(n);
            for i in start + 1..end {
                let mut j = i;
                while j > start && self.list.len_at(j - 1) > self.list.len_at(j) {
                    self.list.swap(j - 1, j);
                    j -= 1;
                }
            }
        }
    }
}

/// Packed input and desired output sequences.
#[derive(Clone)]
pub struct Batch {
    /// Input sequences.
    pub inputs: SeqRef,
    /// Desired output sequences.
    pub outputs: SeqRef,
}

/// Fetches batches and computes gradients for a sequence-to-sequence model.
pub struct Trainer {
    /// The model.
    pub func: Box<dyn Fn(SeqRef) -> SeqRef>,
    /// Cost of each output timestep.
    pub cost: Box<dyn Cost>,
    /// Variables to differentiate.
    pub params: Vec<Var>,
    /// Average the costs of all timesteps instead of summing them.
    pub average: bool,
    /// Total cost of the last batch passed to [`Gradienter::gradient`].
    pub last_cost: f64,
}

impl Trainer {
    /// Create an averaging trainer for an arbitrary sequence function.
    pub fn new<F, C>(func: F, cost: C, params: Vec<Var>) -> Self
    where
        F: Fn(SeqRef) -> SeqRef + 'static,
        C: Cost + 'static,
    {
        Self {
            func: Box::new(func),
            cost: Box::new(cost),
            params,
            average: true,
            last_cost: 0.0,
        }
    }

    /// Create an averaging trainer for a recurrent block over all of its parameters.
    pub fn for_block<C: Cost + 'static>(block: Block, cost: C) -> Self {
        let params = block.parameters();
        Self::new(move |s| rnn::map(s, &block), cost, params)
    }

    /// Build the graph of the (possibly averaged) total cost of a batch.
    ///
    /// # Panics
    ///
    /// Panics if the model's outputs and the desired outputs have different shapes.
    pub fn total_cost(&self, batch: &Batch) -> ResRef {
        let actual = (self.func)(batch.inputs.clone());
        let desired = batch.outputs.output();
        assert_eq!(
            actual.output().len(),
            desired.len(),
            "mismatching actual and desired sequence shapes"
        );
        let mut idx = 0;
        let mut count = 0;
        let costs = seq::map(actual, |a, n| {
            let d = &desired[idx];
            assert_eq!(
                d.present.num_present(),
                n,
                "mismatching actual and desired sequence shapes"
            );
            idx += 1;
            count += n;
            self.cost.cost(constant(d.packed.clone()), a, n)
        });
        let total = seq::sum_all(costs);
        if self.average && count > 0 {
            scale(total, 1.0 / count as f64)
        } else {
            total
        }
    }
}

/// Load the samples in `range` on the rayon pool and pack them into sequence batches.
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
    let (ins, outs): (Vec<_>, Vec<_>) = loaded.into_iter().map(|s| (s.input, s.output)).unzip();
    Ok(Batch {
        inputs: seq::const_seq_list(&ins),
        outputs: seq::const_seq_list(&outs),
    })
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
        tracing::debug!(cost = self.last_cost, "sequence-to-sequence gradient");
        cost_gradient(&total, &self.params)
    }
}

#[cfg(test)]
mod tests {
    use rand::{rngs::StdRng, SeedableRng};

    use super::*;
    use crate::{
        net::{cost::Mse, Activation},
        rnn::Vanilla,
        sgd::{Sgd, StepLimit},
    };

    fn t(v: &[f64]) -> Tensor {
        Tensor::from(v)
    }

    /// Sequences whose desired output at each step is the previous input.
    fn echo_samples() -> SliceSampleList {
        let inputs: [&[f64]; 3] = [&[1.0, -1.0, 1.0], &[-1.0, 1.0], &[1.0, 1.0, -1.0, -1.0]];
        SliceSampleList(
            inputs
                .iter()
                .map(|xs| {
                    let mut prev = 0.0;
                    let mut output = Vec::new();
                    for &x in xs.iter() {
                        output.push(t(&[prev * 0.5]));
                        prev = x;
                    }
                    Sample {
                        input: xs.iter().map(|&x| t(&[x])).collect(),
                        output,
                    }
                })
                .collect(),
        )
    }

    #[test]
    fn sort_sample_list_sorts_windows() {
        let lens = [5, 3, 1, 4, 2];
        let samples = SliceSampleList(
            lens.iter()
                .map(|&n| Sample {
                    input: vec![Tensor::zeros(1); n],
                    output: vec![Tensor::zeros(1); n],
                })
                .collect(),
        );
        let mut sorted = SortSampleList {
            list: samples,
            batch_size: 3,
        };
        sorted.post_shuffle();
        let got: Vec<usize> = (0..5).map(|i| sorted.list.len_at(i)).collect();
        assert_eq!(got, [1, 3, 5, 2, 4]);
    }

    #[test]
    fn fetch_packs_sequences() {
        let b = fetch_batch(&echo_samples(), 0..3).unwrap();
        assert_eq!(b.inputs.output().len(), 4);
        assert_eq!(b.outputs.output()[2].present.num_present(), 2);
        assert_eq!(b.inputs.output()[3].packed.data(), &[-1.0]);
    }

    #[test]
    fn averaged_cost_counts_timesteps() {
        let samples = echo_samples();
        let trainer = Trainer::new(|s| s, Mse, Vec::new());
        let batch = fetch_batch(&samples, 0..3).unwrap();
        let mut expected = 0.0;
        for s in &samples.0 {
            for (x, y) in s.input.iter().zip(&s.output) {
                expected += (x[0] - y[0]).powi(2);
            }
        }
        let cost = trainer.total_cost(&batch).output()[0];
        assert!((cost - expected / 9.0).abs() < 1e-12);
    }

    #[test]
    fn training_reduces_cost() {
        let mut rng = StdRng::seed_from_u64(0);
        let block: Block = Vanilla::new(1, 1, Activation::Tanh, &mut rng).into();
        let trainer = Trainer::for_block(block, Mse);
        let samples = echo_samples();
        let batch = fetch_batch(&samples, 0..3).unwrap();
        let before = trainer.total_cost(&batch).output()[0];

        let mut sgd = Sgd::new(trainer, samples, 0.1, 0);
        sgd.rng = StdRng::seed_from_u64(1);
        sgd.run(&mut StepLimit(300)).unwrap();
        let after = sgd.trainer.total_cost(&batch).output()[0];
        assert!(after < before, "cost went from {before} to {after}");
    }
}
