//! Training sequence-to-vector models, where every input sequence has one desired output.

use std::ops::Range;

use rayon::prelude::*;

use crate::{
    autodiff::{constant, scale, sum, Grad, ResRef, Var},
    error::{Error, Result, ResultExt},
    net::{cost::Cost, Layer},
    rnn::{self, Block},
    seq::{self, SeqRef},
    sgd::{cost_gradient, Fetcher, Gradienter, SampleList},
    tensor::Tensor,
};

/// A non-empty input sequence and its desired output vector.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Sample {
    /// Input vectors, one per timestep.
    pub input: Vec<Tensor>,
    /// Desired output.
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

/// Packed input sequences and their concatenated desired outputs.
#[derive(Clone)]
pub struct Batch {
    /// Input sequences.
    pub inputs: SeqRef,
    /// Desired outputs, one vector per sequence.
    pub outputs: Tensor,
    /// Number of sequences.
    pub num: usize,
}

/// Fetches batches and computes gradients for a sequence-to-vector model.
pub struct Trainer {
    /// The model, producing one packed vector per sequence.
    pub func: Box<dyn Fn(SeqRef) -> ResRef>,
    /// Cost of each sequence's output.
    pub cost: Box<dyn Cost>,
    /// Variables to differentiate.
    pub params: Vec<Var>,
    /// Average the costs of all sequences instead of summing them.
    pub average: bool,
    /// Total cost of the last batch passed to [`Gradienter::gradient`].
    pub last_cost: f64,
}

impl Trainer {
    /// Create an averaging trainer for an arbitrary sequence function.
    pub fn new<F, C>(func: F, cost: C, params: Vec<Var>) -> Self
    where
        F: Fn(SeqRef) -> ResRef + 'static,
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

    /// Create an averaging trainer which runs `block` over each sequence and feeds its last
    /// output through `out`.
    pub fn for_block<C: Cost + 'static>(block: Block, out: Layer, cost: C) -> Self {
        let mut params = block.parameters();
        params.extend(out.parameters());
        Self::new(
            move |s| {
                let n = s.output().first().map_or(0, |b| b.present.len());
                out.apply(seq::tail(rnn::map(s, &block)), n)
            },
            cost,
            params,
        )
    }

    /// Build the graph of the (possibly averaged) total cost of a batch.
    pub fn total_cost(&self, batch: &Batch) -> ResRef {
        let actual = (self.func)(batch.inputs.clone());
        let desired = constant(batch.outputs.clone());
        let cost = self.cost.cost(desired, actual, batch.num);
        let n = cost.output().len();
        let total = sum(cost);
        if self.average && n > 0 {
            scale(total, 1.0 / n as f64)
        } else {
            total
        }
    }
}

/// Load the samples in `range` on the rayon pool and pack them into a batch.
///
/// Fails if the range is empty or a sample has an empty input sequence.
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
    if loaded.iter().any(|s| s.input.is_empty()) {
        return Err(Error::InvalidData("empty sequence".into())).context("fetch batch");
    }
    let num = loaded.len();
    let (ins, outs): (Vec<_>, Vec<_>) = loaded.into_iter().map(|s| (s.input, s.output)).unzip();
    Ok(Batch {
        inputs: seq::const_seq_list(&ins),
        outputs: Tensor::concat(&outs),
        num,
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
        tracing::debug!(
            cost = self.last_cost,
            sequences = batch.num,
            "sequence-to-vector gradient"
        );
        cost_gradient(&total, &self.params)
    }
}

#[cfg(test)]
mod tests {
    use rand::{rngs::StdRng, SeedableRng};

    use super::*;
    use crate::{
        net::{cost::Mse, Activation, Fc},
        rnn::Vanilla,
        sgd::{Sgd, StepLimit},
    };

    fn t(v: &[f64]) -> Tensor {
        Tensor::from(v)
    }

    /// Sequences whose desired output is half the sum of their inputs.
    fn sum_samples() -> SliceSampleList {
        let inputs: [&[f64]; 4] = [&[1.0, -1.0, 1.0], &[-1.0], &[1.0, 1.0], &[0.5, -1.0, -0.5]];
        SliceSampleList(
            inputs
                .iter()
                .map(|xs| Sample {
                    input: xs.iter().map(|&x| t(&[x])).collect(),
                    output: t(&[xs.iter().sum::<f64>() * 0.5]),
                })
                .collect(),
        )
    }

    #[test]
    fn fetch_packs_inputs_and_outputs() {
        let b = fetch_batch(&sum_samples(), 1..4).unwrap();
        assert_eq!(b.num, 3);
        assert_eq!(b.inputs.output().len(), 3);
        assert_eq!(b.inputs.output()[1].present.as_slice(), &[false, true, true]);
        assert_eq!(b.outputs.data(), &[-0.5, 1.0, -0.5]);
    }

    #[test]
    fn fetch_rejects_empty_sequences() {
        let mut samples = sum_samples();
        samples.0[2].input.clear();
        let err = fetch_batch(&samples, 0..4).err().unwrap();
        assert_eq!(err.to_string(), "fetch batch: invalid data: empty sequence");
        assert!(matches!(
            fetch_batch(&samples, 2..2),
            Err(Error::Context { .. })
        ));
    }

    #[test]
    fn averaged_cost_counts_sequences() {
        let samples = sum_samples();
        let trainer = Trainer::new(seq::tail, Mse, Vec::new());
        let batch = fetch_batch(&samples, 0..4).unwrap();
        let expected: f64 = samples
            .0
            .iter()
            .map(|s| (s.input[s.input.len() - 1][0] - s.output[0]).powi(2))
            .sum();
        let cost = trainer.total_cost(&batch).output()[0];
        assert!((cost - expected / 4.0).abs() < 1e-12);
    }

    #[test]
    fn training_reduces_cost() {
        let mut rng = StdRng::seed_from_u64(0);
        let block: Block = Vanilla::new(1, 3, Activation::Tanh, &mut rng).into();
        let trainer = Trainer::for_block(block, Fc::new(3, 1, &mut rng).into(), Mse);
        let samples = sum_samples();
        let batch = fetch_batch(&samples, 0..4).unwrap();
        let before = trainer.total_cost(&batch).output()[0];

        let mut sgd = Sgd::new(trainer, samples, 0.1, 0);
        sgd.rng = StdRng::seed_from_u64(1);
        sgd.run(&mut StepLimit(300)).unwrap();
        let after = sgd.trainer.total_cost(&batch).output()[0];
        assert!(after < before, "cost went from {before} to {after}");
    }
}
