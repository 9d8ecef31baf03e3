//! Stochastic gradient descent over shuffled mini-batches.

use std::{
    ops::Range,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

use rand::{rngs::StdRng, Rng, SeedableRng};

use crate::{
    autodiff::{Grad, ResRef, Var},
    error::{Error, Result},
    tensor::Tensor,
};

mod adam;
mod momentum;
mod rmsprop;

pub use adam::Adam;
pub use momentum::Momentum;
pub use rmsprop::RmsProp;

/// An indexable, shuffleable list of training samples.
pub trait SampleList {
    /// The type of a single sample.
    type Sample;

    /// Return the number of samples.
    fn len(&self) -> usize;

    /// Check whether the list is empty.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Exchange two samples.
    fn swap(&mut self, i: usize, j: usize);

    /// Load a sample, which may fail for lists backed by external storage.
    fn get(&self, i: usize) -> Result<Self::Sample>;

    /// Called after every shuffle, so a list can regroup compatible samples.
    fn post_shuffle(&mut self) {}
}

/// Turns a contiguous range of a sample list into a batch.
pub trait Fetcher<L: ?Sized> {
    /// The batch type.
    type Batch;

    /// Fetch the samples in `range`.
    fn fetch(&self, samples: &L, range: Range<usize>) -> Result<Self::Batch>;
}

/// Computes the gradient of a batch's cost.
pub trait Gradienter<B> {
    /// Return the untransformed gradient for a batch.
    fn gradient(&mut self, batch: &B) -> Grad;
}

/// Rewrites gradients before they are applied, e.g. for adaptive step sizes.
pub trait Transformer {
    /// Transform a gradient, possibly in place.
    fn transform(&mut self, grad: Grad) -> Grad;
}

/// Chooses a learning rate given the fractional number of epochs completed.
pub trait Rater {
    /// Return the learning rate.
    fn rate(&self, epoch: f64) -> f64;
}

/// A learning rate which never changes.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ConstRater(pub f64);

impl Rater for ConstRater {
    fn rate(&self, _: f64) -> f64 {
        self.0
    }
}

/// Decides when gradient descent stops.
pub trait Stopper {
    /// Check whether training should stop.
    fn done(&self) -> bool;

    /// Called after every applied step.
    fn on_step(&mut self) {}
}

/// A stop signal which can be raised from any thread.
#[derive(Clone, Debug, Default)]
pub struct StopFlag(Arc<AtomicBool>);

impl StopFlag {
    /// Create a lowered flag.
    pub fn new() -> Self {
        Self::default()
    }

    /// Raise the flag.
    pub fn stop(&self) {
        self.0.store(true, Ordering::SeqCst);
    }
}

impl Stopper for StopFlag {
    fn done(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Stops after a fixed number of steps.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StepLimit(pub usize);

impl Stopper for StepLimit {
    fn done(&self) -> bool {
        self.0 == 0
    }

    fn on_step(&mut self) {
        self.0 = self.0.saturating_sub(1);
    }
}

/// Shuffle a sample list in place, then notify it.
pub fn shuffle<L: SampleList + ?Sized, R: Rng + ?Sized>(samples: &mut L, rng: &mut R) {
    let n = samples.len();
    for i in 0..n {
        let j = rng.gen_range(i..n);
        samples.swap(i, j);
    }
    samples.post_shuffle();
}

/// Differentiate a cost node with respect to `params`, seeding every output entry with one.
pub fn cost_gradient(cost: &ResRef, params: &[Var]) -> Grad {
    let mut grad = Grad::zeros(params);
    cost.propagate(Tensor::full(cost.output().len(), 1.0), &mut grad);
    grad
}

/// The gradient descent driver.
///
/// Every step fetches the next mini-batch of the shuffled sample list, computes its gradient,
/// optionally transforms it, and adds `-rate * grad` to the variables. The list is reshuffled
/// whenever a pass over it finishes.
pub struct Sgd<L, T> {
    /// Fetches batches and computes their gradients.
    pub trainer: T,
    /// Training samples.
    pub samples: L,
    /// Optional gradient transformer.
    pub transformer: Option<Box<dyn Transformer>>,
    /// Learning rate schedule.
    pub rater: Box<dyn Rater>,
    /// Mini-batch size; zero means the whole list.
    pub batch_size: usize,
    /// Number of samples whose gradients have been applied, used to compute the epoch.
    pub num_processed: usize,
    /// Source of shuffling randomness.
    pub rng: StdRng,
}

impl<L, T> Sgd<L, T>
where
    L: SampleList,
    T: Fetcher<L> + Gradienter<<T as Fetcher<L>>::Batch>,
{
    /// Create a driver with a constant learning rate and no transformer.
    pub fn new(trainer: T, samples: L, rate: f64, batch_size: usize) -> Self {
        Self {
            trainer,
            samples,
            transformer: None,
            rater: Box::new(ConstRater(rate)),
            batch_size,
            num_processed: 0,
            rng: StdRng::from_entropy(),
        }
    }

    /// Train until the stopper is done or a fetch fails.
    pub fn run<S: Stopper + ?Sized>(&mut self, stopper: &mut S) -> Result<()> {
        self.run_with_status(stopper, |_, _| {})
    }

    /// Like [`Sgd::run`], calling `status` with every batch before its gradient is computed.
    ///
    /// The stopper is checked before every fetch and again after every status call.
    pub fn run_with_status<S, F>(&mut self, stopper: &mut S, mut status: F) -> Result<()>
    where
        S: Stopper + ?Sized,
        F: FnMut(&T, &<T as Fetcher<L>>::Batch),
    {
        let total = self.samples.len();
        if total == 0 {
            return Err(Error::EmptySamples);
        }
        let mut idx = total;
        loop {
            if stopper.done() {
                return Ok(());
            }
            if idx == total {
                shuffle(&mut self.samples, &mut self.rng);
                idx = 0;
            }
            let remaining = total - idx;
            let size = if self.batch_size == 0 {
                remaining
            } else {
                self.batch_size.min(remaining)
            };
            let batch = self.trainer.fetch(&self.samples, idx..idx + size)?;
            idx += size;

            status(&self.trainer, &batch);
            if stopper.done() {
                return Ok(());
            }

            let mut grad = self.trainer.gradient(&batch);
            if let Some(t) = self.transformer.as_mut() {
                grad = t.transform(grad);
            }
            let epoch = self.num_processed as f64 / total as f64;
            let rate = self.rater.rate(epoch);
            grad.scale(-rate);
            grad.add_to_vars();
            self.num_processed += size;
            tracing::trace!(epoch, rate, size, "applied sgd step");
            stopper.on_step();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::autodiff::{square, sub, sum};

    #[derive(Debug)]
    struct Targets(Vec<f64>);

    impl SampleList for Targets {
        type Sample = f64;

        fn len(&self) -> usize {
            self.0.len()
        }

        fn swap(&mut self, i: usize, j: usize) {
            self.0.swap(i, j);
        }

        fn get(&self, i: usize) -> Result<f64> {
            Ok(self.0[i])
        }
    }

    /// Fits a single scalar to the mean of the targets.
    struct MeanFitter {
        param: Var,
        fail_at: Option<usize>,
        gradients: usize,
    }

    impl Fetcher<Targets> for MeanFitter {
        type Batch = Vec<f64>;

        fn fetch(&self, samples: &Targets, range: Range<usize>) -> Result<Vec<f64>> {
            if self.fail_at == Some(range.start) {
                return Err(Error::InvalidData("unreadable sample".into()));
            }
            range.map(|i| samples.get(i)).collect()
        }
    }

    impl Gradienter<Vec<f64>> for MeanFitter {
        fn gradient(&mut self, batch: &Vec<f64>) -> Grad {
            self.gradients += 1;
            let n = batch.len() as f64;
            let repeated = crate::autodiff::concat(vec![self.param.res(); batch.len()]);
            let target = crate::autodiff::constant(Tensor::from(batch.clone()));
            let cost = crate::autodiff::scale(sum(square(sub(repeated, target))), 1.0 / n);
            cost_gradient(&cost, &[self.param.clone()])
        }
    }

    fn fitter() -> MeanFitter {
        MeanFitter {
            param: Var::new(Tensor::zeros(1)),
            fail_at: None,
            gradients: 0,
        }
    }

    #[test]
    fn converges_to_mean() {
        let mut sgd = Sgd::new(fitter(), Targets(vec![1.0, 2.0, 3.0, 6.0]), 0.1, 0);
        sgd.rng = StdRng::seed_from_u64(0);
        sgd.run(&mut StepLimit(200)).unwrap();
        assert!((sgd.trainer.param.value()[0] - 3.0).abs() < 1e-6);
        assert_eq!(sgd.num_processed, 800);
    }

    #[test]
    fn batches_cover_epochs() {
        let mut sgd = Sgd::new(fitter(), Targets(vec![1.0, 2.0, 3.0, 4.0, 5.0]), 0.01, 2);
        sgd.rng = StdRng::seed_from_u64(1);
        let mut sizes = Vec::new();
        sgd.run_with_status(&mut StepLimit(6), |_, b| sizes.push(b.len()))
            .unwrap();
        assert_eq!(sizes, [2, 2, 1, 2, 2, 1]);
        assert_eq!(sgd.trainer.gradients, 6);
    }

    #[test]
    fn stop_flag_checked_after_status() {
        let mut sgd = Sgd::new(fitter(), Targets(vec![1.0]), 0.5, 0);
        let mut flag = StopFlag::new();
        let raiser = flag.clone();
        sgd.run_with_status(&mut flag, |_, _| raiser.stop()).unwrap();
        assert_eq!(sgd.trainer.gradients, 0);
        assert_eq!(sgd.trainer.param.value()[0], 0.0);
    }

    #[test]
    fn fetch_error_is_returned() {
        let mut trainer = fitter();
        trainer.fail_at = Some(0);
        let mut sgd = Sgd::new(trainer, Targets(vec![1.0, 2.0]), 0.5, 1);
        let err = sgd.run(&mut StepLimit(10)).unwrap_err();
        assert!(matches!(err, Error::InvalidData(_)));
    }

    #[test]
    fn empty_samples_rejected() {
        let mut sgd = Sgd::new(fitter(), Targets(Vec::new()), 0.5, 1);
        assert!(matches!(
            sgd.run(&mut StepLimit(1)),
            Err(Error::EmptySamples)
        ));
    }

    #[test]
    fn shuffle_is_a_permutation() {
        let mut list = Targets((0..20).map(f64::from).collect());
        shuffle(&mut list, &mut StdRng::seed_from_u64(4));
        let mut sorted = list.0.clone();
        sorted.sort_by(f64::total_cmp);
        assert_eq!(sorted, (0..20).map(f64::from).collect::<Vec<_>>());
    }
}
