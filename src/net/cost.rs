//! Cost functions producing one cost per batch entry.

use crate::autodiff::{
    add, add_repeated, complement, constant, log_sigmoid, mul, pool, scale, square, sub, sum,
    sum_cols, ResRef, Var,
};
use crate::tensor::Tensor;

/// Measures how far actual outputs are from desired ones.
pub trait Cost {
    /// Compute the cost of each of the `batch` entries.
    fn cost(&self, desired: ResRef, actual: ResRef, batch: usize) -> ResRef;
}

fn cols(res: &ResRef, batch: usize) -> usize {
    let len = res.output().len();
    assert!(
        batch > 0 && len % batch == 0,
        "cost input of {len} entries not divisible into {batch} samples"
    );
    len / batch
}

/// Negated dot product of the desired and actual vectors.
///
/// Paired with log-softmax outputs and one-hot targets, this is the cross-entropy loss.
#[derive(Clone, Copy, Debug, Default)]
pub struct DotCost;

impl Cost for DotCost {
    fn cost(&self, desired: ResRef, actual: ResRef, batch: usize) -> ResRef {
        let n = cols(&actual, batch);
        scale(sum_cols(mul(desired, actual), n), -1.0)
    }
}

/// Mean squared error over each sample's components.
#[derive(Clone, Copy, Debug, Default)]
pub struct Mse;

impl Cost for Mse {
    fn cost(&self, desired: ResRef, actual: ResRef, batch: usize) -> ResRef {
        let n = cols(&actual, batch);
        scale(sum_cols(square(sub(desired, actual)), n), 1.0 / n as f64)
    }
}

/// Cross-entropy between desired probabilities and the sigmoid of the actual outputs.
#[derive(Clone, Copy, Debug, Default)]
pub struct SigmoidCe {
    /// Divide each sample's cost by its number of components.
    pub average: bool,
}

impl Cost for SigmoidCe {
    fn cost(&self, desired: ResRef, actual: ResRef, batch: usize) -> ResRef {
        let n = cols(&actual, batch);
        let log_likelihoods = pool(desired, |d| {
            pool(actual, |a| {
                let pos = mul(d.clone(), log_sigmoid(a.clone()));
                let neg = mul(complement(d), log_sigmoid(scale(a, -1.0)));
                add(pos, neg)
            })
        });
        let s = if self.average { -1.0 / n as f64 } else { -1.0 };
        scale(sum_cols(log_likelihoods, n), s)
    }
}

/// Adds an L2 penalty on a set of parameters to a wrapped cost.
pub struct L2Reg {
    /// Penalty coefficient; the added term is `penalty / 2 * sum(p^2)`.
    pub penalty: f64,
    /// Penalized parameters.
    pub params: Vec<Var>,
    /// The cost being regularized.
    pub wrapped: Box<dyn Cost>,
}

impl Cost for L2Reg {
    fn cost(&self, desired: ResRef, actual: ResRef, batch: usize) -> ResRef {
        let base = self.wrapped.cost(desired, actual, batch);
        let penalty = self
            .params
            .iter()
            .fold(constant(Tensor::zeros(1)), |acc, p| add(acc, sum(square(p.res()))));
        add_repeated(base, scale(penalty, self.penalty / 2.0))
    }
}
