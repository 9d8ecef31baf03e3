//! Finite-difference gradient checking.

use rand::{rngs::StdRng, SeedableRng};

use super::{Grad, ResRef, Var};
use crate::tensor::Tensor;

/// Compares the gradients computed by [`Res::propagate`](super::Res::propagate) against central
/// finite differences.
///
/// The checked function is rebuilt for every perturbation, so it must read the variables afresh
/// each time it is called and must be deterministic.
pub struct ResChecker<F> {
    /// Builds the graph under test.
    pub f: F,
    /// Variables to differentiate with respect to.
    pub vars: Vec<Var>,
    /// Perturbation used for the finite differences.
    pub delta: f64,
    /// Allowed error, relative to the magnitude of the expected derivative when above one.
    pub prec: f64,
    /// Seed for the random upstream vector.
    pub seed: u64,
}

impl<F: Fn() -> ResRef> ResChecker<F> {
    /// Create a checker with default tolerances.
    pub fn new(f: F, vars: Vec<Var>) -> Self {
        Self {
            f,
            vars,
            delta: 1e-5,
            prec: 1e-5,
            seed: 0,
        }
    }

    /// Check every component of every variable, returning a description of the first mismatch.
    pub fn check(&self) -> Result<(), String> {
        let mut rng = StdRng::seed_from_u64(self.seed);
        let res = (self.f)();
        let upstream = Tensor::rand_normal(res.output().len(), 1.0, &mut rng);

        let mut grad = Grad::zeros(&self.vars);
        res.propagate(upstream.clone(), &mut grad);

        for (vi, var) in self.vars.iter().enumerate() {
            let actual = grad
                .get(var.id())
                .cloned()
                .unwrap_or_else(|| Tensor::zeros(var.len()));
            for i in 0..var.len() {
                let expected = self.approximate(var, i, &upstream);
                let diff = (actual[i] - expected).abs();
                if diff > self.prec * expected.abs().max(1.0) {
                    return Err(format!(
                        "var {vi} entry {i}: expected {expected} but got {}",
                        actual[i]
                    ));
                }
            }
        }
        Ok(())
    }

    /// Like [`ResChecker::check`] but panics on a mismatch.
    pub fn assert_gradients(&self) {
        if let Err(msg) = self.check() {
            panic!("gradient check failed: {msg}");
        }
    }

    fn approximate(&self, var: &Var, i: usize, upstream: &Tensor) -> f64 {
        var.update(|t| t[i] += self.delta);
        let plus = (self.f)().output().dot(upstream);
        var.update(|t| t[i] -= 2.0 * self.delta);
        let minus = (self.f)().output().dot(upstream);
        var.update(|t| t[i] += self.delta);
        (plus - minus) / (2.0 * self.delta)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::autodiff::{mul, sum, Res, ResRef, VarSet};
    use std::rc::Rc;

    struct WrongGrad(ResRef);

    impl Res for WrongGrad {
        fn output(&self) -> &Tensor {
            self.0.output()
        }

        fn vars(&self) -> &VarSet {
            self.0.vars()
        }

        fn propagate(&self, mut upstream: Tensor, grad: &mut Grad) {
            upstream.scale(3.0);
            self.0.propagate(upstream, grad);
        }
    }

    #[test]
    fn accepts_correct_gradients() {
        let v = Var::new(Tensor::from(vec![1.0, -2.0, 0.5]));
        let checker = ResChecker::new(|| sum(mul(v.res(), v.res())), vec![v.clone()]);
        checker.assert_gradients();
    }

    #[test]
    fn detects_wrong_gradients() {
        let v = Var::new(Tensor::from(vec![1.0, -2.0]));
        let checker = ResChecker::new(
            || -> ResRef { Rc::new(WrongGrad(mul(v.res(), v.res()))) },
            vec![v.clone()],
        );
        assert!(checker.check().is_err());
    }
}
