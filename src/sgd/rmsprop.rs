use std::collections::BTreeMap;

use super::Transformer;
use crate::{
    autodiff::{Grad, VarId},
    tensor::Tensor,
};

/// Divides gradients by a running root-mean-square of their past values.
///
/// Zero-valued settings select a decay rate of 0.9 and damping of 1e-8.
#[derive(Clone, Debug, Default)]
pub struct RmsProp {
    /// Decay rate of the running average.
    pub decay_rate: f64,
    /// Added to the running average before the square root.
    pub damping: f64,
    moment: BTreeMap<VarId, Tensor>,
}

impl RmsProp {
    fn decay_rate(&self) -> f64 {
        if self.decay_rate == 0.0 {
            0.9
        } else {
            self.decay_rate
        }
    }

    fn damping(&self) -> f64 {
        if self.damping == 0.0 {
            1e-8
        } else {
            self.damping
        }
    }
}

impl Transformer for RmsProp {
    fn transform(&mut self, mut grad: Grad) -> Grad {
        let (keep, damping) = (1.0 - self.decay_rate(), self.damping());
        let seen = !self.moment.is_empty();
        for (var, g) in grad.iter_mut() {
            let sq = g.map(|x| x * x);
            match self.moment.get_mut(&var.id()) {
                Some(m) => {
                    for (m, s) in m.data_mut().iter_mut().zip(sq.data()) {
                        *m += (s - *m) * keep;
                    }
                }
                None => {
                    if seen {
                        tracing::warn!(var = ?var.id(), "rmsprop: new variable, seeding its average");
                    }
                    self.moment.insert(var.id(), sq);
                }
            }
            if let Some(m) = self.moment.get(&var.id()) {
                for (x, m) in g.data_mut().iter_mut().zip(m.data()) {
                    *x /= (m + damping).sqrt();
                }
            }
        }
        grad
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::autodiff::Var;

    #[test]
    fn running_average() {
        let v = Var::new(Tensor::zeros(1));
        let mut r = RmsProp::default();
        let mut out = Vec::new();
        for g in [2.0, 1.0] {
            let mut grad = Grad::new();
            grad.insert(&v, Tensor::from(vec![g]));
            out.push(r.transform(grad).get(v.id()).unwrap()[0]);
        }
        assert!((out[0] - 1.0).abs() < 1e-6);
        let avg: f64 = 4.0 + (1.0 - 4.0) * 0.1;
        assert!((out[1] - 1.0 / avg.sqrt()).abs() < 1e-6);
    }
}
