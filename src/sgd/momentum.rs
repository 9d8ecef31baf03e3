use std::collections::BTreeMap;

use super::Transformer;
use crate::{
    autodiff::{Grad, VarId},
    tensor::Tensor,
};

/// Classical momentum: the step is `v = momentum * v + grad`.
#[derive(Clone, Debug, Default)]
pub struct Momentum {
    /// Decay of the rolling step.
    pub momentum: f64,
    rolling: BTreeMap<VarId, Tensor>,
}

impl Momentum {
    /// Create a transformer with the given momentum.
    pub fn new(momentum: f64) -> Self {
        Self {
            momentum,
            rolling: BTreeMap::new(),
        }
    }
}

impl Transformer for Momentum {
    fn transform(&mut self, mut grad: Grad) -> Grad {
        let seen = !self.rolling.is_empty();
        for (var, g) in grad.iter_mut() {
            match self.rolling.get_mut(&var.id()) {
                Some(v) => {
                    v.scale(self.momentum);
                    *v += &*g;
                    g.set(v);
                }
                None => {
                    if seen {
                        tracing::warn!(var = ?var.id(), "momentum: new variable, starting from its gradient");
                    }
                    self.rolling.insert(var.id(), g.clone());
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
    fn accumulates() {
        let v = Var::new(Tensor::zeros(2));
        let mut m = Momentum::new(0.5);
        let mut out = Vec::new();
        for _ in 0..3 {
            let mut g = Grad::new();
            g.insert(&v, Tensor::from(vec![1.0, -2.0]));
            out.push(m.transform(g).get(v.id()).cloned().unwrap());
        }
        assert_eq!(out[0].data(), &[1.0, -2.0]);
        assert_eq!(out[1].data(), &[1.5, -3.0]);
        assert_eq!(out[2].data(), &[1.75, -3.5]);
    }
}
