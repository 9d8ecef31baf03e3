use std::collections::BTreeMap;

use super::Transformer;
use crate::{
    autodiff::{Grad, VarId},
    tensor::Tensor,
};

const DEFAULT_DECAY_RATE1: f64 = 0.9;
const DEFAULT_DECAY_RATE2: f64 = 0.999;
const DEFAULT_DAMPING: f64 = 1e-8;

/// Adaptive moment estimation (Kingma and Ba, 2014).
///
/// Zero-valued settings select the defaults of 0.9, 0.999 and 1e-8.
#[derive(Clone, Debug, Default)]
pub struct Adam {
    /// Decay rate of the first moment.
    pub decay_rate1: f64,
    /// Decay rate of the second moment.
    pub decay_rate2: f64,
    /// Added to the second moment before dividing by its square root.
    pub damping: f64,
    first_moment: BTreeMap<VarId, Tensor>,
    second_moment: BTreeMap<VarId, Tensor>,
    iteration: i32,
}

fn or_default(v: f64, default: f64) -> f64 {
    if v == 0.0 {
        default
    } else {
        v
    }
}

impl Adam {
    fn rates(&self) -> (f64, f64, f64) {
        (
            or_default(self.decay_rate1, DEFAULT_DECAY_RATE1),
            or_default(self.decay_rate2, DEFAULT_DECAY_RATE2),
            or_default(self.damping, DEFAULT_DAMPING),
        )
    }

    fn update_moments(&mut self, grad: &Grad, b1: f64, b2: f64) {
        let seen = !self.first_moment.is_empty();
        for m in self.first_moment.values_mut() {
            m.scale(b1);
        }
        for v in self.second_moment.values_mut() {
            v.scale(b2);
        }
        for (var, g) in grad.iter() {
            let first = self.first_moment.entry(var.id()).or_insert_with(|| {
                if seen {
                    tracing::warn!(var = ?var.id(), "adam: new variable, starting its moments at zero");
                }
                Tensor::zeros(g.len())
            });
            let mut scaled = g.clone();
            scaled.scale(1.0 - b1);
            *first += &scaled;

            let second = self
                .second_moment
                .entry(var.id())
                .or_insert_with(|| Tensor::zeros(g.len()));
            *second += &g.map(|x| x * x * (1.0 - b2));
        }
    }
}

impl Transformer for Adam {
    fn transform(&mut self, mut grad: Grad) -> Grad {
        let (b1, b2, damping) = self.rates();
        self.update_moments(&grad, b1, b2);
        self.iteration += 1;
        let factor = (1.0 - b2.powi(self.iteration)).sqrt() / (1.0 - b1.powi(self.iteration));
        for (var, g) in grad.iter_mut() {
            let (Some(m), Some(v)) = (
                self.first_moment.get(&var.id()),
                self.second_moment.get(&var.id()),
            ) else {
                continue;
            };
            for ((out, m), v) in g.data_mut().iter_mut().zip(m.data()).zip(v.data()) {
                *out = m * factor / (v + damping).sqrt();
            }
        }
        grad
    }
}
