//! Gradient accumulators keyed by variable identity.

use std::collections::BTreeMap;

use super::{Var, VarId, VarSet};
use crate::tensor::Tensor;

#[derive(Clone, Debug)]
struct Entry {
    var: Var,
    value: Tensor,
}

/// A table of gradient accumulators.
///
/// Only variables with an entry receive gradients during propagation, which lets callers ask for
/// a subset of the parameters and lets nodes skip branches no entry depends on.
#[derive(Clone, Debug, Default)]
pub struct Grad {
    entries: BTreeMap<VarId, Entry>,
}

impl Grad {
    /// Create an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a table with a zero accumulator for every given variable.
    pub fn zeros<'a, I: IntoIterator<Item = &'a Var>>(vars: I) -> Self {
        let mut grad = Self::new();
        for v in vars {
            grad.insert_zero(v);
        }
        grad
    }

    /// Add a zero accumulator for a variable, replacing any existing one.
    pub fn insert_zero(&mut self, var: &Var) {
        self.insert(var, Tensor::zeros(var.len()));
    }

    /// Set the accumulator for a variable.
    pub fn insert(&mut self, var: &Var, value: Tensor) {
        assert_eq!(var.len(), value.len(), "gradient length does not match variable");
        self.entries.insert(
            var.id(),
            Entry {
                var: var.clone(),
                value,
            },
        );
    }

    /// Remove an accumulator and return its value.
    pub fn remove(&mut self, id: VarId) -> Option<Tensor> {
        self.entries.remove(&id).map(|e| e.value)
    }

    /// Return an accumulator.
    pub fn get(&self, id: VarId) -> Option<&Tensor> {
        self.entries.get(&id).map(|e| &e.value)
    }

    /// Return an accumulator mutably.
    pub fn get_mut(&mut self, id: VarId) -> Option<&mut Tensor> {
        self.entries.get_mut(&id).map(|e| &mut e.value)
    }

    /// Check whether a variable has an accumulator.
    pub fn contains(&self, id: VarId) -> bool {
        self.entries.contains_key(&id)
    }

    /// Check whether any variable of a set has an accumulator.
    pub fn intersects(&self, vars: &VarSet) -> bool {
        if vars.len() < self.entries.len() {
            vars.iter().any(|v| self.entries.contains_key(&v.id()))
        } else {
            self.entries.keys().any(|id| vars.contains(*id))
        }
    }

    /// Add to a variable's accumulator if it has one.
    pub fn accumulate(&mut self, id: VarId, delta: &Tensor) {
        if let Some(e) = self.entries.get_mut(&id) {
            e.value += delta;
        }
    }

    /// Multiply every accumulator by a scalar.
    pub fn scale(&mut self, s: f64) {
        for e in self.entries.values_mut() {
            e.value.scale(s);
        }
    }

    /// Add every accumulator to the value of its variable.
    pub fn add_to_vars(&self) {
        for e in self.entries.values() {
            e.var.update(|v| *v += &e.value);
        }
    }

    /// Return the number of accumulators.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Check whether there are no accumulators.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Iterate over variables and their accumulators.
    pub fn iter(&self) -> impl Iterator<Item = (&Var, &Tensor)> + '_ {
        self.entries.values().map(|e| (&e.var, &e.value))
    }

    /// Iterate over variables and their accumulators mutably.
    pub fn iter_mut(&mut self) -> impl Iterator<Item = (&Var, &mut Tensor)> + '_ {
        self.entries.values_mut().map(|e| (&e.var, &mut e.value))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accumulate_and_apply() {
        let a = Var::new(Tensor::from(vec![1.0, 2.0]));
        let b = Var::new(Tensor::from(vec![3.0]));
        let mut g = Grad::zeros([&a]);
        g.accumulate(a.id(), &Tensor::from(vec![0.5, 0.5]));
        g.accumulate(b.id(), &Tensor::from(vec![10.0]));
        assert!(!g.contains(b.id()));
        g.scale(2.0);
        g.add_to_vars();
        assert_eq!(a.value().data(), &[2.0, 3.0]);
        assert_eq!(b.value().data(), &[3.0]);
    }

    #[test]
    fn intersection() {
        let a = Var::new(Tensor::zeros(1));
        let b = Var::new(Tensor::zeros(1));
        let g = Grad::zeros([&a]);
        assert!(g.intersects(&[&a, &b].into_iter().collect()));
        assert!(!g.intersects(&[&b].into_iter().collect()));
        assert!(!g.intersects(&VarSet::new()));
    }
}
