//! Trainable variables and sets of them.

use std::{
    cell::RefCell,
    collections::BTreeMap,
    fmt,
    rc::Rc,
    sync::atomic::{AtomicU64, Ordering},
};

use super::{Grad, Res, ResRef};
use crate::tensor::Tensor;

static NEXT_ID: AtomicU64 = AtomicU64::new(0);

/// Identity of a variable. Two variables are the same iff their ids are equal.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct VarId(u64);

/// A trainable leaf in the computation graph.
///
/// Cloning a variable clones the handle, not the value, so a layer and the graphs built from it
/// share the same storage. Forward passes take a snapshot of the value; updates made afterwards
/// copy on write and leave existing graphs untouched.
#[derive(Clone)]
pub struct Var {
    inner: Rc<VarInner>,
}

struct VarInner {
    id: VarId,
    value: RefCell<Rc<Tensor>>,
}

impl fmt::Debug for Var {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Var")
            .field("id", &self.inner.id)
            .field("value", &self.inner.value.borrow())
            .finish()
    }
}

impl PartialEq for Var {
    fn eq(&self, other: &Self) -> bool {
        self.id() == other.id()
    }
}

impl Eq for Var {}

impl Var {
    /// Create a variable with a fresh id.
    pub fn new(value: Tensor) -> Self {
        let id = VarId(NEXT_ID.fetch_add(1, Ordering::Relaxed));
        Self {
            inner: Rc::new(VarInner {
                id,
                value: RefCell::new(Rc::new(value)),
            }),
        }
    }

    /// Return the variable's identity.
    pub fn id(&self) -> VarId {
        self.inner.id
    }

    /// Return a snapshot of the current value.
    pub fn value(&self) -> Rc<Tensor> {
        Rc::clone(&self.inner.value.borrow())
    }

    /// Return the number of entries.
    pub fn len(&self) -> usize {
        self.inner.value.borrow().len()
    }

    /// Check whether the variable has no entries.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Replace the value.
    pub fn set(&self, value: Tensor) {
        *self.inner.value.borrow_mut() = Rc::new(value);
    }

    /// Modify the value in place.
    pub fn update<F: FnOnce(&mut Tensor)>(&self, f: F) {
        let mut value = self.inner.value.borrow_mut();
        f(Rc::make_mut(&mut value));
    }

    /// Create a graph leaf reading the current value.
    pub fn res(&self) -> ResRef {
        let mut vars = VarSet::new();
        vars.add(self);
        Rc::new(Leaf {
            var: self.clone(),
            value: self.value(),
            vars,
        })
    }
}

struct Leaf {
    var: Var,
    value: Rc<Tensor>,
    vars: VarSet,
}

impl Res for Leaf {
    fn output(&self) -> &Tensor {
        &self.value
    }

    fn vars(&self) -> &VarSet {
        &self.vars
    }

    fn propagate(&self, upstream: Tensor, grad: &mut Grad) {
        grad.accumulate(self.var.id(), &upstream);
    }
}

/// A set of variables keyed by identity.
#[derive(Clone, Default)]
pub struct VarSet {
    vars: BTreeMap<VarId, Var>,
}

impl fmt::Debug for VarSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.vars.keys()).finish()
    }
}

impl FromIterator<Var> for VarSet {
    fn from_iter<I: IntoIterator<Item = Var>>(iter: I) -> Self {
        Self {
            vars: iter.into_iter().map(|v| (v.id(), v)).collect(),
        }
    }
}

impl<'a> FromIterator<&'a Var> for VarSet {
    fn from_iter<I: IntoIterator<Item = &'a Var>>(iter: I) -> Self {
        iter.into_iter().cloned().collect()
    }
}

impl VarSet {
    /// Create an empty set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Union several sets.
    pub fn merge<'a, I: IntoIterator<Item = &'a VarSet>>(sets: I) -> Self {
        let mut out = Self::new();
        for s in sets {
            out.extend(s);
        }
        out
    }

    /// Insert a variable.
    pub fn add(&mut self, var: &Var) {
        self.vars.entry(var.id()).or_insert_with(|| var.clone());
    }

    /// Remove a variable.
    pub fn del(&mut self, id: VarId) {
        self.vars.remove(&id);
    }

    /// Insert every variable of another set.
    pub fn extend(&mut self, other: &VarSet) {
        for (id, v) in &other.vars {
            self.vars.entry(*id).or_insert_with(|| v.clone());
        }
    }

    /// Check whether a variable is in the set.
    pub fn contains(&self, id: VarId) -> bool {
        self.vars.contains_key(&id)
    }

    /// Return the number of variables.
    pub fn len(&self) -> usize {
        self.vars.len()
    }

    /// Check whether the set is empty.
    pub fn is_empty(&self) -> bool {
        self.vars.is_empty()
    }

    /// Iterate over the variables in id order.
    pub fn iter(&self) -> impl Iterator<Item = &Var> + '_ {
        self.vars.values()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_are_unique() {
        let a = Var::new(Tensor::zeros(1));
        let b = Var::new(Tensor::zeros(1));
        assert_ne!(a.id(), b.id());
        assert_eq!(a, a.clone());
    }

    #[test]
    fn snapshots_copy_on_write() {
        let v = Var::new(Tensor::from(vec![1.0, 2.0]));
        let res = v.res();
        v.update(|t| t.scale(2.0));
        assert_eq!(res.output().data(), &[1.0, 2.0]);
        assert_eq!(v.value().data(), &[2.0, 4.0]);
    }

    #[test]
    fn set_operations() {
        let a = Var::new(Tensor::zeros(1));
        let b = Var::new(Tensor::zeros(1));
        let s1: VarSet = [&a].into_iter().collect();
        let s2: VarSet = [&a, &b].into_iter().collect();
        let mut merged = VarSet::merge([&s1, &s2]);
        assert_eq!(merged.len(), 2);
        merged.del(a.id());
        assert!(!merged.contains(a.id()));
        assert!(merged.contains(b.id()));
    }
}
