//! Reverse-mode automatic differentiation over packed tensors.
//!
//! Every forward computation returns a [`Res`]: an immutable node holding its output, the set of
//! variables it depends on and a way to propagate an upstream gradient back to its inputs. Graphs
//! are rebuilt on every forward pass and shared through [`ResRef`] handles.

use std::rc::Rc;

use crate::tensor::Tensor;

pub mod check;
mod grad;
mod ops;
mod var;

pub use grad::Grad;
pub use ops::*;
pub use var::{Var, VarId, VarSet};

/// The result of a differentiable computation.
pub trait Res {
    /// Return the computed value.
    fn output(&self) -> &Tensor;

    /// Return every variable the output depends on.
    fn vars(&self) -> &VarSet;

    /// Accumulate the gradient of `upstream . output` into `grad`.
    ///
    /// Implementations may reuse `upstream` as scratch space. Inputs whose variables have no
    /// accumulator in `grad` are not visited.
    fn propagate(&self, upstream: Tensor, grad: &mut Grad);
}

/// A shared handle to a graph node.
pub type ResRef = Rc<dyn Res>;

/// A row-major matrix whose entries come from a graph node.
#[derive(Clone)]
pub struct Matrix {
    /// The packed entries.
    pub data: ResRef,
    /// Number of rows.
    pub rows: usize,
    /// Number of columns.
    pub cols: usize,
}

impl Matrix {
    /// Wrap a node as a matrix, checking its size.
    pub fn new(data: ResRef, rows: usize, cols: usize) -> Self {
        assert_eq!(
            data.output().len(),
            rows * cols,
            "matrix data has {} entries, expected {rows}x{cols}",
            data.output().len()
        );
        Self { data, rows, cols }
    }
}
