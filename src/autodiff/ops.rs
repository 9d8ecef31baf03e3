//! Differentiable functions building graph nodes.

use std::rc::Rc;

use super::{Grad, Matrix, Res, ResRef, Var, VarSet};
use crate::tensor::{cpu, Tensor};

/// Local derivative of an elementwise unary function.
trait UnaryDiff {
    /// Turn the gradient w.r.t. the output into the gradient w.r.t. the input.
    fn df(&self, input: &Tensor, output: &Tensor, upstream: Tensor) -> Tensor;
}

/// Local derivatives of a binary function.
trait BinaryDiff {
    /// Gradient w.r.t. the left input.
    fn dfda(&self, a: &Tensor, b: &Tensor, upstream: Tensor) -> Tensor;

    /// Gradient w.r.t. the right input.
    fn dfdb(&self, a: &Tensor, b: &Tensor, upstream: Tensor) -> Tensor;
}

struct Const {
    value: Tensor,
    vars: VarSet,
}

impl Res for Const {
    fn output(&self) -> &Tensor {
        &self.value
    }

    fn vars(&self) -> &VarSet {
        &self.vars
    }

    fn propagate(&self, _: Tensor, _: &mut Grad) {}
}

/// Create a node with a fixed value and no variables.
pub fn constant(value: Tensor) -> ResRef {
    Rc::new(Const {
        value,
        vars: VarSet::new(),
    })
}

struct UnaryRes<D> {
    input: ResRef,
    out: Tensor,
    diff: D,
}

impl<D: UnaryDiff> Res for UnaryRes<D> {
    fn output(&self) -> &Tensor {
        &self.out
    }

    fn vars(&self) -> &VarSet {
        self.input.vars()
    }

    fn propagate(&self, upstream: Tensor, grad: &mut Grad) {
        if grad.intersects(self.input.vars()) {
            let down = self.diff.df(self.input.output(), &self.out, upstream);
            self.input.propagate(down, grad);
        }
    }
}

fn unary<D: UnaryDiff + 'static>(input: ResRef, out: Tensor, diff: D) -> ResRef {
    Rc::new(UnaryRes { input, out, diff })
}

struct BinaryRes<D> {
    a: ResRef,
    b: ResRef,
    out: Tensor,
    vars: VarSet,
    diff: D,
}

impl<D: BinaryDiff> Res for BinaryRes<D> {
    fn output(&self) -> &Tensor {
        &self.out
    }

    fn vars(&self) -> &VarSet {
        &self.vars
    }

    fn propagate(&self, upstream: Tensor, grad: &mut Grad) {
        let (a, b) = (self.a.output(), self.b.output());
        match (grad.intersects(self.a.vars()), grad.intersects(self.b.vars())) {
            (true, true) => {
                let db = self.diff.dfdb(a, b, upstream.clone());
                let da = self.diff.dfda(a, b, upstream);
                self.a.propagate(da, grad);
                self.b.propagate(db, grad);
            }
            (true, false) => self.a.propagate(self.diff.dfda(a, b, upstream), grad),
            (false, true) => self.b.propagate(self.diff.dfdb(a, b, upstream), grad),
            (false, false) => {}
        }
    }
}

fn binary<D: BinaryDiff + 'static>(a: ResRef, b: ResRef, out: Tensor, diff: D) -> ResRef {
    let vars = VarSet::merge([a.vars(), b.vars()]);
    Rc::new(BinaryRes {
        a,
        b,
        out,
        vars,
        diff,
    })
}

struct Scale(f64);

impl UnaryDiff for Scale {
    fn df(&self, _: &Tensor, _: &Tensor, mut upstream: Tensor) -> Tensor {
        upstream.scale(self.0);
        upstream
    }
}

/// Multiply every entry by a scalar.
pub fn scale(input: ResRef, s: f64) -> ResRef {
    let mut out = input.output().clone();
    out.scale(s);
    unary(input, out, Scale(s))
}

struct Identity;

impl UnaryDiff for Identity {
    fn df(&self, _: &Tensor, _: &Tensor, upstream: Tensor) -> Tensor {
        upstream
    }
}

/// Add a scalar to every entry.
pub fn add_scalar(input: ResRef, s: f64) -> ResRef {
    let mut out = input.output().clone();
    out.add_scalar(s);
    unary(input, out, Identity)
}

struct Complement;

impl UnaryDiff for Complement {
    fn df(&self, _: &Tensor, _: &Tensor, mut upstream: Tensor) -> Tensor {
        upstream.scale(-1.0);
        upstream
    }
}

/// Compute `1 - x` for every entry.
pub fn complement(input: ResRef) -> ResRef {
    let out = input.output().map(|x| 1.0 - x);
    unary(input, out, Complement)
}

struct Pow(f64);

impl UnaryDiff for Pow {
    fn df(&self, input: &Tensor, _: &Tensor, mut upstream: Tensor) -> Tensor {
        let p = self.0;
        for (u, x) in upstream.data_mut().iter_mut().zip(input.data()) {
            *u *= p * x.powf(p - 1.0);
        }
        upstream
    }
}

/// Raise every entry to a power.
pub fn pow(input: ResRef, p: f64) -> ResRef {
    let out = input.output().map(|x| x.powf(p));
    unary(input, out, Pow(p))
}

struct Square;

impl UnaryDiff for Square {
    fn df(&self, input: &Tensor, _: &Tensor, mut upstream: Tensor) -> Tensor {
        for (u, x) in upstream.data_mut().iter_mut().zip(input.data()) {
            *u *= 2.0 * x;
        }
        upstream
    }
}

/// Square every entry.
pub fn square(input: ResRef) -> ResRef {
    let out = input.output().map(|x| x * x);
    unary(input, out, Square)
}

struct Exp;

impl UnaryDiff for Exp {
    fn df(&self, _: &Tensor, output: &Tensor, mut upstream: Tensor) -> Tensor {
        upstream *= output;
        upstream
    }
}

/// Exponentiate every entry.
pub fn exp(input: ResRef) -> ResRef {
    let out = input.output().map(f64::exp);
    unary(input, out, Exp)
}

struct Tanh;

impl UnaryDiff for Tanh {
    fn df(&self, _: &Tensor, output: &Tensor, mut upstream: Tensor) -> Tensor {
        for (u, y) in upstream.data_mut().iter_mut().zip(output.data()) {
            *u *= 1.0 - y * y;
        }
        upstream
    }
}

/// Apply the hyperbolic tangent.
pub fn tanh(input: ResRef) -> ResRef {
    let out = input.output().map(f64::tanh);
    unary(input, out, Tanh)
}

fn sigmoid_f(x: f64) -> f64 {
    if x >= 0.0 {
        1.0 / (1.0 + (-x).exp())
    } else {
        let e = x.exp();
        e / (1.0 + e)
    }
}

struct Sigmoid;

impl UnaryDiff for Sigmoid {
    fn df(&self, _: &Tensor, output: &Tensor, mut upstream: Tensor) -> Tensor {
        for (u, y) in upstream.data_mut().iter_mut().zip(output.data()) {
            *u *= y * (1.0 - y);
        }
        upstream
    }
}

/// Apply the logistic sigmoid.
pub fn sigmoid(input: ResRef) -> ResRef {
    let out = input.output().map(sigmoid_f);
    unary(input, out, Sigmoid)
}

struct LogSigmoid;

impl UnaryDiff for LogSigmoid {
    fn df(&self, input: &Tensor, _: &Tensor, mut upstream: Tensor) -> Tensor {
        for (u, x) in upstream.data_mut().iter_mut().zip(input.data()) {
            *u *= sigmoid_f(-x);
        }
        upstream
    }
}

/// Compute `log(sigmoid(x))` in a numerically stable way.
pub fn log_sigmoid(input: ResRef) -> ResRef {
    let out = input.output().map(|x| {
        if x >= 0.0 {
            -(-x).exp().ln_1p()
        } else {
            x - x.exp().ln_1p()
        }
    });
    unary(input, out, LogSigmoid)
}

struct Relu;

impl UnaryDiff for Relu {
    fn df(&self, input: &Tensor, _: &Tensor, mut upstream: Tensor) -> Tensor {
        for (u, x) in upstream.data_mut().iter_mut().zip(input.data()) {
            if *x <= 0.0 {
                *u = 0.0;
            }
        }
        upstream
    }
}

/// Clip negative entries to zero.
pub fn relu(input: ResRef) -> ResRef {
    let out = input.output().map(|x| x.max(0.0));
    unary(input, out, Relu)
}

struct Sin;

impl UnaryDiff for Sin {
    fn df(&self, input: &Tensor, _: &Tensor, mut upstream: Tensor) -> Tensor {
        for (u, x) in upstream.data_mut().iter_mut().zip(input.data()) {
            *u *= x.cos();
        }
        upstream
    }
}

/// Apply the sine function.
pub fn sin(input: ResRef) -> ResRef {
    let out = input.output().map(f64::sin);
    unary(input, out, Sin)
}

struct LogSoftmax(usize);

impl UnaryDiff for LogSoftmax {
    fn df(&self, _: &Tensor, output: &Tensor, mut upstream: Tensor) -> Tensor {
        let chunk = self.0;
        for (u, y) in upstream
            .data_mut()
            .chunks_mut(chunk)
            .zip(output.data().chunks(chunk))
        {
            let total: f64 = u.iter().sum();
            for (ui, yi) in u.iter_mut().zip(y) {
                *ui -= yi.exp() * total;
            }
        }
        upstream
    }
}

/// Apply log-softmax to consecutive chunks of `chunk` entries.
pub fn log_softmax(input: ResRef, chunk: usize) -> ResRef {
    let x = input.output();
    if x.is_empty() {
        return unary(input, Tensor::zeros(0), LogSoftmax(1));
    }
    assert!(
        chunk > 0 && x.len() % chunk == 0,
        "log-softmax chunk {chunk} does not divide length {}",
        x.len()
    );
    let mut out = x.clone();
    for c in out.data_mut().chunks_mut(chunk) {
        let norm = cpu::log_sum_exp(c);
        c.iter_mut().for_each(|v| *v -= norm);
    }
    unary(input, out, LogSoftmax(chunk))
}

struct Add;

impl BinaryDiff for Add {
    fn dfda(&self, _: &Tensor, _: &Tensor, upstream: Tensor) -> Tensor {
        upstream
    }

    fn dfdb(&self, _: &Tensor, _: &Tensor, upstream: Tensor) -> Tensor {
        upstream
    }
}

/// Add two nodes elementwise.
pub fn add(a: ResRef, b: ResRef) -> ResRef {
    let out = a.output() + b.output();
    binary(a, b, out, Add)
}

struct Sub;

impl BinaryDiff for Sub {
    fn dfda(&self, _: &Tensor, _: &Tensor, upstream: Tensor) -> Tensor {
        upstream
    }

    fn dfdb(&self, _: &Tensor, _: &Tensor, mut upstream: Tensor) -> Tensor {
        upstream.scale(-1.0);
        upstream
    }
}

/// Subtract the second node from the first elementwise.
pub fn sub(a: ResRef, b: ResRef) -> ResRef {
    let out = a.output() - b.output();
    binary(a, b, out, Sub)
}

struct Mul;

impl BinaryDiff for Mul {
    fn dfda(&self, _: &Tensor, b: &Tensor, mut upstream: Tensor) -> Tensor {
        upstream *= b;
        upstream
    }

    fn dfdb(&self, a: &Tensor, _: &Tensor, mut upstream: Tensor) -> Tensor {
        upstream *= a;
        upstream
    }
}

/// Multiply two nodes elementwise.
pub fn mul(a: ResRef, b: ResRef) -> ResRef {
    let out = a.output() * b.output();
    binary(a, b, out, Mul)
}

struct AddRepeated;

impl BinaryDiff for AddRepeated {
    fn dfda(&self, _: &Tensor, _: &Tensor, upstream: Tensor) -> Tensor {
        upstream
    }

    fn dfdb(&self, _: &Tensor, b: &Tensor, upstream: Tensor) -> Tensor {
        upstream.sum_rows(b.len())
    }
}

/// Add `b` to every consecutive chunk of `b.len()` entries of `a`.
pub fn add_repeated(a: ResRef, b: ResRef) -> ResRef {
    let mut out = a.output().clone();
    out.add_repeated(b.output());
    binary(a, b, out, AddRepeated)
}

struct ScaleRepeated;

impl BinaryDiff for ScaleRepeated {
    fn dfda(&self, _: &Tensor, b: &Tensor, mut upstream: Tensor) -> Tensor {
        upstream.scale_repeated(b);
        upstream
    }

    fn dfdb(&self, a: &Tensor, b: &Tensor, mut upstream: Tensor) -> Tensor {
        upstream *= a;
        upstream.sum_rows(b.len())
    }
}

/// Multiply every consecutive chunk of `s.len()` entries of `a` by `s`.
pub fn scale_repeated(a: ResRef, s: ResRef) -> ResRef {
    let mut out = a.output().clone();
    out.scale_repeated(s.output());
    binary(a, s, out, ScaleRepeated)
}

/// Compute `a[i] * s[i % s.len()] + b[i % b.len()]`.
pub fn scale_add_repeated(a: ResRef, s: ResRef, b: ResRef) -> ResRef {
    add_repeated(scale_repeated(a, s), b)
}

struct Sum(usize);

impl UnaryDiff for Sum {
    fn df(&self, _: &Tensor, _: &Tensor, upstream: Tensor) -> Tensor {
        Tensor::full(self.0, upstream[0])
    }
}

/// Sum every entry into a single-entry node.
pub fn sum(input: ResRef) -> ResRef {
    let n = input.output().len();
    let out = Tensor::from(vec![input.output().sum()]);
    unary(input, out, Sum(n))
}

struct SumRows(usize);

impl UnaryDiff for SumRows {
    fn df(&self, input: &Tensor, _: &Tensor, upstream: Tensor) -> Tensor {
        (0..input.len()).map(|i| upstream[i % self.0]).collect()
    }
}

/// Sum the rows of a matrix with `cols` columns into a single row.
pub fn sum_rows(input: ResRef, cols: usize) -> ResRef {
    let out = input.output().sum_rows(cols);
    unary(input, out, SumRows(cols.max(1)))
}

struct SumCols(usize);

impl UnaryDiff for SumCols {
    fn df(&self, input: &Tensor, _: &Tensor, upstream: Tensor) -> Tensor {
        (0..input.len()).map(|i| upstream[i / self.0]).collect()
    }
}

/// Sum each row of a matrix with `cols` columns, yielding one entry per row.
pub fn sum_cols(input: ResRef, cols: usize) -> ResRef {
    let out = input.output().sum_cols(cols);
    unary(input, out, SumCols(cols.max(1)))
}

struct Slice {
    start: usize,
    len: usize,
}

impl UnaryDiff for Slice {
    fn df(&self, input: &Tensor, _: &Tensor, upstream: Tensor) -> Tensor {
        let mut down = Tensor::zeros(input.len());
        down.data_mut()[self.start..self.start + self.len].copy_from_slice(upstream.data());
        down
    }
}

/// Select the entries in `[start, end)`.
pub fn slice(input: ResRef, start: usize, end: usize) -> ResRef {
    let out = input.output().slice(start, end);
    unary(
        input,
        out,
        Slice {
            start,
            len: end - start,
        },
    )
}

struct Concat {
    parts: Vec<ResRef>,
    out: Tensor,
    vars: VarSet,
}

impl Res for Concat {
    fn output(&self) -> &Tensor {
        &self.out
    }

    fn vars(&self) -> &VarSet {
        &self.vars
    }

    fn propagate(&self, upstream: Tensor, grad: &mut Grad) {
        let mut offset = 0;
        for p in &self.parts {
            let n = p.output().len();
            if grad.intersects(p.vars()) {
                p.propagate(upstream.slice(offset, offset + n), grad);
            }
            offset += n;
        }
    }
}

/// Join several nodes end to end.
pub fn concat(parts: Vec<ResRef>) -> ResRef {
    let out = Tensor::concat(parts.iter().map(|p| p.output()));
    let vars = VarSet::merge(parts.iter().map(|p| p.vars()));
    Rc::new(Concat { parts, out, vars })
}

struct MatMul {
    a: Matrix,
    b: Matrix,
    trans_a: bool,
    trans_b: bool,
    out: Tensor,
    vars: VarSet,
}

impl Res for MatMul {
    fn output(&self) -> &Tensor {
        &self.out
    }

    fn vars(&self) -> &VarSet {
        &self.vars
    }

    fn propagate(&self, upstream: Tensor, grad: &mut Grad) {
        let (m, k) = op_dims(&self.a, self.trans_a);
        let n = op_dims(&self.b, self.trans_b).1;
        let (a, b) = (self.a.data.output().data(), self.b.data.output().data());
        let u = upstream.data();
        if grad.intersects(self.a.data.vars()) {
            let mut da = Tensor::zeros(m * k);
            if self.trans_a {
                cpu::gemm(self.trans_b, true, k, m, n, 1.0, b, u, 0.0, da.data_mut());
            } else {
                cpu::gemm(false, !self.trans_b, m, k, n, 1.0, u, b, 0.0, da.data_mut());
            }
            self.a.data.propagate(da, grad);
        }
        if grad.intersects(self.b.data.vars()) {
            let mut db = Tensor::zeros(k * n);
            if self.trans_b {
                cpu::gemm(true, self.trans_a, n, k, m, 1.0, u, a, 0.0, db.data_mut());
            } else {
                cpu::gemm(!self.trans_a, false, k, n, m, 1.0, a, u, 0.0, db.data_mut());
            }
            self.b.data.propagate(db, grad);
        }
    }
}

fn op_dims(m: &Matrix, trans: bool) -> (usize, usize) {
    if trans {
        (m.cols, m.rows)
    } else {
        (m.rows, m.cols)
    }
}

/// Multiply two matrices, optionally transposing either operand.
pub fn matmul(trans_a: bool, trans_b: bool, a: Matrix, b: Matrix) -> Matrix {
    let (m, k) = op_dims(&a, trans_a);
    let (k2, n) = op_dims(&b, trans_b);
    assert_eq!(k, k2, "matrix inner dimensions differ: {k} vs {k2}");
    let mut out = Tensor::zeros(m * n);
    cpu::gemm(
        trans_a,
        trans_b,
        m,
        n,
        k,
        1.0,
        a.data.output().data(),
        b.data.output().data(),
        0.0,
        out.data_mut(),
    );
    let vars = VarSet::merge([a.data.vars(), b.data.vars()]);
    let data: ResRef = Rc::new(MatMul {
        a,
        b,
        trans_a,
        trans_b,
        out,
        vars,
    });
    Matrix { data, rows: m, cols: n }
}

struct Pool {
    input: ResRef,
    tmp: Var,
    res: ResRef,
    vars: VarSet,
}

impl Res for Pool {
    fn output(&self) -> &Tensor {
        self.res.output()
    }

    fn vars(&self) -> &VarSet {
        &self.vars
    }

    fn propagate(&self, upstream: Tensor, grad: &mut Grad) {
        if !grad.intersects(self.input.vars()) {
            self.res.propagate(upstream, grad);
            return;
        }
        grad.insert_zero(&self.tmp);
        self.res.propagate(upstream, grad);
        let down = grad
            .remove(self.tmp.id())
            .unwrap_or_else(|| Tensor::zeros(self.tmp.len()));
        self.input.propagate(down, grad);
    }
}

/// Evaluate `f` on a stand-in for `input` so that `input` is propagated exactly once, no matter
/// how many times `f` uses it.
pub fn pool<F: FnOnce(ResRef) -> ResRef>(input: ResRef, f: F) -> ResRef {
    let tmp = Var::new(input.output().clone());
    let res = f(tmp.res());
    let mut vars = res.vars().clone();
    vars.del(tmp.id());
    vars.extend(input.vars());
    Rc::new(Pool {
        input,
        tmp,
        res,
        vars,
    })
}
