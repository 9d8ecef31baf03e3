//! Packed numeric vectors and the CPU kernels operating on them.

use std::ops;

use rand::Rng;
use rand_distr::{Distribution, StandardNormal, Uniform};
use serde::{Deserialize, Serialize};

pub mod cpu;
mod mapper;

pub use mapper::Mapper;

/// A packed vector of `f64` values.
///
/// Matrices are row-major views over a tensor, described by a separate `(rows, cols)` pair. For
/// convinience, traits from [`std`] are implemented to overload elementwise arithmetic. All
/// elementwise operations require operands of equal length and panic otherwise.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Tensor {
    data: Vec<f64>,
}

impl From<Vec<f64>> for Tensor {
    fn from(data: Vec<f64>) -> Self {
        Self { data }
    }
}

impl From<&[f64]> for Tensor {
    fn from(data: &[f64]) -> Self {
        Self {
            data: data.to_vec(),
        }
    }
}

impl FromIterator<f64> for Tensor {
    fn from_iter<I: IntoIterator<Item = f64>>(iter: I) -> Self {
        Self {
            data: iter.into_iter().collect(),
        }
    }
}

impl ops::Index<usize> for Tensor {
    type Output = f64;

    fn index(&self, index: usize) -> &f64 {
        &self.data[index]
    }
}

impl ops::IndexMut<usize> for Tensor {
    fn index_mut(&mut self, index: usize) -> &mut f64 {
        &mut self.data[index]
    }
}

impl ops::AddAssign<&Tensor> for Tensor {
    fn add_assign(&mut self, other: &Tensor) {
        self.zip_apply(other, "add", |a, b| *a += b);
    }
}

impl ops::SubAssign<&Tensor> for Tensor {
    fn sub_assign(&mut self, other: &Tensor) {
        self.zip_apply(other, "sub", |a, b| *a -= b);
    }
}

impl ops::MulAssign<&Tensor> for Tensor {
    fn mul_assign(&mut self, other: &Tensor) {
        self.zip_apply(other, "mul", |a, b| *a *= b);
    }
}

impl ops::DivAssign<&Tensor> for Tensor {
    fn div_assign(&mut self, other: &Tensor) {
        self.zip_apply(other, "div", |a, b| *a /= b);
    }
}

impl ops::Add<Self> for &Tensor {
    type Output = Tensor;

    fn add(self, other: Self) -> Tensor {
        let mut out = self.clone();
        out += other;
        out
    }
}

impl ops::Sub<Self> for &Tensor {
    type Output = Tensor;

    fn sub(self, other: Self) -> Tensor {
        let mut out = self.clone();
        out -= other;
        out
    }
}

impl ops::Mul<Self> for &Tensor {
    type Output = Tensor;

    fn mul(self, other: Self) -> Tensor {
        let mut out = self.clone();
        out *= other;
        out
    }
}

impl Tensor {
    /// Create a tensor of zeros.
    pub fn zeros(len: usize) -> Self {
        Self::full(len, 0.0)
    }

    /// Create a tensor filled with a single value.
    pub fn full(len: usize, value: f64) -> Self {
        Self {
            data: vec![value; len],
        }
    }

    /// Create a tensor owning the given data.
    pub fn from_vec(data: Vec<f64>) -> Self {
        Self { data }
    }

    /// Create a tensor with entries drawn from the standard normal distribution and scaled.
    pub fn rand_normal<R: Rng + ?Sized>(len: usize, scale: f64, rng: &mut R) -> Self {
        (0..len)
            .map(|_| {
                let x: f64 = StandardNormal.sample(rng);
                x * scale
            })
            .collect()
    }

    /// Create a tensor with entries drawn uniformly from `[low, high)`.
    pub fn rand_uniform<R: Rng + ?Sized>(len: usize, low: f64, high: f64, rng: &mut R) -> Self {
        let dist = Uniform::new(low, high);
        (0..len).map(|_| dist.sample(rng)).collect()
    }

    /// Concatenate tensors end to end.
    pub fn concat<'a, I: IntoIterator<Item = &'a Tensor>>(parts: I) -> Self {
        let mut data = Vec::new();
        for p in parts {
            data.extend_from_slice(&p.data);
        }
        Self { data }
    }

    /// Return the number of entries.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Check whether the tensor has no entries.
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Return the underlying data.
    pub fn data(&self) -> &[f64] {
        &self.data
    }

    /// Return the underlying data mutably.
    pub fn data_mut(&mut self) -> &mut [f64] {
        &mut self.data
    }

    /// Consume the tensor and return its data.
    pub fn into_vec(self) -> Vec<f64> {
        self.data
    }

    /// Copy out the entries in `[start, end)`.
    pub fn slice(&self, start: usize, end: usize) -> Self {
        Self {
            data: self.data[start..end].to_vec(),
        }
    }

    /// Overwrite this tensor's entries with those of another one.
    pub fn set(&mut self, other: &Tensor) {
        assert_eq!(self.len(), other.len(), "mismatched lengths in set");
        self.data.copy_from_slice(&other.data);
    }

    /// Multiply every entry by a scalar.
    pub fn scale(&mut self, s: f64) {
        self.data.iter_mut().for_each(|x| *x *= s);
    }

    /// Add a scalar to every entry.
    pub fn add_scalar(&mut self, s: f64) {
        self.data.iter_mut().for_each(|x| *x += s);
    }

    /// Apply a function to every entry.
    pub fn map_in_place<F: FnMut(f64) -> f64>(&mut self, mut f: F) {
        self.data.iter_mut().for_each(|x| *x = f(*x));
    }

    /// Return a new tensor with a function applied to every entry.
    #[must_use]
    pub fn map<F: FnMut(f64) -> f64>(&self, f: F) -> Self {
        self.data.iter().copied().map(f).collect()
    }

    /// Sum all entries.
    pub fn sum(&self) -> f64 {
        self.data.iter().sum()
    }

    /// Compute the dot product with another tensor.
    pub fn dot(&self, other: &Tensor) -> f64 {
        assert_eq!(self.len(), other.len(), "mismatched lengths in dot");
        self.data.iter().zip(&other.data).map(|(a, b)| a * b).sum()
    }

    /// Return the largest absolute value, or zero for an empty tensor.
    pub fn max_abs(&self) -> f64 {
        self.data.iter().fold(0.0, |m, x| m.max(x.abs()))
    }

    /// Add `v` repeatedly, treating this tensor as rows of `v.len()` columns.
    pub fn add_repeated(&mut self, v: &Tensor) {
        self.repeat_apply(v, "add_repeated", |a, b| *a += b);
    }

    /// Multiply by `v` repeatedly, treating this tensor as rows of `v.len()` columns.
    pub fn scale_repeated(&mut self, v: &Tensor) {
        self.repeat_apply(v, "scale_repeated", |a, b| *a *= b);
    }

    /// Sum the rows of a matrix with `cols` columns, producing a tensor of length `cols`.
    pub fn sum_rows(&self, cols: usize) -> Self {
        let mut out = Self::zeros(cols);
        if cols == 0 {
            return out;
        }
        assert_eq!(self.len() % cols, 0, "length not divisible by columns");
        for row in self.data.chunks(cols) {
            for (o, x) in out.data.iter_mut().zip(row) {
                *o += x;
            }
        }
        out
    }

    /// Sum each row of a matrix with `cols` columns, producing one entry per row.
    pub fn sum_cols(&self, cols: usize) -> Self {
        if cols == 0 {
            return Self::zeros(0);
        }
        assert_eq!(self.len() % cols, 0, "length not divisible by columns");
        self.data.chunks(cols).map(|row| row.iter().sum()).collect()
    }

    fn zip_apply<F: FnMut(&mut f64, f64)>(&mut self, other: &Tensor, op: &str, mut f: F) {
        assert_eq!(
            self.len(),
            other.len(),
            "mismatched lengths in {op}: {} vs {}",
            self.len(),
            other.len()
        );
        for (a, b) in self.data.iter_mut().zip(&other.data) {
            f(a, *b);
        }
    }

    fn repeat_apply<F: FnMut(&mut f64, f64)>(&mut self, v: &Tensor, op: &str, mut f: F) {
        if self.is_empty() {
            return;
        }
        assert!(
            !v.is_empty() && self.len() % v.len() == 0,
            "length {} not divisible by {} in {op}",
            self.len(),
            v.len()
        );
        for chunk in self.data.chunks_mut(v.len()) {
            for (a, b) in chunk.iter_mut().zip(&v.data) {
                f(a, *b);
            }
        }
    }
}
