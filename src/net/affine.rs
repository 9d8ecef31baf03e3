use serde::{Deserialize, Serialize};

use crate::{
    autodiff::{add_scalar, constant, scale, scale_add_repeated, ResRef, Var},
    error::{Error, Result},
    serializer::{BuildOptions, Codec},
    tensor::Tensor,
};

/// A learnable elementwise transform `x[i] * scalers[i % s] + biases[i % b]`.
#[derive(Clone, Debug)]
pub struct Affine {
    /// Repeated multipliers.
    pub scalers: Var,
    /// Repeated offsets.
    pub biases: Var,
}

impl Affine {
    /// Create a transform with a single scaler and bias.
    pub fn new(scaler: f64, bias: f64) -> Self {
        Self::from_vectors(Tensor::from(vec![scaler]), Tensor::from(vec![bias]))
    }

    /// Create a transform from per-component scalers and biases.
    pub fn from_vectors(scalers: Tensor, biases: Tensor) -> Self {
        Self {
            scalers: Var::new(scalers),
            biases: Var::new(biases),
        }
    }

    /// Apply the transform to `batch` inputs.
    pub fn apply(&self, input: ResRef, batch: usize) -> ResRef {
        let len = input.output().len();
        if len == 0 {
            return constant(Tensor::zeros(0));
        }
        let (s, b) = (self.scalers.len(), self.biases.len());
        assert!(
            s > 0 && b > 0 && len % s == 0 && len % b == 0,
            "affine input of {len} entries ({batch} samples) not divisible by {s} scalers and {b} biases"
        );
        scale_add_repeated(input, self.scalers.res(), self.biases.res())
    }

    /// Return the scalers and biases.
    pub fn parameters(&self) -> Vec<Var> {
        vec![self.scalers.clone(), self.biases.clone()]
    }
}

/// Stored parameters of an [`Affine`] layer.
#[derive(Serialize, Deserialize)]
pub struct AffineRecord {
    scalers: Tensor,
    biases: Tensor,
}

impl Codec for Affine {
    const TYPE_ID: &'static str = "anynet.Affine";
    type Record = AffineRecord;

    fn to_record(&self) -> Result<AffineRecord> {
        Ok(AffineRecord {
            scalers: Tensor::clone(&self.scalers.value()),
            biases: Tensor::clone(&self.biases.value()),
        })
    }

    fn from_record(r: AffineRecord, _: &BuildOptions) -> Result<Self> {
        if r.scalers.is_empty() || r.biases.is_empty() {
            return Err(Error::InvalidData("empty affine parameters".into()));
        }
        Ok(Self::from_vectors(r.scalers, r.biases))
    }
}

/// A fixed transform `x * scale + bias`.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct ConstAffine {
    /// Multiplier.
    pub scale: f64,
    /// Offset.
    pub bias: f64,
}

impl ConstAffine {
    /// Apply the transform.
    pub fn apply(&self, input: ResRef, _batch: usize) -> ResRef {
        add_scalar(scale(input, self.scale), self.bias)
    }
}

impl Codec for ConstAffine {
    const TYPE_ID: &'static str = "anynet.ConstAffine";
    type Record = Self;

    fn to_record(&self) -> Result<Self> {
        Ok(*self)
    }

    fn from_record(r: Self, _: &BuildOptions) -> Result<Self> {
        Ok(r)
    }
}
