use serde::{Deserialize, Serialize};

use crate::{
    autodiff::{
        add, add_scalar, constant, mul, pool, pow, scale, scale_add_repeated, square, sub,
        sum_rows, ResRef, Var,
    },
    error::{Error, Result},
    serializer::{BuildOptions, Codec},
    tensor::Tensor,
};

const DEFAULT_STABILIZER: f64 = 1e-3;

/// Normalizes each component over the rows of a batch, then applies a learned affine transform.
///
/// After a fully-connected layer `input_count` is the number of outputs; after a convolution it
/// is the number of filters, so every spatial position counts as a row. Once training is over,
/// [`PostTrainer`](super::PostTrainer) replaces these layers with fixed affine transforms.
#[derive(Clone, Debug)]
pub struct BatchNorm {
    /// Number of normalized components.
    pub input_count: usize,
    /// Post-normalization scales.
    pub scalers: Var,
    /// Post-normalization biases.
    pub biases: Var,
    /// Added to variances before the square root; zero selects a default of `1e-3`.
    pub stabilizer: f64,
}

impl BatchNorm {
    /// Create a layer with unit scales and zero biases.
    pub fn new(input_count: usize) -> Self {
        Self {
            input_count,
            scalers: Var::new(Tensor::full(input_count, 1.0)),
            biases: Var::new(Tensor::zeros(input_count)),
            stabilizer: 0.0,
        }
    }

    /// The stabilizer actually used.
    pub fn effective_stabilizer(&self) -> f64 {
        if self.stabilizer == 0.0 {
            DEFAULT_STABILIZER
        } else {
            self.stabilizer
        }
    }

    /// Apply the layer to a batch.
    pub fn apply(&self, input: ResRef, _batch: usize) -> ResRef {
        let n = self.input_count;
        let len = input.output().len();
        if len == 0 {
            return constant(Tensor::zeros(0));
        }
        assert!(
            n > 0 && len % n == 0,
            "batch-norm input of {len} entries not divisible by {n}"
        );
        let rows = (len / n).max(1) as f64;
        let eps = self.effective_stabilizer();
        pool(input, |x| {
            let neg_mean = scale(sum_rows(x.clone(), n), -1.0 / rows);
            let second_moment = scale(sum_rows(square(x.clone()), n), 1.0 / rows);
            pool(neg_mean, |neg_mean| {
                let variance = sub(second_moment, square(neg_mean.clone()));
                let normalizer = pow(add_scalar(variance, eps), -0.5);
                let total_scaler = mul(self.scalers.res(), normalizer);
                pool(total_scaler, |ts| {
                    let bias = add(self.biases.res(), mul(neg_mean, ts.clone()));
                    scale_add_repeated(x, ts, bias)
                })
            })
        })
    }

    /// Return the scales and biases, in that order.
    pub fn parameters(&self) -> Vec<Var> {
        vec![self.scalers.clone(), self.biases.clone()]
    }
}

/// Stored parameters of a [`BatchNorm`] layer.
#[derive(Serialize, Deserialize)]
pub struct BatchNormRecord {
    scalers: Tensor,
    biases: Tensor,
    stabilizer: f64,
}

impl Codec for BatchNorm {
    const TYPE_ID: &'static str = "anynet.conv.BatchNorm";
    type Record = BatchNormRecord;

    fn to_record(&self) -> Result<BatchNormRecord> {
        Ok(BatchNormRecord {
            scalers: Tensor::clone(&self.scalers.value()),
            biases: Tensor::clone(&self.biases.value()),
            stabilizer: self.stabilizer,
        })
    }

    fn from_record(r: BatchNormRecord, _: &BuildOptions) -> Result<Self> {
        if r.scalers.len() != r.biases.len() {
            return Err(Error::InvalidData(format!(
                "{} scalers but {} biases",
                r.scalers.len(),
                r.biases.len()
            )));
        }
        Ok(Self {
            input_count: r.scalers.len(),
            scalers: Var::new(r.scalers),
            biases: Var::new(r.biases),
            stabilizer: r.stabilizer,
        })
    }
}
