use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::{
    autodiff::{add_repeated, constant, matmul, Matrix, ResRef, Var},
    error::{Error, Result},
    serializer::{BuildOptions, Codec},
    tensor::Tensor,
};

/// A fully-connected layer computing `W x + b` for every input `x`.
///
/// The weight matrix has `out_count` rows and `in_count` columns.
#[derive(Clone, Debug)]
pub struct Fc {
    /// Input dimension.
    pub in_count: usize,
    /// Output dimension.
    pub out_count: usize,
    /// Row-major `out_count x in_count` weights.
    pub weights: Var,
    /// Output biases.
    pub biases: Var,
}

impl Fc {
    /// Create a layer with normal weights scaled by `1/sqrt(in_count)` and zero biases.
    pub fn new<R: Rng + ?Sized>(in_count: usize, out_count: usize, rng: &mut R) -> Self {
        let scale = 1.0 / (in_count as f64).sqrt();
        Self {
            in_count,
            out_count,
            weights: Var::new(Tensor::rand_normal(in_count * out_count, scale, rng)),
            biases: Var::new(Tensor::zeros(out_count)),
        }
    }

    /// Create a layer with all parameters set to zero.
    pub fn zero(in_count: usize, out_count: usize) -> Self {
        Self {
            in_count,
            out_count,
            weights: Var::new(Tensor::zeros(in_count * out_count)),
            biases: Var::new(Tensor::zeros(out_count)),
        }
    }

    /// Apply the layer to `batch` inputs.
    ///
    /// An empty batch gives an empty constant that references no parameters.
    pub fn apply(&self, input: ResRef, batch: usize) -> ResRef {
        if batch == 0 || input.output().is_empty() {
            return constant(Tensor::zeros(0));
        }
        assert_eq!(
            input.output().len(),
            batch * self.in_count,
            "fc input has {} entries, expected {batch}x{}",
            input.output().len(),
            self.in_count
        );
        let inputs = Matrix::new(input, batch, self.in_count);
        let weights = Matrix::new(self.weights.res(), self.out_count, self.in_count);
        let product = matmul(false, true, inputs, weights);
        add_repeated(product.data, self.biases.res())
    }

    /// Return the weights and biases.
    pub fn parameters(&self) -> Vec<Var> {
        vec![self.weights.clone(), self.biases.clone()]
    }
}

/// Stored parameters of an [`Fc`] layer.
#[derive(Serialize, Deserialize)]
pub struct FcRecord {
    weights: Tensor,
    biases: Tensor,
}

impl Codec for Fc {
    const TYPE_ID: &'static str = "anynet.FC";
    type Record = FcRecord;

    fn to_record(&self) -> Result<FcRecord> {
        Ok(FcRecord {
            weights: Tensor::clone(&self.weights.value()),
            biases: Tensor::clone(&self.biases.value()),
        })
    }

    fn from_record(r: FcRecord, _: &BuildOptions) -> Result<Self> {
        let out_count = r.biases.len();
        if out_count == 0 || r.weights.len() % out_count != 0 {
            return Err(Error::InvalidData(format!(
                "invalid matrix dimensions: {} weights for {out_count} outputs",
                r.weights.len()
            )));
        }
        Ok(Self {
            in_count: r.weights.len() / out_count,
            out_count,
            weights: Var::new(r.weights),
            biases: Var::new(r.biases),
        })
    }
}
