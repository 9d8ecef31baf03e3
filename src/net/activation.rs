use serde::{Deserialize, Serialize};

use crate::{
    autodiff::{log_softmax, relu, sigmoid, sin, tanh, ResRef},
    error::Result,
    serializer::{BuildOptions, Codec},
};

/// A parameter-free nonlinearity.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Activation {
    /// Hyperbolic tangent.
    Tanh,
    /// Log-softmax over each sample.
    LogSoftmax,
    /// Logistic sigmoid.
    Sigmoid,
    /// Rectified linear unit.
    ReLU,
    /// Sine.
    Sin,
}

impl Activation {
    /// Apply the function to `batch` inputs.
    pub fn apply(&self, input: ResRef, batch: usize) -> ResRef {
        match self {
            Activation::Tanh => tanh(input),
            Activation::LogSoftmax => {
                let len = input.output().len();
                let chunk = if batch == 0 { len } else { len / batch };
                log_softmax(input, chunk)
            }
            Activation::Sigmoid => sigmoid(input),
            Activation::ReLU => relu(input),
            Activation::Sin => sin(input),
        }
    }
}

impl Codec for Activation {
    const TYPE_ID: &'static str = "anynet.Activation";
    type Record = Self;

    fn to_record(&self) -> Result<Self> {
        Ok(*self)
    }

    fn from_record(r: Self, _: &BuildOptions) -> Result<Self> {
        Ok(r)
    }
}
