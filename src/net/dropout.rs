use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::{
    autodiff::{constant, mul, scale, ResRef},
    error::Result,
    serializer::{BuildOptions, Codec},
    tensor::Tensor,
};

/// Randomly zeroes inputs during training.
///
/// When disabled, inputs are scaled by the keep probability so that their expected value matches
/// the training-time output.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Dropout {
    /// Whether random masking is active.
    pub enabled: bool,
    /// Probability of keeping each input.
    pub keep_prob: f64,
}

impl Dropout {
    /// Create an enabled dropout layer.
    pub fn new(keep_prob: f64) -> Self {
        Self {
            enabled: true,
            keep_prob,
        }
    }

    /// Apply the layer.
    pub fn apply(&self, input: ResRef, _batch: usize) -> ResRef {
        if !self.enabled {
            return scale(input, self.keep_prob);
        }
        let mut rng = rand::thread_rng();
        let mask: Tensor = (0..input.output().len())
            .map(|_| if rng.gen::<f64>() < self.keep_prob { 1.0 } else { 0.0 })
            .collect();
        mul(input, constant(mask))
    }
}

impl Codec for Dropout {
    const TYPE_ID: &'static str = "anynet.Dropout";
    type Record = Self;

    fn to_record(&self) -> Result<Self> {
        Ok(*self)
    }

    fn from_record(r: Self, _: &BuildOptions) -> Result<Self> {
        Ok(r)
    }
}
