use serde::{Deserialize, Serialize};
use tracing::info;

use crate::{
    autodiff::ResRef,
    error::Result,
    serializer::{BuildOptions, Codec},
};

/// Logs statistics of its input and returns it unchanged.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DebugLayer {
    /// Label attached to every log line.
    pub id: String,
    /// Log the raw input.
    pub print_raw: bool,
    /// Log the mean of the input.
    pub print_mean: bool,
    /// Log the variance of the input.
    pub print_variance: bool,
}

impl DebugLayer {
    /// Log the configured statistics and pass the input through.
    pub fn apply(&self, input: ResRef, _batch: usize) -> ResRef {
        let out = input.output();
        let n = out.len().max(1) as f64;
        let mean = out.sum() / n;
        if self.print_raw {
            info!(id = %self.id, raw = ?out.data(), "layer input");
        }
        if self.print_mean {
            info!(id = %self.id, mean, "layer input");
        }
        if self.print_variance {
            let variance = out.data().iter().map(|x| (x - mean).powi(2)).sum::<f64>() / n;
            info!(id = %self.id, variance, "layer input");
        }
        input
    }
}

impl Codec for DebugLayer {
    const TYPE_ID: &'static str = "anynet.Debug";
    type Record = Self;

    fn to_record(&self) -> Result<Self> {
        Ok(self.clone())
    }

    fn from_record(r: Self, _: &BuildOptions) -> Result<Self> {
        Ok(r)
    }
}
