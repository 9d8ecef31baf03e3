//! Convolutional layers operating on row-major, depth-minor image tensors.
//!
//! An image of width `w`, height `h` and depth `d` is a packed tensor where entry `(x, y, z)` is
//! stored at index `(y * w + x) * d + z`. Batches concatenate images.

use rayon::prelude::*;

use crate::{autodiff::Var, net::Layer};

mod batch_norm;
mod im2row;
mod layer;
mod padding;
mod pool;
mod post_train;
mod residual;
mod resize;

pub use batch_norm::BatchNorm;
pub use im2row::Im2Row;
pub use layer::{Conv, ConvShape};
pub use padding::Padding;
pub use pool::{MaxPool, MeanPool};
pub use post_train::PostTrainer;
pub use residual::Residual;
pub use resize::Resize;

/// How convolution layers distribute work over the images of a batch.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum ConvStrategy {
    /// Process images one after another on the calling thread.
    #[default]
    Serial,
    /// Process images on the rayon worker pool.
    Parallel,
}

impl ConvStrategy {
    /// Evaluate `f` for every index in `0..n`, returning the results in order.
    pub fn map_items<T, F>(self, n: usize, f: F) -> Vec<T>
    where
        T: Send,
        F: Fn(usize) -> T + Send + Sync,
    {
        match self {
            ConvStrategy::Serial => (0..n).map(f).collect(),
            ConvStrategy::Parallel => (0..n).into_par_iter().map(f).collect(),
        }
    }
}

/// List the weight variables of a layer, leaving out biases and normalization parameters.
///
/// Useful for applying weight decay to filters and fully-connected weights only.
pub fn weights(layer: &Layer) -> Vec<Var> {
    match layer {
        Layer::Fc(l) => vec![l.weights.clone()],
        Layer::Conv(l) => vec![l.filters.clone()],
        Layer::Net(n) => n.0.iter().flat_map(weights).collect(),
        Layer::Residual(r) => {
            let mut res = weights(&r.layer);
            if let Some(p) = &r.projection {
                res.extend(weights(p));
            }
            res
        }
        _ => Vec::new(),
    }
}
