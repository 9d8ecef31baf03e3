//! Neural network layers, recurrent blocks and gradient-based training built on reverse-mode
//! automatic differentiation.

#![deny(unsafe_code, rust_2018_idioms, rust_2021_compatibility)]
#![warn(missing_docs)]

pub mod autodiff;
pub mod conv;
pub mod ctc;
pub mod error;
pub mod ff;
pub mod net;
pub mod rnn;
pub mod s2s;
pub mod s2v;
pub mod seq;
pub mod serializer;
pub mod sgd;
pub mod tensor;

pub use error::{Error, Result, ResultExt};
