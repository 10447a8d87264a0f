//! A fully connected layer on top of [dfdx] tensors.
//!
//! [Linear] computes `x * weight^T + bias` for single samples, batches and
//! batches of sequences. The shared module traits live in
//! [dfdx_linear_core] and are re-exported here.

pub mod linear;
pub mod sgd;

pub use dfdx_linear_core::*;
pub use linear::{Linear, LinearConfig, LinearError};
pub use sgd::Sgd;
