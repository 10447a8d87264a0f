//! Parameter initializers.
//!
//! Every sampler takes its random source as an argument, so a seeded
//! [rand::rngs::StdRng] reproduces a model exactly.

use dfdx::prelude::*;
use num_traits::Float;
use rand::Rng;
use rand_distr::{uniform::SampleUniform, Distribution, Uniform};

use crate::DeviceError;

/// Negative slope `a` used by [kaiming_bound] unless a layer asks for another
/// one. With `a = 1` the bound is `sqrt(3 / fan_in)`.
pub const DEFAULT_NEGATIVE_SLOPE: f64 = 1.0;

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum InitError {
    #[error("fan-in must be positive")]
    ZeroFanIn,
    #[error("invalid uniform range [{low}, {high}]")]
    InvalidRange { low: f64, high: f64 },
    #[error(transparent)]
    Device(#[from] DeviceError),
}

/// Returns `(fan_in, fan_out)` for a parameter of the given shape.
///
/// Shapes are `[out, in, receptive..]`. A 1-D shape uses its only dimension
/// for both fans.
pub fn compute_fans(shape: &[usize]) -> (usize, usize) {
    match shape {
        [] => (1, 1),
        [n] => (*n, *n),
        [out, inp, receptive @ ..] => {
            let receptive: usize = receptive.iter().product();
            (inp * receptive, out * receptive)
        }
    }
}

/// `sqrt(6 / ((1 + a²) * fan_in))`
pub fn kaiming_bound(fan_in: usize, negative_slope: f64) -> Result<f64, InitError> {
    if fan_in == 0 {
        return Err(InitError::ZeroFanIn);
    }
    let gain_sq = 2.0 / (1.0 + negative_slope * negative_slope);
    Ok((3.0 * gain_sq / fan_in as f64).sqrt())
}

/// `1 / sqrt(fan_in)`, the range used for bias terms.
pub fn fan_in_bound(fan_in: usize) -> Result<f64, InitError> {
    if fan_in == 0 {
        return Err(InitError::ZeroFanIn);
    }
    Ok(1.0 / (fan_in as f64).sqrt())
}

/// Draws `n` values uniformly from `[low, high]`.
pub fn sample_uniform<E, R>(rng: &mut R, n: usize, low: f64, high: f64) -> Result<Vec<E>, InitError>
where
    E: Float + SampleUniform,
    R: Rng + ?Sized,
{
    let invalid = InitError::InvalidRange { low, high };
    if !low.is_finite() || !high.is_finite() || low > high {
        return Err(invalid);
    }
    let (Some(lo), Some(hi)) = (num_traits::cast::<f64, E>(low), num_traits::cast::<f64, E>(high))
    else {
        return Err(invalid);
    };
    // bounds may overflow `E`; the sampler scales the width by 1 / (1 - eps)
    let width = (hi - lo) / (E::one() - E::epsilon());
    if !lo.is_finite() || !hi.is_finite() || !width.is_finite() {
        return Err(invalid);
    }
    let distr = Uniform::<E>::new_inclusive(lo, hi);
    Ok((0..n).map(|_| distr.sample(&mut *rng)).collect())
}

/// Draws `n` values from the Kaiming-uniform distribution for `fan_in`.
pub fn sample_kaiming_uniform<E, R>(
    rng: &mut R,
    n: usize,
    fan_in: usize,
    negative_slope: f64,
) -> Result<Vec<E>, InitError>
where
    E: Float + SampleUniform,
    R: Rng + ?Sized,
{
    let bound = kaiming_bound(fan_in, negative_slope)?;
    sample_uniform(rng, n, -bound, bound)
}

/// A tensor of `shape` filled uniformly from `[low, high]`.
pub fn uniform<S, E, D, R>(
    device: &D,
    rng: &mut R,
    shape: S,
    low: f64,
    high: f64,
) -> Result<Tensor<S, E, D>, InitError>
where
    S: Shape,
    E: Dtype + Float + SampleUniform,
    D: Device<E>,
    R: Rng + ?Sized,
{
    let values = sample_uniform(rng, shape.num_elements(), low, high)?;
    let t = device
        .try_tensor_from_vec(values, shape)
        .map_err(DeviceError::new)?;
    Ok(t)
}

/// A tensor of `shape` filled from the Kaiming-uniform distribution.
pub fn kaiming_uniform<S, E, D, R>(
    device: &D,
    rng: &mut R,
    shape: S,
    fan_in: usize,
    negative_slope: f64,
) -> Result<Tensor<S, E, D>, InitError>
where
    S: Shape,
    E: Dtype + Float + SampleUniform,
    D: Device<E>,
    R: Rng + ?Sized,
{
    let bound = kaiming_bound(fan_in, negative_slope)?;
    uniform(device, rng, shape, -bound, bound)
}
