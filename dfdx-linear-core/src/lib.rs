//! Module abstraction shared by the layers in `dfdx-linear`.
//!
//! A layer is described by the capabilities it implements rather than by a
//! base class: [Module] for the forward pass, [Parameters] for the ordered
//! list of trainable tensors, [Describe] for a printable summary,
//! [ResetParams] and [UpdateParams] for the two ways parameters change.
//! Tensors, tapes and gradients all come from [dfdx].

pub mod init;
pub mod persist;
mod vecs;

use dfdx::prelude::*;
use rand::Rng;

pub use init::InitError;
pub use vecs::Stack;

pub trait Module<X> {
    type Output;
    type Error: std::fmt::Debug;

    fn try_forward(&self, x: X) -> Result<Self::Output, Self::Error>;

    fn try_forward_mut(&mut self, x: X) -> Result<Self::Output, Self::Error> {
        self.try_forward(x)
    }

    fn forward(&self, x: X) -> Self::Output {
        self.try_forward(x).unwrap()
    }

    fn forward_mut(&mut self, x: X) -> Self::Output {
        self.try_forward_mut(x).unwrap()
    }
}

/// Applies a gradient step to a single parameter tensor.
///
/// `gradients` is mutable so a tensor that took no part in the traced
/// computation can be given a zero gradient with
/// [Gradients::try_alloc_for] instead of failing the lookup.
pub trait Optimizer<E: Dtype, D: Device<E>> {
    fn update_tensor<S: Shape>(
        &mut self,
        t: &mut Tensor<S, E, D>,
        gradients: &mut Gradients<E, D>,
    ) -> Result<(), D::Err>;
}

pub trait BuildOnDevice<E: Dtype, D: Device<E>>: Clone {
    type Built: Clone;
    fn build_on_device(&self, device: &D) -> Self::Built {
        self.try_build_on_device(device).unwrap()
    }
    fn try_build_on_device(&self, device: &D) -> Result<Self::Built, D::Err>;
}

/// Re-draws parameter values from an explicit random source.
pub trait ResetParams {
    type Error: std::fmt::Debug;
    fn reset_params<R: Rng + ?Sized>(&mut self, rng: &mut R) {
        self.try_reset_params(rng).unwrap()
    }
    fn try_reset_params<R: Rng + ?Sized>(&mut self, rng: &mut R) -> Result<(), Self::Error>;
}

pub trait UpdateParams<E: Dtype, D: Device<E>> {
    fn update_params<Optim: Optimizer<E, D>>(
        &mut self,
        optimizer: &mut Optim,
        gradients: &mut Gradients<E, D>,
    ) {
        self.try_update_params(optimizer, gradients).unwrap()
    }
    fn try_update_params<Optim: Optimizer<E, D>>(
        &mut self,
        optimizer: &mut Optim,
        gradients: &mut Gradients<E, D>,
    ) -> Result<(), D::Err>;
}

pub trait BuildModuleExt<M>: Sized {
    fn build_module_ext<E: Dtype, R: Rng + ?Sized>(&self, m: M, rng: &mut R) -> M::Built
    where
        M: BuildOnDevice<E, Self>,
        M::Built: ResetParams,
        Self: Device<E>,
    {
        let mut module = m.build_on_device(self);
        module.reset_params(rng);
        module
    }

    fn try_build_module_ext<E: Dtype, R: Rng + ?Sized>(
        &self,
        m: M,
        rng: &mut R,
    ) -> Result<M::Built, <M::Built as ResetParams>::Error>
    where
        M: BuildOnDevice<E, Self>,
        M::Built: ResetParams,
        <M::Built as ResetParams>::Error: From<DeviceError>,
        Self: Device<E>,
    {
        let mut module = m.try_build_on_device(self).map_err(DeviceError::new)?;
        module.try_reset_params(rng)?;
        Ok(module)
    }
}
impl<D, M> BuildModuleExt<M> for D {}

/// A borrowed trainable tensor, as listed by [Parameters::parameters].
#[derive(Debug)]
pub enum Parameter<'a, E: Dtype, D: Device<E>> {
    Vector(&'a Tensor<(usize,), E, D>),
    Matrix(&'a Tensor<(usize, usize), E, D>),
}

impl<'a, E: Dtype, D: Device<E>> Parameter<'a, E, D> {
    pub fn shape(&self) -> Vec<usize> {
        match self {
            Parameter::Vector(t) => {
                let (n,) = *t.shape();
                vec![n]
            }
            Parameter::Matrix(t) => {
                let (m, n) = *t.shape();
                vec![m, n]
            }
        }
    }

    pub fn num_elements(&self) -> usize {
        self.shape().iter().product()
    }

    /// Copies the values out of the device, row-major.
    pub fn values(&self) -> Vec<E> {
        match self {
            Parameter::Vector(t) => t.as_vec(),
            Parameter::Matrix(t) => t.as_vec(),
        }
    }
}

/// Ordered trainable tensors of a module. Registration order is part of the
/// contract: a layer's weight always precedes its bias.
pub trait Parameters<E: Dtype, D: Device<E>> {
    fn parameters(&self) -> Vec<Parameter<'_, E, D>>;

    fn num_parameters(&self) -> usize {
        self.parameters().iter().map(Parameter::num_elements).sum()
    }
}

/// Human readable one-line summary of a module.
pub trait Describe: std::fmt::Display {
    fn describe(&self) -> String {
        self.to_string()
    }
}

/// A device failure, flattened to its debug representation so it can travel
/// inside device-agnostic error enums.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("device error: {0}")]
pub struct DeviceError(pub String);

impl DeviceError {
    pub fn new<Err: std::fmt::Debug>(err: Err) -> Self {
        Self(format!("{err:?}"))
    }
}
