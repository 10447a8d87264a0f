use dfdx::prelude::{Device, Dtype, Gradients};
use rand::Rng;

use crate::{Describe, Module, Optimizer, Parameter, Parameters, ResetParams, UpdateParams};

impl<E: Dtype, D: Device<E>, T: crate::BuildOnDevice<E, D>> crate::BuildOnDevice<E, D> for Vec<T> {
    type Built = Vec<T::Built>;
    fn try_build_on_device(&self, device: &D) -> Result<Self::Built, D::Err> {
        self.iter()
            .map(|m_i| m_i.try_build_on_device(device))
            .collect()
    }
}

impl<T: ResetParams> ResetParams for Vec<T> {
    type Error = T::Error;
    fn try_reset_params<R: Rng + ?Sized>(&mut self, rng: &mut R) -> Result<(), Self::Error> {
        for m_i in self.iter_mut() {
            m_i.try_reset_params(rng)?;
        }
        Ok(())
    }
}

impl<E: Dtype, D: Device<E>, T: UpdateParams<E, D>> UpdateParams<E, D> for Vec<T> {
    fn try_update_params<Optim: Optimizer<E, D>>(
        &mut self,
        optimizer: &mut Optim,
        gradients: &mut Gradients<E, D>,
    ) -> Result<(), D::Err> {
        for m_i in self.iter_mut() {
            m_i.try_update_params(optimizer, gradients)?;
        }
        Ok(())
    }
}

/// Parameters of every element, element by element.
impl<E: Dtype, D: Device<E>, T: Parameters<E, D>> Parameters<E, D> for Vec<T> {
    fn parameters(&self) -> Vec<Parameter<'_, E, D>> {
        self.iter().flat_map(|m_i| m_i.parameters()).collect()
    }
}

impl<Input, T: Module<Input, Output = Input>> Module<Input> for Vec<T> {
    type Output = T::Output;
    type Error = T::Error;

    fn try_forward(&self, mut x: Input) -> Result<Self::Output, T::Error> {
        for m_i in self.iter() {
            x = m_i.try_forward(x)?;
        }
        Ok(x)
    }
    fn try_forward_mut(&mut self, mut x: Input) -> Result<Self::Output, Self::Error> {
        for m_i in self.iter_mut() {
            x = m_i.try_forward_mut(x)?;
        }
        Ok(x)
    }
}

/// Lists a stack as `[a, b, ...]` using each element's own description.
pub struct Stack<'a, T>(pub &'a [T]);

impl<T: Describe> std::fmt::Display for Stack<'_, T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[")?;
        for (i, m_i) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}", m_i.describe())?;
        }
        write!(f, "]")
    }
}

impl<T: Describe> Describe for Stack<'_, T> {}
