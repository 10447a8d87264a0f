use dfdx::prelude::*;
use dfdx_linear_core::Optimizer;
use log::trace;

/// Plain stochastic gradient descent: `p -= lr * grad`.
///
/// A tensor with no entry in the gradients (one that did not feed the loss)
/// gets a zero gradient allocated and is left unchanged.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Sgd {
    lr: f64,
}

impl Sgd {
    pub fn new(lr: f64) -> Self {
        Self { lr }
    }

    pub fn learning_rate(&self) -> f64 {
        self.lr
    }

    pub fn set_learning_rate(&mut self, lr: f64) {
        self.lr = lr;
    }
}

impl Default for Sgd {
    fn default() -> Self {
        Self::new(1e-2)
    }
}

impl<E: Dtype, D: Device<E>> Optimizer<E, D> for Sgd {
    fn update_tensor<S: Shape>(
        &mut self,
        t: &mut Tensor<S, E, D>,
        gradients: &mut Gradients<E, D>,
    ) -> Result<(), D::Err> {
        trace!("sgd step on tensor of shape {:?} with lr {}", t.shape(), self.lr);
        gradients.try_alloc_for(t)?;
        let g = gradients.get(t);
        t.try_axpy(1.0, &g, -self.lr)
    }
}
