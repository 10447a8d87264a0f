use std::{fmt, path::Path};

use dfdx::prelude::*;
use dfdx_linear_core::{
    init::{self, InitError, DEFAULT_NEGATIVE_SLOPE},
    persist::{self, SafeDtype, SafetensorsError, SafetensorsFile, TensorRecord},
    BuildModuleExt, BuildOnDevice, Describe, Module, Optimizer, Parameter, Parameters,
    ResetParams, UpdateParams,
};
use log::debug;
use num_traits::Float;
use rand::Rng;
use rand_distr::uniform::SampleUniform;

#[derive(Debug, thiserror::Error)]
pub enum LinearError {
    #[error("{0}")]
    InvalidArgument(String),
    #[error(transparent)]
    Safetensors(#[from] SafetensorsError),
}

/// Build config for [Linear]. Bias is on by default.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LinearConfig {
    pub inp: usize,
    pub out: usize,
    pub bias: bool,
    pub negative_slope: f64,
}

impl LinearConfig {
    pub fn new(inp: usize, out: usize) -> Self {
        Self {
            inp,
            out,
            bias: true,
            negative_slope: DEFAULT_NEGATIVE_SLOPE,
        }
    }

    pub fn without_bias(self) -> Self {
        Self { bias: false, ..self }
    }

    pub fn with_negative_slope(self, negative_slope: f64) -> Self {
        Self {
            negative_slope,
            ..self
        }
    }
}

impl<E: Dtype, D: Device<E>> BuildOnDevice<E, D> for LinearConfig {
    type Built = Linear<E, D>;
    fn try_build_on_device(&self, device: &D) -> Result<Self::Built, D::Err> {
        let bias = if self.bias {
            Some(device.try_zeros_like(&(self.out,))?)
        } else {
            None
        };
        Ok(Linear {
            weight: device.try_zeros_like(&(self.out, self.inp))?,
            bias,
            negative_slope: self.negative_slope,
        })
    }
}

/// Fully connected layer computing `x * weight^T + bias`.
///
/// `weight` has shape `(out, in)` and `bias`, when present, `(out,)`. Both are
/// plain dfdx tensors: the forward pass records onto whatever tape the input
/// carries, so gradients for the input and both parameters come out of dfdx's
/// `backward`.
///
/// ```
/// use dfdx::prelude::*;
/// use dfdx_linear::{Linear, Module};
/// use rand::{rngs::StdRng, SeedableRng};
///
/// let dev: Cpu = Default::default();
/// let mut rng = StdRng::seed_from_u64(0);
/// let layer: Linear<f32, Cpu> = Linear::try_new(&dev, &mut rng, 10, 5, true).unwrap();
/// let x: Tensor<(usize, usize), f32, Cpu> = dev.zeros_like(&(8, 10));
/// let y = layer.forward(x);
/// assert_eq!(*y.shape(), (8, 5));
/// ```
#[derive(Clone, Debug)]
pub struct Linear<E: Dtype, D: Device<E>> {
    weight: Tensor<(usize, usize), E, D>,
    bias: Option<Tensor<(usize,), E, D>>,
    negative_slope: f64,
}

impl<E, D> Linear<E, D>
where
    E: Dtype + Float + SampleUniform,
    D: Device<E>,
{
    /// Freshly initialized layer: Kaiming-uniform weight and, if `bias`, a
    /// bias drawn from `[-1/sqrt(in), 1/sqrt(in)]`.
    pub fn try_new<R: Rng + ?Sized>(
        device: &D,
        rng: &mut R,
        input_size: usize,
        output_size: usize,
        bias: bool,
    ) -> Result<Self, InitError> {
        let mut cfg = LinearConfig::new(input_size, output_size);
        if !bias {
            cfg = cfg.without_bias();
        }
        Self::try_from_config(device, rng, cfg)
    }

    pub fn try_from_config<R: Rng + ?Sized>(
        device: &D,
        rng: &mut R,
        cfg: LinearConfig,
    ) -> Result<Self, InitError> {
        let layer = device.try_build_module_ext::<E, R>(cfg, rng)?;
        debug!("initialized {layer}");
        Ok(layer)
    }
}

impl<E: Dtype, D: Device<E>> Linear<E, D> {
    /// Wraps an existing `(out, in)` weight. The layer has no bias.
    pub fn from_weight(weight: Tensor<(usize, usize), E, D>) -> Self {
        Self {
            weight,
            bias: None,
            negative_slope: DEFAULT_NEGATIVE_SLOPE,
        }
    }

    /// Wraps an existing weight and bias. `bias` must have one entry per
    /// output row of `weight`.
    pub fn try_from_parts(
        weight: Tensor<(usize, usize), E, D>,
        bias: Tensor<(usize,), E, D>,
    ) -> Result<Self, LinearError> {
        let (out, _) = *weight.shape();
        let (b,) = *bias.shape();
        if b != out {
            return Err(LinearError::InvalidArgument(format!(
                "dimension mismatch between Linear weight and bias: weight has {out} rows, bias has {b} entries"
            )));
        }
        Ok(Self {
            weight,
            bias: Some(bias),
            negative_slope: DEFAULT_NEGATIVE_SLOPE,
        })
    }

    /// Slope used by [ResetParams] when re-drawing the weight.
    pub fn with_negative_slope(self, negative_slope: f64) -> Self {
        Self {
            negative_slope,
            ..self
        }
    }

    pub fn input_size(&self) -> usize {
        self.weight.shape().1
    }

    pub fn output_size(&self) -> usize {
        self.weight.shape().0
    }

    pub fn has_bias(&self) -> bool {
        self.bias.is_some()
    }

    pub fn negative_slope(&self) -> f64 {
        self.negative_slope
    }

    pub fn weight(&self) -> &Tensor<(usize, usize), E, D> {
        &self.weight
    }

    pub fn bias(&self) -> Option<&Tensor<(usize,), E, D>> {
        self.bias.as_ref()
    }

    /// `weight^T` on tape `T`, so the matmul reports gradients for `weight`.
    fn try_weight_t<T: Tape<E, D>>(&self) -> Result<Tensor<(usize, usize), E, D, T>, D::Err> {
        self.weight.retaped::<T>().try_permute::<_, Axes2<1, 0>>()
    }
}

impl<E: SafeDtype, D: Device<E>> Linear<E, D> {
    /// Writes `weight` (and `bias`) to a safetensors file.
    pub fn save_safetensors<P: AsRef<Path>>(&self, path: P) -> Result<(), SafetensorsError> {
        let names = ["weight", "bias"];
        let records = self
            .parameters()
            .iter()
            .zip(names)
            .map(|(p, name)| (name.to_string(), TensorRecord::from_parameter(p)))
            .collect();
        persist::save(path, records)
    }

    /// Rebuilds a layer from a file written by [Linear::save_safetensors].
    pub fn try_load_safetensors<P: AsRef<Path>>(device: &D, path: P) -> Result<Self, LinearError> {
        let file = SafetensorsFile::open(path)?;
        let weight = file.read_matrix(device, "weight")?;
        let layer = if file.contains("bias")? {
            let bias = file.read_vector(device, "bias")?;
            Self::try_from_parts(weight, bias)?
        } else {
            Self::from_weight(weight)
        };
        debug!("loaded {layer}");
        Ok(layer)
    }
}

impl<E, D> ResetParams for Linear<E, D>
where
    E: Dtype + Float + SampleUniform,
    D: Device<E>,
{
    type Error = InitError;
    fn try_reset_params<R: Rng + ?Sized>(&mut self, rng: &mut R) -> Result<(), Self::Error> {
        let (out, inp) = *self.weight.shape();
        let (fan_in, _) = init::compute_fans(&[out, inp]);
        let dev = self.weight.device().clone();
        self.weight =
            init::kaiming_uniform(&dev, rng, (out, inp), fan_in, self.negative_slope)?;
        if self.bias.is_some() {
            let bound = init::fan_in_bound(fan_in)?;
            self.bias = Some(init::uniform(&dev, rng, (out,), -bound, bound)?);
        }
        Ok(())
    }
}

impl<E: Dtype, D: Device<E>> UpdateParams<E, D> for Linear<E, D> {
    fn try_update_params<Optim: Optimizer<E, D>>(
        &mut self,
        optimizer: &mut Optim,
        gradients: &mut Gradients<E, D>,
    ) -> Result<(), D::Err> {
        optimizer.update_tensor(&mut self.weight, gradients)?;
        if let Some(bias) = &mut self.bias {
            optimizer.update_tensor(bias, gradients)?;
        }
        Ok(())
    }
}

impl<E: Dtype, D: Device<E>> Parameters<E, D> for Linear<E, D> {
    fn parameters(&self) -> Vec<Parameter<'_, E, D>> {
        let mut params = vec![Parameter::Matrix(&self.weight)];
        if let Some(bias) = &self.bias {
            params.push(Parameter::Vector(bias));
        }
        params
    }
}

impl<E: Dtype, D: Device<E>> fmt::Display for Linear<E, D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Linear ({}->{})", self.input_size(), self.output_size())?;
        if self.has_bias() {
            write!(f, " (with bias)")
        } else {
            write!(f, " (without bias)")
        }
    }
}

impl<E: Dtype, D: Device<E>> Describe for Linear<E, D> {}

// Single
impl<E: Dtype, D: Device<E>, T: Tape<E, D>> Module<Tensor<(usize,), E, D, T>> for Linear<E, D> {
    type Output = Tensor<(usize,), E, D, T>;
    type Error = D::Err;

    fn try_forward(&self, x: Tensor<(usize,), E, D, T>) -> Result<Self::Output, Self::Error> {
        let y = x.try_matmul(self.try_weight_t::<T>()?)?;
        match &self.bias {
            Some(bias) => y.try_add(bias.retaped::<T>()),
            None => Ok(y),
        }
    }
}

// Batched
impl<B: Dim, E: Dtype, D: Device<E>, T: Tape<E, D>> Module<Tensor<(B, usize), E, D, T>>
    for Linear<E, D>
{
    type Output = Tensor<(B, usize), E, D, T>;
    type Error = D::Err;

    fn try_forward(&self, x: Tensor<(B, usize), E, D, T>) -> Result<Self::Output, Self::Error> {
        let y = x.try_matmul(self.try_weight_t::<T>()?)?;
        match &self.bias {
            Some(bias) => {
                let shape = *y.shape();
                let bias = bias.retaped::<T>().try_broadcast_like::<_, Axis<0>>(&shape)?;
                y.try_add(bias)
            }
            None => Ok(y),
        }
    }
}

// Batched sequences
impl<B: Dim, S: Dim, E: Dtype, D: Device<E>, T: Tape<E, D>>
    Module<Tensor<(B, S, usize), E, D, T>> for Linear<E, D>
{
    type Output = Tensor<(B, S, usize), E, D, T>;
    type Error = D::Err;

    fn try_forward(
        &self,
        x: Tensor<(B, S, usize), E, D, T>,
    ) -> Result<Self::Output, Self::Error> {
        let y = x.try_matmul(self.try_weight_t::<T>()?)?;
        match &self.bias {
            Some(bias) => {
                let shape = *y.shape();
                let bias = bias
                    .retaped::<T>()
                    .try_broadcast_like::<_, Axes2<0, 1>>(&shape)?;
                y.try_add(bias)
            }
            None => Ok(y),
        }
    }
}
