//! Reading and writing parameter tensors in the safetensors format.

use std::{borrow::Cow, fs::File, path::Path};

use dfdx::prelude::*;
use log::debug;
use safetensors::tensor::{Dtype as SafeTensorsDtype, SafeTensors, View};

use crate::{DeviceError, Parameter};

#[derive(Debug, thiserror::Error)]
pub enum SafetensorsError {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("malformed safetensors data: {0}")]
    Format(String),
    #[error("tensor `{0}` not found")]
    MissingTensor(String),
    #[error("tensor `{name}` is stored as {found}, expected {expected}")]
    Dtype {
        name: String,
        expected: String,
        found: String,
    },
    #[error("tensor `{name}` has rank {found}, expected {expected}")]
    Rank {
        name: String,
        expected: usize,
        found: usize,
    },
    #[error("shape {shape:?} holds {expected} elements, got {found} values")]
    ShapeMismatch {
        shape: Vec<usize>,
        expected: usize,
        found: usize,
    },
    #[error(transparent)]
    Device(#[from] DeviceError),
}

/// Element types that have a safetensors encoding.
pub trait SafeDtype: Dtype {
    const DTYPE: SafeTensorsDtype;

    fn write_le(values: &[Self], out: &mut Vec<u8>);
    fn read_le(bytes: &[u8]) -> Vec<Self>;
}

impl SafeDtype for f32 {
    const DTYPE: SafeTensorsDtype = SafeTensorsDtype::F32;

    fn write_le(values: &[Self], out: &mut Vec<u8>) {
        for v in values {
            out.extend_from_slice(&v.to_le_bytes());
        }
    }

    fn read_le(bytes: &[u8]) -> Vec<Self> {
        bytes
            .chunks_exact(4)
            .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect()
    }
}

impl SafeDtype for f64 {
    const DTYPE: SafeTensorsDtype = SafeTensorsDtype::F64;

    fn write_le(values: &[Self], out: &mut Vec<u8>) {
        for v in values {
            out.extend_from_slice(&v.to_le_bytes());
        }
    }

    fn read_le(bytes: &[u8]) -> Vec<Self> {
        bytes
            .chunks_exact(8)
            .map(|c| f64::from_le_bytes([c[0], c[1], c[2], c[3], c[4], c[5], c[6], c[7]]))
            .collect()
    }
}

/// An encoded tensor waiting to be written.
#[derive(Debug, Clone)]
pub struct TensorRecord {
    dtype: SafeTensorsDtype,
    shape: Vec<usize>,
    data: Vec<u8>,
}

impl TensorRecord {
    /// Encodes `values` as a tensor of `shape`. The element count must match.
    pub fn new<E: SafeDtype>(shape: Vec<usize>, values: &[E]) -> Result<Self, SafetensorsError> {
        let expected: usize = shape.iter().product();
        if expected != values.len() {
            return Err(SafetensorsError::ShapeMismatch {
                shape,
                expected,
                found: values.len(),
            });
        }
        Ok(Self::encode(shape, values))
    }

    pub fn from_parameter<E: SafeDtype, D: Device<E>>(p: &Parameter<'_, E, D>) -> Self {
        Self::encode(p.shape(), &p.values())
    }

    fn encode<E: SafeDtype>(shape: Vec<usize>, values: &[E]) -> Self {
        let mut data = Vec::with_capacity(std::mem::size_of_val(values));
        E::write_le(values, &mut data);
        Self {
            dtype: E::DTYPE,
            shape,
            data,
        }
    }
}

impl View for TensorRecord {
    fn dtype(&self) -> SafeTensorsDtype {
        self.dtype
    }
    fn shape(&self) -> &[usize] {
        &self.shape
    }
    fn data(&self) -> Cow<[u8]> {
        Cow::Borrowed(&self.data)
    }
    fn data_len(&self) -> usize {
        self.data.len()
    }
}

/// Serializes `records` and writes them to `path`, replacing any existing file.
pub fn save<P: AsRef<Path>>(
    path: P,
    records: Vec<(String, TensorRecord)>,
) -> Result<(), SafetensorsError> {
    let names: Vec<String> = records.iter().map(|(name, _)| name.clone()).collect();
    let bytes = safetensors::serialize(records, &None)
        .map_err(|e| SafetensorsError::Format(format!("{e:?}")))?;
    std::fs::write(path.as_ref(), bytes)?;
    debug!("saved {names:?} to {}", path.as_ref().display());
    Ok(())
}

/// A memory-mapped safetensors file.
pub struct SafetensorsFile {
    mmap: memmap2::Mmap,
}

impl SafetensorsFile {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, SafetensorsError> {
        let file = File::open(path.as_ref())?;
        // SAFETY: the map is read-only and lives as long as `Self`.
        let mmap = unsafe { memmap2::Mmap::map(&file)? };
        debug!("opened {} ({} bytes)", path.as_ref().display(), mmap.len());
        Ok(Self { mmap })
    }

    fn tensors(&self) -> Result<SafeTensors<'_>, SafetensorsError> {
        SafeTensors::deserialize(&self.mmap).map_err(|e| SafetensorsError::Format(format!("{e:?}")))
    }

    pub fn names(&self) -> Result<Vec<String>, SafetensorsError> {
        let tensors = self.tensors()?;
        let mut names: Vec<String> = tensors.names().into_iter().cloned().collect();
        names.sort();
        Ok(names)
    }

    pub fn contains(&self, name: &str) -> Result<bool, SafetensorsError> {
        Ok(self.names()?.iter().any(|n| n == name))
    }

    /// Shape and decoded values of tensor `name`.
    pub fn read<E: SafeDtype>(&self, name: &str) -> Result<(Vec<usize>, Vec<E>), SafetensorsError> {
        let tensors = self.tensors()?;
        let view = tensors
            .tensor(name)
            .map_err(|_| SafetensorsError::MissingTensor(name.to_string()))?;
        if view.dtype() != E::DTYPE {
            return Err(SafetensorsError::Dtype {
                name: name.to_string(),
                expected: format!("{:?}", E::DTYPE),
                found: format!("{:?}", view.dtype()),
            });
        }
        Ok((view.shape().to_vec(), E::read_le(view.data())))
    }

    pub fn read_vector<E: SafeDtype, D: Device<E>>(
        &self,
        device: &D,
        name: &str,
    ) -> Result<Tensor<(usize,), E, D>, SafetensorsError> {
        let (shape, values) = self.read::<E>(name)?;
        match shape[..] {
            [n] => Ok(device
                .try_tensor_from_vec(values, (n,))
                .map_err(DeviceError::new)?),
            _ => Err(SafetensorsError::Rank {
                name: name.to_string(),
                expected: 1,
                found: shape.len(),
            }),
        }
    }

    pub fn read_matrix<E: SafeDtype, D: Device<E>>(
        &self,
        device: &D,
        name: &str,
    ) -> Result<Tensor<(usize, usize), E, D>, SafetensorsError> {
        let (shape, values) = self.read::<E>(name)?;
        match shape[..] {
            [m, n] => Ok(device
                .try_tensor_from_vec(values, (m, n))
                .map_err(DeviceError::new)?),
            _ => Err(SafetensorsError::Rank {
                name: name.to_string(),
                expected: 2,
                found: shape.len(),
            }),
        }
    }
}
