use ndarray::{ArrayD, IxDyn};

use crate::sharding::Placement;
use crate::{Error, Result};

/// Element kind of a graph tensor.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DType {
    /// 32-bit float.
    F32,
    /// 32-bit signed integer.
    I32,
}

/// A concrete array fed to or returned from graph execution.
#[derive(Clone, Debug)]
pub enum HostTensor {
    /// A float array.
    F32(ArrayD<f32>),
    /// An integer array, used for gather indices.
    I32(ArrayD<i32>),
}

impl HostTensor {
    /// Element kind of the array.
    pub fn dtype(&self) -> DType {
        match self {
            HostTensor::F32(_) => DType::F32,
            HostTensor::I32(_) => DType::I32,
        }
    }

    /// Shape of the array.
    pub fn shape(&self) -> &[usize] {
        match self {
            HostTensor::F32(a) => a.shape(),
            HostTensor::I32(a) => a.shape(),
        }
    }

    /// Borrows the float array, or fails for integer tensors.
    pub fn as_f32(&self) -> Result<&ArrayD<f32>> {
        match self {
            HostTensor::F32(a) => Ok(a),
            HostTensor::I32(_) => Err(Error::DTypeMismatch("expected an f32 tensor".into())),
        }
    }

    /// Borrows the integer array, or fails for float tensors.
    pub fn as_i32(&self) -> Result<&ArrayD<i32>> {
        match self {
            HostTensor::I32(a) => Ok(a),
            HostTensor::F32(_) => Err(Error::DTypeMismatch("expected an i32 tensor".into())),
        }
    }

    /// Consumes the tensor, returning the float array.
    pub fn into_f32(self) -> Result<ArrayD<f32>> {
        match self {
            HostTensor::F32(a) => Ok(a),
            HostTensor::I32(_) => Err(Error::DTypeMismatch("expected an f32 tensor".into())),
        }
    }
}

impl From<ArrayD<f32>> for HostTensor {
    fn from(a: ArrayD<f32>) -> Self {
        HostTensor::F32(a)
    }
}

impl From<ArrayD<i32>> for HostTensor {
    fn from(a: ArrayD<i32>) -> Self {
        HostTensor::I32(a)
    }
}

/// Initial value of a session variable.
#[derive(Clone, Debug)]
pub enum Initializer {
    /// All zeros.
    Zeros,
    /// All ones.
    Ones,
    /// A constant fill value.
    Constant(f32),
    /// The identity matrix; requires a square rank-2 shape.
    Identity,
}

impl Initializer {
    pub(crate) fn materialize(&self, shape: &[usize]) -> Result<ArrayD<f32>> {
        match self {
            Initializer::Zeros => Ok(ArrayD::zeros(IxDyn(shape))),
            Initializer::Ones => Ok(ArrayD::from_elem(IxDyn(shape), 1.0)),
            Initializer::Constant(value) => Ok(ArrayD::from_elem(IxDyn(shape), *value)),
            Initializer::Identity => {
                if shape.len() != 2 || shape[0] != shape[1] {
                    return Err(Error::ShapeMismatch(format!(
                        "identity initializer needs a square matrix, got {shape:?}"
                    )));
                }
                let mut eye = ArrayD::zeros(IxDyn(shape));
                for i in 0..shape[0] {
                    eye[[i, i]] = 1.0;
                }
                Ok(eye)
            }
        }
    }
}

pub(crate) struct Node {
    pub op: Op,
    pub shape: Vec<usize>,
    pub dtype: DType,
}

pub(crate) enum Op {
    Placeholder,
    Variable {
        name: String,
        placement: Placement,
        init: Initializer,
    },
    Cast {
        input: usize,
        target: Placement,
        grad: Option<Placement>,
    },
    MatMul {
        lhs: usize,
        rhs: usize,
    },
    Relu {
        input: usize,
    },
    ReduceSum {
        input: usize,
        axes: Vec<usize>,
        keepdims: bool,
    },
    Gather {
        input: usize,
        indices: usize,
    },
    Slice {
        input: usize,
        begin: Vec<usize>,
        size: Vec<usize>,
    },
    Reshape {
        input: usize,
    },
}
