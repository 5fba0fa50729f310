//! Typed tensor values produced by the weight decoder and fed to the engine.

use crate::{ModelError, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

/// Element type of a tensor.
///
/// String tensors only ever live on the host; they are rejected before any
/// GPU layout is computed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataType {
    Float32,
    Int32,
    Bool,
    String,
}

impl DataType {
    /// Size in bytes of one element in the weight byte format.
    ///
    /// Returns `None` for strings, which are length-prefixed per element.
    pub fn byte_size(&self) -> Option<usize> {
        match self {
            DataType::Float32 | DataType::Int32 => Some(4),
            DataType::Bool => Some(1),
            DataType::String => None,
        }
    }

    /// Whether values of this type can be stored in float texels.
    pub fn is_numeric(&self) -> bool {
        !matches!(self, DataType::String)
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DataType::Float32 => "float32",
            DataType::Int32 => "int32",
            DataType::Bool => "bool",
            DataType::String => "string",
        };
        f.write_str(name)
    }
}

/// Shape and element type of a tensor. Structural equality only.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TensorDescriptor {
    pub shape: Vec<usize>,
    pub dtype: DataType,
}

impl TensorDescriptor {
    pub fn new(shape: impl Into<Vec<usize>>, dtype: DataType) -> Self {
        Self {
            shape: shape.into(),
            dtype,
        }
    }

    /// Product of all dimensions; 1 for a scalar.
    pub fn element_count(&self) -> usize {
        self.shape.iter().product()
    }

    pub fn rank(&self) -> usize {
        self.shape.len()
    }
}

/// Host-side storage for tensor elements.
#[derive(Debug, Clone, PartialEq)]
pub enum TensorData {
    F32(Vec<f32>),
    I32(Vec<i32>),
    Bool(Vec<bool>),
    Str(Vec<String>),
}

impl TensorData {
    pub fn len(&self) -> usize {
        match self {
            TensorData::F32(v) => v.len(),
            TensorData::I32(v) => v.len(),
            TensorData::Bool(v) => v.len(),
            TensorData::Str(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn dtype(&self) -> DataType {
        match self {
            TensorData::F32(_) => DataType::Float32,
            TensorData::I32(_) => DataType::Int32,
            TensorData::Bool(_) => DataType::Bool,
            TensorData::Str(_) => DataType::String,
        }
    }
}

/// A decoded tensor: descriptor plus typed values in row-major order.
#[derive(Debug, Clone, PartialEq)]
pub struct TensorValue {
    desc: TensorDescriptor,
    data: TensorData,
}

impl TensorValue {
    /// Create a tensor value, checking that the data length matches the shape.
    ///
    /// # Errors
    /// Returns `ModelError::ShapeMismatch` if the element counts disagree.
    pub fn new(name: &str, shape: impl Into<Vec<usize>>, data: TensorData) -> Result<Self> {
        let desc = TensorDescriptor::new(shape, data.dtype());
        let expected = desc.element_count();
        if data.len() != expected {
            return Err(ModelError::ShapeMismatch {
                name: name.to_string(),
                shape: desc.shape,
                expected,
                actual: data.len(),
            });
        }
        Ok(Self { desc, data })
    }

    /// Convenience constructor for float tensors in tests and tooling.
    ///
    /// # Panics
    /// Panics if `values.len()` does not match the shape.
    pub fn from_f32(shape: &[usize], values: Vec<f32>) -> Self {
        let expected: usize = shape.iter().product();
        assert_eq!(
            values.len(),
            expected,
            "Data length {} doesn't match shape {:?}",
            values.len(),
            shape
        );
        Self {
            desc: TensorDescriptor::new(shape, DataType::Float32),
            data: TensorData::F32(values),
        }
    }

    pub fn descriptor(&self) -> &TensorDescriptor {
        &self.desc
    }

    pub fn shape(&self) -> &[usize] {
        &self.desc.shape
    }

    pub fn dtype(&self) -> DataType {
        self.desc.dtype
    }

    pub fn data(&self) -> &TensorData {
        &self.data
    }

    pub fn element_count(&self) -> usize {
        self.desc.element_count()
    }

    /// Borrow the values if this is a float tensor.
    pub fn as_f32(&self) -> Option<&[f32]> {
        match &self.data {
            TensorData::F32(v) => Some(v),
            _ => None,
        }
    }

    /// Numeric values widened to `f32`, the texel element type.
    ///
    /// Returns `None` for string tensors.
    pub fn to_f32_vec(&self) -> Option<Vec<f32>> {
        match &self.data {
            TensorData::F32(v) => Some(v.clone()),
            TensorData::I32(v) => Some(v.iter().map(|&x| x as f32).collect()),
            TensorData::Bool(v) => Some(v.iter().map(|&b| if b { 1.0 } else { 0.0 }).collect()),
            TensorData::Str(_) => None,
        }
    }

    /// Same data with a different shape of equal element count.
    ///
    /// # Errors
    /// Returns `ModelError::ShapeMismatch` if the element counts disagree.
    pub fn reshaped(&self, name: &str, shape: impl Into<Vec<usize>>) -> Result<Self> {
        Self::new(name, shape, self.data.clone())
    }
}

/// Tensors keyed by node or weight name.
pub type NamedTensorMap = HashMap<String, TensorValue>;
