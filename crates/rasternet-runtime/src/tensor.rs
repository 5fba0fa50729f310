//! User-facing tensor type for host/GPU data interchange.

use crate::error::{Result, RuntimeError};
use bytemuck::Pod;
use rasternet_core::{DataType, TensorData, TensorDescriptor, TensorValue};
use serde_json::Value;

/// Element types a [`Tensor`] can hold.
pub trait Element: Pod {
    const DTYPE: DataType;
}

impl Element for f32 {
    const DTYPE: DataType = DataType::Float32;
}

impl Element for i32 {
    const DTYPE: DataType = DataType::Int32;
}

/// Host tensor for inputs and outputs: flat little-endian values plus the
/// shape they came from.
#[derive(Debug, Clone, PartialEq)]
pub struct Tensor {
    data: Vec<u8>,
    shape: Vec<usize>,
    dtype: DataType,
}

impl Tensor {
    /// Create a tensor from a vector with a given shape.
    ///
    /// # Example
    /// ```
    /// # use rasternet_runtime::Tensor;
    /// let tensor = Tensor::from_vec(vec![1.0f32, 2.0, 3.0, 4.0], &[2, 2]).unwrap();
    /// assert_eq!(tensor.shape(), &[2, 2]);
    /// ```
    ///
    /// # Errors
    /// Returns `TensorError` if `data` does not fill `shape`.
    pub fn from_vec<T: Element>(data: Vec<T>, shape: &[usize]) -> Result<Self> {
        let expected: usize = shape.iter().product();
        if data.len() != expected {
            return Err(RuntimeError::TensorError(format!(
                "data length {} doesn't match shape {shape:?} (expected {expected})",
                data.len()
            )));
        }
        Ok(Self {
            data: bytemuck::cast_slice(&data).to_vec(),
            shape: shape.to_vec(),
            dtype: T::DTYPE,
        })
    }

    /// Rebuild an output read back from a float texture as the type its
    /// descriptor declares. Int32 values are rounded; bool outputs stay
    /// float32 (`0.0`/`1.0`).
    ///
    /// # Errors
    /// Returns `TensorError` if `values` does not fill the descriptor's shape
    /// or the descriptor holds strings.
    pub fn from_readback(values: Vec<f32>, desc: &TensorDescriptor) -> Result<Self> {
        match desc.dtype {
            DataType::Int32 => Self::from_vec(
                values.into_iter().map(|v| v.round() as i32).collect(),
                &desc.shape,
            ),
            DataType::Float32 | DataType::Bool => Self::from_vec(values, &desc.shape),
            DataType::String => Err(RuntimeError::TensorError(
                "string tensors cannot be read back from the GPU".to_string(),
            )),
        }
    }

    /// Copy a decoded tensor value.
    ///
    /// # Errors
    /// Returns `TensorError` for bool and string values.
    pub fn from_value(value: &TensorValue) -> Result<Self> {
        match value.data() {
            TensorData::F32(v) => Self::from_vec(v.clone(), value.shape()),
            TensorData::I32(v) => Self::from_vec(v.clone(), value.shape()),
            _ => Err(RuntimeError::TensorError(format!(
                "{} tensors cannot be exchanged with the GPU",
                value.dtype()
            ))),
        }
    }

    /// Build a float tensor from nested JSON arrays; the nesting gives the
    /// shape and must be rectangular.
    ///
    /// # Errors
    /// Returns `TensorError` for ragged arrays and non-numeric leaves.
    pub fn from_nested(value: &Value) -> Result<Self> {
        let mut shape = Vec::new();
        let mut cursor = value;
        while let Value::Array(items) = cursor {
            shape.push(items.len());
            match items.first() {
                Some(first) => cursor = first,
                None => break,
            }
        }

        let mut values = Vec::with_capacity(shape.iter().product());
        flatten(value, &shape, &mut values)?;
        Self::from_vec(values, &shape)
    }

    /// Convert to a decoded tensor value named `name`.
    pub fn to_value(&self, name: &str) -> Result<TensorValue> {
        let data = match self.dtype {
            DataType::Float32 => TensorData::F32(self.to_vec::<f32>()?),
            DataType::Int32 => TensorData::I32(self.to_vec::<i32>()?),
            other => {
                return Err(RuntimeError::TensorError(format!(
                    "tensor '{name}' has unsupported dtype {other}"
                )));
            }
        };
        Ok(TensorValue::new(name, self.shape.clone(), data)?)
    }

    /// Copy the values out as `T`.
    ///
    /// # Errors
    /// Returns `TensorError` if `T` is not the tensor's element type.
    pub fn to_vec<T: Element>(&self) -> Result<Vec<T>> {
        if T::DTYPE != self.dtype {
            return Err(RuntimeError::TensorError(format!(
                "tensor holds {}, requested {}",
                self.dtype,
                T::DTYPE
            )));
        }
        Ok(bytemuck::pod_collect_to_vec(&self.data))
    }

    /// Values as `f32`, converting integer tensors.
    pub fn to_f32_vec(&self) -> Result<Vec<f32>> {
        match self.dtype {
            DataType::Int32 => Ok(self.to_vec::<i32>()?.into_iter().map(|v| v as f32).collect()),
            _ => self.to_vec::<f32>(),
        }
    }

    /// Rebuild nested JSON arrays following the tensor's shape. A scalar
    /// becomes a bare number.
    pub fn to_nested(&self) -> Result<Value> {
        let values: Vec<Value> = match self.dtype {
            DataType::Int32 => self.to_vec::<i32>()?.into_iter().map(Value::from).collect(),
            _ => self
                .to_vec::<f32>()?
                .into_iter()
                .map(|v| Value::from(f64::from(v)))
                .collect(),
        };
        Ok(nest(&values, &self.shape))
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn dtype(&self) -> DataType {
        self.dtype
    }

    pub fn len(&self) -> usize {
        self.shape.iter().product()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn nest(values: &[Value], shape: &[usize]) -> Value {
    match shape {
        [] => values.first().cloned().unwrap_or(Value::Null),
        [_] => Value::Array(values.to_vec()),
        [_, rest @ ..] => {
            let stride: usize = rest.iter().product();
            if stride == 0 {
                return Value::Array(Vec::new());
            }
            Value::Array(values.chunks(stride).map(|chunk| nest(chunk, rest)).collect())
        }
    }
}

fn flatten(value: &Value, shape: &[usize], out: &mut Vec<f32>) -> Result<()> {
    match (value, shape) {
        (Value::Number(n), []) => {
            let v = n
                .as_f64()
                .ok_or_else(|| RuntimeError::TensorError(format!("{n} is not a float")))?;
            out.push(v as f32);
            Ok(())
        }
        (Value::Array(items), [len, rest @ ..]) if items.len() == *len => {
            items.iter().try_for_each(|item| flatten(item, rest, out))
        }
        (Value::Array(items), [len, ..]) => Err(RuntimeError::TensorError(format!(
            "ragged array: expected {len} elements, found {}",
            items.len()
        ))),
        (other, _) => Err(RuntimeError::TensorError(format!(
            "expected a number or an array, found {other}"
        ))),
    }
}
