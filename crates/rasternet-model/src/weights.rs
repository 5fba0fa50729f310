//! Weight manifest entries and the flat little-endian weight codec.
//!
//! Weights are stored back to back in manifest order. Per entry:
//! - `float32`/`int32`: 4 bytes per element
//! - `bool`: 1 byte per element
//! - `string`: per element, a `u32` byte length followed by UTF-8 bytes
//! - quantized `uint8`/`uint16`: 1 or 2 bytes per element, dequantized as
//!   `raw * scale + min`
//! - quantized `float16`: 2 bytes per element, widened to `f32`

use crate::tensor::{DataType, NamedTensorMap, TensorData, TensorValue};
use crate::{ModelError, Result};
use half::f16;
use serde::{Deserialize, Serialize};

/// Storage type of a quantized weight.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QuantizationDtype {
    Uint8,
    Uint16,
    Float16,
}

impl QuantizationDtype {
    pub fn byte_size(&self) -> usize {
        match self {
            QuantizationDtype::Uint8 => 1,
            QuantizationDtype::Uint16 | QuantizationDtype::Float16 => 2,
        }
    }

    fn max_raw(&self) -> f32 {
        match self {
            QuantizationDtype::Uint8 => u8::MAX as f32,
            QuantizationDtype::Uint16 => u16::MAX as f32,
            QuantizationDtype::Float16 => 0.0,
        }
    }
}

/// Quantization descriptor of a manifest entry.
///
/// `scale` and `min` are required for the affine integer formats and ignored
/// for `float16`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Quantization {
    pub dtype: QuantizationDtype,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scale: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min: Option<f32>,
}

/// Manifest metadata for one weight tensor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WeightEntry {
    pub name: String,
    pub dtype: DataType,
    pub shape: Vec<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quantization: Option<Quantization>,
}

impl WeightEntry {
    pub fn element_count(&self) -> usize {
        self.shape.iter().product()
    }
}

/// A group of weights sharing one set of shard files.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WeightGroup {
    /// Shard files, relative to the model description, concatenated in order.
    pub paths: Vec<String>,
    pub weights: Vec<WeightEntry>,
}

/// Little-endian cursor over the weight buffer.
struct ByteReader<'a> {
    buf: &'a [u8],
    offset: usize,
}

impl<'a> ByteReader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, offset: 0 }
    }

    fn remaining(&self) -> usize {
        self.buf.len() - self.offset
    }

    fn take(&mut self, name: &str, len: usize) -> Result<&'a [u8]> {
        if len > self.remaining() {
            return Err(ModelError::TruncatedWeights {
                name: name.to_string(),
                needed: len,
                available: self.remaining(),
            });
        }
        let bytes = &self.buf[self.offset..self.offset + len];
        self.offset += len;
        Ok(bytes)
    }
}

/// Decode every manifest entry from a concatenated weight buffer.
///
/// Entries are read in manifest order. Any malformed entry aborts the whole
/// decode.
///
/// # Errors
/// Returns an error for truncated buffers, missing quantization parameters,
/// quantized strings/bools, or `float16` on non-float weights.
#[tracing::instrument(skip_all, fields(bytes = buffer.len()))]
pub fn decode_weights<'a>(
    buffer: &[u8],
    specs: impl IntoIterator<Item = &'a WeightEntry>,
) -> Result<NamedTensorMap> {
    let mut reader = ByteReader::new(buffer);
    let mut weights = NamedTensorMap::new();

    for spec in specs {
        let value = decode_entry(&mut reader, spec)?;
        tracing::trace!(name = %spec.name, shape = ?spec.shape, "decoded weight");
        weights.insert(spec.name.clone(), value);
    }

    if reader.remaining() > 0 {
        tracing::warn!(
            trailing = reader.remaining(),
            "weight buffer has bytes past the last manifest entry"
        );
    }

    Ok(weights)
}

fn decode_entry(reader: &mut ByteReader<'_>, spec: &WeightEntry) -> Result<TensorValue> {
    let count = spec.element_count();

    let data = match spec.quantization {
        Some(quant) => decode_quantized(reader, spec, quant, count)?,
        None => decode_raw(reader, spec, count)?,
    };

    TensorValue::new(&spec.name, spec.shape.clone(), data)
}

fn decode_raw(reader: &mut ByteReader<'_>, spec: &WeightEntry, count: usize) -> Result<TensorData> {
    let name = spec.name.as_str();
    Ok(match spec.dtype {
        DataType::Float32 => TensorData::F32(
            reader
                .take(name, count * 4)?
                .chunks_exact(4)
                .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
                .collect(),
        ),
        DataType::Int32 => TensorData::I32(
            reader
                .take(name, count * 4)?
                .chunks_exact(4)
                .map(|b| i32::from_le_bytes([b[0], b[1], b[2], b[3]]))
                .collect(),
        ),
        DataType::Bool => {
            TensorData::Bool(reader.take(name, count)?.iter().map(|&b| b != 0).collect())
        }
        DataType::String => {
            let mut values = Vec::with_capacity(count);
            for _ in 0..count {
                let len = reader.take(name, 4)?;
                let len = u32::from_le_bytes([len[0], len[1], len[2], len[3]]) as usize;
                let bytes = reader.take(name, len)?;
                let text = std::str::from_utf8(bytes).map_err(|e| {
                    ModelError::InvalidModel(format!("string weight '{name}' is not UTF-8: {e}"))
                })?;
                values.push(text.to_string());
            }
            TensorData::Str(values)
        }
    })
}

fn decode_quantized(
    reader: &mut ByteReader<'_>,
    spec: &WeightEntry,
    quant: Quantization,
    count: usize,
) -> Result<TensorData> {
    let name = spec.name.as_str();
    let quant_error = |reason: String| ModelError::Quantization {
        name: name.to_string(),
        reason,
    };

    if !matches!(spec.dtype, DataType::Float32 | DataType::Int32) {
        return Err(quant_error(format!(
            "{} weights cannot be quantized",
            spec.dtype
        )));
    }

    let bytes = reader.take(name, count * quant.dtype.byte_size())?;

    if quant.dtype == QuantizationDtype::Float16 {
        if spec.dtype != DataType::Float32 {
            return Err(quant_error(format!(
                "float16 quantization requires float32 weights, got {}",
                spec.dtype
            )));
        }
        return Ok(TensorData::F32(
            bytes
                .chunks_exact(2)
                .map(|b| f16::from_le_bytes([b[0], b[1]]).to_f32())
                .collect(),
        ));
    }

    let (Some(scale), Some(min)) = (quant.scale, quant.min) else {
        return Err(quant_error(format!(
            "{:?} quantization requires both scale and min",
            quant.dtype
        )));
    };

    let raw: Vec<f32> = match quant.dtype {
        QuantizationDtype::Uint8 => bytes.iter().map(|&b| b as f32).collect(),
        _ => bytes
            .chunks_exact(2)
            .map(|b| u16::from_le_bytes([b[0], b[1]]) as f32)
            .collect(),
    };

    Ok(match spec.dtype {
        DataType::Int32 => {
            TensorData::I32(raw.iter().map(|&v| (v * scale + min).round() as i32).collect())
        }
        _ => TensorData::F32(raw.iter().map(|&v| v * scale + min).collect()),
    })
}

/// Encode named tensors into a weight buffer and its manifest entries.
///
/// Float tensors are quantized when `quantize` is set; other dtypes are
/// always stored raw. This is the inverse of [`decode_weights`] up to
/// quantization error.
///
/// # Errors
/// Returns an error if a float tensor holds non-finite values while
/// affine quantization is requested.
pub fn encode_weights(
    weights: &[(String, TensorValue)],
    quantize: Option<QuantizationDtype>,
) -> Result<(Vec<u8>, Vec<WeightEntry>)> {
    let mut buffer = Vec::new();
    let mut entries = Vec::with_capacity(weights.len());

    for (name, value) in weights {
        let mut entry = WeightEntry {
            name: name.clone(),
            dtype: value.dtype(),
            shape: value.shape().to_vec(),
            quantization: None,
        };

        match (value.data(), quantize) {
            (TensorData::F32(values), Some(QuantizationDtype::Float16)) => {
                for &v in values {
                    buffer.extend_from_slice(&f16::from_f32(v).to_le_bytes());
                }
                entry.quantization = Some(Quantization {
                    dtype: QuantizationDtype::Float16,
                    scale: None,
                    min: None,
                });
            }
            (TensorData::F32(values), Some(dtype)) => {
                entry.quantization = Some(quantize_affine(name, values, dtype, &mut buffer)?);
            }
            (TensorData::F32(values), None) => {
                for &v in values {
                    buffer.extend_from_slice(&v.to_le_bytes());
                }
            }
            (TensorData::I32(values), _) => {
                for &v in values {
                    buffer.extend_from_slice(&v.to_le_bytes());
                }
            }
            (TensorData::Bool(values), _) => {
                buffer.extend(values.iter().map(|&b| b as u8));
            }
            (TensorData::Str(values), _) => {
                for s in values {
                    buffer.extend_from_slice(&(s.len() as u32).to_le_bytes());
                    buffer.extend_from_slice(s.as_bytes());
                }
            }
        }

        entries.push(entry);
    }

    Ok((buffer, entries))
}

fn quantize_affine(
    name: &str,
    values: &[f32],
    dtype: QuantizationDtype,
    buffer: &mut Vec<u8>,
) -> Result<Quantization> {
    if values.iter().any(|v| !v.is_finite()) {
        return Err(ModelError::Quantization {
            name: name.to_string(),
            reason: "cannot quantize non-finite values".to_string(),
        });
    }

    let min = values.iter().copied().fold(f32::INFINITY, f32::min);
    let max = values.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let (min, max) = if values.is_empty() { (0.0, 0.0) } else { (min, max) };
    let range = max - min;
    let scale = if range > 0.0 { range / dtype.max_raw() } else { 1.0 };

    for &v in values {
        let raw = ((v - min) / scale).round().clamp(0.0, dtype.max_raw());
        match dtype {
            QuantizationDtype::Uint8 => buffer.push(raw as u8),
            _ => buffer.extend_from_slice(&(raw as u16).to_le_bytes()),
        }
    }

    Ok(Quantization {
        dtype,
        scale: Some(scale),
        min: Some(min),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(name: &str, dtype: DataType, shape: &[usize]) -> WeightEntry {
        WeightEntry {
            name: name.to_string(),
            dtype,
            shape: shape.to_vec(),
            quantization: None,
        }
    }

    #[test]
    fn test_decode_float32_and_int32() {
        let mut buf = Vec::new();
        for v in [1.5f32, -2.0] {
            buf.extend_from_slice(&v.to_le_bytes());
        }
        for v in [7i32, -3, 0] {
            buf.extend_from_slice(&v.to_le_bytes());
        }
        let specs = [
            entry("a", DataType::Float32, &[2]),
            entry("b", DataType::Int32, &[3]),
        ];
        let weights = decode_weights(&buf, &specs).unwrap();
        assert_eq!(weights["a"].as_f32().unwrap(), &[1.5, -2.0]);
        assert_eq!(weights["b"].data(), &TensorData::I32(vec![7, -3, 0]));
    }

    #[test]
    fn test_decode_uint8_quantized() {
        let mut spec = entry("q", DataType::Float32, &[3]);
        spec.quantization = Some(Quantization {
            dtype: QuantizationDtype::Uint8,
            scale: Some(0.5),
            min: Some(-1.0),
        });
        let weights = decode_weights(&[0, 2, 255], [&spec]).unwrap();
        assert_eq!(weights["q"].as_f32().unwrap(), &[-1.0, 0.0, 126.5]);
    }

    #[test]
    fn test_decode_uint16_to_int32_rounds() {
        let mut spec = entry("q", DataType::Int32, &[2]);
        spec.quantization = Some(Quantization {
            dtype: QuantizationDtype::Uint16,
            scale: Some(0.3),
            min: Some(0.0),
        });
        let mut buf = Vec::new();
        buf.extend_from_slice(&5u16.to_le_bytes());
        buf.extend_from_slice(&1u16.to_le_bytes());
        let weights = decode_weights(&buf, [&spec]).unwrap();
        assert_eq!(weights["q"].data(), &TensorData::I32(vec![2, 0]));
    }

    #[test]
    fn test_quantization_requires_scale_and_min() {
        let mut spec = entry("q", DataType::Float32, &[1]);
        spec.quantization = Some(Quantization {
            dtype: QuantizationDtype::Uint8,
            scale: Some(1.0),
            min: None,
        });
        let err = decode_weights(&[1], [&spec]).unwrap_err();
        assert!(matches!(err, ModelError::Quantization { .. }));
    }

    #[test]
    fn test_float16_requires_float32() {
        let mut spec = entry("q", DataType::Int32, &[1]);
        spec.quantization = Some(Quantization {
            dtype: QuantizationDtype::Float16,
            scale: None,
            min: None,
        });
        let err = decode_weights(&[0, 0], [&spec]).unwrap_err();
        assert!(matches!(err, ModelError::Quantization { .. }));
    }

    #[test]
    fn test_unknown_dtype_rejected_at_parse() {
        let result: std::result::Result<WeightEntry, _> =
            serde_json::from_str(r#"{"name": "w", "dtype": "complex64", "shape": [1]}"#);
        assert!(result.is_err());
    }

    #[test]
    fn test_decode_strings() {
        let mut buf = Vec::new();
        for s in ["ab", "", "xyz"] {
            buf.extend_from_slice(&(s.len() as u32).to_le_bytes());
            buf.extend_from_slice(s.as_bytes());
        }
        let weights = decode_weights(&buf, [&entry("s", DataType::String, &[3])]).unwrap();
        assert_eq!(
            weights["s"].data(),
            &TensorData::Str(vec!["ab".into(), "".into(), "xyz".into()])
        );
    }

    #[test]
    fn test_truncated_buffer() {
        let err = decode_weights(&[0; 6], [&entry("w", DataType::Float32, &[2])]).unwrap_err();
        assert!(matches!(
            err,
            ModelError::TruncatedWeights {
                needed: 8,
                available: 6,
                ..
            }
        ));
    }

    #[test]
    fn test_encode_decode_exact_for_raw() {
        let weights = vec![
            (
                "f".to_string(),
                TensorValue::from_f32(&[2, 2], vec![0.1, -7.25, 3.0, 1e-7]),
            ),
            (
                "i".to_string(),
                TensorValue::new("i", [3], TensorData::I32(vec![i32::MIN, 0, 42])).unwrap(),
            ),
        ];
        let (buf, specs) = encode_weights(&weights, None).unwrap();
        let decoded = decode_weights(&buf, &specs).unwrap();
        for (name, value) in &weights {
            assert_eq!(&decoded[name], value);
        }
    }

    #[test]
    fn test_encode_decode_within_quantization_error() {
        let values: Vec<f32> = (0..64).map(|i| (i as f32 * 0.37).sin() * 4.0).collect();
        let weights = vec![("w".to_string(), TensorValue::from_f32(&[64], values.clone()))];

        for dtype in [QuantizationDtype::Uint8, QuantizationDtype::Uint16] {
            let (buf, specs) = encode_weights(&weights, Some(dtype)).unwrap();
            let scale = specs[0].quantization.unwrap().scale.unwrap();
            let decoded = decode_weights(&buf, &specs).unwrap();
            for (a, b) in values.iter().zip(decoded["w"].as_f32().unwrap()) {
                assert!((a - b).abs() <= scale / 2.0 + 1e-5, "{dtype:?}: {a} vs {b}");
            }
        }

        let (buf, specs) = encode_weights(&weights, Some(QuantizationDtype::Float16)).unwrap();
        let decoded = decode_weights(&buf, &specs).unwrap();
        for (a, b) in values.iter().zip(decoded["w"].as_f32().unwrap()) {
            assert!((a - b).abs() <= 4.0 * 1e-3, "float16: {a} vs {b}");
        }
    }
}
