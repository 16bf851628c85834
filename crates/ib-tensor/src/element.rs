use half::f16;
use serde::{Deserialize, Serialize};

use crate::dtype::ElementType;
use crate::error::{Result, TensorError};

/// Host-side value of one output element.
///
/// Half-precision device values are widened to `F32` when decoded, so there
/// is no `F16` variant.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum TensorElement {
    F32(f32),
    I32(i32),
    I64(i64),
}

impl TensorElement {
    pub fn as_f32(&self) -> Option<f32> {
        match self {
            TensorElement::F32(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_i32(&self) -> Option<i32> {
        match self {
            TensorElement::I32(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            TensorElement::I64(v) => Some(*v),
            _ => None,
        }
    }

    /// Lossy numeric view used for logging and comparisons.
    pub fn to_f64(&self) -> f64 {
        match self {
            TensorElement::F32(v) => *v as f64,
            TensorElement::I32(v) => *v as f64,
            TensorElement::I64(v) => *v as f64,
        }
    }
}

impl From<f32> for TensorElement {
    fn from(v: f32) -> Self {
        TensorElement::F32(v)
    }
}

impl From<i32> for TensorElement {
    fn from(v: i32) -> Self {
        TensorElement::I32(v)
    }
}

impl From<i64> for TensorElement {
    fn from(v: i64) -> Self {
        TensorElement::I64(v)
    }
}

/// Decode raw little-endian device bytes into host elements.
///
/// `f32`, `i32` and `i64` pass through; `f16` is widened to `f32`.
pub fn decode(elem: ElementType, bytes: &[u8]) -> Result<Vec<TensorElement>> {
    let size = elem.size_in_bytes();
    if bytes.len() % size != 0 {
        return Err(TensorError::ByteLength {
            len: bytes.len(),
            elem_size: size,
            dtype: elem.to_string(),
        });
    }

    let chunks = bytes.chunks_exact(size);
    let out = match elem {
        ElementType::F32 => chunks
            .map(|c| TensorElement::F32(f32::from_le_bytes([c[0], c[1], c[2], c[3]])))
            .collect(),
        ElementType::F16 => chunks
            .map(|c| TensorElement::F32(f16::from_le_bytes([c[0], c[1]]).to_f32()))
            .collect(),
        ElementType::I32 => chunks
            .map(|c| TensorElement::I32(i32::from_le_bytes([c[0], c[1], c[2], c[3]])))
            .collect(),
        ElementType::I64 => chunks
            .map(|c| {
                let mut buf = [0u8; 8];
                buf.copy_from_slice(c);
                TensorElement::I64(i64::from_le_bytes(buf))
            })
            .collect(),
    };
    Ok(out)
}

/// Encode f32 values as little-endian bytes.
pub fn encode_f32(values: &[f32]) -> Vec<u8> {
    values.iter().flat_map(|v| v.to_le_bytes()).collect()
}

/// Encode f32 values as little-endian half-precision bytes (rounded to nearest).
pub fn encode_f16(values: &[f32]) -> Vec<u8> {
    values
        .iter()
        .flat_map(|&v| f16::from_f32(v).to_le_bytes())
        .collect()
}

pub fn encode_i32(values: &[i32]) -> Vec<u8> {
    values.iter().flat_map(|v| v.to_le_bytes()).collect()
}

pub fn encode_i64(values: &[i64]) -> Vec<u8> {
    values.iter().flat_map(|v| v.to_le_bytes()).collect()
}

/// Reinterpret little-endian bytes as f32 values, ignoring a trailing partial element.
pub fn f32_values(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect()
}
