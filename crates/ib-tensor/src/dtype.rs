use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::TensorError;

/// Element types an engine artifact may declare for a tensor.
///
/// Not every declared type can be served: see [`ElementType`] for the subset
/// the backend allocates and marshals.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataType {
    /// 32-bit floating point.
    F32,
    /// 16-bit floating point (IEEE 754 half-precision, via the `half` crate).
    F16,
    /// Signed 8-bit integer (quantized tensors).
    I8,
    /// Signed 32-bit integer.
    I32,
    /// One byte per boolean.
    Bool,
    /// Unsigned 8-bit integer.
    U8,
    /// Signed 64-bit integer.
    I64,
}

impl DataType {
    /// Returns the size in bytes of a single element.
    pub fn size_in_bytes(&self) -> usize {
        match self {
            DataType::F32 | DataType::I32 => 4,
            DataType::F16 => 2,
            DataType::I8 | DataType::Bool | DataType::U8 => 1,
            DataType::I64 => 8,
        }
    }

    /// Converts an engine-file type ID to a `DataType`.
    ///
    /// Engine type IDs:
    /// - 0 => F32
    /// - 1 => F16
    /// - 2 => I8
    /// - 3 => I32
    /// - 4 => Bool
    /// - 5 => U8
    /// - 6 => I64
    pub fn from_engine_type(id: u32) -> Option<DataType> {
        match id {
            0 => Some(DataType::F32),
            1 => Some(DataType::F16),
            2 => Some(DataType::I8),
            3 => Some(DataType::I32),
            4 => Some(DataType::Bool),
            5 => Some(DataType::U8),
            6 => Some(DataType::I64),
            _ => None,
        }
    }

    /// Returns the engine-file type ID for this `DataType`.
    pub fn to_engine_type(&self) -> u32 {
        match self {
            DataType::F32 => 0,
            DataType::F16 => 1,
            DataType::I8 => 2,
            DataType::I32 => 3,
            DataType::Bool => 4,
            DataType::U8 => 5,
            DataType::I64 => 6,
        }
    }

    /// Returns true if buffers of this type can be allocated and marshalled.
    pub fn is_supported(&self) -> bool {
        ElementType::try_from(*self).is_ok()
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DataType::F32 => write!(f, "f32"),
            DataType::F16 => write!(f, "f16"),
            DataType::I8 => write!(f, "i8"),
            DataType::I32 => write!(f, "i32"),
            DataType::Bool => write!(f, "bool"),
            DataType::U8 => write!(f, "u8"),
            DataType::I64 => write!(f, "i64"),
        }
    }
}

/// The closed set of element types the backend can serve.
///
/// Every buffer operation matches on this enum, so adding a type forces
/// every marshalling path to handle it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ElementType {
    F32,
    F16,
    I32,
    I64,
}

impl ElementType {
    /// Size in bytes of one element: 4 (f32/i32), 2 (f16) or 8 (i64).
    pub fn size_in_bytes(&self) -> usize {
        match self {
            ElementType::F32 | ElementType::I32 => 4,
            ElementType::F16 => 2,
            ElementType::I64 => 8,
        }
    }

    /// The declared type this element type corresponds to.
    pub fn data_type(&self) -> DataType {
        match self {
            ElementType::F32 => DataType::F32,
            ElementType::F16 => DataType::F16,
            ElementType::I32 => DataType::I32,
            ElementType::I64 => DataType::I64,
        }
    }
}

impl TryFrom<DataType> for ElementType {
    type Error = TensorError;

    fn try_from(dtype: DataType) -> Result<Self, Self::Error> {
        match dtype {
            DataType::F32 => Ok(ElementType::F32),
            DataType::F16 => Ok(ElementType::F16),
            DataType::I32 => Ok(ElementType::I32),
            DataType::I64 => Ok(ElementType::I64),
            other @ (DataType::I8 | DataType::Bool | DataType::U8) => Err(
                TensorError::UnsupportedDType(format!("{} tensors cannot be marshalled", other)),
            ),
        }
    }
}

impl From<ElementType> for DataType {
    fn from(elem: ElementType) -> Self {
        elem.data_type()
    }
}

impl fmt::Display for ElementType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.data_type().fmt(f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL: [DataType; 7] = [
        DataType::F32,
        DataType::F16,
        DataType::I8,
        DataType::I32,
        DataType::Bool,
        DataType::U8,
        DataType::I64,
    ];

    #[test]
    fn test_size_in_bytes() {
        assert_eq!(DataType::F32.size_in_bytes(), 4);
        assert_eq!(DataType::F16.size_in_bytes(), 2);
        assert_eq!(DataType::I32.size_in_bytes(), 4);
        assert_eq!(DataType::I64.size_in_bytes(), 8);
        assert_eq!(DataType::U8.size_in_bytes(), 1);
    }

    #[test]
    fn test_engine_type_ids() {
        for dtype in &ALL {
            let back = DataType::from_engine_type(dtype.to_engine_type()).unwrap();
            assert_eq!(*dtype, back);
        }
        assert!(DataType::from_engine_type(999).is_none());
    }

    #[test]
    fn test_supported_subset() {
        let supported: Vec<_> = ALL.iter().filter(|d| d.is_supported()).collect();
        assert_eq!(
            supported,
            vec![&DataType::F32, &DataType::F16, &DataType::I32, &DataType::I64]
        );
    }

    #[test]
    fn test_element_size_matches_declared() {
        for dtype in ALL.iter().filter(|d| d.is_supported()) {
            let elem = ElementType::try_from(*dtype).unwrap();
            assert_eq!(elem.size_in_bytes(), dtype.size_in_bytes());
            assert_eq!(DataType::from(elem), *dtype);
        }
    }

    #[test]
    fn test_unsupported_dtype_error() {
        let err = ElementType::try_from(DataType::Bool).unwrap_err();
        assert!(matches!(err, TensorError::UnsupportedDType(_)));
        assert!(err.to_string().contains("bool"));
    }
}
