use thiserror::Error;

#[derive(Error, Debug)]
pub enum TensorError {
    #[error("shape mismatch: expected {expected:?}, got {got:?}")]
    ShapeMismatch { expected: Vec<i64>, got: Vec<i64> },
    #[error("invalid dimension {value} at axis {axis}")]
    InvalidDimension { axis: usize, value: i64 },
    #[error("unsupported dtype: {0}")]
    UnsupportedDType(String),
    #[error("{len} bytes is not a whole number of {dtype} elements ({elem_size} bytes each)")]
    ByteLength {
        len: usize,
        elem_size: usize,
        dtype: String,
    },
    #[error("{0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, TensorError>;
