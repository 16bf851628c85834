//! `ib-tensor` - element types, shapes and host tensor values for inference-backends.
//!
//! This crate provides:
//! - `DataType`, every element type an engine artifact may declare, and
//!   `ElementType`, the closed subset a backend can allocate and marshal
//! - `DeclaredShape` (with named dynamic axes) and the concrete `Shape`
//! - `TensorElement`, the host-side value representation of outputs, plus
//!   little-endian byte decoding/encoding for every supported element type

pub mod dtype;
pub mod element;
pub mod error;
pub mod shape;

// Re-export primary types at the crate root for convenience.
pub use dtype::{DataType, ElementType};
pub use element::TensorElement;
pub use error::{Result, TensorError};
pub use shape::{DeclaredShape, Dim, Shape};
