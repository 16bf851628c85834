use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{Result, TensorError};

/// One declared dimension: a fixed size or a named dynamic axis.
///
/// Dynamic axes sharing a symbol are the same size, which is how an output
/// axis is tied to an input axis (e.g. `batch`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Dim {
    Fixed(usize),
    Dynamic(String),
}

impl Dim {
    pub fn is_dynamic(&self) -> bool {
        matches!(self, Dim::Dynamic(_))
    }

    /// Returns the fixed size, or `None` for a dynamic axis.
    pub fn fixed(&self) -> Option<usize> {
        match self {
            Dim::Fixed(n) => Some(*n),
            Dim::Dynamic(_) => None,
        }
    }

    /// Engine-style encoding: the size, or -1 for a dynamic axis.
    pub fn as_i64(&self) -> i64 {
        match self {
            Dim::Fixed(n) => *n as i64,
            Dim::Dynamic(_) => -1,
        }
    }
}

impl fmt::Display for Dim {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Dim::Fixed(n) => write!(f, "{}", n),
            Dim::Dynamic(sym) => write!(f, "{}", sym),
        }
    }
}

/// The shape a compiled graph declares for a tensor, possibly with dynamic axes.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DeclaredShape {
    dims: Vec<Dim>,
}

impl DeclaredShape {
    /// Create a declared shape, rejecting zero-sized fixed dimensions.
    pub fn new(dims: Vec<Dim>) -> Result<Self> {
        if let Some(axis) = dims.iter().position(|d| d.fixed() == Some(0)) {
            return Err(TensorError::InvalidDimension { axis, value: 0 });
        }
        Ok(DeclaredShape { dims })
    }

    /// Declared shape with only fixed dimensions.
    pub fn fixed(dims: &[usize]) -> Result<Self> {
        Self::new(dims.iter().map(|&d| Dim::Fixed(d)).collect())
    }

    /// Number of dimensions (rank).
    pub fn ndim(&self) -> usize {
        self.dims.len()
    }

    pub fn dims(&self) -> &[Dim] {
        &self.dims
    }

    /// True if any axis is dynamic.
    pub fn is_dynamic(&self) -> bool {
        self.dims.iter().any(Dim::is_dynamic)
    }

    /// Engine-style encoding with -1 for every dynamic axis.
    pub fn to_i64_vec(&self) -> Vec<i64> {
        self.dims.iter().map(Dim::as_i64).collect()
    }

    /// The concrete shape, if no axis is dynamic.
    pub fn to_static(&self) -> Option<Shape> {
        self.dims
            .iter()
            .map(Dim::fixed)
            .collect::<Option<Vec<_>>>()
            .map(Shape::new)
    }

    /// Checks that `shape` has this rank and agrees on every fixed axis.
    pub fn check(&self, shape: &Shape) -> Result<()> {
        let compatible = shape.ndim() == self.ndim()
            && self
                .dims
                .iter()
                .zip(shape.dims())
                .all(|(declared, &got)| declared.fixed().map_or(true, |n| n == got));
        if compatible {
            Ok(())
        } else {
            Err(TensorError::ShapeMismatch {
                expected: self.to_i64_vec(),
                got: shape.to_i64_vec(),
            })
        }
    }
}

impl fmt::Display for DeclaredShape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[")?;
        for (i, d) in self.dims.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}", d)?;
        }
        write!(f, "]")
    }
}

/// A concrete tensor shape, wrapping a vector of dimension sizes.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Shape {
    dims: Vec<usize>,
}

impl Shape {
    /// Create a new shape from a vector of dimensions.
    pub fn new(dims: Vec<usize>) -> Self {
        Shape { dims }
    }

    /// Create a shape from a slice of dimensions.
    pub fn from_slice(dims: &[usize]) -> Self {
        Shape {
            dims: dims.to_vec(),
        }
    }

    /// Create a shape from caller-supplied signed sizes.
    ///
    /// Every dimension must be strictly positive; zero and negative
    /// (unresolved) sizes are rejected rather than defaulted.
    pub fn from_i64(dims: &[i64]) -> Result<Self> {
        let mut out = Vec::with_capacity(dims.len());
        for (axis, &value) in dims.iter().enumerate() {
            if value <= 0 {
                return Err(TensorError::InvalidDimension { axis, value });
            }
            out.push(value as usize);
        }
        Ok(Shape { dims: out })
    }

    /// Number of dimensions (rank).
    pub fn ndim(&self) -> usize {
        self.dims.len()
    }

    /// Total number of elements (product of all dimension sizes).
    pub fn numel(&self) -> usize {
        self.dims.iter().product()
    }

    /// Element count with overflow detection.
    pub fn checked_numel(&self) -> Option<usize> {
        self.dims
            .iter()
            .try_fold(1usize, |acc, &d| acc.checked_mul(d))
    }

    /// Returns the size of dimension `i`.
    ///
    /// # Panics
    /// Panics if `i >= ndim()`.
    pub fn dim(&self, i: usize) -> usize {
        self.dims[i]
    }

    /// Returns a reference to the underlying dimension sizes.
    pub fn dims(&self) -> &[usize] {
        &self.dims
    }

    pub fn to_i64_vec(&self) -> Vec<i64> {
        self.dims.iter().map(|&d| d as i64).collect()
    }
}

impl fmt::Display for Shape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[")?;
        for (i, d) in self.dims.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}", d)?;
        }
        write!(f, "]")
    }
}

impl From<Vec<usize>> for Shape {
    fn from(dims: Vec<usize>) -> Self {
        Shape::new(dims)
    }
}

impl From<&[usize]> for Shape {
    fn from(dims: &[usize]) -> Self {
        Shape::from_slice(dims)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn image_input() -> DeclaredShape {
        DeclaredShape::new(vec![
            Dim::Dynamic("batch".to_string()),
            Dim::Fixed(3),
            Dim::Fixed(224),
            Dim::Fixed(224),
        ])
        .unwrap()
    }

    #[test]
    fn test_basic_shape() {
        let s = Shape::new(vec![2, 3, 4]);
        assert_eq!(s.ndim(), 3);
        assert_eq!(s.numel(), 24);
        assert_eq!(s.dim(0), 2);
        assert_eq!(s.to_string(), "[2, 3, 4]");
    }

    #[test]
    fn test_scalar_shape() {
        let s = Shape::new(vec![]);
        assert_eq!(s.ndim(), 0);
        assert_eq!(s.numel(), 1); // product of empty = 1
    }

    #[test]
    fn test_from_i64_rejects_unresolved() {
        assert_eq!(Shape::from_i64(&[1, 3, 224]).unwrap().dims(), &[1, 3, 224]);
        assert!(matches!(
            Shape::from_i64(&[1, 0, 4]),
            Err(TensorError::InvalidDimension { axis: 1, value: 0 })
        ));
        assert!(matches!(
            Shape::from_i64(&[-1, 4]),
            Err(TensorError::InvalidDimension { axis: 0, value: -1 })
        ));
    }

    #[test]
    fn test_checked_numel_overflow() {
        let s = Shape::new(vec![usize::MAX, 2]);
        assert!(s.checked_numel().is_none());
    }

    #[test]
    fn test_declared_dynamic() {
        let d = image_input();
        assert!(d.is_dynamic());
        assert_eq!(d.to_i64_vec(), vec![-1, 3, 224, 224]);
        assert!(d.to_static().is_none());
        assert_eq!(d.to_string(), "[batch, 3, 224, 224]");

        let f = DeclaredShape::fixed(&[1, 1000]).unwrap();
        assert!(!f.is_dynamic());
        assert_eq!(f.to_static().unwrap().dims(), &[1, 1000]);
    }

    #[test]
    fn test_declared_rejects_zero() {
        assert!(DeclaredShape::fixed(&[1, 0]).is_err());
    }

    #[test]
    fn test_declared_check() {
        let d = image_input();
        assert!(d.check(&Shape::new(vec![4, 3, 224, 224])).is_ok());
        assert!(d.check(&Shape::new(vec![4, 3, 256, 256])).is_err());
        assert!(d.check(&Shape::new(vec![3, 224, 224])).is_err());
    }
}
