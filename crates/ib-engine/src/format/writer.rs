use std::fs;
use std::path::Path;

use ib_tensor::{DataType, DeclaredShape, Dim};

use crate::error::Result;
use crate::registry::{TensorDescriptor, TensorDirection};

use super::header::{EngineHeader, ENGINE_PAYLOAD_ALIGNMENT, ENGINE_VERSION};
use super::tensor_table::write_tensor_entry;

/// Serializes engine files in the layout `EngineFile::open` reads.
///
/// Used by tooling that packages compiled graphs, and by tests.
#[derive(Debug, Clone)]
pub struct EngineWriter {
    kernel: String,
    tensors: Vec<TensorDescriptor>,
    payload: Vec<u8>,
}

impl EngineWriter {
    /// Start an engine executed by the kernel registered as `kernel`.
    pub fn new(kernel: impl Into<String>) -> Self {
        EngineWriter {
            kernel: kernel.into(),
            tensors: Vec::new(),
            payload: Vec::new(),
        }
    }

    /// Append an input tensor.
    pub fn input(self, name: &str, dtype: DataType, dims: Vec<Dim>) -> Result<Self> {
        self.tensor(name, TensorDirection::Input, dtype, dims)
    }

    /// Append an output tensor.
    pub fn output(self, name: &str, dtype: DataType, dims: Vec<Dim>) -> Result<Self> {
        self.tensor(name, TensorDirection::Output, dtype, dims)
    }

    /// Append a tensor; the file keeps tensors in the order they are added.
    pub fn tensor(
        mut self,
        name: &str,
        direction: TensorDirection,
        dtype: DataType,
        dims: Vec<Dim>,
    ) -> Result<Self> {
        self.tensors.push(TensorDescriptor {
            name: name.to_string(),
            direction,
            dtype,
            shape: DeclaredShape::new(dims)?,
        });
        Ok(self)
    }

    /// Set the opaque payload handed to the kernel at execution time.
    pub fn payload(mut self, payload: Vec<u8>) -> Self {
        self.payload = payload;
        self
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        EngineHeader {
            version: ENGINE_VERSION,
            n_tensors: self.tensors.len() as u32,
            kernel: self.kernel.clone(),
        }
        .write(&mut out)?;
        for tensor in &self.tensors {
            write_tensor_entry(&mut out, tensor)?;
        }
        out.extend_from_slice(&(self.payload.len() as u64).to_le_bytes());

        let aligned = (out.len() + ENGINE_PAYLOAD_ALIGNMENT - 1) & !(ENGINE_PAYLOAD_ALIGNMENT - 1);
        out.resize(aligned, 0);
        out.extend_from_slice(&self.payload);
        Ok(out)
    }

    pub fn write_to(&self, path: &Path) -> Result<()> {
        fs::write(path, self.to_bytes()?)?;
        Ok(())
    }
}
