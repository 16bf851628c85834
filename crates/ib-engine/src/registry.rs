//! Static metadata for every I/O tensor of a compiled graph.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use ib_tensor::{DataType, DeclaredShape, ElementType};

use crate::error::{EngineError, Result};

/// Whether the graph reads or writes a tensor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TensorDirection {
    Input,
    Output,
}

/// Name, direction, declared shape and element type of one graph tensor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TensorDescriptor {
    pub name: String,
    pub direction: TensorDirection,
    pub dtype: DataType,
    pub shape: DeclaredShape,
}

impl TensorDescriptor {
    pub fn is_input(&self) -> bool {
        self.direction == TensorDirection::Input
    }

    /// The element type buffers of this tensor are marshalled as.
    ///
    /// Fails with `UnsupportedDType` for declared types the backend cannot serve.
    pub fn element_type(&self) -> Result<ElementType> {
        ElementType::try_from(self.dtype).map_err(|_| EngineError::UnsupportedDType {
            tensor: self.name.clone(),
            dtype: self.dtype.to_string(),
        })
    }
}

/// Tensor descriptors in binding order: every input in the graph's native
/// order, followed by every output in native order.
///
/// The position of a descriptor here is its ordinal, which also indexes the
/// device buffer array and the execution context's shape table.
#[derive(Debug, Clone)]
pub struct TensorRegistry {
    tensors: Vec<TensorDescriptor>,
    num_inputs: usize,
}

impl TensorRegistry {
    /// Classify tensors read from an artifact (in file order).
    pub fn new(file_order: Vec<TensorDescriptor>) -> Result<Self> {
        let mut seen = HashSet::new();
        for t in &file_order {
            if !seen.insert(t.name.as_str()) {
                return Err(EngineError::GraphLoad(format!(
                    "duplicate tensor name '{}'",
                    t.name
                )));
            }
        }

        let (inputs, outputs): (Vec<_>, Vec<_>) =
            file_order.into_iter().partition(TensorDescriptor::is_input);
        if outputs.is_empty() {
            return Err(EngineError::GraphLoad(
                "graph declares no output tensors".to_string(),
            ));
        }

        let num_inputs = inputs.len();
        let mut tensors = inputs;
        tensors.extend(outputs);
        Ok(TensorRegistry {
            tensors,
            num_inputs,
        })
    }

    /// Every tensor, inputs first.
    pub fn enumerate(&self) -> &[TensorDescriptor] {
        &self.tensors
    }

    pub fn inputs(&self) -> &[TensorDescriptor] {
        &self.tensors[..self.num_inputs]
    }

    pub fn outputs(&self) -> &[TensorDescriptor] {
        &self.tensors[self.num_inputs..]
    }

    pub fn num_inputs(&self) -> usize {
        self.num_inputs
    }

    pub fn num_outputs(&self) -> usize {
        self.tensors.len() - self.num_inputs
    }

    pub fn len(&self) -> usize {
        self.tensors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tensors.is_empty()
    }

    pub fn get(&self, ordinal: usize) -> Option<&TensorDescriptor> {
        self.tensors.get(ordinal)
    }

    /// Ordinal of the tensor called `name`.
    pub fn ordinal(&self, name: &str) -> Option<usize> {
        self.tensors.iter().position(|t| t.name == name)
    }

    /// True if any input declares a dynamic axis.
    pub fn has_dynamic_inputs(&self) -> bool {
        self.inputs().iter().any(|t| t.shape.is_dynamic())
    }
}
