use ib_engine::{InferenceBackend, InferenceOutput};
use ib_tensor::TensorElement;

use crate::types::IBElementType;

/// Opaque handle owning one inference backend.
pub struct IBBackend {
    pub(crate) inner: Box<dyn InferenceBackend>,
}

impl IBBackend {
    pub fn new(inner: Box<dyn InferenceBackend>) -> Self {
        Self { inner }
    }
}

/// Opaque handle holding the decoded outputs of one `ib_backend_infer` call.
pub struct IBInferResult {
    pub(crate) output: InferenceOutput,
}

impl IBInferResult {
    pub fn new(output: InferenceOutput) -> Self {
        Self { output }
    }

    /// Element type of output `index`; every element of one output shares it.
    pub fn element_type(&self, index: usize) -> Option<IBElementType> {
        let values = self.output.outputs.get(index)?;
        Some(match values.first() {
            Some(TensorElement::I32(_)) => IBElementType::I32,
            Some(TensorElement::I64(_)) => IBElementType::I64,
            Some(TensorElement::F32(_)) | None => IBElementType::F32,
        })
    }
}
