//! The interface every inference backend implements.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use ib_tensor::{DataType, Shape, TensorElement};

use crate::error::Result;
use crate::registry::{TensorDescriptor, TensorRegistry};

/// Name and per-sample shape of one model input or output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LayerInfo {
    pub name: String,
    /// Shape with the leading batch axis removed.
    pub shape: Vec<i64>,
    pub batch_size: usize,
    pub dtype: DataType,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelInfo {
    pub inputs: Vec<LayerInfo>,
    pub outputs: Vec<LayerInfo>,
}

impl ModelInfo {
    /// Describe a graph's tensors at their resolved shapes.
    pub fn from_registry(registry: &TensorRegistry, shapes: &[Shape], batch_size: usize) -> Self {
        let layer = |(desc, shape): (&TensorDescriptor, &Shape)| LayerInfo {
            name: desc.name.clone(),
            shape: shape.to_i64_vec().into_iter().skip(1).collect(),
            batch_size,
            dtype: desc.dtype,
        };
        let num_inputs = registry.num_inputs();
        ModelInfo {
            inputs: registry.inputs().iter().zip(shapes).map(layer).collect(),
            outputs: registry
                .outputs()
                .iter()
                .zip(shapes.iter().skip(num_inputs))
                .map(layer)
                .collect(),
        }
    }

    pub fn add_input(&mut self, name: impl Into<String>, shape: Vec<i64>, batch_size: usize, dtype: DataType) {
        self.inputs.push(LayerInfo {
            name: name.into(),
            shape,
            batch_size,
            dtype,
        });
    }

    pub fn add_output(&mut self, name: impl Into<String>, shape: Vec<i64>, batch_size: usize, dtype: DataType) {
        self.outputs.push(LayerInfo {
            name: name.into(),
            shape,
            batch_size,
            dtype,
        });
    }
}

/// Running performance counters of a backend.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct InferenceStats {
    pub total_inferences: u64,
    pub failed_inferences: u64,
    pub last_inference_time_ms: f64,
    pub total_inference_time_ms: f64,
}

impl InferenceStats {
    pub fn record_success(&mut self, elapsed: Duration) {
        let ms = elapsed.as_secs_f64() * 1000.0;
        self.total_inferences += 1;
        self.last_inference_time_ms = ms;
        self.total_inference_time_ms += ms;
    }

    pub fn record_failure(&mut self) {
        self.failed_inferences += 1;
    }

    pub fn average_inference_time_ms(&self) -> f64 {
        if self.total_inferences == 0 {
            0.0
        } else {
            self.total_inference_time_ms / self.total_inferences as f64
        }
    }
}

/// Decoded outputs of one inference call, in output order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InferenceOutput {
    pub outputs: Vec<Vec<TensorElement>>,
    /// Concrete shape of each output, batch axis included.
    pub shapes: Vec<Vec<i64>>,
}

impl InferenceOutput {
    pub fn into_tuple(self) -> (Vec<Vec<TensorElement>>, Vec<Vec<i64>>) {
        (self.outputs, self.shapes)
    }

    pub fn len(&self) -> usize {
        self.outputs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.outputs.is_empty()
    }
}

/// A backend that runs one model.
///
/// Calls on one instance are serialized by `&mut self`; use a
/// [`BackendPool`](crate::pool::BackendPool) to serve concurrent callers.
pub trait InferenceBackend: Send {
    /// Short backend identifier (e.g., "gpu-engine", "mock").
    fn name(&self) -> &str;

    /// Run one inference on per-input byte buffers.
    fn infer(&mut self, inputs: &[Vec<u8>]) -> Result<InferenceOutput>;

    fn model_info(&self) -> ModelInfo;

    fn batch_size(&self) -> usize;

    fn model_path(&self) -> &Path;

    fn is_gpu_available(&self) -> bool;

    fn stats(&self) -> InferenceStats;

    fn last_inference_time_ms(&self) -> f64 {
        self.stats().last_inference_time_ms
    }

    fn total_inferences(&self) -> u64 {
        self.stats().total_inferences
    }

    /// Device or host memory held by the backend, in bytes.
    fn memory_usage_bytes(&self) -> usize {
        0
    }

    fn clear_cache(&mut self) {}

    /// False once a device failure has made the instance unusable.
    fn is_usable(&self) -> bool {
        true
    }
}
