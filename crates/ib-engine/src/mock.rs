use std::path::{Path, PathBuf};
use std::time::Duration;

use tracing::debug;

use ib_tensor::{DataType, TensorElement};

use crate::error::{EngineError, Result};
use crate::interface::{InferenceBackend, InferenceOutput, InferenceStats, ModelInfo};

const NUM_CLASSES: usize = 1000;
const MOCK_LATENCY: Duration = Duration::from_millis(5);
const MOCK_MEMORY_BYTES: usize = 50 * 1024 * 1024;
const MOCK_MEMORY_AFTER_CLEAR: usize = 10 * 1024 * 1024;

/// Backend double producing a fixed 1000-class classification output.
///
/// Reports a constant 5 ms latency without sleeping, so it can stand in for
/// a real backend in tests of code built on `InferenceBackend`.
#[derive(Debug, Clone)]
pub struct MockBackend {
    model_path: PathBuf,
    batch_size: usize,
    stats: InferenceStats,
    memory_bytes: usize,
}

impl MockBackend {
    pub fn new() -> Self {
        MockBackend {
            model_path: PathBuf::from("mock_model"),
            batch_size: 1,
            stats: InferenceStats::default(),
            memory_bytes: MOCK_MEMORY_BYTES,
        }
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    /// Value of class `i` in every mock output.
    pub fn class_score(i: usize) -> f32 {
        0.001 + (i % 10) as f32 * 0.0001
    }
}

impl Default for MockBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl InferenceBackend for MockBackend {
    fn name(&self) -> &str {
        "mock"
    }

    fn infer(&mut self, inputs: &[Vec<u8>]) -> Result<InferenceOutput> {
        if inputs.len() != 1 {
            self.stats.record_failure();
            return Err(EngineError::InputCountMismatch {
                expected: 1,
                got: inputs.len(),
            });
        }

        let scores: Vec<TensorElement> = (0..NUM_CLASSES)
            .map(|i| TensorElement::F32(Self::class_score(i)))
            .collect();
        self.stats.record_success(MOCK_LATENCY);
        debug!(total = self.stats.total_inferences, "mock inference");
        Ok(InferenceOutput {
            outputs: vec![scores],
            shapes: vec![vec![1, NUM_CLASSES as i64]],
        })
    }

    fn model_info(&self) -> ModelInfo {
        let mut info = ModelInfo::default();
        info.add_input("input", vec![3, 224, 224], self.batch_size, DataType::F32);
        info.add_output("output", vec![NUM_CLASSES as i64], self.batch_size, DataType::F32);
        info
    }

    fn batch_size(&self) -> usize {
        self.batch_size
    }

    fn model_path(&self) -> &Path {
        &self.model_path
    }

    fn is_gpu_available(&self) -> bool {
        false
    }

    fn stats(&self) -> InferenceStats {
        self.stats
    }

    fn memory_usage_bytes(&self) -> usize {
        self.memory_bytes
    }

    fn clear_cache(&mut self) {
        self.memory_bytes = MOCK_MEMORY_AFTER_CLEAR;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_mock_output() {
        let mut mock = MockBackend::new();
        let (outputs, shapes) = mock.infer(&[vec![0u8; 12]]).unwrap().into_tuple();
        assert_eq!(shapes, vec![vec![1, 1000]]);
        assert_eq!(outputs[0].len(), 1000);
        assert_relative_eq!(outputs[0][0].as_f32().unwrap(), 0.001);
        assert_relative_eq!(outputs[0][19].as_f32().unwrap(), 0.0019, epsilon = 1e-6);
        assert_eq!(mock.total_inferences(), 1);
        assert_relative_eq!(mock.last_inference_time_ms(), 5.0);
    }

    #[test]
    fn test_mock_rejects_input_count() {
        let mut mock = MockBackend::new();
        assert!(mock.infer(&[]).is_err());
        assert_eq!(mock.stats().failed_inferences, 1);
    }

    #[test]
    fn test_clear_cache() {
        let mut mock = MockBackend::new();
        assert_eq!(mock.memory_usage_bytes(), 50 * 1024 * 1024);
        mock.clear_cache();
        assert_eq!(mock.memory_usage_bytes(), 10 * 1024 * 1024);
        assert_eq!(mock.model_info().inputs[0].shape, vec![3, 224, 224]);
    }
}
