use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::config::BackendConfig;
use crate::device::Device;
use crate::error::Result;
use crate::gpu::GpuEngineBackend;
use crate::interface::InferenceBackend;
use crate::mock::MockBackend;

/// Which backend implementation `setup_inference_engine` builds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    /// Compiled-graph execution engine on a device.
    #[default]
    GpuEngine,
    /// Fixed-output test double.
    Mock,
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackendKind::GpuEngine => write!(f, "gpu_engine"),
            BackendKind::Mock => write!(f, "mock"),
        }
    }
}

/// Build the backend selected by `config.kind`.
pub fn setup_inference_engine(config: &BackendConfig) -> Result<Box<dyn InferenceBackend>> {
    config.validate()?;
    info!(kind = %config.kind, "setting up inference backend");
    match config.kind {
        BackendKind::GpuEngine => Ok(Box::new(GpuEngineBackend::with_default_device(config)?)),
        BackendKind::Mock => Ok(Box::new(MockBackend::new().with_batch_size(config.batch_size))),
    }
}

/// Like [`setup_inference_engine`], but engine backends run on `device`.
pub fn setup_with_device(
    config: &BackendConfig,
    device: Arc<dyn Device>,
) -> Result<Box<dyn InferenceBackend>> {
    config.validate()?;
    match config.kind {
        BackendKind::GpuEngine => Ok(Box::new(GpuEngineBackend::new(config, device)?)),
        BackendKind::Mock => Ok(Box::new(MockBackend::new().with_batch_size(config.batch_size))),
    }
}
