use thiserror::Error;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid engine magic: expected 'IBEN', got {0:?}")]
    InvalidMagic([u8; 4]),
    #[error("unsupported engine version: {0}")]
    UnsupportedVersion(u32),
    #[error("failed to load compiled graph: {0}")]
    GraphLoad(String),
    #[error("unsupported dtype for tensor '{tensor}': {dtype}")]
    UnsupportedDType { tensor: String, dtype: String },
    #[error("dynamic shape of tensor '{tensor}' cannot be resolved: {reason}")]
    DynamicShapeUnresolved { tensor: String, reason: String },
    #[error("invalid shape for tensor '{tensor}': {reason}")]
    InvalidShape { tensor: String, reason: String },
    #[error("input tensor count mismatch: expected {expected}, got {got}")]
    InputCountMismatch { expected: usize, got: usize },
    #[error("input tensor '{tensor}' size mismatch: expected {expected} bytes, got {got} bytes")]
    InputSizeMismatch {
        tensor: String,
        expected: usize,
        got: usize,
    },
    #[error("device out of memory: requested {requested} bytes, {available} available")]
    OutOfMemory { requested: usize, available: usize },
    #[error("device transfer failed: {0}")]
    Transfer(String),
    #[error("inference execution failed: {0}")]
    ExecutionFailed(String),
    #[error("kernel not found: {0}")]
    KernelNotFound(String),
    #[error("invalid execution context state: {0}")]
    InvalidState(String),
    #[error("backend is unusable after an earlier device failure: {0}")]
    BackendUnusable(String),
    #[error("configuration error: {0}")]
    Config(String),
    #[error("tensor error: {0}")]
    Tensor(#[from] ib_tensor::TensorError),
    #[error("{0}")]
    Other(String),
}

impl EngineError {
    /// True for device/runtime failures after which the instance's buffers
    /// and bindings can no longer be trusted.
    pub fn is_device_error(&self) -> bool {
        matches!(
            self,
            EngineError::OutOfMemory { .. }
                | EngineError::Transfer(_)
                | EngineError::ExecutionFailed(_)
        )
    }

    /// True for errors detected while loading and configuring a backend.
    pub fn is_configuration_error(&self) -> bool {
        matches!(
            self,
            EngineError::Io(_)
                | EngineError::InvalidMagic(_)
                | EngineError::UnsupportedVersion(_)
                | EngineError::GraphLoad(_)
                | EngineError::UnsupportedDType { .. }
                | EngineError::DynamicShapeUnresolved { .. }
                | EngineError::InvalidShape { .. }
                | EngineError::KernelNotFound(_)
                | EngineError::Config(_)
        )
    }
}

impl From<::config::ConfigError> for EngineError {
    fn from(e: ::config::ConfigError) -> Self {
        EngineError::Config(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, EngineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classes() {
        assert!(EngineError::ExecutionFailed("x".into()).is_device_error());
        assert!(EngineError::Transfer("x".into()).is_device_error());
        assert!(!EngineError::InputCountMismatch {
            expected: 1,
            got: 2
        }
        .is_device_error());

        let unresolved = EngineError::DynamicShapeUnresolved {
            tensor: "input".into(),
            reason: "no sizes".into(),
        };
        assert!(unresolved.is_configuration_error());
        assert!(!unresolved.is_device_error());
    }

    #[test]
    fn test_display() {
        let e = EngineError::InputSizeMismatch {
            tensor: "input".into(),
            expected: 8,
            got: 4,
        };
        assert_eq!(
            e.to_string(),
            "input tensor 'input' size mismatch: expected 8 bytes, got 4 bytes"
        );
    }
}
