use std::path::{Path, PathBuf};

use ::config::{Config, Environment, File};
use serde::{Deserialize, Serialize};

use crate::error::{EngineError, Result};
use crate::setup::BackendKind;

/// Prefix of environment variables layered over a config file,
/// e.g. `IB_BATCH_SIZE=4` or `IB_LOGGING__LEVEL=debug`.
pub const ENV_PREFIX: &str = "IB";

/// What `infer` does when an input buffer's length differs from the
/// resolved tensor's byte size.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InputSizePolicy {
    /// Reject the call with `InputSizeMismatch`.
    #[default]
    Strict,
    /// Log a warning, copy what fits and zero the rest.
    Lenient,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Compact,
    Pretty,
    Json,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// `EnvFilter` directive used when `RUST_LOG` is unset.
    pub level: String,
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        LoggingConfig {
            level: "info".to_string(),
            format: LogFormat::Compact,
        }
    }
}

/// Everything needed to construct an inference backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendConfig {
    /// Compiled engine file.
    pub model_path: PathBuf,
    pub kind: BackendKind,
    pub use_gpu: bool,
    pub batch_size: usize,
    /// Per-input sizes, with or without the batch axis.
    pub input_sizes: Vec<Vec<i64>>,
    pub input_size_policy: InputSizePolicy,
    /// Cap on device memory for the default host device.
    pub device_memory_limit: Option<usize>,
    /// Instances held by a `BackendPool`.
    pub pool_size: usize,
    pub logging: LoggingConfig,
}

impl Default for BackendConfig {
    fn default() -> Self {
        BackendConfig {
            model_path: PathBuf::new(),
            kind: BackendKind::GpuEngine,
            use_gpu: true,
            batch_size: 1,
            input_sizes: Vec::new(),
            input_size_policy: InputSizePolicy::Strict,
            device_memory_limit: None,
            pool_size: 1,
            logging: LoggingConfig::default(),
        }
    }
}

impl BackendConfig {
    pub fn new(model_path: impl Into<PathBuf>) -> Self {
        BackendConfig {
            model_path: model_path.into(),
            ..Self::default()
        }
    }

    pub fn with_kind(mut self, kind: BackendKind) -> Self {
        self.kind = kind;
        self
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    pub fn with_input_sizes(mut self, input_sizes: Vec<Vec<i64>>) -> Self {
        self.input_sizes = input_sizes;
        self
    }

    pub fn with_input_size_policy(mut self, policy: InputSizePolicy) -> Self {
        self.input_size_policy = policy;
        self
    }

    pub fn with_use_gpu(mut self, use_gpu: bool) -> Self {
        self.use_gpu = use_gpu;
        self
    }

    pub fn with_device_memory_limit(mut self, bytes: usize) -> Self {
        self.device_memory_limit = Some(bytes);
        self
    }

    pub fn with_pool_size(mut self, pool_size: usize) -> Self {
        self.pool_size = pool_size;
        self
    }

    /// Load from a TOML/JSON/YAML file (by extension), overridden by
    /// `IB_`-prefixed environment variables.
    pub fn load(path: &Path) -> Result<Self> {
        let cfg: BackendConfig = Config::builder()
            .add_source(File::from(path))
            .add_source(env_source())
            .build()?
            .try_deserialize()?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Load from `IB_`-prefixed environment variables alone.
    pub fn from_env() -> Result<Self> {
        let cfg: BackendConfig = Config::builder()
            .add_source(env_source())
            .build()?
            .try_deserialize()?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<()> {
        if self.batch_size == 0 {
            return Err(EngineError::Config("batch_size must be at least 1".to_string()));
        }
        if self.pool_size == 0 {
            return Err(EngineError::Config("pool_size must be at least 1".to_string()));
        }
        if self.kind == BackendKind::GpuEngine && self.model_path.as_os_str().is_empty() {
            return Err(EngineError::Config("model_path is empty".to_string()));
        }
        if let Some(sizes) = self.input_sizes.iter().find(|s| s.iter().any(|&d| d <= 0)) {
            return Err(EngineError::Config(format!(
                "input sizes must be positive, got {:?}",
                sizes
            )));
        }
        Ok(())
    }
}

fn env_source() -> Environment {
    Environment::with_prefix(ENV_PREFIX)
        .separator("__")
        .try_parsing(true)
}
