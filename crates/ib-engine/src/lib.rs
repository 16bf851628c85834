//! Execution-engine inference backend.
//!
//! Loads a compiled graph from an `.ibe` engine file, resolves its dynamic
//! tensor shapes from caller-supplied sizes, owns one device buffer per
//! tensor and runs synchronous inference behind the [`InferenceBackend`]
//! interface shared by every backend.

pub mod allocator;
pub mod config;
pub mod context;
pub mod device;
pub mod error;
pub mod format;
pub mod gpu;
pub mod graph;
pub mod interface;
pub mod logging;
pub mod marshal;
pub mod mock;
pub mod pool;
pub mod registry;
pub mod resolver;
pub mod setup;

pub use allocator::{BufferAllocator, DeviceBuffer};
pub use config::{BackendConfig, InputSizePolicy, LogFormat, LoggingConfig};
pub use context::{ContextPhase, ExecutionContext};
pub use device::{Device, DevicePtr, HostDevice, KernelRegistry};
pub use error::{EngineError, Result};
pub use gpu::GpuEngineBackend;
pub use graph::CompiledGraph;
pub use interface::{InferenceBackend, InferenceOutput, InferenceStats, LayerInfo, ModelInfo};
pub use mock::MockBackend;
pub use pool::{BackendPool, PooledBackend};
pub use registry::{TensorDescriptor, TensorDirection, TensorRegistry};
pub use resolver::{RankFit, ShapeResolver};
pub use setup::{setup_inference_engine, setup_with_device, BackendKind};
