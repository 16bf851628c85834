//! Backend that runs a compiled graph on a device.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use tracing::{debug, error, info, warn};

use ib_tensor::Shape;

use crate::allocator::{required_bytes, BufferAllocator, DeviceBuffer};
use crate::config::BackendConfig;
use crate::context::ExecutionContext;
use crate::device::{Device, HostDevice};
use crate::error::{EngineError, Result};
use crate::graph::CompiledGraph;
use crate::interface::{InferenceBackend, InferenceOutput, InferenceStats, ModelInfo};
use crate::marshal::Marshaller;
use crate::resolver::ShapeResolver;

/// Execution-engine backend: one compiled graph, one execution context and
/// one device buffer per tensor, all owned exclusively by the instance.
///
/// Construction either fully succeeds or fails with every device resource
/// already released. After a device failure the instance is poisoned and
/// every later call fails with `BackendUnusable`.
pub struct GpuEngineBackend {
    model_path: PathBuf,
    batch_size: usize,
    input_sizes: Vec<Vec<i64>>,
    device: Arc<dyn Device>,
    graph: Arc<CompiledGraph>,
    resolver: ShapeResolver,
    allocator: BufferAllocator,
    marshaller: Marshaller,
    // Dropped before `context` so buffers are freed before the stream goes.
    buffers: Vec<DeviceBuffer>,
    context: ExecutionContext,
    model_info: ModelInfo,
    stats: InferenceStats,
    poisoned: Option<String>,
}

impl GpuEngineBackend {
    /// Build a backend on the default host device, honouring
    /// `device_memory_limit`.
    pub fn with_default_device(config: &BackendConfig) -> Result<Self> {
        let mut host = HostDevice::new();
        if let Some(limit) = config.device_memory_limit {
            host = host.with_memory_limit(limit);
        }
        Self::new(config, Arc::new(host))
    }

    pub fn new(config: &BackendConfig, device: Arc<dyn Device>) -> Result<Self> {
        config.validate()?;
        if !config.use_gpu {
            info!("execution-engine backend always runs on the device; ignoring use_gpu = false");
        }
        info!(
            model = %config.model_path.display(),
            device = device.name(),
            batch_size = config.batch_size,
            "initializing execution-engine backend"
        );

        let graph = Arc::new(CompiledGraph::deserialize(&config.model_path)?);
        let mut context = ExecutionContext::new(Arc::clone(&graph), Arc::clone(&device))?;
        let resolver = ShapeResolver::new(config.batch_size);
        let shapes = resolver.resolve(&mut context, &config.input_sizes)?;

        let allocator = BufferAllocator::new(Arc::clone(&device));
        let buffers = allocator.allocate_all(graph.registry(), &shapes)?;
        context.mark_allocated()?;

        let model_info = ModelInfo::from_registry(graph.registry(), &shapes, config.batch_size);
        info!(
            inputs = graph.registry().num_inputs(),
            outputs = graph.registry().num_outputs(),
            device_bytes = buffers.iter().map(DeviceBuffer::capacity).sum::<usize>(),
            "execution-engine backend ready"
        );

        Ok(GpuEngineBackend {
            model_path: config.model_path.clone(),
            batch_size: config.batch_size,
            input_sizes: config.input_sizes.clone(),
            marshaller: Marshaller::new(Arc::clone(&device), config.input_size_policy),
            device,
            graph,
            resolver,
            allocator,
            buffers,
            context,
            model_info,
            stats: InferenceStats::default(),
            poisoned: None,
        })
    }

    /// Resolve shapes for new input sizes and resize buffers to match.
    ///
    /// Buffers that already hold enough bytes are kept. On failure the
    /// previous configuration stays in effect.
    pub fn reconfigure(&mut self, input_sizes: &[Vec<i64>]) -> Result<()> {
        self.ensure_usable()?;
        let snapshot = self.context.snapshot();
        self.context.reset_shapes()?;

        let shapes = match self.resolver.resolve(&mut self.context, input_sizes) {
            Ok(shapes) => shapes,
            Err(e) => {
                warn!(error = %e, "reconfiguration failed, keeping previous shapes");
                self.context.restore(snapshot);
                return Err(e);
            }
        };

        let mut replacements = Vec::with_capacity(self.buffers.len());
        for ((desc, shape), buffer) in self
            .graph
            .registry()
            .enumerate()
            .iter()
            .zip(&shapes)
            .zip(&self.buffers)
        {
            let plan = required_bytes(desc, shape).and_then(|bytes| {
                if bytes <= buffer.capacity() {
                    Ok(None)
                } else {
                    self.allocator.allocate(desc, shape).map(Some)
                }
            });
            match plan {
                Ok(replacement) => replacements.push(replacement),
                Err(e) => {
                    warn!(tensor = %desc.name, error = %e, "reconfiguration failed, keeping previous buffers");
                    self.context.restore(snapshot);
                    return Err(e);
                }
            }
        }

        for (ordinal, replacement) in replacements.into_iter().enumerate() {
            if let Some(buffer) = replacement {
                let old = std::mem::replace(&mut self.buffers[ordinal], buffer);
                debug!(tensor = %old.name(), old_bytes = old.capacity(), "replacing device buffer");
                if let Err(e) = old.release() {
                    error!(error = %e, "failed to release replaced buffer");
                }
            }
        }

        self.context.mark_allocated()?;
        self.model_info = ModelInfo::from_registry(self.graph.registry(), &shapes, self.batch_size);
        self.input_sizes = input_sizes.to_vec();
        info!(sizes = ?input_sizes, "reconfigured input shapes");
        Ok(())
    }

    /// Concrete shape of the tensor called `name`.
    pub fn resolved_shape(&self, name: &str) -> Option<&Shape> {
        self.graph
            .registry()
            .ordinal(name)
            .and_then(|i| self.context.shape(i))
    }

    pub fn input_sizes(&self) -> &[Vec<i64>] {
        &self.input_sizes
    }

    pub fn graph(&self) -> &CompiledGraph {
        &self.graph
    }

    pub fn device(&self) -> &Arc<dyn Device> {
        &self.device
    }

    fn ensure_usable(&self) -> Result<()> {
        match &self.poisoned {
            Some(reason) => Err(EngineError::BackendUnusable(reason.clone())),
            None => Ok(()),
        }
    }

    fn poison(&mut self, err: &EngineError) {
        error!(error = %err, "device failure, backend is now unusable");
        self.context.poison(&err.to_string());
        self.poisoned = Some(err.to_string());
    }

    fn execute(&mut self, inputs: &[Vec<u8>], expected: &[usize], shapes: &[Shape]) -> Result<InferenceOutput> {
        let registry = self.graph.registry();
        self.marshaller.upload(registry, &self.buffers, inputs, expected)?;
        self.context.bind(&self.buffers)?;
        self.context.enqueue()?;
        let (outputs, shapes) = self.marshaller.download(registry, &self.buffers, shapes)?;
        Ok(InferenceOutput { outputs, shapes })
    }
}

impl InferenceBackend for GpuEngineBackend {
    fn name(&self) -> &str {
        "gpu-engine"
    }

    fn infer(&mut self, inputs: &[Vec<u8>]) -> Result<InferenceOutput> {
        let checked = self.ensure_usable().and_then(|()| {
            let shapes = self.context.shapes()?;
            let expected = self
                .marshaller
                .validate_inputs(self.graph.registry(), &shapes, inputs)?;
            Ok((shapes, expected))
        });
        let (shapes, expected) = match checked {
            Ok(checked) => checked,
            Err(e) => {
                // rejected before touching the device; counted like any failed call
                self.stats.record_failure();
                return Err(e);
            }
        };

        let start = Instant::now();
        match self.execute(inputs, &expected, &shapes) {
            Ok(output) => {
                self.stats.record_success(start.elapsed());
                debug!(
                    outputs = output.len(),
                    elapsed_ms = self.stats.last_inference_time_ms,
                    "inference complete"
                );
                Ok(output)
            }
            Err(e) => {
                self.stats.record_failure();
                self.context.clear_bindings();
                if e.is_device_error() {
                    self.poison(&e);
                }
                Err(e)
            }
        }
    }

    fn model_info(&self) -> ModelInfo {
        self.model_info.clone()
    }

    fn batch_size(&self) -> usize {
        self.batch_size
    }

    fn model_path(&self) -> &Path {
        &self.model_path
    }

    fn is_gpu_available(&self) -> bool {
        true
    }

    fn stats(&self) -> InferenceStats {
        self.stats
    }

    fn memory_usage_bytes(&self) -> usize {
        self.buffers.iter().map(DeviceBuffer::capacity).sum()
    }

    fn is_usable(&self) -> bool {
        self.poisoned.is_none()
    }
}

impl Drop for GpuEngineBackend {
    fn drop(&mut self) {
        let buffers = std::mem::take(&mut self.buffers);
        let count = buffers.len();
        if let Err(e) = self.allocator.release_all(buffers) {
            error!(error = %e, "teardown did not release every device buffer");
        }
        info!(model = %self.model_path.display(), buffers = count, "execution-engine backend torn down");
    }
}

impl std::fmt::Debug for GpuEngineBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GpuEngineBackend")
            .field("model_path", &self.model_path)
            .field("batch_size", &self.batch_size)
            .field("device", &self.device.name())
            .field("phase", &self.context.phase())
            .field("buffers", &self.buffers)
            .field("poisoned", &self.poisoned)
            .finish()
    }
}
