//! Per-instance execution state: resolved shapes, address bindings, stream.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use tracing::{debug, error, warn};

use ib_tensor::{Dim, Shape};

use crate::allocator::{required_bytes, DeviceBuffer};
use crate::device::{Device, StreamHandle, TensorBinding};
use crate::error::{EngineError, Result};
use crate::graph::CompiledGraph;

/// Lifecycle of an execution context.
///
/// ```text
/// Configuring -> ShapesResolved -> Ready <-> Bound
///        \______________\____________\_______\__-> Poisoned
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContextPhase {
    /// Input shapes are being set.
    Configuring,
    /// Every tensor has a concrete shape; buffers not yet allocated.
    ShapesResolved,
    /// Buffers allocated, no bindings set.
    Ready,
    /// Bindings set for the next launch.
    Bound,
    /// A device failure occurred; nothing further is accepted.
    Poisoned,
}

impl fmt::Display for ContextPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ContextPhase::Configuring => "configuring",
            ContextPhase::ShapesResolved => "shapes-resolved",
            ContextPhase::Ready => "ready",
            ContextPhase::Bound => "bound",
            ContextPhase::Poisoned => "poisoned",
        };
        f.write_str(s)
    }
}

/// Saved shape configuration, restored when a reconfiguration fails.
#[derive(Debug, Clone)]
pub struct ContextSnapshot {
    phase: ContextPhase,
    shapes: Vec<Option<Shape>>,
}

/// Bindings and shapes for one graph on one device, with a dedicated stream.
pub struct ExecutionContext {
    graph: Arc<CompiledGraph>,
    device: Arc<dyn Device>,
    stream: Option<StreamHandle>,
    phase: ContextPhase,
    shapes: Vec<Option<Shape>>,
    bindings: Vec<TensorBinding>,
}

impl ExecutionContext {
    /// Create a context and its stream. Fails if the device cannot run the
    /// graph's kernel.
    pub fn new(graph: Arc<CompiledGraph>, device: Arc<dyn Device>) -> Result<Self> {
        if !device.has_kernel(graph.kernel()) {
            return Err(EngineError::KernelNotFound(format!(
                "'{}' is not available on device '{}'",
                graph.kernel(),
                device.name()
            )));
        }
        let stream = device.create_stream()?;
        let n = graph.registry().len();
        Ok(ExecutionContext {
            graph,
            device,
            stream: Some(stream),
            phase: ContextPhase::Configuring,
            shapes: vec![None; n],
            bindings: Vec::new(),
        })
    }

    pub fn phase(&self) -> ContextPhase {
        self.phase
    }

    pub fn is_poisoned(&self) -> bool {
        self.phase == ContextPhase::Poisoned
    }

    pub fn graph(&self) -> &CompiledGraph {
        &self.graph
    }

    fn expect_phase(&self, allowed: &[ContextPhase], op: &str) -> Result<()> {
        if allowed.contains(&self.phase) {
            Ok(())
        } else {
            Err(EngineError::InvalidState(format!(
                "cannot {} while context is {}",
                op, self.phase
            )))
        }
    }

    /// Set the concrete shape of input `ordinal`.
    ///
    /// The shape must have the declared rank, agree on every fixed axis and
    /// have no zero-sized axis.
    pub fn set_input_shape(&mut self, ordinal: usize, shape: Shape) -> Result<()> {
        self.expect_phase(&[ContextPhase::Configuring], "set an input shape")?;
        let registry = self.graph.registry();
        let desc = registry
            .get(ordinal)
            .filter(|d| d.is_input())
            .ok_or_else(|| EngineError::InvalidState(format!("ordinal {} is not an input", ordinal)))?;

        if shape.dims().contains(&0) {
            return Err(EngineError::InvalidShape {
                tensor: desc.name.clone(),
                reason: format!("{} has a zero-sized axis", shape),
            });
        }
        desc.shape.check(&shape).map_err(|e| EngineError::InvalidShape {
            tensor: desc.name.clone(),
            reason: e.to_string(),
        })?;

        debug!(tensor = %desc.name, declared = %desc.shape, resolved = %shape, "set input shape");
        self.shapes[ordinal] = Some(shape);
        Ok(())
    }

    /// Derive every output's concrete shape from the input shapes.
    ///
    /// Dynamic axes are unified by symbol: each symbol takes the size of the
    /// input axes that carry it, which must all agree.
    pub fn resolve_output_shapes(&mut self) -> Result<Vec<Shape>> {
        self.expect_phase(&[ContextPhase::Configuring], "resolve output shapes")?;
        let registry = self.graph.registry();

        let mut symbols: HashMap<&str, (usize, &str)> = HashMap::new();
        for (ordinal, desc) in registry.inputs().iter().enumerate() {
            let shape = self.shapes[ordinal].as_ref().ok_or_else(|| {
                EngineError::DynamicShapeUnresolved {
                    tensor: desc.name.clone(),
                    reason: "input shape was never set".to_string(),
                }
            })?;
            for (dim, &size) in desc.shape.dims().iter().zip(shape.dims()) {
                let Dim::Dynamic(symbol) = dim else { continue };
                match symbols.get(symbol.as_str()) {
                    Some(&(bound, source)) if bound != size => {
                        return Err(EngineError::InvalidShape {
                            tensor: desc.name.clone(),
                            reason: format!(
                                "axis '{}' is {} here but {} in '{}'",
                                symbol, size, bound, source
                            ),
                        });
                    }
                    Some(_) => {}
                    None => {
                        symbols.insert(symbol.as_str(), (size, desc.name.as_str()));
                    }
                }
            }
        }

        let num_inputs = registry.num_inputs();
        let mut outputs = Vec::with_capacity(registry.num_outputs());
        for desc in registry.outputs() {
            let mut dims = Vec::with_capacity(desc.shape.ndim());
            for dim in desc.shape.dims() {
                let size = match dim {
                    Dim::Fixed(n) => *n,
                    Dim::Dynamic(symbol) => match symbols.get(symbol.as_str()) {
                        Some(&(size, _)) => size,
                        None => {
                            return Err(EngineError::DynamicShapeUnresolved {
                                tensor: desc.name.clone(),
                                reason: format!("axis '{}' is not determined by any input", symbol),
                            })
                        }
                    },
                };
                dims.push(size);
            }
            outputs.push(Shape::new(dims));
        }

        for (i, (desc, shape)) in registry.outputs().iter().zip(&outputs).enumerate() {
            debug!(tensor = %desc.name, declared = %desc.shape, resolved = %shape, "resolved output shape");
            self.shapes[num_inputs + i] = Some(shape.clone());
        }
        self.phase = ContextPhase::ShapesResolved;
        self.shapes()
    }

    /// Concrete shapes of every tensor in ordinal order.
    pub fn shapes(&self) -> Result<Vec<Shape>> {
        self.expect_phase(
            &[ContextPhase::ShapesResolved, ContextPhase::Ready, ContextPhase::Bound],
            "read resolved shapes",
        )?;
        self.shapes
            .iter()
            .zip(self.graph.registry().enumerate())
            .map(|(shape, desc)| {
                shape.clone().ok_or_else(|| EngineError::DynamicShapeUnresolved {
                    tensor: desc.name.clone(),
                    reason: "shape not resolved".to_string(),
                })
            })
            .collect()
    }

    /// Concrete shape of one tensor, if resolved.
    pub fn shape(&self, ordinal: usize) -> Option<&Shape> {
        self.shapes.get(ordinal).and_then(Option::as_ref)
    }

    /// Record that buffers for the resolved shapes exist.
    pub fn mark_allocated(&mut self) -> Result<()> {
        self.expect_phase(&[ContextPhase::ShapesResolved], "mark buffers allocated")?;
        self.phase = ContextPhase::Ready;
        Ok(())
    }

    /// Return to `Configuring` with no shapes, so inputs can be set again.
    pub fn reset_shapes(&mut self) -> Result<()> {
        self.expect_phase(
            &[ContextPhase::Configuring, ContextPhase::ShapesResolved, ContextPhase::Ready],
            "reset shapes",
        )?;
        self.shapes.iter_mut().for_each(|s| *s = None);
        self.bindings.clear();
        self.phase = ContextPhase::Configuring;
        Ok(())
    }

    pub fn snapshot(&self) -> ContextSnapshot {
        ContextSnapshot {
            phase: self.phase,
            shapes: self.shapes.clone(),
        }
    }

    /// Restore a snapshot. A poisoned context stays poisoned.
    pub fn restore(&mut self, snapshot: ContextSnapshot) {
        if self.is_poisoned() {
            return;
        }
        self.shapes = snapshot.shapes;
        self.phase = snapshot.phase;
        self.bindings.clear();
    }

    /// Bind every tensor name to its buffer's address.
    ///
    /// `buffers` must be in ordinal order and large enough for the
    /// resolved shapes.
    pub fn bind(&mut self, buffers: &[DeviceBuffer]) -> Result<()> {
        self.expect_phase(&[ContextPhase::Ready], "bind buffers")?;
        let registry = self.graph.registry();
        if buffers.len() != registry.len() {
            return Err(EngineError::InvalidState(format!(
                "{} buffers for {} tensors",
                buffers.len(),
                registry.len()
            )));
        }

        let mut bindings = Vec::with_capacity(buffers.len());
        for (ordinal, (desc, buffer)) in registry.enumerate().iter().zip(buffers).enumerate() {
            let shape = self.shape(ordinal).cloned().ok_or_else(|| {
                EngineError::InvalidState(format!("tensor '{}' has no resolved shape", desc.name))
            })?;
            let bytes = required_bytes(desc, &shape)?;
            let ptr = buffer.ptr();
            if buffer.capacity() < bytes {
                return Err(EngineError::InvalidState(format!(
                    "buffer for '{}' holds {} bytes, {} needed",
                    desc.name,
                    buffer.capacity(),
                    bytes
                )));
            }
            bindings.push(TensorBinding {
                name: desc.name.clone(),
                ptr,
                bytes,
                direction: desc.direction,
                dtype: buffer.dtype(),
                shape,
            });
        }

        self.bindings = bindings;
        self.phase = ContextPhase::Bound;
        Ok(())
    }

    pub fn bindings(&self) -> &[TensorBinding] {
        &self.bindings
    }

    /// Drop the current bindings without launching.
    pub fn clear_bindings(&mut self) {
        if self.phase == ContextPhase::Bound {
            self.bindings.clear();
            self.phase = ContextPhase::Ready;
        }
    }

    /// Launch the graph on the context's stream and wait for it.
    ///
    /// Bindings are consumed either way. A device failure poisons the context.
    pub fn enqueue(&mut self) -> Result<()> {
        self.expect_phase(&[ContextPhase::Bound], "enqueue")?;
        let stream = self
            .stream
            .ok_or_else(|| EngineError::InvalidState("context has no stream".to_string()))?;

        let bindings = std::mem::take(&mut self.bindings);
        let result = self
            .device
            .launch(stream, self.graph.kernel(), self.graph.payload(), &bindings)
            .and_then(|()| self.device.synchronize(stream));

        match result {
            Ok(()) => {
                self.phase = ContextPhase::Ready;
                Ok(())
            }
            Err(e) => {
                if e.is_device_error() {
                    self.poison(&e.to_string());
                } else {
                    self.phase = ContextPhase::Ready;
                }
                Err(e)
            }
        }
    }

    /// Enter the terminal `Poisoned` phase.
    pub fn poison(&mut self, reason: &str) {
        if !self.is_poisoned() {
            warn!(kernel = self.graph.kernel(), reason, "execution context poisoned");
        }
        self.bindings.clear();
        self.phase = ContextPhase::Poisoned;
    }
}

impl Drop for ExecutionContext {
    fn drop(&mut self) {
        if let Some(stream) = self.stream.take() {
            if let Err(e) = self.device.destroy_stream(stream) {
                error!(error = %e, "failed to destroy execution stream");
            }
        }
    }
}

impl fmt::Debug for ExecutionContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecutionContext")
            .field("kernel", &self.graph.kernel())
            .field("device", &self.device.name())
            .field("phase", &self.phase)
            .field("shapes", &self.shapes)
            .finish()
    }
}
