//! Turns caller-supplied input sizes into concrete tensor shapes.

use tracing::{debug, warn};

use ib_tensor::Shape;

use crate::context::ExecutionContext;
use crate::error::{EngineError, Result};
use crate::format::MAX_RANK;
use crate::registry::TensorDescriptor;

/// How a caller's size vector was matched to a declared rank.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RankFit {
    /// Same rank as declared.
    Exact,
    /// One axis short; the configured batch size was prepended.
    BatchPrepended,
    /// Neither; the vector was used as given (capped at `MAX_RANK`).
    Degraded,
}

#[derive(Debug, Clone, Copy)]
pub struct ShapeResolver {
    batch_size: usize,
}

impl ShapeResolver {
    pub fn new(batch_size: usize) -> Self {
        ShapeResolver { batch_size }
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    /// Match a caller size vector against `desc`'s declared rank.
    ///
    /// Zero or negative sizes are rejected with `InvalidShape`. A degraded
    /// fit is logged and left for the context to validate.
    pub fn fit_input(&self, desc: &TensorDescriptor, sizes: &[i64]) -> Result<(Shape, RankFit)> {
        let rank = desc.shape.ndim();
        let (dims, fit) = if sizes.len() == rank {
            (sizes.to_vec(), RankFit::Exact)
        } else if sizes.len() + 1 == rank {
            let mut dims = Vec::with_capacity(rank);
            dims.push(self.batch_size as i64);
            dims.extend_from_slice(sizes);
            (dims, RankFit::BatchPrepended)
        } else {
            warn!(
                tensor = %desc.name,
                declared = %desc.shape,
                got = ?sizes,
                "input sizes match neither the declared rank nor rank - 1"
            );
            let n = sizes.len().min(MAX_RANK as usize);
            (sizes[..n].to_vec(), RankFit::Degraded)
        };

        let shape = Shape::from_i64(&dims).map_err(|e| EngineError::InvalidShape {
            tensor: desc.name.clone(),
            reason: e.to_string(),
        })?;
        Ok((shape, fit))
    }

    /// Set every input's concrete shape on `ctx`, then read back all shapes.
    ///
    /// Inputs without caller sizes fall back to their declared shape, which
    /// must then be fully static. Returns shapes in ordinal order.
    pub fn resolve(&self, ctx: &mut ExecutionContext, input_sizes: &[Vec<i64>]) -> Result<Vec<Shape>> {
        let inputs: Vec<TensorDescriptor> = ctx.graph().registry().inputs().to_vec();
        if input_sizes.len() > inputs.len() {
            warn!(
                supplied = input_sizes.len(),
                inputs = inputs.len(),
                "ignoring input sizes beyond the graph's inputs"
            );
        }

        for (ordinal, desc) in inputs.iter().enumerate() {
            let shape = match input_sizes.get(ordinal) {
                Some(sizes) => {
                    let (shape, fit) = self.fit_input(desc, sizes)?;
                    debug!(tensor = %desc.name, ?fit, shape = %shape, "fitted input sizes");
                    shape
                }
                None => desc.shape.to_static().ok_or_else(|| {
                    EngineError::DynamicShapeUnresolved {
                        tensor: desc.name.clone(),
                        reason: format!("declared {} but no input sizes were supplied", desc.shape),
                    }
                })?,
            };
            ctx.set_input_shape(ordinal, shape)?;
        }

        ctx.resolve_output_shapes()
    }
}
