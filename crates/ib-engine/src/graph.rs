use std::path::{Path, PathBuf};

use tracing::{debug, info};

use crate::error::Result;
use crate::format::EngineFile;
use crate::registry::TensorRegistry;

/// An immutable, deserialized computation graph.
///
/// Opaque apart from its tensor interface, its kernel entry point and the
/// payload handed to that kernel. Shared read-only between the backend and
/// its execution context.
#[derive(Debug)]
pub struct CompiledGraph {
    path: PathBuf,
    file: EngineFile,
    registry: TensorRegistry,
}

impl CompiledGraph {
    /// Load and classify the engine file at `path`.
    pub fn deserialize(path: &Path) -> Result<CompiledGraph> {
        let file = EngineFile::open(path)?;
        let registry = TensorRegistry::new(file.tensors.clone())?;

        info!(
            path = %path.display(),
            kernel = %file.header.kernel,
            inputs = registry.num_inputs(),
            outputs = registry.num_outputs(),
            "deserialized compiled graph"
        );
        for t in registry.enumerate() {
            debug!(tensor = %t.name, direction = ?t.direction, dtype = %t.dtype, shape = %t.shape, "graph tensor");
        }

        Ok(CompiledGraph {
            path: path.to_path_buf(),
            file,
            registry,
        })
    }

    pub fn registry(&self) -> &TensorRegistry {
        &self.registry
    }

    /// Name of the kernel that executes this graph.
    pub fn kernel(&self) -> &str {
        &self.file.header.kernel
    }

    pub fn payload(&self) -> &[u8] {
        self.file.payload()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}
