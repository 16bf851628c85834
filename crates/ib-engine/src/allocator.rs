//! Device buffers sized from resolved shapes.

use std::fmt;
use std::sync::Arc;

use tracing::{debug, error, info};

use ib_tensor::{ElementType, Shape};

use crate::device::{Device, DevicePtr};
use crate::error::{EngineError, Result};
use crate::registry::{TensorDescriptor, TensorRegistry};

/// Bytes needed to hold `shape` elements of `desc`'s element type.
///
/// Fails with `UnsupportedDType` for types the backend cannot serve and with
/// `InvalidShape` for zero-sized axes or sizes that overflow `usize`.
pub fn required_bytes(desc: &TensorDescriptor, shape: &Shape) -> Result<usize> {
    let elem = desc.element_type()?;
    if let Some(axis) = shape.dims().iter().position(|&d| d == 0) {
        return Err(EngineError::InvalidShape {
            tensor: desc.name.clone(),
            reason: format!("axis {} of {} is zero-sized", axis, shape),
        });
    }
    shape
        .checked_numel()
        .and_then(|n| n.checked_mul(elem.size_in_bytes()))
        .ok_or_else(|| EngineError::InvalidShape {
            tensor: desc.name.clone(),
            reason: format!("byte size of {} x {} overflows", shape, elem),
        })
}

/// A device memory region owned by exactly one backend instance.
///
/// Freed when released or dropped, whichever comes first.
pub struct DeviceBuffer {
    name: String,
    dtype: ElementType,
    ptr: DevicePtr,
    capacity: usize,
    device: Arc<dyn Device>,
    released: bool,
}

impl DeviceBuffer {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn dtype(&self) -> ElementType {
        self.dtype
    }

    /// Device address, valid for as long as the buffer is alive.
    pub fn ptr(&self) -> DevicePtr {
        self.ptr
    }

    /// Allocated size in bytes.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Free the region now, reporting the device's answer.
    pub fn release(mut self) -> Result<()> {
        self.released = true;
        debug!(tensor = %self.name, addr = %self.ptr, bytes = self.capacity, "releasing device buffer");
        self.device.free(self.ptr)
    }
}

impl Drop for DeviceBuffer {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        if let Err(e) = self.device.free(self.ptr) {
            error!(tensor = %self.name, addr = %self.ptr, error = %e, "failed to free device buffer");
        }
    }
}

impl fmt::Debug for DeviceBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceBuffer")
            .field("name", &self.name)
            .field("dtype", &self.dtype)
            .field("ptr", &self.ptr)
            .field("capacity", &self.capacity)
            .finish()
    }
}

/// Allocates one device buffer per tensor.
#[derive(Debug, Clone)]
pub struct BufferAllocator {
    device: Arc<dyn Device>,
}

impl BufferAllocator {
    pub fn new(device: Arc<dyn Device>) -> Self {
        BufferAllocator { device }
    }

    /// Allocate a buffer for `desc` at its resolved `shape`.
    pub fn allocate(&self, desc: &TensorDescriptor, shape: &Shape) -> Result<DeviceBuffer> {
        let dtype = desc.element_type()?;
        let bytes = required_bytes(desc, shape)?;
        let ptr = self.device.malloc(bytes)?;
        debug!(tensor = %desc.name, shape = %shape, dtype = %dtype, bytes, addr = %ptr, "allocated device buffer");
        Ok(DeviceBuffer {
            name: desc.name.clone(),
            dtype,
            ptr,
            capacity: bytes,
            device: Arc::clone(&self.device),
            released: false,
        })
    }

    /// Allocate every tensor's buffer in ordinal order.
    ///
    /// All or nothing: on the first failure the buffers already allocated
    /// are freed before the error is returned.
    pub fn allocate_all(&self, registry: &TensorRegistry, shapes: &[Shape]) -> Result<Vec<DeviceBuffer>> {
        if shapes.len() != registry.len() {
            return Err(EngineError::InvalidState(format!(
                "{} resolved shapes for {} tensors",
                shapes.len(),
                registry.len()
            )));
        }

        let mut buffers = Vec::with_capacity(registry.len());
        for (desc, shape) in registry.enumerate().iter().zip(shapes) {
            buffers.push(self.allocate(desc, shape)?);
        }

        let total: usize = buffers.iter().map(DeviceBuffer::capacity).sum();
        info!(buffers = buffers.len(), bytes = total, device = self.device.name(), "allocated device buffers");
        Ok(buffers)
    }

    /// Free buffers in the order given, continuing past failures.
    ///
    /// Returns the first error encountered.
    pub fn release_all(&self, buffers: Vec<DeviceBuffer>) -> Result<()> {
        let mut first_err = None;
        for buffer in buffers {
            let name = buffer.name().to_string();
            if let Err(e) = buffer.release() {
                error!(tensor = %name, error = %e, "failed to release device buffer");
                first_err.get_or_insert(e);
            }
        }
        first_err.map_or(Ok(()), Err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::HostDevice;
    use crate::registry::TensorDirection;
    use ib_tensor::{DataType, DeclaredShape, Dim};

    fn desc(name: &str, direction: TensorDirection, dtype: DataType) -> TensorDescriptor {
        TensorDescriptor {
            name: name.to_string(),
            direction,
            dtype,
            shape: DeclaredShape::new(vec![Dim::Dynamic("batch".into()), Dim::Fixed(4)]).unwrap(),
        }
    }

    #[test]
    fn test_required_bytes() {
        let shape = Shape::new(vec![2, 4]);
        let cases = [
            (DataType::F32, 32),
            (DataType::I32, 32),
            (DataType::F16, 16),
            (DataType::I64, 64),
        ];
        for (dtype, bytes) in cases {
            let d = desc("t", TensorDirection::Output, dtype);
            assert_eq!(required_bytes(&d, &shape).unwrap(), bytes);
        }

        let d = desc("t", TensorDirection::Output, DataType::F32);
        assert!(matches!(
            required_bytes(&d, &Shape::new(vec![0, 4])),
            Err(EngineError::InvalidShape { .. })
        ));
        assert!(matches!(
            required_bytes(&d, &Shape::new(vec![usize::MAX, 4])),
            Err(EngineError::InvalidShape { .. })
        ));
    }

    #[test]
    fn test_unsupported_dtype_at_allocation() {
        let device: Arc<dyn Device> = Arc::new(HostDevice::new());
        let alloc = BufferAllocator::new(Arc::clone(&device));
        let d = desc("mask", TensorDirection::Output, DataType::U8);
        let err = alloc.allocate(&d, &Shape::new(vec![1, 4])).unwrap_err();
        assert!(matches!(err, EngineError::UnsupportedDType { .. }));
        assert_eq!(device.memory_in_use(), 0);
    }

    #[test]
    fn test_drop_frees() {
        let device: Arc<dyn Device> = Arc::new(HostDevice::new());
        let alloc = BufferAllocator::new(Arc::clone(&device));
        let d = desc("x", TensorDirection::Input, DataType::F32);
        let buf = alloc.allocate(&d, &Shape::new(vec![1, 4])).unwrap();
        assert_eq!(buf.capacity(), 16);
        assert_eq!(device.memory_in_use(), 16);
        drop(buf);
        assert_eq!(device.memory_in_use(), 0);
    }

    #[test]
    fn test_release_frees_exactly_once() {
        let host = Arc::new(HostDevice::new());
        let device: Arc<dyn Device> = host.clone();
        let alloc = BufferAllocator::new(Arc::clone(&device));
        let d = desc("x", TensorDirection::Input, DataType::F32);
        let buf = alloc.allocate(&d, &Shape::new(vec![2, 4])).unwrap();
        let ptr = buf.ptr();
        assert_eq!(host.live_allocations(), 1);

        buf.release().unwrap();
        assert_eq!(host.live_allocations(), 0);
        assert_eq!(device.memory_in_use(), 0);
        // the region is gone, so a second free is rejected
        assert!(matches!(device.free(ptr), Err(EngineError::Transfer(_))));
    }

    #[test]
    fn test_allocate_all_is_atomic() {
        let device: Arc<dyn Device> = Arc::new(HostDevice::new().with_memory_limit(40));
        let alloc = BufferAllocator::new(Arc::clone(&device));
        let registry = TensorRegistry::new(vec![
            desc("x", TensorDirection::Input, DataType::F32),
            desc("y", TensorDirection::Output, DataType::F32),
        ])
        .unwrap();
        let shapes = vec![Shape::new(vec![2, 4]), Shape::new(vec![2, 4])];

        let err = alloc.allocate_all(&registry, &shapes).unwrap_err();
        assert!(matches!(err, EngineError::OutOfMemory { .. }));
        assert_eq!(device.memory_in_use(), 0);

        let small = vec![Shape::new(vec![1, 4]), Shape::new(vec![1, 4])];
        let buffers = alloc.allocate_all(&registry, &small).unwrap();
        assert_eq!(device.memory_in_use(), 32);
        alloc.release_all(buffers).unwrap();
        assert_eq!(device.memory_in_use(), 0);
    }
}
