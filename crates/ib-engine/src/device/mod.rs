//! Device abstraction: opaque device memory, streams and kernel launches.

mod host;
mod kernel;

pub use host::HostDevice;
pub use kernel::{Kernel, KernelRegistry, KernelTensor, KernelTensorMut};

use std::fmt::{self, Debug};

use ib_tensor::{ElementType, Shape};

use crate::error::Result;
use crate::registry::TensorDirection;

/// Address of a device memory region.
///
/// Only meaningful to the device that produced it; never a host pointer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DevicePtr(pub u64);

impl fmt::Display for DevicePtr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// Handle of an execution stream owned by a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StreamHandle(pub u64);

/// A tensor name bound to a device address for one launch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TensorBinding {
    pub name: String,
    pub ptr: DevicePtr,
    /// Bytes of the region the kernel may touch.
    pub bytes: usize,
    pub direction: TensorDirection,
    pub dtype: ElementType,
    pub shape: Shape,
}

/// An accelerator that owns memory and executes compiled graphs.
///
/// Memory and stream operations return `OutOfMemory`, `Transfer` or
/// `ExecutionFailed` on failure, all of which are device errors.
pub trait Device: Send + Sync + Debug {
    /// Returns the name of this device (e.g., "host", "cuda:0").
    fn name(&self) -> &str;

    /// True if this device is a discrete accelerator.
    fn is_gpu(&self) -> bool;

    /// Allocate `bytes` of device memory.
    fn malloc(&self, bytes: usize) -> Result<DevicePtr>;

    /// Free a region returned by `malloc`. Freeing twice is an error.
    fn free(&self, ptr: DevicePtr) -> Result<()>;

    /// Copy host bytes into the start of the region at `dst`.
    fn memcpy_htod(&self, dst: DevicePtr, src: &[u8]) -> Result<()>;

    /// Copy the first `dst.len()` bytes of the region at `src` to the host.
    fn memcpy_dtoh(&self, dst: &mut [u8], src: DevicePtr) -> Result<()>;

    /// Fill the first `bytes` bytes of the region at `dst` with `value`.
    fn memset(&self, dst: DevicePtr, value: u8, bytes: usize) -> Result<()>;

    fn create_stream(&self) -> Result<StreamHandle>;

    fn destroy_stream(&self, stream: StreamHandle) -> Result<()>;

    /// True if `kernel` can be launched on this device.
    fn has_kernel(&self, kernel: &str) -> bool;

    /// Enqueue `kernel` on `stream` with the given bindings.
    fn launch(
        &self,
        stream: StreamHandle,
        kernel: &str,
        payload: &[u8],
        bindings: &[TensorBinding],
    ) -> Result<()>;

    /// Block until all work enqueued on `stream` has completed.
    fn synchronize(&self, stream: StreamHandle) -> Result<()>;

    /// Bytes of device memory currently allocated.
    fn memory_in_use(&self) -> usize;
}
