use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::{Mutex, RwLock};
use tracing::{debug, trace, warn};

use crate::error::{EngineError, Result};
use crate::registry::TensorDirection;

use super::kernel::{KernelRegistry, KernelTensor, KernelTensorMut};
use super::{Device, DevicePtr, StreamHandle, TensorBinding};

/// Base address of the first region handed out.
const BASE_ADDRESS: u64 = 0x1000_0000;

/// Regions start on this boundary, as on real device allocators.
const ADDRESS_ALIGNMENT: u64 = 256;

#[derive(Debug, Default)]
struct HostState {
    regions: HashMap<u64, Vec<u8>>,
    in_use: usize,
    next_addr: u64,
    streams: HashSet<u64>,
    next_stream: u64,
}

/// In-process device whose memory is a host-side arena.
///
/// Launches run the named kernel eagerly against host views of the bound
/// regions. An optional memory limit makes `malloc` fail with `OutOfMemory`
/// once exceeded.
#[derive(Debug)]
pub struct HostDevice {
    name: String,
    limit: Option<usize>,
    kernels: RwLock<KernelRegistry>,
    state: Mutex<HostState>,
    fail_launch: AtomicBool,
    fail_transfer: AtomicBool,
}

impl HostDevice {
    /// Host device with the builtin kernels and no memory limit.
    pub fn new() -> Self {
        Self::with_kernels(KernelRegistry::with_builtins())
    }

    pub fn with_kernels(kernels: KernelRegistry) -> Self {
        HostDevice {
            name: "host".to_string(),
            limit: None,
            kernels: RwLock::new(kernels),
            state: Mutex::new(HostState {
                next_addr: BASE_ADDRESS,
                next_stream: 1,
                ..HostState::default()
            }),
            fail_launch: AtomicBool::new(false),
            fail_transfer: AtomicBool::new(false),
        }
    }

    /// Cap total allocated bytes at `limit`.
    pub fn with_memory_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn memory_limit(&self) -> Option<usize> {
        self.limit
    }

    /// Add or replace a kernel after construction.
    pub fn register_kernel<F>(&self, name: impl Into<String>, f: F)
    where
        F: Fn(&[u8], &[KernelTensor<'_>], &mut [KernelTensorMut<'_>]) -> Result<()>
            + Send
            + Sync
            + 'static,
    {
        self.kernels.write().register_fn(name, f);
    }

    /// Make the next `launch` fail with `ExecutionFailed`.
    pub fn fail_next_launch(&self) {
        self.fail_launch.store(true, Ordering::SeqCst);
    }

    /// Make the next host/device copy fail with `Transfer`.
    pub fn fail_next_transfer(&self) {
        self.fail_transfer.store(true, Ordering::SeqCst);
    }

    /// Number of live allocations.
    pub fn live_allocations(&self) -> usize {
        self.state.lock().regions.len()
    }

    fn take_transfer_fault(&self, what: &str) -> Result<()> {
        if self.fail_transfer.swap(false, Ordering::SeqCst) {
            warn!(op = what, "injected transfer fault");
            return Err(EngineError::Transfer(format!("{}: injected fault", what)));
        }
        Ok(())
    }

    fn check_bindings(state: &HostState, bindings: &[TensorBinding]) -> Result<()> {
        let mut seen = HashSet::new();
        for b in bindings {
            if !seen.insert(b.ptr) {
                return Err(EngineError::ExecutionFailed(format!(
                    "address {} bound to more than one tensor",
                    b.ptr
                )));
            }
            let region = state.regions.get(&b.ptr.0).ok_or_else(|| {
                EngineError::ExecutionFailed(format!(
                    "tensor '{}' bound to unknown address {}",
                    b.name, b.ptr
                ))
            })?;
            if b.bytes > region.len() {
                return Err(EngineError::ExecutionFailed(format!(
                    "tensor '{}' binding of {} bytes exceeds region of {} bytes",
                    b.name,
                    b.bytes,
                    region.len()
                )));
            }
        }
        Ok(())
    }
}

impl Default for HostDevice {
    fn default() -> Self {
        Self::new()
    }
}

impl Device for HostDevice {
    fn name(&self) -> &str {
        &self.name
    }

    fn is_gpu(&self) -> bool {
        false
    }

    fn malloc(&self, bytes: usize) -> Result<DevicePtr> {
        let mut state = self.state.lock();
        if let Some(limit) = self.limit {
            let available = limit.saturating_sub(state.in_use);
            if bytes > available {
                return Err(EngineError::OutOfMemory {
                    requested: bytes,
                    available,
                });
            }
        }

        let mut region = Vec::new();
        if region.try_reserve_exact(bytes).is_err() {
            warn!(bytes, "host arena cannot back allocation");
            return Err(EngineError::OutOfMemory {
                requested: bytes,
                available: self.limit.map_or(0, |limit| limit.saturating_sub(state.in_use)),
            });
        }
        region.resize(bytes, 0u8);

        let addr = state.next_addr;
        let span = (bytes as u64).max(1).div_ceil(ADDRESS_ALIGNMENT) * ADDRESS_ALIGNMENT;
        state.next_addr += span;
        state.regions.insert(addr, region);
        state.in_use += bytes;
        trace!(addr = %DevicePtr(addr), bytes, "malloc");
        Ok(DevicePtr(addr))
    }

    fn free(&self, ptr: DevicePtr) -> Result<()> {
        let mut state = self.state.lock();
        match state.regions.remove(&ptr.0) {
            Some(region) => {
                state.in_use -= region.len();
                trace!(addr = %ptr, bytes = region.len(), "free");
                Ok(())
            }
            None => Err(EngineError::Transfer(format!(
                "free of unknown address {}",
                ptr
            ))),
        }
    }

    fn memcpy_htod(&self, dst: DevicePtr, src: &[u8]) -> Result<()> {
        self.take_transfer_fault("memcpy_htod")?;
        let mut state = self.state.lock();
        let region = state
            .regions
            .get_mut(&dst.0)
            .ok_or_else(|| EngineError::Transfer(format!("copy to unknown address {}", dst)))?;
        if src.len() > region.len() {
            return Err(EngineError::Transfer(format!(
                "copy of {} bytes overflows region {} of {} bytes",
                src.len(),
                dst,
                region.len()
            )));
        }
        region[..src.len()].copy_from_slice(src);
        Ok(())
    }

    fn memcpy_dtoh(&self, dst: &mut [u8], src: DevicePtr) -> Result<()> {
        self.take_transfer_fault("memcpy_dtoh")?;
        let state = self.state.lock();
        let region = state
            .regions
            .get(&src.0)
            .ok_or_else(|| EngineError::Transfer(format!("copy from unknown address {}", src)))?;
        if dst.len() > region.len() {
            return Err(EngineError::Transfer(format!(
                "copy of {} bytes overruns region {} of {} bytes",
                dst.len(),
                src,
                region.len()
            )));
        }
        dst.copy_from_slice(&region[..dst.len()]);
        Ok(())
    }

    fn memset(&self, dst: DevicePtr, value: u8, bytes: usize) -> Result<()> {
        self.take_transfer_fault("memset")?;
        let mut state = self.state.lock();
        let region = state
            .regions
            .get_mut(&dst.0)
            .ok_or_else(|| EngineError::Transfer(format!("memset of unknown address {}", dst)))?;
        let n = bytes.min(region.len());
        region[..n].fill(value);
        Ok(())
    }

    fn create_stream(&self) -> Result<StreamHandle> {
        let mut state = self.state.lock();
        let id = state.next_stream;
        state.next_stream += 1;
        state.streams.insert(id);
        debug!(stream = id, "created stream");
        Ok(StreamHandle(id))
    }

    fn destroy_stream(&self, stream: StreamHandle) -> Result<()> {
        if self.state.lock().streams.remove(&stream.0) {
            debug!(stream = stream.0, "destroyed stream");
            Ok(())
        } else {
            Err(EngineError::ExecutionFailed(format!(
                "destroy of unknown stream {}",
                stream.0
            )))
        }
    }

    fn has_kernel(&self, kernel: &str) -> bool {
        self.kernels.read().contains(kernel)
    }

    fn launch(
        &self,
        stream: StreamHandle,
        kernel: &str,
        payload: &[u8],
        bindings: &[TensorBinding],
    ) -> Result<()> {
        if self.fail_launch.swap(false, Ordering::SeqCst) {
            warn!(kernel, "injected launch fault");
            return Err(EngineError::ExecutionFailed(format!(
                "kernel '{}': injected fault",
                kernel
            )));
        }

        let body = self
            .kernels
            .read()
            .get(kernel)
            .ok_or_else(|| EngineError::KernelNotFound(kernel.to_string()))?;

        let mut state = self.state.lock();
        if !state.streams.contains(&stream.0) {
            return Err(EngineError::ExecutionFailed(format!(
                "launch on unknown stream {}",
                stream.0
            )));
        }
        Self::check_bindings(&state, bindings)?;

        // Outputs are moved out of the arena so inputs can be borrowed alongside them.
        let mut taken = Vec::new();
        for b in bindings
            .iter()
            .filter(|b| b.direction == TensorDirection::Output)
        {
            if let Some(region) = state.regions.remove(&b.ptr.0) {
                taken.push((b, region));
            }
        }

        let result = {
            let regions = &state.regions;
            let inputs: Vec<KernelTensor<'_>> = bindings
                .iter()
                .filter(|b| b.direction == TensorDirection::Input)
                .filter_map(|b| {
                    regions.get(&b.ptr.0).map(|r| KernelTensor {
                        name: &b.name,
                        dtype: b.dtype,
                        shape: &b.shape,
                        data: &r[..b.bytes],
                    })
                })
                .collect();
            let mut outputs: Vec<KernelTensorMut<'_>> = taken
                .iter_mut()
                .map(|(b, region)| KernelTensorMut {
                    name: &b.name,
                    dtype: b.dtype,
                    shape: &b.shape,
                    data: &mut region[..b.bytes],
                })
                .collect();
            body.run(payload, &inputs, &mut outputs)
        };

        for (b, region) in taken {
            state.regions.insert(b.ptr.0, region);
        }

        trace!(kernel, stream = stream.0, "launch complete");
        result.map_err(|e| match e {
            EngineError::ExecutionFailed(msg) => EngineError::ExecutionFailed(msg),
            other => EngineError::ExecutionFailed(format!("kernel '{}': {}", kernel, other)),
        })
    }

    fn synchronize(&self, stream: StreamHandle) -> Result<()> {
        if self.state.lock().streams.contains(&stream.0) {
            Ok(())
        } else {
            Err(EngineError::ExecutionFailed(format!(
                "synchronize on unknown stream {}",
                stream.0
            )))
        }
    }

    fn memory_in_use(&self) -> usize {
        self.state.lock().in_use
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ib_tensor::{ElementType, Shape};

    fn binding(name: &str, ptr: DevicePtr, bytes: usize, direction: TensorDirection) -> TensorBinding {
        TensorBinding {
            name: name.to_string(),
            ptr,
            bytes,
            direction,
            dtype: ElementType::F32,
            shape: Shape::new(vec![bytes / 4]),
        }
    }

    #[test]
    fn test_malloc_free_accounting() {
        let dev = HostDevice::new();
        let a = dev.malloc(100).unwrap();
        let b = dev.malloc(4).unwrap();
        assert_ne!(a, b);
        assert_eq!(b.0 % ADDRESS_ALIGNMENT, 0);
        assert_eq!(dev.memory_in_use(), 104);
        dev.free(a).unwrap();
        assert_eq!(dev.memory_in_use(), 4);
        assert!(dev.free(a).is_err());
        dev.free(b).unwrap();
        assert_eq!(dev.live_allocations(), 0);
    }

    #[test]
    fn test_memory_limit() {
        let dev = HostDevice::new().with_memory_limit(64);
        let a = dev.malloc(48).unwrap();
        let err = dev.malloc(32).unwrap_err();
        assert!(matches!(
            err,
            EngineError::OutOfMemory {
                requested: 32,
                available: 16
            }
        ));
        dev.free(a).unwrap();
        assert!(dev.malloc(64).is_ok());
    }

    #[test]
    fn test_unbackable_malloc_is_out_of_memory() {
        let dev = HostDevice::new();
        let err = dev.malloc(1usize << 46).unwrap_err();
        assert!(matches!(
            err,
            EngineError::OutOfMemory {
                requested,
                ..
            } if requested == 1usize << 46
        ));
        assert_eq!(dev.memory_in_use(), 0);
        assert_eq!(dev.live_allocations(), 0);
        assert!(dev.malloc(16).is_ok());
    }

    #[test]
    fn test_copy_bounds() {
        let dev = HostDevice::new();
        let p = dev.malloc(4).unwrap();
        dev.memcpy_htod(p, &[1, 2]).unwrap();
        let mut out = [0u8; 4];
        dev.memcpy_dtoh(&mut out, p).unwrap();
        assert_eq!(out, [1, 2, 0, 0]);
        assert!(matches!(
            dev.memcpy_htod(p, &[0; 5]),
            Err(EngineError::Transfer(_))
        ));
        let mut big = [0u8; 8];
        assert!(dev.memcpy_dtoh(&mut big, p).is_err());
    }

    #[test]
    fn test_launch_identity() {
        let dev = HostDevice::new();
        let stream = dev.create_stream().unwrap();
        let x = dev.malloc(8).unwrap();
        let y = dev.malloc(8).unwrap();
        dev.memcpy_htod(x, &[1, 2, 3, 4, 5, 6, 7, 8]).unwrap();

        let bindings = vec![
            binding("x", x, 8, TensorDirection::Input),
            binding("y", y, 8, TensorDirection::Output),
        ];
        dev.launch(stream, "identity", &[], &bindings).unwrap();
        dev.synchronize(stream).unwrap();

        let mut out = [0u8; 8];
        dev.memcpy_dtoh(&mut out, y).unwrap();
        assert_eq!(out, [1, 2, 3, 4, 5, 6, 7, 8]);
        assert_eq!(dev.live_allocations(), 2);
        dev.destroy_stream(stream).unwrap();
    }

    #[test]
    fn test_injected_faults() {
        let dev = HostDevice::new();
        let stream = dev.create_stream().unwrap();
        let y = dev.malloc(4).unwrap();
        let bindings = vec![binding("y", y, 4, TensorDirection::Output)];

        dev.fail_next_launch();
        let err = dev.launch(stream, "zeros", &[], &bindings).unwrap_err();
        assert!(err.is_device_error());
        dev.launch(stream, "zeros", &[], &bindings).unwrap();

        dev.fail_next_transfer();
        assert!(matches!(
            dev.memcpy_htod(y, &[1]),
            Err(EngineError::Transfer(_))
        ));
        dev.memcpy_htod(y, &[1]).unwrap();

        dev.fail_next_transfer();
        assert!(matches!(
            dev.memset(y, 0, 4),
            Err(EngineError::Transfer(_))
        ));
        dev.memset(y, 0, 4).unwrap();
    }

    #[test]
    fn test_launch_unknown_kernel() {
        let dev = HostDevice::new();
        let stream = dev.create_stream().unwrap();
        let err = dev.launch(stream, "conv_net", &[], &[]).unwrap_err();
        assert!(matches!(err, EngineError::KernelNotFound(_)));
    }

    #[test]
    fn test_kernel_error_becomes_execution_failure() {
        let dev = HostDevice::new();
        dev.register_kernel("broken", |_, _, _| {
            Err(EngineError::Other("bad payload".to_string()))
        });
        let stream = dev.create_stream().unwrap();
        let err = dev.launch(stream, "broken", &[], &[]).unwrap_err();
        assert!(matches!(err, EngineError::ExecutionFailed(msg) if msg.contains("bad payload")));
    }
}
