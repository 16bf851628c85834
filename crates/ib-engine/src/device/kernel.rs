use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use ib_tensor::{ElementType, Shape};

use crate::error::Result;

/// Read-only host view of an input buffer during a launch.
#[derive(Debug)]
pub struct KernelTensor<'a> {
    pub name: &'a str,
    pub dtype: ElementType,
    pub shape: &'a Shape,
    pub data: &'a [u8],
}

/// Writable host view of an output buffer during a launch.
#[derive(Debug)]
pub struct KernelTensorMut<'a> {
    pub name: &'a str,
    pub dtype: ElementType,
    pub shape: &'a Shape,
    pub data: &'a mut [u8],
}

/// Executable body of a compiled graph on the host device.
///
/// `payload` is the engine file's opaque payload. Inputs and outputs arrive
/// in binding order.
pub trait Kernel: Send + Sync {
    fn run(
        &self,
        payload: &[u8],
        inputs: &[KernelTensor<'_>],
        outputs: &mut [KernelTensorMut<'_>],
    ) -> Result<()>;
}

struct FnKernel<F>(F);

impl<F> Kernel for FnKernel<F>
where
    F: Fn(&[u8], &[KernelTensor<'_>], &mut [KernelTensorMut<'_>]) -> Result<()> + Send + Sync,
{
    fn run(
        &self,
        payload: &[u8],
        inputs: &[KernelTensor<'_>],
        outputs: &mut [KernelTensorMut<'_>],
    ) -> Result<()> {
        (self.0)(payload, inputs, outputs)
    }
}

/// Kernels available to a device, keyed by entry point name.
#[derive(Clone, Default)]
pub struct KernelRegistry {
    kernels: HashMap<String, Arc<dyn Kernel>>,
}

impl KernelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the `identity` and `zeros` kernels.
    ///
    /// `identity` copies input `i` into output `i` (truncating or
    /// zero-padding); `zeros` clears every output.
    pub fn with_builtins() -> Self {
        let mut reg = Self::new();
        reg.register_fn("identity", |_, inputs, outputs| {
            for (i, out) in outputs.iter_mut().enumerate() {
                out.data.fill(0);
                if let Some(src) = inputs.get(i) {
                    let n = src.data.len().min(out.data.len());
                    out.data[..n].copy_from_slice(&src.data[..n]);
                }
            }
            Ok(())
        });
        reg.register_fn("zeros", |_, _, outputs| {
            for out in outputs.iter_mut() {
                out.data.fill(0);
            }
            Ok(())
        });
        reg
    }

    pub fn register(&mut self, name: impl Into<String>, kernel: Arc<dyn Kernel>) {
        self.kernels.insert(name.into(), kernel);
    }

    /// Register a closure as a kernel.
    pub fn register_fn<F>(&mut self, name: impl Into<String>, f: F)
    where
        F: Fn(&[u8], &[KernelTensor<'_>], &mut [KernelTensorMut<'_>]) -> Result<()>
            + Send
            + Sync
            + 'static,
    {
        self.register(name, Arc::new(FnKernel(f)));
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Kernel>> {
        self.kernels.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.kernels.contains_key(name)
    }

    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<_> = self.kernels.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

impl fmt::Debug for KernelRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KernelRegistry")
            .field("kernels", &self.names())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtins_registered() {
        let reg = KernelRegistry::with_builtins();
        assert_eq!(reg.names(), vec!["identity", "zeros"]);
        assert!(reg.get("missing").is_none());
    }

    #[test]
    fn test_identity_pads_with_zeros() {
        let reg = KernelRegistry::with_builtins();
        let kernel = reg.get("identity").unwrap();
        let shape = Shape::new(vec![2]);
        let input = [1u8, 2, 3, 4];
        let mut out = [9u8; 8];
        let inputs = [KernelTensor {
            name: "x",
            dtype: ElementType::F16,
            shape: &shape,
            data: &input,
        }];
        let mut outputs = [KernelTensorMut {
            name: "y",
            dtype: ElementType::F32,
            shape: &shape,
            data: &mut out,
        }];
        kernel.run(&[], &inputs, &mut outputs).unwrap();
        assert_eq!(out, [1, 2, 3, 4, 0, 0, 0, 0]);
    }
}
