//! Host <-> device copies of tensor data.

use std::sync::Arc;

use tracing::{trace, warn};

use ib_tensor::{element, Shape, TensorElement};

use crate::allocator::{required_bytes, DeviceBuffer};
use crate::config::InputSizePolicy;
use crate::device::Device;
use crate::error::{EngineError, Result};
use crate::registry::TensorRegistry;

/// Copies caller inputs into device buffers and decodes outputs.
#[derive(Debug, Clone)]
pub struct Marshaller {
    device: Arc<dyn Device>,
    policy: InputSizePolicy,
}

impl Marshaller {
    pub fn new(device: Arc<dyn Device>, policy: InputSizePolicy) -> Self {
        Marshaller { device, policy }
    }

    pub fn policy(&self) -> InputSizePolicy {
        self.policy
    }

    /// Check `inputs` against the resolved input tensors without touching
    /// the device. Returns the expected byte size of each input.
    pub fn validate_inputs(
        &self,
        registry: &TensorRegistry,
        shapes: &[Shape],
        inputs: &[Vec<u8>],
    ) -> Result<Vec<usize>> {
        if inputs.len() != registry.num_inputs() {
            return Err(EngineError::InputCountMismatch {
                expected: registry.num_inputs(),
                got: inputs.len(),
            });
        }

        let mut expected = Vec::with_capacity(inputs.len());
        for ((desc, shape), data) in registry.inputs().iter().zip(shapes).zip(inputs) {
            let bytes = required_bytes(desc, shape)?;
            if data.len() != bytes && self.policy == InputSizePolicy::Strict {
                return Err(EngineError::InputSizeMismatch {
                    tensor: desc.name.clone(),
                    expected: bytes,
                    got: data.len(),
                });
            }
            expected.push(bytes);
        }
        Ok(expected)
    }

    /// Copy every input into its buffer. `expected` comes from
    /// `validate_inputs`.
    pub fn upload(
        &self,
        registry: &TensorRegistry,
        buffers: &[DeviceBuffer],
        inputs: &[Vec<u8>],
        expected: &[usize],
    ) -> Result<()> {
        for (((desc, buffer), data), &bytes) in registry
            .inputs()
            .iter()
            .zip(buffers)
            .zip(inputs)
            .zip(expected)
        {
            let ptr = buffer.ptr();
            if data.len() == bytes {
                self.device.memcpy_htod(ptr, data)?;
            } else {
                warn!(
                    tensor = %desc.name,
                    expected = bytes,
                    got = data.len(),
                    "input size mismatch, copying what fits and zero-filling"
                );
                let n = data.len().min(bytes);
                if n < bytes {
                    self.device.memset(ptr, 0, bytes)?;
                }
                self.device.memcpy_htod(ptr, &data[..n])?;
            }
            trace!(tensor = %desc.name, bytes, "uploaded input");
        }
        Ok(())
    }

    /// Copy every output back and decode it by element type.
    ///
    /// Returns values and shapes (batch axis included) in output order.
    pub fn download(
        &self,
        registry: &TensorRegistry,
        buffers: &[DeviceBuffer],
        shapes: &[Shape],
    ) -> Result<(Vec<Vec<TensorElement>>, Vec<Vec<i64>>)> {
        let num_inputs = registry.num_inputs();
        let mut outputs = Vec::with_capacity(registry.num_outputs());
        let mut out_shapes = Vec::with_capacity(registry.num_outputs());

        for (desc, (buffer, shape)) in registry
            .outputs()
            .iter()
            .zip(buffers[num_inputs..].iter().zip(&shapes[num_inputs..]))
        {
            let elem = desc.element_type()?;
            let bytes = required_bytes(desc, shape)?;
            let mut host = vec![0u8; bytes];
            self.device.memcpy_dtoh(&mut host, buffer.ptr())?;
            let values = element::decode(elem, &host)?;
            trace!(tensor = %desc.name, elements = values.len(), "downloaded output");
            outputs.push(values);
            out_shapes.push(shape.to_i64_vec());
        }
        Ok((outputs, out_shapes))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::allocator::BufferAllocator;
    use crate::device::HostDevice;
    use crate::registry::{TensorDescriptor, TensorDirection};
    use ib_tensor::{DataType, DeclaredShape};

    fn setup(
        policy: InputSizePolicy,
    ) -> (Marshaller, TensorRegistry, Vec<DeviceBuffer>, Vec<Shape>, Arc<HostDevice>) {
        let host = Arc::new(HostDevice::new());
        let device: Arc<dyn Device> = host.clone();
        let registry = TensorRegistry::new(vec![
            TensorDescriptor {
                name: "x".into(),
                direction: TensorDirection::Input,
                dtype: DataType::F32,
                shape: DeclaredShape::fixed(&[1, 4]).unwrap(),
            },
            TensorDescriptor {
                name: "y".into(),
                direction: TensorDirection::Output,
                dtype: DataType::F16,
                shape: DeclaredShape::fixed(&[1, 4]).unwrap(),
            },
        ])
        .unwrap();
        let shapes = vec![Shape::new(vec![1, 4]), Shape::new(vec![1, 4])];
        let buffers = BufferAllocator::new(Arc::clone(&device))
            .allocate_all(&registry, &shapes)
            .unwrap();
        (Marshaller::new(device, policy), registry, buffers, shapes, host)
    }

    #[test]
    fn test_count_mismatch() {
        let (m, registry, buffers, shapes, host) = setup(InputSizePolicy::Strict);
        host.fail_next_transfer();
        let err = m.validate_inputs(&registry, &shapes, &[]).unwrap_err();
        assert!(matches!(err, EngineError::InputCountMismatch { expected: 1, got: 0 }));
        // validation never reached the device, so the injected fault is still armed
        assert!(host.memcpy_htod(buffers[0].ptr(), &[]).is_err());
    }

    #[test]
    fn test_strict_size_mismatch() {
        let (m, registry, _, shapes, _) = setup(InputSizePolicy::Strict);
        let err = m
            .validate_inputs(&registry, &shapes, &[vec![0u8; 8]])
            .unwrap_err();
        assert!(matches!(
            err,
            EngineError::InputSizeMismatch {
                expected: 16,
                got: 8,
                ..
            }
        ));
    }

    #[test]
    fn test_lenient_zero_fills() {
        let (m, registry, buffers, shapes, host) = setup(InputSizePolicy::Lenient);
        let input = element::encode_f32(&[1.0, 2.0]);
        let expected = m.validate_inputs(&registry, &shapes, &[input.clone()]).unwrap();
        assert_eq!(expected, vec![16]);

        let ptr = buffers[0].ptr();
        host.memcpy_htod(ptr, &[0xff; 16]).unwrap();
        m.upload(&registry, &buffers, &[input], &expected).unwrap();

        let mut back = [0u8; 16];
        host.memcpy_dtoh(&mut back, ptr).unwrap();
        assert_eq!(element::f32_values(&back), vec![1.0, 2.0, 0.0, 0.0]);
    }

    #[test]
    fn test_download_widens_f16() {
        let (m, registry, buffers, shapes, host) = setup(InputSizePolicy::Strict);
        let half = element::encode_f16(&[0.5, -1.0, 2.0, 0.25]);
        host.memcpy_htod(buffers[1].ptr(), &half).unwrap();

        let (outputs, out_shapes) = m.download(&registry, &buffers, &shapes).unwrap();
        assert_eq!(out_shapes, vec![vec![1, 4]]);
        let values: Vec<f32> = outputs[0].iter().filter_map(TensorElement::as_f32).collect();
        assert_eq!(values, vec![0.5, -1.0, 2.0, 0.25]);
    }
}
