#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::sync::Arc;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use ib_engine::device::{Device, HostDevice};
use ib_engine::format::EngineWriter;
use ib_engine::{BackendConfig, EngineError};
use ib_tensor::{element, DataType, Dim};

pub const CLASSES: usize = 1000;
pub const IMAGE: [usize; 3] = [3, 224, 224];
pub const IMAGE_ELEMS: usize = 3 * 224 * 224;

pub fn batch() -> Dim {
    Dim::Dynamic("batch".to_string())
}

/// Host device with every kernel the test engines use.
pub fn test_device() -> Arc<HostDevice> {
    let device = HostDevice::new();

    // logits[b][j] = mean(input[b]) + j / 1000
    device.register_kernel("classifier", |_, inputs, outputs| {
        let values = element::f32_values(inputs[0].data);
        let batch = inputs[0].shape.dim(0);
        let row = values.len() / batch;
        let classes = outputs[0].shape.dim(1);
        let mut logits = Vec::with_capacity(batch * classes);
        for b in 0..batch {
            let mean = values[b * row..(b + 1) * row].iter().sum::<f32>() / row as f32;
            logits.extend((0..classes).map(|j| mean + j as f32 / 1000.0));
        }
        outputs[0].data.copy_from_slice(&element::encode_f32(&logits));
        Ok(())
    });

    // half-precision copy of input * 0.5
    device.register_kernel("half_head", |_, inputs, outputs| {
        let halved: Vec<f32> = element::f32_values(inputs[0].data)
            .iter()
            .map(|v| v * 0.5)
            .collect();
        outputs[0].data.copy_from_slice(&element::encode_f16(&halved));
        Ok(())
    });

    // per row: index of the maximum (i32) and the row length (i64)
    device.register_kernel("argmax", |_, inputs, outputs| {
        let values = element::f32_values(inputs[0].data);
        let batch = inputs[0].shape.dim(0);
        let row = values.len() / batch;
        let mut index = Vec::with_capacity(batch);
        for b in 0..batch {
            let slice = &values[b * row..(b + 1) * row];
            let best = slice
                .iter()
                .enumerate()
                .fold(0, |best, (i, v)| if *v > slice[best] { i } else { best });
            index.push(best as i32);
        }
        outputs[0].data.copy_from_slice(&element::encode_i32(&index));
        outputs[1].data.copy_from_slice(&element::encode_i64(&vec![row as i64; batch]));
        Ok(())
    });

    // sum = a + b
    device.register_kernel("pair_sum", |_, inputs, outputs| {
        let a = element::f32_values(inputs[0].data);
        let b = element::f32_values(inputs[1].data);
        if a.len() != b.len() {
            return Err(EngineError::ExecutionFailed("operand lengths differ".to_string()));
        }
        let sum: Vec<f32> = a.iter().zip(&b).map(|(x, y)| x + y).collect();
        outputs[0].data.copy_from_slice(&element::encode_f32(&sum));
        Ok(())
    });

    Arc::new(device)
}

pub fn as_device(host: &Arc<HostDevice>) -> Arc<dyn Device> {
    host.clone()
}

/// `input [batch, 3, 224, 224] f32 -> logits [batch, 1000] f32`
pub fn write_classifier(dir: &Path) -> PathBuf {
    let path = dir.join("classifier.ibe");
    EngineWriter::new("classifier")
        .input(
            "input",
            DataType::F32,
            vec![batch(), Dim::Fixed(3), Dim::Fixed(224), Dim::Fixed(224)],
        )
        .unwrap()
        .output("logits", DataType::F32, vec![batch(), Dim::Fixed(CLASSES)])
        .unwrap()
        .payload(vec![0xAB; 64])
        .write_to(&path)
        .unwrap();
    path
}

/// `x [batch, 4] f32 -> y [batch, 4] f16`
pub fn write_half_head(dir: &Path) -> PathBuf {
    let path = dir.join("half_head.ibe");
    EngineWriter::new("half_head")
        .input("x", DataType::F32, vec![batch(), Dim::Fixed(4)])
        .unwrap()
        .output("y", DataType::F16, vec![batch(), Dim::Fixed(4)])
        .unwrap()
        .write_to(&path)
        .unwrap();
    path
}

/// `scores [batch, classes] f32 -> index [batch] i32, width [batch] i64`
pub fn write_argmax(dir: &Path) -> PathBuf {
    let path = dir.join("argmax.ibe");
    EngineWriter::new("argmax")
        .output("index", DataType::I32, vec![batch()])
        .unwrap()
        .input(
            "scores",
            DataType::F32,
            vec![batch(), Dim::Dynamic("classes".to_string())],
        )
        .unwrap()
        .output("width", DataType::I64, vec![batch()])
        .unwrap()
        .write_to(&path)
        .unwrap();
    path
}

/// `a [2, 8] f32, b [2, 8] f32 -> sum [2, 8] f32`, fully static.
pub fn write_pair_sum(dir: &Path) -> PathBuf {
    let path = dir.join("pair_sum.ibe");
    EngineWriter::new("pair_sum")
        .input("a", DataType::F32, vec![Dim::Fixed(2), Dim::Fixed(8)])
        .unwrap()
        .input("b", DataType::F32, vec![Dim::Fixed(2), Dim::Fixed(8)])
        .unwrap()
        .output("sum", DataType::F32, vec![Dim::Fixed(2), Dim::Fixed(8)])
        .unwrap()
        .write_to(&path)
        .unwrap();
    path
}

pub fn classifier_config(path: &Path) -> BackendConfig {
    BackendConfig::new(path)
        .with_batch_size(1)
        .with_input_sizes(vec![IMAGE.iter().map(|&d| d as i64).collect()])
}

/// Seeded random f32 input of `n` elements, as bytes.
pub fn random_f32_bytes(seed: u64, n: usize) -> Vec<u8> {
    let mut rng = StdRng::seed_from_u64(seed);
    let values: Vec<f32> = (0..n).map(|_| rng.gen_range(-1.0..1.0)).collect();
    element::encode_f32(&values)
}
