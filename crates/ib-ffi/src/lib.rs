mod context;
mod error;
mod types;

pub use context::*;
pub use error::*;
pub use types::*;

use std::ffi::{CStr, CString};
use std::os::raw::c_char;
use std::path::PathBuf;
use std::slice;

use ib_engine::logging::init_logging;
use ib_engine::{BackendConfig, BackendKind, InputSizePolicy, LogFormat, LoggingConfig};
use ib_tensor::TensorElement;

/// Execute a closure that returns an `IBStatus`, catching any panics
/// and converting them into `IBStatus::ErrorInternal`.
fn catch_panic<F: FnOnce() -> IBStatus>(f: F) -> IBStatus {
    match std::panic::catch_unwind(std::panic::AssertUnwindSafe(f)) {
        Ok(status) => status,
        Err(_) => {
            set_last_error("internal panic".to_string());
            IBStatus::ErrorInternal
        }
    }
}

fn invalid(msg: &str) -> IBStatus {
    set_last_error(msg.to_string());
    IBStatus::ErrorInvalidArgument
}

unsafe fn read_str<'a>(ptr: *const c_char, what: &str) -> Result<&'a str, IBStatus> {
    CStr::from_ptr(ptr)
        .to_str()
        .map_err(|e| invalid(&format!("invalid {}: {}", what, e)))
}

/// Split the flattened `input_dims` array into one size list per input.
unsafe fn read_input_sizes(params: &IBBackendParams) -> Result<Vec<Vec<i64>>, IBStatus> {
    if params.n_inputs == 0 {
        return Ok(Vec::new());
    }
    if params.input_ranks.is_null() {
        return Err(invalid("input_ranks is null"));
    }
    let ranks = slice::from_raw_parts(params.input_ranks, params.n_inputs);
    let total: usize = ranks.iter().sum();
    if total > 0 && params.input_dims.is_null() {
        return Err(invalid("input_dims is null"));
    }
    let dims = if total == 0 {
        &[][..]
    } else {
        slice::from_raw_parts(params.input_dims, total)
    };

    let mut sizes = Vec::with_capacity(ranks.len());
    let mut offset = 0;
    for &rank in ranks {
        sizes.push(dims[offset..offset + rank].to_vec());
        offset += rank;
    }
    Ok(sizes)
}

fn finish_create(config: &BackendConfig, backend_out: *mut *mut IBBackend) -> IBStatus {
    match ib_engine::setup_inference_engine(config) {
        Ok(inner) => {
            unsafe {
                *backend_out = Box::into_raw(Box::new(IBBackend::new(inner)));
            }
            IBStatus::Ok
        }
        Err(e) => report(e),
    }
}

/// Create a backend for the engine file at `model_path`.
///
/// `params` may be null to use the defaults (GPU engine, batch size 1, no
/// input sizes, strict input lengths). `model_path` may be null only for the
/// mock backend. On success writes a heap-allocated handle into
/// `*backend_out`; release it with `ib_backend_destroy`.
#[no_mangle]
pub unsafe extern "C" fn ib_backend_create(
    model_path: *const c_char,
    params: *const IBBackendParams,
    backend_out: *mut *mut IBBackend,
) -> IBStatus {
    catch_panic(|| {
        if backend_out.is_null() {
            return invalid("backend_out is null");
        }
        let params = if params.is_null() {
            IBBackendParams::default()
        } else {
            unsafe { (*params).clone() }
        };

        let kind = match params.kind {
            IBBackendKind::GpuEngine => BackendKind::GpuEngine,
            IBBackendKind::Mock => BackendKind::Mock,
        };
        let path = if model_path.is_null() {
            if kind == BackendKind::GpuEngine {
                return invalid("model_path is null");
            }
            PathBuf::new()
        } else {
            match unsafe { read_str(model_path, "model path") } {
                Ok(s) => PathBuf::from(s),
                Err(status) => return status,
            }
        };
        let input_sizes = match unsafe { read_input_sizes(&params) } {
            Ok(sizes) => sizes,
            Err(status) => return status,
        };
        let policy = if params.lenient_input_size {
            InputSizePolicy::Lenient
        } else {
            InputSizePolicy::Strict
        };

        let config = BackendConfig::new(path)
            .with_kind(kind)
            .with_use_gpu(params.use_gpu)
            .with_batch_size(params.batch_size)
            .with_input_sizes(input_sizes)
            .with_input_size_policy(policy);
        finish_create(&config, backend_out)
    })
}

/// Create a backend from a TOML configuration file, with `IB_*` environment
/// overrides applied.
#[no_mangle]
pub unsafe extern "C" fn ib_backend_create_from_config(
    config_path: *const c_char,
    backend_out: *mut *mut IBBackend,
) -> IBStatus {
    catch_panic(|| {
        if config_path.is_null() || backend_out.is_null() {
            return invalid("null argument");
        }
        let path = match unsafe { read_str(config_path, "config path") } {
            Ok(s) => PathBuf::from(s),
            Err(status) => return status,
        };
        match BackendConfig::load(&path) {
            Ok(config) => finish_create(&config, backend_out),
            Err(e) => report(e),
        }
    })
}

/// Destroy a backend, releasing its device buffers.
///
/// Passing a null pointer is a no-op and returns `IBStatus::Ok`.
#[no_mangle]
pub unsafe extern "C" fn ib_backend_destroy(backend: *mut IBBackend) -> IBStatus {
    if backend.is_null() {
        return IBStatus::Ok;
    }
    drop(Box::from_raw(backend));
    IBStatus::Ok
}

/// Run one inference.
///
/// `inputs` holds `n_inputs` byte buffers in input-ordinal order. On success
/// writes a result handle into `*result_out`; release it with
/// `ib_result_destroy`.
#[no_mangle]
pub unsafe extern "C" fn ib_backend_infer(
    backend: *mut IBBackend,
    inputs: *const IBInputBuffer,
    n_inputs: usize,
    result_out: *mut *mut IBInferResult,
) -> IBStatus {
    catch_panic(|| {
        if backend.is_null() || result_out.is_null() {
            return invalid("null argument");
        }
        if n_inputs > 0 && inputs.is_null() {
            return invalid("inputs is null");
        }
        let backend = unsafe { &mut *backend };

        let buffers = if n_inputs == 0 {
            &[][..]
        } else {
            unsafe { slice::from_raw_parts(inputs, n_inputs) }
        };
        let mut owned = Vec::with_capacity(buffers.len());
        for (i, buf) in buffers.iter().enumerate() {
            if buf.len == 0 {
                owned.push(Vec::new());
            } else if buf.data.is_null() {
                return invalid(&format!("input {} data is null", i));
            } else {
                owned.push(unsafe { slice::from_raw_parts(buf.data, buf.len) }.to_vec());
            }
        }

        match backend.inner.infer(&owned) {
            Ok(output) => {
                unsafe {
                    *result_out = Box::into_raw(Box::new(IBInferResult::new(output)));
                }
                IBStatus::Ok
            }
            Err(e) => report(e),
        }
    })
}

/// Number of model inputs.
#[no_mangle]
pub unsafe extern "C" fn ib_backend_num_inputs(backend: *const IBBackend, out: *mut usize) -> IBStatus {
    catch_panic(|| {
        if backend.is_null() || out.is_null() {
            return invalid("null argument");
        }
        unsafe { *out = (*backend).inner.model_info().inputs.len() };
        IBStatus::Ok
    })
}

/// Number of model outputs.
#[no_mangle]
pub unsafe extern "C" fn ib_backend_num_outputs(backend: *const IBBackend, out: *mut usize) -> IBStatus {
    catch_panic(|| {
        if backend.is_null() || out.is_null() {
            return invalid("null argument");
        }
        unsafe { *out = (*backend).inner.model_info().outputs.len() };
        IBStatus::Ok
    })
}

/// Describe the model's inputs and outputs as a JSON string.
///
/// The string must be freed with `ib_free_string`.
#[no_mangle]
pub unsafe extern "C" fn ib_backend_model_info_json(
    backend: *const IBBackend,
    json_out: *mut *mut c_char,
) -> IBStatus {
    catch_panic(|| {
        if backend.is_null() || json_out.is_null() {
            return invalid("null argument");
        }
        let info = unsafe { (*backend).inner.model_info() };
        let json = match serde_json::to_string(&info) {
            Ok(j) => j,
            Err(e) => {
                set_last_error(format!("failed to serialize model info: {}", e));
                return IBStatus::ErrorInternal;
            }
        };
        match CString::new(json) {
            Ok(c) => {
                unsafe { *json_out = c.into_raw() };
                IBStatus::Ok
            }
            Err(e) => {
                set_last_error(format!("model info contains NUL: {}", e));
                IBStatus::ErrorInternal
            }
        }
    })
}

#[no_mangle]
pub unsafe extern "C" fn ib_backend_stats(backend: *const IBBackend, stats_out: *mut IBStats) -> IBStatus {
    catch_panic(|| {
        if backend.is_null() || stats_out.is_null() {
            return invalid("null argument");
        }
        let backend = unsafe { &*backend };
        let stats = backend.inner.stats();
        unsafe {
            *stats_out = IBStats {
                total_inferences: stats.total_inferences,
                failed_inferences: stats.failed_inferences,
                last_inference_time_ms: stats.last_inference_time_ms,
                average_inference_time_ms: stats.average_inference_time_ms(),
                memory_usage_bytes: backend.inner.memory_usage_bytes(),
            };
        }
        IBStatus::Ok
    })
}

/// False once a device failure has made the backend unusable, or for a null handle.
#[no_mangle]
pub unsafe extern "C" fn ib_backend_is_usable(backend: *const IBBackend) -> bool {
    !backend.is_null() && (*backend).inner.is_usable()
}

#[no_mangle]
pub unsafe extern "C" fn ib_backend_clear_cache(backend: *mut IBBackend) -> IBStatus {
    catch_panic(|| {
        if backend.is_null() {
            return invalid("backend is null");
        }
        unsafe { (*backend).inner.clear_cache() };
        IBStatus::Ok
    })
}

/// Destroy a result. Passing a null pointer is a no-op.
#[no_mangle]
pub unsafe extern "C" fn ib_result_destroy(result: *mut IBInferResult) {
    if !result.is_null() {
        drop(Box::from_raw(result));
    }
}

#[no_mangle]
pub unsafe extern "C" fn ib_result_num_outputs(result: *const IBInferResult) -> usize {
    if result.is_null() {
        return 0;
    }
    (*result).output.len()
}

/// Element count and type of output `index`.
#[no_mangle]
pub unsafe extern "C" fn ib_result_output_info(
    result: *const IBInferResult,
    index: usize,
    len_out: *mut usize,
    type_out: *mut IBElementType,
) -> IBStatus {
    catch_panic(|| {
        if result.is_null() || len_out.is_null() || type_out.is_null() {
            return invalid("null argument");
        }
        let result = unsafe { &*result };
        let Some(elem) = result.element_type(index) else {
            return invalid(&format!("output index {} out of range", index));
        };
        unsafe {
            *len_out = result.output.outputs[index].len();
            *type_out = elem;
        }
        IBStatus::Ok
    })
}

/// Copy the shape of output `index` into `dims`, writing the rank to `rank_out`.
///
/// Fails with `ErrorInvalidArgument` when `capacity` is smaller than the rank;
/// `rank_out` is still written so the caller can retry.
#[no_mangle]
pub unsafe extern "C" fn ib_result_shape(
    result: *const IBInferResult,
    index: usize,
    dims: *mut i64,
    capacity: usize,
    rank_out: *mut usize,
) -> IBStatus {
    catch_panic(|| {
        if result.is_null() || rank_out.is_null() {
            return invalid("null argument");
        }
        let result = unsafe { &*result };
        let Some(shape) = result.output.shapes.get(index) else {
            return invalid(&format!("output index {} out of range", index));
        };
        unsafe { *rank_out = shape.len() };
        copy_out(shape, dims, capacity)
    })
}

fn copy_out<T: Copy>(values: &[T], dst: *mut T, capacity: usize) -> IBStatus {
    if capacity < values.len() {
        return invalid(&format!(
            "buffer holds {} elements, {} needed",
            capacity,
            values.len()
        ));
    }
    if values.is_empty() {
        return IBStatus::Ok;
    }
    if dst.is_null() {
        return invalid("destination is null");
    }
    unsafe { std::ptr::copy_nonoverlapping(values.as_ptr(), dst, values.len()) };
    IBStatus::Ok
}

fn copy_output<T: Copy>(
    result: *const IBInferResult,
    index: usize,
    dst: *mut T,
    capacity: usize,
    extract: fn(&TensorElement) -> Option<T>,
) -> IBStatus {
    if result.is_null() {
        return invalid("result is null");
    }
    let result = unsafe { &*result };
    let Some(values) = result.output.outputs.get(index) else {
        return invalid(&format!("output index {} out of range", index));
    };
    let converted: Option<Vec<T>> = values.iter().map(extract).collect();
    match converted {
        Some(v) => copy_out(&v, dst, capacity),
        None => invalid(&format!(
            "output {} has element type {:?}",
            index,
            result.element_type(index)
        )),
    }
}

/// Copy an f32 output (including widened f16 outputs) into `dst`.
#[no_mangle]
pub unsafe extern "C" fn ib_result_copy_f32(
    result: *const IBInferResult,
    index: usize,
    dst: *mut f32,
    capacity: usize,
) -> IBStatus {
    catch_panic(|| copy_output(result, index, dst, capacity, TensorElement::as_f32))
}

#[no_mangle]
pub unsafe extern "C" fn ib_result_copy_i32(
    result: *const IBInferResult,
    index: usize,
    dst: *mut i32,
    capacity: usize,
) -> IBStatus {
    catch_panic(|| copy_output(result, index, dst, capacity, TensorElement::as_i32))
}

#[no_mangle]
pub unsafe extern "C" fn ib_result_copy_i64(
    result: *const IBInferResult,
    index: usize,
    dst: *mut i64,
    capacity: usize,
) -> IBStatus {
    catch_panic(|| copy_output(result, index, dst, capacity, TensorElement::as_i64))
}

/// Install the global tracing subscriber.
///
/// `level` is an `EnvFilter` directive (null means "info"); `RUST_LOG` wins
/// when set. Fails if a subscriber is already installed.
#[no_mangle]
pub unsafe extern "C" fn ib_init_logging(level: *const c_char, json: bool) -> IBStatus {
    catch_panic(|| {
        let mut config = LoggingConfig::default();
        if !level.is_null() {
            match unsafe { read_str(level, "log level") } {
                Ok(s) => config.level = s.to_string(),
                Err(status) => return status,
            }
        }
        if json {
            config.format = LogFormat::Json;
        }
        match init_logging(&config) {
            Ok(()) => IBStatus::Ok,
            Err(e) => report(e),
        }
    })
}

/// Retrieve the last error message, or null if none.
///
/// The caller must free the returned string with `ib_free_string`.
#[no_mangle]
pub extern "C" fn ib_last_error() -> *mut c_char {
    match error::take_last_error() {
        Some(e) => e.into_raw(),
        None => std::ptr::null_mut(),
    }
}

/// Free a string previously returned by `ib_last_error` or
/// `ib_backend_model_info_json`.
#[no_mangle]
pub unsafe extern "C" fn ib_free_string(s: *mut c_char) {
    if !s.is_null() {
        drop(CString::from_raw(s));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ib_engine::format::EngineWriter;
    use ib_tensor::element::encode_f32;
    use ib_tensor::{DataType, Dim};
    use std::ptr;

    fn last_error() -> String {
        let raw = ib_last_error();
        assert!(!raw.is_null());
        let msg = unsafe { CStr::from_ptr(raw) }.to_string_lossy().into_owned();
        unsafe { ib_free_string(raw) };
        msg
    }

    fn mock_params() -> IBBackendParams {
        IBBackendParams {
            kind: IBBackendKind::Mock,
            ..IBBackendParams::default()
        }
    }

    fn write_identity_engine(dir: &tempfile::TempDir) -> CString {
        let path = dir.path().join("identity.ibe");
        let batch = || Dim::Dynamic("batch".to_string());
        EngineWriter::new("identity")
            .input("x", DataType::F32, vec![batch(), Dim::Fixed(4)])
            .unwrap()
            .output("y", DataType::F32, vec![batch(), Dim::Fixed(4)])
            .unwrap()
            .write_to(&path)
            .unwrap();
        CString::new(path.to_str().unwrap()).unwrap()
    }

    #[test]
    fn test_null_arguments() {
        unsafe {
            assert_eq!(
                ib_backend_create(ptr::null(), ptr::null(), ptr::null_mut()),
                IBStatus::ErrorInvalidArgument
            );
            assert_eq!(last_error(), "backend_out is null");

            let mut backend = ptr::null_mut();
            assert_eq!(
                ib_backend_create(ptr::null(), ptr::null(), &mut backend),
                IBStatus::ErrorInvalidArgument
            );
            assert!(backend.is_null());
            assert_eq!(last_error(), "model_path is null");
            assert_eq!(ib_backend_destroy(ptr::null_mut()), IBStatus::Ok);
            assert!(!ib_backend_is_usable(ptr::null()));
            assert_eq!(ib_result_num_outputs(ptr::null()), 0);
        }
        assert!(ib_last_error().is_null());
    }

    #[test]
    fn test_mock_backend_roundtrip() {
        unsafe {
            let mut backend = ptr::null_mut();
            let params = mock_params();
            assert_eq!(ib_backend_create(ptr::null(), &params, &mut backend), IBStatus::Ok);

            let mut n = 0;
            assert_eq!(ib_backend_num_inputs(backend, &mut n), IBStatus::Ok);
            assert_eq!(n, 1);

            let image = vec![0u8; 16];
            let input = IBInputBuffer {
                data: image.as_ptr(),
                len: image.len(),
            };
            let mut result = ptr::null_mut();
            assert_eq!(ib_backend_infer(backend, &input, 1, &mut result), IBStatus::Ok);
            assert_eq!(ib_result_num_outputs(result), 1);

            let mut len = 0;
            let mut elem = IBElementType::I64;
            assert_eq!(ib_result_output_info(result, 0, &mut len, &mut elem), IBStatus::Ok);
            assert_eq!(len, 1000);
            assert_eq!(elem, IBElementType::F32);

            let mut scores = vec![0f32; len];
            assert_eq!(ib_result_copy_f32(result, 0, scores.as_mut_ptr(), len), IBStatus::Ok);
            assert!((scores[9] - 0.0019).abs() < 1e-6);

            let mut wrong = vec![0i64; len];
            assert_eq!(
                ib_result_copy_i64(result, 0, wrong.as_mut_ptr(), len),
                IBStatus::ErrorInvalidArgument
            );
            assert!(last_error().contains("element type"));
            ib_result_destroy(result);

            let mut stats = IBStats::default();
            assert_eq!(ib_backend_stats(backend, &mut stats), IBStatus::Ok);
            assert_eq!(stats.total_inferences, 1);
            assert!((stats.last_inference_time_ms - 5.0).abs() < 1e-9);

            assert_eq!(ib_backend_destroy(backend), IBStatus::Ok);
        }
    }

    #[test]
    fn test_input_count_mismatch_status() {
        unsafe {
            let mut backend = ptr::null_mut();
            let params = mock_params();
            assert_eq!(ib_backend_create(ptr::null(), &params, &mut backend), IBStatus::Ok);

            let mut result = ptr::null_mut();
            assert_eq!(
                ib_backend_infer(backend, ptr::null(), 0, &mut result),
                IBStatus::ErrorInvalidArgument
            );
            assert!(result.is_null());
            assert!(last_error().contains("count mismatch"));
            ib_backend_destroy(backend);
        }
    }

    #[test]
    fn test_engine_backend_from_params() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_identity_engine(&dir);
        let dims = [4i64];
        let ranks = [1usize];
        let params = IBBackendParams {
            batch_size: 2,
            input_dims: dims.as_ptr(),
            input_ranks: ranks.as_ptr(),
            n_inputs: 1,
            ..IBBackendParams::default()
        };

        unsafe {
            let mut backend = ptr::null_mut();
            assert_eq!(ib_backend_create(path.as_ptr(), &params, &mut backend), IBStatus::Ok);

            let mut json = ptr::null_mut();
            assert_eq!(ib_backend_model_info_json(backend, &mut json), IBStatus::Ok);
            let info: serde_json::Value =
                serde_json::from_str(CStr::from_ptr(json).to_str().unwrap()).unwrap();
            ib_free_string(json);
            assert_eq!(info["inputs"][0]["name"], "x");
            assert_eq!(info["outputs"][0]["shape"], serde_json::json!([4]));

            let data = encode_f32(&[1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0, 8.0]);
            let input = IBInputBuffer {
                data: data.as_ptr(),
                len: data.len(),
            };
            let mut result = ptr::null_mut();
            assert_eq!(ib_backend_infer(backend, &input, 1, &mut result), IBStatus::Ok);

            let mut rank = 0;
            let mut short = [0i64; 1];
            assert_eq!(
                ib_result_shape(result, 0, short.as_mut_ptr(), 1, &mut rank),
                IBStatus::ErrorInvalidArgument
            );
            assert_eq!(rank, 2);
            let mut shape = [0i64; 2];
            assert_eq!(ib_result_shape(result, 0, shape.as_mut_ptr(), 2, &mut rank), IBStatus::Ok);
            assert_eq!(shape, [2, 4]);

            let mut values = [0f32; 8];
            assert_eq!(ib_result_copy_f32(result, 0, values.as_mut_ptr(), 8), IBStatus::Ok);
            assert_eq!(values, [1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0, 8.0]);
            ib_result_destroy(result);

            let short_input = IBInputBuffer {
                data: data.as_ptr(),
                len: 4,
            };
            let mut result = ptr::null_mut();
            assert_eq!(
                ib_backend_infer(backend, &short_input, 1, &mut result),
                IBStatus::ErrorInvalidArgument
            );
            assert!(ib_backend_is_usable(backend));
            assert!(last_error().contains("size mismatch"));
            ib_backend_destroy(backend);
        }
    }

    #[test]
    fn test_model_load_status() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("garbage.ibe");
        std::fs::write(&path, b"NOPE0000000000000000").unwrap();
        let path = CString::new(path.to_str().unwrap()).unwrap();

        unsafe {
            let mut backend = ptr::null_mut();
            assert_eq!(
                ib_backend_create(path.as_ptr(), ptr::null(), &mut backend),
                IBStatus::ErrorModelLoad
            );
            assert!(backend.is_null());
        }
        assert!(last_error().contains("magic"));
    }

    #[test]
    fn test_create_from_config_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("backend.toml");
        std::fs::write(&path, "kind = \"mock\"\nbatch_size = 3\n").unwrap();
        let path = CString::new(path.to_str().unwrap()).unwrap();

        unsafe {
            let mut backend = ptr::null_mut();
            assert_eq!(ib_backend_create_from_config(path.as_ptr(), &mut backend), IBStatus::Ok);
            assert_eq!((*backend).inner.batch_size(), 3);
            ib_backend_destroy(backend);
        }
    }
}
