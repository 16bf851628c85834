/// Status codes returned by all FFI functions.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum IBStatus {
    Ok = 0,
    ErrorInvalidArgument = 1,
    ErrorModelLoad = 2,
    ErrorInference = 3,
    ErrorOutOfMemory = 4,
    ErrorUnusable = 5,
    ErrorInternal = 6,
}

/// Backend implementation selector.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum IBBackendKind {
    GpuEngine = 0,
    Mock = 1,
}

/// Host element type of a decoded output.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum IBElementType {
    F32 = 0,
    I32 = 1,
    I64 = 2,
}

/// Construction parameters.
///
/// `input_dims` holds every input's sizes back to back; `input_ranks[i]`
/// says how many of them belong to input `i`.
#[repr(C)]
#[derive(Debug, Clone)]
pub struct IBBackendParams {
    pub kind: IBBackendKind,
    pub use_gpu: bool,
    pub batch_size: usize,
    pub input_dims: *const i64,
    pub input_ranks: *const usize,
    pub n_inputs: usize,
    /// Zero-fill short inputs instead of rejecting them.
    pub lenient_input_size: bool,
}

impl Default for IBBackendParams {
    fn default() -> Self {
        Self {
            kind: IBBackendKind::GpuEngine,
            use_gpu: true,
            batch_size: 1,
            input_dims: std::ptr::null(),
            input_ranks: std::ptr::null(),
            n_inputs: 0,
            lenient_input_size: false,
        }
    }
}

/// One input tensor's bytes.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct IBInputBuffer {
    pub data: *const u8,
    pub len: usize,
}

/// Performance counters of a backend.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct IBStats {
    pub total_inferences: u64,
    pub failed_inferences: u64,
    pub last_inference_time_ms: f64,
    pub average_inference_time_ms: f64,
    pub memory_usage_bytes: usize,
}
