use std::cell::RefCell;
use std::ffi::CString;

use ib_engine::EngineError;

use crate::types::IBStatus;

thread_local! {
    static LAST_ERROR: RefCell<Option<CString>> = const { RefCell::new(None) };
}

/// Store an error message for later retrieval via `ib_last_error`.
pub fn set_last_error(msg: String) {
    LAST_ERROR.with(|e| {
        *e.borrow_mut() = CString::new(msg).ok();
    });
}

/// Take the last error message, leaving `None` in its place.
pub fn take_last_error() -> Option<CString> {
    LAST_ERROR.with(|e| e.borrow_mut().take())
}

/// Record `err` as the last error and map it to a status code.
pub fn report(err: EngineError) -> IBStatus {
    let status = match &err {
        EngineError::OutOfMemory { .. } => IBStatus::ErrorOutOfMemory,
        EngineError::BackendUnusable(_) => IBStatus::ErrorUnusable,
        EngineError::InputCountMismatch { .. } | EngineError::InputSizeMismatch { .. } => {
            IBStatus::ErrorInvalidArgument
        }
        e if e.is_configuration_error() => IBStatus::ErrorModelLoad,
        e if e.is_device_error() => IBStatus::ErrorInference,
        _ => IBStatus::ErrorInternal,
    };
    tracing::debug!(?status, error = %err, "ffi call failed");
    set_last_error(err.to_string());
    status
}
