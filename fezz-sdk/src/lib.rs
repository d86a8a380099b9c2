//! Types shared between the fezz-local worker harness and Fezz functions.
//!
//! A function shipped as a shared library exports one `extern "C"` symbol per
//! handler plus [`FREE_SYMBOL`]. The harness passes the invocation payload as
//! JSON bytes in a [`FezzSlice`] and receives a JSON encoded
//! [`HandlerOutcome`] back in a [`FezzOwned`] buffer, which it hands back to
//! the library's `fezz_free` once copied.
//!
//! ```rust,ignore
//! use fezz_sdk::{export_free, export_handler, ErrorDescriptor};
//! use serde_json::Value;
//!
//! fn greet(payload: Value) -> Result<Value, ErrorDescriptor> {
//!     let name = payload["name"].as_str().unwrap_or("world");
//!     Ok(Value::String(format!("Hello, {}!", name)))
//! }
//!
//! export_handler!(handler, greet);
//! export_free!();
//! ```

use serde::{Deserialize, Serialize};
use std::any::Any;
use std::fmt;

pub use serde_json;

/// Name of the symbol used to release buffers returned by a handler.
pub const FREE_SYMBOL: &str = "fezz_free";

/// Handler entry point exported by a shared-library function.
pub type HandleFn = unsafe extern "C" fn(FezzSlice) -> FezzOwned;

/// Buffer release function exported by a shared-library function.
pub type FreeFn = unsafe extern "C" fn(FezzOwned);

/// Borrowed byte buffer passed into a handler.
#[repr(C)]
pub struct FezzSlice {
    pub ptr: *const u8,
    pub len: usize,
}

impl FezzSlice {
    /// Borrow a byte slice for the duration of a call.
    pub fn from_bytes(bytes: &[u8]) -> Self {
        Self {
            ptr: bytes.as_ptr(),
            len: bytes.len(),
        }
    }

    /// View the buffer as a byte slice.
    ///
    /// # Safety
    ///
    /// `ptr` must point to `len` readable bytes that outlive the returned slice.
    pub unsafe fn as_bytes<'a>(&self) -> &'a [u8] {
        if self.ptr.is_null() || self.len == 0 {
            return &[];
        }
        std::slice::from_raw_parts(self.ptr, self.len)
    }
}

/// Byte buffer allocated by a handler and owned by the caller until freed.
#[repr(C)]
pub struct FezzOwned {
    pub ptr: *mut u8,
    pub len: usize,
}

impl FezzOwned {
    /// Leak a vector into an FFI-safe buffer.
    pub fn from_vec(bytes: Vec<u8>) -> Self {
        let boxed = bytes.into_boxed_slice();
        let len = boxed.len();
        let ptr = Box::into_raw(boxed) as *mut u8;
        Self { ptr, len }
    }

    /// Copy the buffer contents out without releasing it.
    ///
    /// # Safety
    ///
    /// The buffer must have been produced by [`FezzOwned::from_vec`] and not
    /// yet reclaimed.
    pub unsafe fn to_vec(&self) -> Vec<u8> {
        if self.ptr.is_null() || self.len == 0 {
            return Vec::new();
        }
        std::slice::from_raw_parts(self.ptr, self.len).to_vec()
    }

    /// Release a buffer produced by [`FezzOwned::from_vec`].
    ///
    /// # Safety
    ///
    /// Must be called exactly once, from the allocator that produced it.
    pub unsafe fn reclaim(self) {
        if self.ptr.is_null() {
            return;
        }
        let slice = std::ptr::slice_from_raw_parts_mut(self.ptr, self.len);
        drop(Box::from_raw(slice));
    }
}

/// A plain, transferable description of a handler failure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorDescriptor {
    /// Error type name.
    pub name: String,
    /// Human readable message.
    pub message: String,
    /// Source chain or backtrace, when one was available.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stack: Option<String>,
}

impl ErrorDescriptor {
    /// Create a descriptor with the generic `Error` name.
    pub fn new(message: impl Into<String>) -> Self {
        Self::with_name("Error", message)
    }

    /// Create a descriptor with an explicit type name.
    pub fn with_name(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            message: message.into(),
            stack: None,
        }
    }

    /// Attach a stack or source chain.
    pub fn with_stack(mut self, stack: impl Into<String>) -> Self {
        self.stack = Some(stack.into());
        self
    }

    /// Flatten any error value, keeping its type name and source chain.
    pub fn from_error<E: std::error::Error>(err: &E) -> Self {
        let full = std::any::type_name::<E>();
        let name = full.rsplit("::").next().unwrap_or(full);
        let mut descriptor = Self::with_name(name, err.to_string());

        let mut chain = Vec::new();
        let mut source = err.source();
        while let Some(cause) = source {
            chain.push(format!("caused by: {}", cause));
            source = cause.source();
        }
        if !chain.is_empty() {
            descriptor.stack = Some(chain.join("\n"));
        }
        descriptor
    }

    /// Describe a caught panic payload.
    pub fn from_panic(payload: &(dyn Any + Send)) -> Self {
        Self::with_name("Panic", panic_message(payload))
    }
}

impl fmt::Display for ErrorDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.name, self.message)
    }
}

impl std::error::Error for ErrorDescriptor {}

/// Extract the message from a panic payload.
pub fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "handler panicked".to_string()
    }
}

/// Result envelope returned across the shared-library boundary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum HandlerOutcome {
    Ok(serde_json::Value),
    Err(ErrorDescriptor),
}

impl HandlerOutcome {
    pub fn into_result(self) -> Result<serde_json::Value, ErrorDescriptor> {
        match self {
            HandlerOutcome::Ok(value) => Ok(value),
            HandlerOutcome::Err(err) => Err(err),
        }
    }
}

impl From<Result<serde_json::Value, ErrorDescriptor>> for HandlerOutcome {
    fn from(result: Result<serde_json::Value, ErrorDescriptor>) -> Self {
        match result {
            Ok(value) => HandlerOutcome::Ok(value),
            Err(err) => HandlerOutcome::Err(err),
        }
    }
}

pub fn encode_outcome(outcome: &HandlerOutcome) -> Result<Vec<u8>, serde_json::Error> {
    serde_json::to_vec(outcome)
}

pub fn decode_outcome(bytes: &[u8]) -> Result<HandlerOutcome, serde_json::Error> {
    serde_json::from_slice(bytes)
}

/// Export `$handler: fn(Value) -> Result<Value, ErrorDescriptor>` under the
/// C symbol `$symbol`.
#[macro_export]
macro_rules! export_handler {
    ($symbol:ident, $handler:path) => {
        #[no_mangle]
        pub extern "C" fn $symbol(input: $crate::FezzSlice) -> $crate::FezzOwned {
            let bytes = unsafe { input.as_bytes() };
            let outcome = match $crate::serde_json::from_slice::<$crate::serde_json::Value>(bytes) {
                Ok(payload) => match ::std::panic::catch_unwind(|| $handler(payload)) {
                    Ok(result) => $crate::HandlerOutcome::from(result),
                    Err(panic) => {
                        $crate::HandlerOutcome::Err($crate::ErrorDescriptor::from_panic(&*panic))
                    }
                },
                Err(err) => $crate::HandlerOutcome::Err($crate::ErrorDescriptor::from_error(&err)),
            };
            $crate::FezzOwned::from_vec($crate::encode_outcome(&outcome).unwrap_or_default())
        }
    };
}

/// Export the buffer release function every shared-library function needs.
#[macro_export]
macro_rules! export_free {
    () => {
        #[no_mangle]
        pub unsafe extern "C" fn fezz_free(owned: $crate::FezzOwned) {
            owned.reclaim()
        }
    };
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Value};

    fn shout(payload: Value) -> Result<Value, ErrorDescriptor> {
        match payload["word"].as_str() {
            Some(word) => Ok(json!(word.to_uppercase())),
            None => Err(ErrorDescriptor::with_name("TypeError", "word is required")),
        }
    }

    fn explode(_payload: Value) -> Result<Value, ErrorDescriptor> {
        panic!("boom")
    }

    export_handler!(test_shout, shout);
    export_handler!(test_explode, explode);
    export_free!();

    fn call(handler: HandleFn, input: &[u8]) -> HandlerOutcome {
        unsafe {
            let owned = handler(FezzSlice::from_bytes(input));
            let bytes = owned.to_vec();
            fezz_free(owned);
            decode_outcome(&bytes).unwrap()
        }
    }

    #[test]
    fn test_exported_handler_success() {
        let outcome = call(test_shout, br#"{"word":"fezz"}"#);
        assert_eq!(outcome, HandlerOutcome::Ok(json!("FEZZ")));
    }

    #[test]
    fn test_exported_handler_error() {
        let outcome = call(test_shout, b"{}");
        let err = outcome.into_result().unwrap_err();
        assert_eq!(err.name, "TypeError");
        assert_eq!(err.message, "word is required");
    }

    #[test]
    fn test_exported_handler_rejects_invalid_json() {
        let outcome = call(test_shout, b"{not json");
        assert!(matches!(outcome, HandlerOutcome::Err(_)));
    }

    #[test]
    fn test_exported_handler_catches_panic() {
        let outcome = call(test_explode, b"null");
        let err = outcome.into_result().unwrap_err();
        assert_eq!(err.name, "Panic");
        assert_eq!(err.message, "boom");
    }

    #[test]
    fn test_error_descriptor_from_error() {
        let err = serde_json::from_str::<Value>("{").unwrap_err();
        let descriptor = ErrorDescriptor::from_error(&err);
        assert_eq!(descriptor.name, "Error");
        assert!(!descriptor.message.is_empty());
        assert_eq!(descriptor.to_string(), format!("Error: {}", err));
    }

    #[test]
    fn test_error_descriptor_wire_format() {
        let descriptor = ErrorDescriptor::new("nope");
        let json = serde_json::to_value(&descriptor).unwrap();
        assert_eq!(json, json!({"name": "Error", "message": "nope"}));

        let with_stack = descriptor.with_stack("at handler");
        let json = serde_json::to_value(&with_stack).unwrap();
        assert_eq!(json["stack"], "at handler");
    }

    #[test]
    fn test_empty_slice_is_safe() {
        let slice = FezzSlice {
            ptr: std::ptr::null(),
            len: 0,
        };
        assert!(unsafe { slice.as_bytes() }.is_empty());
    }
}
