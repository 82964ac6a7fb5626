//! Error taxonomy shared by every layer of the bridge.
//!
//! Validation failures (`InvalidArgument`, `InvalidBuffer`,
//! `UnsupportedElementType`, `UnknownContext`) are returned synchronously
//! from the call that caused them. Execution failures travel through the
//! command's completion channel as `NativeGraphicsError`.

use thiserror::Error;

use crate::ids::ContextId;

/// GL error codes reported by native drivers.
pub mod codes {
    pub const NO_ERROR: u32 = 0;
    pub const INVALID_ENUM: u32 = 0x0500;
    pub const INVALID_VALUE: u32 = 0x0501;
    pub const INVALID_OPERATION: u32 = 0x0502;
    pub const OUT_OF_MEMORY: u32 = 0x0505;
    pub const INVALID_FRAMEBUFFER_OPERATION: u32 = 0x0506;
    pub const CONTEXT_LOST_WEBGL: u32 = 0x9242;
}

/// A failure reported by the native graphics binding.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("native error 0x{code:04X}: {message}")]
pub struct NativeError {
    pub code: u32,
    pub message: String,
}

impl NativeError {
    pub fn new(code: u32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn invalid_enum(message: impl Into<String>) -> Self {
        Self::new(codes::INVALID_ENUM, message)
    }

    pub fn invalid_value(message: impl Into<String>) -> Self {
        Self::new(codes::INVALID_VALUE, message)
    }

    pub fn invalid_operation(message: impl Into<String>) -> Self {
        Self::new(codes::INVALID_OPERATION, message)
    }

    pub fn out_of_memory(message: impl Into<String>) -> Self {
        Self::new(codes::OUT_OF_MEMORY, message)
    }

    pub fn context_lost(message: impl Into<String>) -> Self {
        Self::new(codes::CONTEXT_LOST_WEBGL, message)
    }
}

/// Every outcome a bridge call can fail with.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BridgeError {
    #[error("unknown context {0}")]
    UnknownContext(ContextId),
    #[error("context {0} lost")]
    ContextLost(ContextId),
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("invalid buffer: {0}")]
    InvalidBuffer(String),
    #[error("unsupported element type: {0}")]
    UnsupportedElementType(String),
    #[error("native graphics error: {0}")]
    NativeGraphicsError(#[from] NativeError),
    #[error("call would block the render thread on itself")]
    ReentrantCall,
    /// A blocking wait was attempted on a thread driving an async runtime.
    #[error("blocking wait inside an async runtime, await the result instead")]
    BlockingInRuntime,
}

impl BridgeError {
    pub fn invalid_argument(message: impl Into<String>) -> Self {
        BridgeError::InvalidArgument(message.into())
    }

    pub fn invalid_buffer(message: impl Into<String>) -> Self {
        BridgeError::InvalidBuffer(message.into())
    }

    /// Native driver code, if this error came from the driver.
    pub fn native_code(&self) -> Option<u32> {
        match self {
            BridgeError::NativeGraphicsError(e) => Some(e.code),
            _ => None,
        }
    }

    /// `ContextLost` is the expected outcome of racing a teardown.
    pub fn is_context_lost(&self) -> bool {
        matches!(self, BridgeError::ContextLost(_))
    }
}

pub type BridgeResult<T> = Result<T, BridgeError>;

/// Failure to parse or validate a configuration record.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("malformed configuration: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_native_error_display() {
        let e = NativeError::invalid_enum("bad target");
        assert_eq!(e.to_string(), "native error 0x0500: bad target");
    }

    #[test]
    fn test_native_code_only_for_driver_errors() {
        let native: BridgeError = NativeError::invalid_operation("no program").into();
        assert_eq!(native.native_code(), Some(codes::INVALID_OPERATION));
        assert_eq!(BridgeError::ReentrantCall.native_code(), None);
    }

    #[test]
    fn test_context_lost_predicate() {
        assert!(BridgeError::ContextLost(ContextId(3)).is_context_lost());
        assert!(!BridgeError::UnknownContext(ContextId(3)).is_context_lost());
    }
}
