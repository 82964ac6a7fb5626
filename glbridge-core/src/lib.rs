//! # glbridge-core
//!
//! Data model of the graphics command bridge.
//!
//! ```text
//!  script call ──► Args ──► (validate) ──► Op ──► Command (glbridge-dispatch)
//!                   │                       ▲
//!                   └── ScriptBuffer ──► BufferView ──► OwnedBuffer
//! ```
//!
//! ## Modules
//!
//! - [`ids`]: context ids and GL object names
//! - [`error`]: error taxonomy and native error codes
//! - [`buffer`]: typed buffer exchange (views, owned copies, host allocator)
//! - [`args`]: named argument maps
//! - [`op`]: validated operations and result values
//! - [`state`]: cached GPU state mirror
//! - [`attributes`]: context creation attributes
//! - [`limits`]: size caps checked before commands are queued

pub mod args;
pub mod attributes;
pub mod buffer;
pub mod error;
pub mod ids;
pub mod limits;
pub mod op;
pub mod state;

pub use args::{ArgValue, Args};
pub use attributes::{ContextAttributes, PowerPreference};
pub use buffer::{
    as_native_view, copy_out, system_allocator, write_back, ArrayKind, BufferView, Element,
    ElementType, HostAllocator, OwnedBuffer, ScriptBuffer, SystemAllocator,
};
pub use error::{codes, BridgeError, BridgeResult, ConfigError, NativeError};
pub use ids::{ContextId, ObjectName};
pub use limits::{rgba8_len, Limits};
pub use op::{gl, Op, Rect, Value};
pub use state::ContextState;
