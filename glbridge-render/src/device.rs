//! The seam between the bridge and a real GPU binding.
//!
//! A [`SurfaceSource`] is what the windowing collaborator hands over when a
//! surface becomes ready. It is opened on the render thread that will own the
//! resulting [`GraphicsDevice`], so thread-affine drivers never see another
//! thread.

use std::sync::Arc;

use glbridge_core::{rgba8_len, ContextAttributes, HostAllocator, NativeError, Op, Value};

/// A native GPU context, driven by exactly one render thread.
pub trait GraphicsDevice: Send {
    /// Human-readable identification for logs.
    fn label(&self) -> &str;

    /// Current drawing buffer size in pixels.
    fn drawing_buffer_size(&self) -> (u32, u32);

    /// Perform the native call for `op`.
    ///
    /// Read-backs copy into storage obtained from `allocator` and return
    /// `Value::Bytes`.
    fn execute(&mut self, op: &Op, allocator: &Arc<dyn HostAllocator>) -> Result<Value, NativeError>;

    /// Swap / present the drawing buffer.
    fn present(&mut self) -> Result<(), NativeError>;

    /// Release every native resource. Called once, after the last command.
    fn release(&mut self);
}

/// Supplier of a native GPU context for a ready surface.
pub trait SurfaceSource: Send {
    /// Human-readable identification for logs.
    fn describe(&self) -> String;

    /// Initial drawing buffer size in pixels.
    fn size(&self) -> (u32, u32);

    /// Create the native context. Runs on the owning render thread.
    fn open(self: Box<Self>, attributes: &ContextAttributes) -> Result<Box<dyn GraphicsDevice>, NativeError>;
}

/// Byte length of an RGBA8 image, `OUT_OF_MEMORY` on overflow.
pub(crate) fn image_len(width: u32, height: u32) -> Result<usize, NativeError> {
    rgba8_len(width, height)
        .ok_or_else(|| NativeError::out_of_memory(format!("{width}x{height} image overflows")))
}

/// Zero-filled bytes, `OUT_OF_MEMORY` when the allocation is refused.
pub(crate) fn zeroed(len: usize) -> Result<Vec<u8>, NativeError> {
    let mut bytes = Vec::new();
    bytes
        .try_reserve_exact(len)
        .map_err(|e| NativeError::out_of_memory(format!("cannot allocate {len} bytes: {e}")))?;
    bytes.resize(len, 0);
    Ok(bytes)
}
