//! Frame / present coordination.
//!
//! A tick travels through the same queue as the context's commands, so
//! every command submitted before `tick()` has executed by the time the
//! render thread presents, and every command submitted after it lands in
//! the next frame.
//!
//! ```text
//!  queue:  cmd cmd cmd TICK cmd cmd TICK
//!                       │            │
//!                       └─ present ──┴─ present ──► frame callbacks
//! ```

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::Serialize;

use glbridge_core::{BridgeResult, ContextId};

use crate::completion::Pending;
use crate::dispatcher::RenderMessage;
use crate::registry::ContextRegistry;

/// Outcome of one presented frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct FrameInfo {
    pub context: ContextId,
    /// 1-based frame counter for the context.
    pub frame: u64,
    /// Commands executed since the previous present.
    pub commands: u64,
}

/// Script-level frame callback; runs on the render thread after present.
pub type FrameCallback = Box<dyn FnMut(&FrameInfo) + Send + 'static>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CallbackId(pub u64);

impl fmt::Display for CallbackId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "cb#{}", self.0)
    }
}

pub struct FrameCoordinator {
    registry: Arc<ContextRegistry>,
    next_callback: AtomicU64,
}

impl FrameCoordinator {
    pub fn new(registry: Arc<ContextRegistry>) -> Self {
        Self {
            registry,
            next_callback: AtomicU64::new(1),
        }
    }

    /// Schedule a present for `context` behind everything already queued.
    ///
    /// `Ok(None)` when the context was already destroyed.
    pub fn tick(&self, context: ContextId) -> BridgeResult<Option<Pending<FrameInfo>>> {
        match self.registry.get(context) {
            Ok(ctx) => Ok(ctx.schedule_tick()),
            Err(_) if self.registry.was_issued(context) => {
                log::debug!("{context}: tick after destroy ignored");
                Ok(None)
            }
            Err(err) => Err(err),
        }
    }

    pub fn add_callback(&self, context: ContextId, callback: FrameCallback) -> BridgeResult<CallbackId> {
        let ctx = self.registry.get(context)?;
        let id = CallbackId(self.next_callback.fetch_add(1, Ordering::Relaxed));
        ctx.send_control(RenderMessage::AddFrameCallback { context, id, callback })?;
        Ok(id)
    }

    pub fn remove_callback(&self, context: ContextId, id: CallbackId) -> BridgeResult<()> {
        let ctx = self.registry.get(context)?;
        ctx.send_control(RenderMessage::RemoveFrameCallback { context, id })
    }
}
