//! Context registry.
//!
//! Owns every live [`GraphicsContext`] and hands out ids from a process-wide
//! monotonic counter, so a stale id resolves to `UnknownContext` instead of
//! aliasing a newer context.
//!
//! ```text
//!   submit()  ──lock(submit)──► seq = next_seq++ ──► render queue
//!   destroy() ──lock(submit)──► disposed = true  ──► Teardown ──► release ──► remove
//! ```
//!
//! Sequence assignment and enqueue happen under one short critical section,
//! so queue order is sequence order and nothing can slip in behind a
//! teardown.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};

use tokio::sync::mpsc::UnboundedSender;

use glbridge_core::{
    BridgeError, BridgeResult, ContextAttributes, ContextId, ContextState, Op, Value,
};

use crate::completion::{self, Pending};
use crate::dispatcher::{Command, RenderMessage};
use crate::frame::FrameInfo;

#[derive(Debug)]
struct SubmitState {
    next_seq: u64,
    disposed: bool,
}

/// One logical GPU rendering context.
///
/// The native device itself lives on the render thread; this handle carries
/// the queue entry point, lifecycle flags and the cached state mirror.
pub struct GraphicsContext {
    id: ContextId,
    worker: usize,
    label: String,
    attributes: ContextAttributes,
    sender: UnboundedSender<RenderMessage>,
    submit: Mutex<SubmitState>,
    disposed: AtomicBool,
    lost: AtomicBool,
    state: RwLock<ContextState>,
    queued: AtomicUsize,
    max_pending: usize,
}

/// Everything needed to build a context, minus its id.
pub(crate) struct NewContext {
    pub worker: usize,
    pub label: String,
    pub attributes: ContextAttributes,
    pub size: (u32, u32),
    pub sender: UnboundedSender<RenderMessage>,
    pub max_pending: usize,
}

impl GraphicsContext {
    fn new(id: ContextId, spec: NewContext) -> Self {
        let (width, height) = spec.size;
        Self {
            id,
            worker: spec.worker,
            label: spec.label,
            attributes: spec.attributes,
            sender: spec.sender,
            submit: Mutex::new(SubmitState { next_seq: 0, disposed: false }),
            disposed: AtomicBool::new(false),
            lost: AtomicBool::new(false),
            state: RwLock::new(ContextState::new(width, height)),
            queued: AtomicUsize::new(0),
            max_pending: spec.max_pending,
        }
    }

    pub fn id(&self) -> ContextId {
        self.id
    }

    /// Index of the render worker that owns this context.
    pub fn worker(&self) -> usize {
        self.worker
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn attributes(&self) -> &ContextAttributes {
        &self.attributes
    }

    /// Set once destroy began; no new commands are accepted afterwards.
    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }

    /// Set when the native context could not be created or went away.
    pub fn is_lost(&self) -> bool {
        self.lost.load(Ordering::Acquire)
    }

    /// Snapshot of the cached GPU state.
    pub fn state(&self) -> ContextState {
        self.state.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Commands submitted but not yet executed or cancelled.
    pub fn queued(&self) -> usize {
        self.queued.load(Ordering::Acquire)
    }

    fn lock_submit(&self) -> MutexGuard<'_, SubmitState> {
        self.submit.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Assign the next sequence number and enqueue `op`.
    pub(crate) fn submit(&self, op: Op) -> BridgeResult<Pending<Value>> {
        let mut submit = self.lock_submit();
        if submit.disposed || self.is_lost() {
            return Err(BridgeError::ContextLost(self.id));
        }
        if self.max_pending > 0 && self.queued() >= self.max_pending {
            log::warn!("{}: rejecting {}, {} commands queued", self.id, op.name(), self.queued());
            return Err(BridgeError::invalid_argument("queue full"));
        }

        let seq = submit.next_seq;
        let (completer, pending) = completion::channel(self.id);
        let name = op.name();
        self.queued.fetch_add(1, Ordering::AcqRel);
        let message = RenderMessage::Execute {
            context: self.id,
            command: Command { seq, op, completer },
        };
        if self.sender.send(message).is_err() {
            self.queued.fetch_sub(1, Ordering::AcqRel);
            return Err(BridgeError::ContextLost(self.id));
        }
        submit.next_seq += 1;
        log::trace!("{}: queued #{seq} {name}", self.id);
        Ok(pending)
    }

    /// Enqueue a present behind every command submitted so far.
    pub(crate) fn schedule_tick(&self) -> Option<Pending<FrameInfo>> {
        let submit = self.lock_submit();
        if submit.disposed {
            return None;
        }
        let (completer, pending) = completion::channel(self.id);
        self.sender
            .send(RenderMessage::Tick { context: self.id, completer })
            .ok()?;
        Some(pending)
    }

    /// Send a non-command message, refused once disposed.
    pub(crate) fn send_control(&self, message: RenderMessage) -> BridgeResult<()> {
        let submit = self.lock_submit();
        if submit.disposed {
            return Err(BridgeError::ContextLost(self.id));
        }
        self.sender
            .send(message)
            .map_err(|_| BridgeError::ContextLost(self.id))
    }

    /// Flag disposed and queue the teardown.
    ///
    /// `None` when a teardown is already under way.
    pub(crate) fn begin_teardown(&self) -> Option<Pending<()>> {
        let mut submit = self.lock_submit();
        if submit.disposed {
            return None;
        }
        submit.disposed = true;
        self.disposed.store(true, Ordering::Release);

        let (completer, pending) = completion::channel(self.id);
        if self
            .sender
            .send(RenderMessage::Teardown { context: self.id, done: completer })
            .is_err()
        {
            log::warn!("{}: render worker gone, teardown not delivered", self.id);
        }
        Some(pending)
    }

    /// Returns `true` if this call flipped the context to lost.
    pub(crate) fn mark_lost(&self) -> bool {
        !self.lost.swap(true, Ordering::AcqRel)
    }

    pub(crate) fn command_finished(&self) {
        self.queued.fetch_sub(1, Ordering::AcqRel);
    }

    /// Publish the state after `op` succeeded natively.
    pub(crate) fn publish_state(&self, op: &Op, value: &Value) {
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(next) = state.apply(op, value) {
            *state = next;
        }
    }
}

// ───────────────────────────────────────────────────────────────────
// Registry
// ───────────────────────────────────────────────────────────────────

pub struct ContextRegistry {
    next_id: AtomicU64,
    contexts: RwLock<HashMap<ContextId, Arc<GraphicsContext>>>,
}

impl Default for ContextRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ContextRegistry {
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            contexts: RwLock::new(HashMap::new()),
        }
    }

    /// Allocate an id, build the context, run `attach` and register it.
    ///
    /// The context becomes reachable through `get` only after `attach`
    /// succeeded, so the render thread always sees the attach first.
    pub(crate) fn create(
        &self,
        spec: NewContext,
        attach: impl FnOnce(&Arc<GraphicsContext>) -> BridgeResult<()>,
    ) -> BridgeResult<Arc<GraphicsContext>> {
        let id = ContextId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let context = Arc::new(GraphicsContext::new(id, spec));
        attach(&context)?;
        self.contexts
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id, context.clone());
        Ok(context)
    }

    pub fn get(&self, id: ContextId) -> BridgeResult<Arc<GraphicsContext>> {
        self.contexts
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&id)
            .cloned()
            .ok_or(BridgeError::UnknownContext(id))
    }

    /// Flag `id` disposed and queue its teardown.
    ///
    /// Idempotent: destroying an id that is already being torn down or is
    /// gone resolves immediately. Ids never issued are `UnknownContext`.
    pub fn destroy(&self, id: ContextId) -> BridgeResult<Pending<()>> {
        match self.get(id) {
            Ok(context) => Ok(context
                .begin_teardown()
                .unwrap_or_else(|| Pending::resolved(id, Ok(())))),
            Err(_) if self.was_issued(id) => Ok(Pending::resolved(id, Ok(()))),
            Err(err) => Err(err),
        }
    }

    pub(crate) fn remove(&self, id: ContextId) -> Option<Arc<GraphicsContext>> {
        self.contexts
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&id)
    }

    /// Whether `id` was ever handed out.
    pub fn was_issued(&self, id: ContextId) -> bool {
        id.0 >= 1 && id.0 < self.next_id.load(Ordering::Relaxed)
    }

    /// Ids of registered contexts, ascending.
    pub fn live(&self) -> Vec<ContextId> {
        let mut ids: Vec<_> = self
            .contexts
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .copied()
            .collect();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        self.contexts.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    fn spec(sender: UnboundedSender<RenderMessage>) -> NewContext {
        NewContext {
            worker: 0,
            label: "test".into(),
            attributes: ContextAttributes::default(),
            size: (64, 32),
            sender,
            max_pending: 2,
        }
    }

    #[test]
    fn test_ids_are_monotonic_and_never_reused() {
        let registry = ContextRegistry::new();
        let (tx, _rx) = mpsc::unbounded_channel();
        let a = registry.create(spec(tx.clone()), |_| Ok(())).unwrap().id();
        registry.remove(a);
        let b = registry.create(spec(tx), |_| Ok(())).unwrap().id();
        assert!(b > a);
        assert!(matches!(registry.get(a), Err(BridgeError::UnknownContext(id)) if id == a));
        assert!(registry.was_issued(a));
        assert!(!registry.was_issued(ContextId(99)));
    }

    #[test]
    fn test_failed_attach_is_not_registered() {
        let registry = ContextRegistry::new();
        let (tx, _rx) = mpsc::unbounded_channel();
        let err = registry
            .create(spec(tx), |ctx| Err(BridgeError::ContextLost(ctx.id())))
            .err();
        assert!(err.is_some());
        assert!(registry.is_empty());
    }

    #[test]
    fn test_submit_assigns_sequence_and_respects_limit() {
        let registry = ContextRegistry::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let ctx = registry.create(spec(tx), |_| Ok(())).unwrap();

        let _p0 = ctx.submit(Op::Flush).unwrap();
        let _p1 = ctx.submit(Op::Finish).unwrap();
        assert!(matches!(ctx.submit(Op::Flush), Err(BridgeError::InvalidArgument(m)) if m == "queue full"));

        let seqs: Vec<u64> = std::iter::from_fn(|| rx.try_recv().ok())
            .filter_map(|m| match m {
                RenderMessage::Execute { command, .. } => Some(command.seq),
                _ => None,
            })
            .collect();
        assert_eq!(seqs, vec![0, 1]);
        assert_eq!(ctx.queued(), 2);
    }

    #[test]
    fn test_destroy_is_idempotent() {
        let registry = ContextRegistry::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let id = registry.create(spec(tx), |_| Ok(())).unwrap().id();

        let _first = registry.destroy(id).unwrap();
        let mut second = registry.destroy(id).unwrap();
        assert_eq!(second.try_result(), Some(Ok(())));
        assert!(matches!(registry.get(id).unwrap().submit(Op::Flush), Err(BridgeError::ContextLost(_))));

        let teardowns = std::iter::from_fn(|| rx.try_recv().ok())
            .filter(|m| matches!(m, RenderMessage::Teardown { .. }))
            .count();
        assert_eq!(teardowns, 1);
        assert!(matches!(registry.destroy(ContextId(42)), Err(BridgeError::UnknownContext(_))));
    }

    #[test]
    fn test_state_mirror_published() {
        let registry = ContextRegistry::new();
        let (tx, _rx) = mpsc::unbounded_channel();
        let ctx = registry.create(spec(tx), |_| Ok(())).unwrap();
        let op = Op::ClearColor([0.5, 0.5, 0.5, 1.0]);
        ctx.publish_state(&op, &Value::None);
        assert_eq!(ctx.state().clear_color, [0.5, 0.5, 0.5, 1.0]);
    }
}
