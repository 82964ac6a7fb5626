//! Render-thread dispatcher.
//!
//! ```text
//!  GraphicsContext::submit ──► mpsc (per worker) ──► RenderWorker (std thread)
//!                                                      ├── ContextSlot ctx#1 ── device
//!                                                      ├── ContextSlot ctx#4 ── device
//!                                                      └── ...
//! ```
//!
//! Each worker is the only code that touches the devices of the contexts
//! assigned to it, and it handles its queue strictly in arrival order.
//! Contexts on different workers run concurrently.

use std::cell::Cell;
use std::collections::{BTreeMap, HashMap};
use std::io;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};

use glbridge_core::{
    codes, BridgeError, ContextId, HostAllocator, NativeError, Op, Value,
};
use glbridge_render::{GraphicsDevice, SurfaceSource};

use crate::completion::Completer;
use crate::config::{BridgeConfig, TeardownPolicy};
use crate::events::{BridgeEvent, EventHub};
use crate::frame::{CallbackId, FrameCallback, FrameInfo};
use crate::registry::{ContextRegistry, GraphicsContext};
use crate::stats::AtomicDispatchStats;

thread_local! {
    static RENDER_THREAD: Cell<bool> = const { Cell::new(false) };
}

/// Whether the current thread is a bridge render thread.
pub fn on_render_thread() -> bool {
    RENDER_THREAD.with(Cell::get)
}

/// One deferred operation in flight.
pub(crate) struct Command {
    pub seq: u64,
    pub op: Op,
    pub completer: Completer<Value>,
}

pub(crate) enum RenderMessage {
    Attach {
        context: Arc<GraphicsContext>,
        source: Box<dyn SurfaceSource>,
    },
    Execute {
        context: ContextId,
        command: Command,
    },
    Tick {
        context: ContextId,
        completer: Completer<FrameInfo>,
    },
    AddFrameCallback {
        context: ContextId,
        id: CallbackId,
        callback: FrameCallback,
    },
    RemoveFrameCallback {
        context: ContextId,
        id: CallbackId,
    },
    Teardown {
        context: ContextId,
        done: Completer<()>,
    },
    Shutdown,
}

/// State shared by every worker.
pub(crate) struct Shared {
    pub registry: Arc<ContextRegistry>,
    pub events: Arc<EventHub>,
    pub stats: Arc<AtomicDispatchStats>,
    pub allocator: Arc<dyn HostAllocator>,
    pub teardown: TeardownPolicy,
}

// ───────────────────────────────────────────────────────────────────
// Worker
// ───────────────────────────────────────────────────────────────────

struct ContextSlot {
    context: Arc<GraphicsContext>,
    /// `None` once the context is lost.
    device: Option<Box<dyn GraphicsDevice>>,
    last_seq: Option<u64>,
    /// First native error since the last `getError`.
    error: Option<NativeError>,
    callbacks: BTreeMap<CallbackId, FrameCallback>,
    frames: u64,
    executed_since_frame: u64,
}

impl ContextSlot {
    fn latch(&mut self, err: &NativeError) {
        if self.error.is_none() {
            self.error = Some(err.clone());
        }
    }
}

struct RenderWorker {
    index: usize,
    rx: UnboundedReceiver<RenderMessage>,
    slots: HashMap<ContextId, ContextSlot>,
    shared: Arc<Shared>,
}

impl RenderWorker {
    fn run(mut self) {
        RENDER_THREAD.with(|flag| flag.set(true));
        log::info!("render worker {} started", self.index);

        while let Some(message) = self.rx.blocking_recv() {
            match message {
                RenderMessage::Attach { context, source } => self.attach(context, source),
                RenderMessage::Execute { context, command } => self.execute(context, command),
                RenderMessage::Tick { context, completer } => self.tick(context, completer),
                RenderMessage::AddFrameCallback { context, id, callback } => {
                    if let Some(slot) = self.slots.get_mut(&context) {
                        slot.callbacks.insert(id, callback);
                    }
                }
                RenderMessage::RemoveFrameCallback { context, id } => {
                    if let Some(slot) = self.slots.get_mut(&context) {
                        slot.callbacks.remove(&id);
                    }
                }
                RenderMessage::Teardown { context, done } => {
                    self.teardown(context);
                    done.resolve(Ok(()));
                }
                RenderMessage::Shutdown => break,
            }
        }
        self.drain();

        let remaining: Vec<ContextId> = self.slots.keys().copied().collect();
        for context in remaining {
            self.teardown(context);
        }
        log::info!("render worker {} stopped", self.index);
    }

    /// Resolve everything queued behind the shutdown message. Senders see
    /// a closed queue from here on.
    fn drain(&mut self) {
        self.rx.close();
        while let Ok(message) = self.rx.try_recv() {
            match message {
                RenderMessage::Execute { context, command } => {
                    if let Ok(handle) = self.shared.registry.get(context) {
                        handle.command_finished();
                    }
                    self.cancel(context, command);
                }
                RenderMessage::Tick { context, completer } => {
                    completer.resolve(Err(BridgeError::ContextLost(context)));
                }
                RenderMessage::Teardown { context, done } => {
                    self.teardown(context);
                    done.resolve(Ok(()));
                }
                RenderMessage::Attach { context, .. } => {
                    log::debug!("{}: surface arrived after shutdown", context.id());
                    context.mark_lost();
                    self.shared.registry.remove(context.id());
                }
                RenderMessage::AddFrameCallback { .. }
                | RenderMessage::RemoveFrameCallback { .. }
                | RenderMessage::Shutdown => {}
            }
        }
    }

    fn attach(&mut self, context: Arc<GraphicsContext>, source: Box<dyn SurfaceSource>) {
        let id = context.id();
        let description = source.describe();
        let device = match source.open(context.attributes()) {
            Ok(device) => {
                let (width, height) = device.drawing_buffer_size();
                log::info!("{id}: attached {description} on worker {}", self.index);
                self.shared.events.publish(BridgeEvent::ContextCreated { context: id, width, height });
                Some(device)
            }
            Err(err) => {
                log::warn!("{id}: could not open {description}: {err}");
                context.mark_lost();
                self.shared.events.publish(BridgeEvent::ContextLost {
                    context: id,
                    reason: err.message,
                });
                None
            }
        };
        self.slots.insert(
            id,
            ContextSlot {
                context,
                device,
                last_seq: None,
                error: None,
                callbacks: BTreeMap::new(),
                frames: 0,
                executed_since_frame: 0,
            },
        );
    }

    fn cancel(&self, id: ContextId, command: Command) {
        AtomicDispatchStats::bump(&self.shared.stats.cancelled);
        log::debug!("{id}: cancelled #{} {}", command.seq, command.op.name());
        command.completer.resolve(Err(BridgeError::ContextLost(id)));
    }

    fn execute(&mut self, id: ContextId, command: Command) {
        let Some(slot) = self.slots.get_mut(&id) else {
            log::error!("{id}: command #{} for a context this worker does not own", command.seq);
            self.cancel(id, command);
            return;
        };
        slot.context.command_finished();

        if let Some(last) = slot.last_seq {
            if command.seq != last + 1 {
                log::error!("{id}: sequence gap, expected #{} got #{}", last + 1, command.seq);
            }
        }
        slot.last_seq = Some(command.seq);

        let cancelled = slot.context.is_disposed() && self.shared.teardown == TeardownPolicy::Cancel;
        let Some(device) = slot.device.as_mut().filter(|_| !cancelled) else {
            self.cancel(id, command);
            return;
        };

        let Command { seq, op, completer } = command;
        if op == Op::GetError {
            let code = slot.error.take().map_or(codes::NO_ERROR, |e| e.code);
            slot.executed_since_frame += 1;
            AtomicDispatchStats::bump(&self.shared.stats.executed);
            completer.resolve(Ok(Value::Int(i64::from(code))));
            return;
        }

        log::trace!("{id}: executing #{seq} {}", op.name());
        match device.execute(&op, &self.shared.allocator) {
            Ok(value) => {
                slot.context.publish_state(&op, &value);
                slot.executed_since_frame += 1;
                AtomicDispatchStats::bump(&self.shared.stats.executed);
                completer.resolve(Ok(value));
            }
            Err(err) => {
                log::warn!("{id}: #{seq} {} failed: {err}", op.name());
                slot.latch(&err);
                AtomicDispatchStats::bump(&self.shared.stats.failed);
                self.shared.events.publish(BridgeEvent::NativeError {
                    context: id,
                    code: err.code,
                    message: err.message.clone(),
                });
                completer.resolve(Err(BridgeError::NativeGraphicsError(err)));
            }
        }
    }

    fn tick(&mut self, id: ContextId, completer: Completer<FrameInfo>) {
        let Some(slot) = self.slots.get_mut(&id) else {
            completer.resolve(Err(BridgeError::ContextLost(id)));
            return;
        };
        let disposed = slot.context.is_disposed();
        let Some(device) = slot.device.as_mut().filter(|_| !disposed) else {
            completer.resolve(Err(BridgeError::ContextLost(id)));
            return;
        };

        if let Err(err) = device.present() {
            log::warn!("{id}: present failed: {err}");
            slot.latch(&err);
            self.shared.events.publish(BridgeEvent::NativeError {
                context: id,
                code: err.code,
                message: err.message.clone(),
            });
            completer.resolve(Err(BridgeError::NativeGraphicsError(err)));
            return;
        }

        slot.frames += 1;
        let info = FrameInfo {
            context: id,
            frame: slot.frames,
            commands: std::mem::take(&mut slot.executed_since_frame),
        };
        AtomicDispatchStats::bump(&self.shared.stats.frames_presented);
        log::debug!("{id}: presented frame {} ({} commands)", info.frame, info.commands);
        self.shared.events.publish(BridgeEvent::FramePresented {
            context: id,
            frame: info.frame,
            commands: info.commands,
        });

        let mut panicked = Vec::new();
        for (cb_id, callback) in slot.callbacks.iter_mut() {
            if panic::catch_unwind(AssertUnwindSafe(|| callback(&info))).is_err() {
                log::error!("{id}: frame callback {cb_id} panicked, removing it");
                panicked.push(*cb_id);
            }
        }
        for cb_id in panicked {
            slot.callbacks.remove(&cb_id);
        }
        completer.resolve(Ok(info));
    }

    /// Release the device and unregister. Every command queued before the
    /// teardown message has already been resolved at this point.
    fn teardown(&mut self, id: ContextId) {
        if let Some(mut slot) = self.slots.remove(&id) {
            if let Some(mut device) = slot.device.take() {
                device.release();
            }
            log::info!("{id}: destroyed after {} frames", slot.frames);
        }
        self.shared.registry.remove(id);
        AtomicDispatchStats::bump(&self.shared.stats.contexts_destroyed);
        self.shared.events.publish(BridgeEvent::ContextDestroyed { context: id });
    }
}

// ───────────────────────────────────────────────────────────────────
// Dispatcher
// ───────────────────────────────────────────────────────────────────

struct WorkerHandle {
    sender: UnboundedSender<RenderMessage>,
    thread: Option<JoinHandle<()>>,
}

/// Pool of render workers.
pub struct Dispatcher {
    workers: Vec<WorkerHandle>,
    next: AtomicUsize,
}

impl Dispatcher {
    pub(crate) fn spawn(config: &BridgeConfig, shared: Arc<Shared>) -> io::Result<Self> {
        let mut dispatcher = Dispatcher {
            workers: Vec::with_capacity(config.render_threads),
            next: AtomicUsize::new(0),
        };
        for index in 0..config.render_threads {
            let (sender, rx) = mpsc::unbounded_channel();
            let worker = RenderWorker {
                index,
                rx,
                slots: HashMap::new(),
                shared: shared.clone(),
            };
            let thread = thread::Builder::new()
                .name(format!("{}-{index}", config.thread_name))
                .spawn(move || worker.run())?;
            dispatcher.workers.push(WorkerHandle {
                sender,
                thread: Some(thread),
            });
        }
        Ok(dispatcher)
    }

    /// Pick the worker for a new context (round-robin).
    pub(crate) fn assign(&self) -> (usize, UnboundedSender<RenderMessage>) {
        let index = self.next.fetch_add(1, Ordering::Relaxed) % self.workers.len().max(1);
        (index, self.workers[index].sender.clone())
    }

    pub fn workers(&self) -> usize {
        self.workers.len()
    }

    /// Stop every worker after it finished what is already queued.
    pub fn shutdown(&mut self) {
        for worker in &self.workers {
            let _ = worker.sender.send(RenderMessage::Shutdown);
        }
        let current = thread::current().id();
        for worker in &mut self.workers {
            let Some(handle) = worker.thread.take() else {
                continue;
            };
            if handle.thread().id() == current {
                continue;
            }
            if handle.join().is_err() {
                log::error!("render worker panicked");
            }
        }
    }
}

impl Drop for Dispatcher {
    fn drop(&mut self) {
        self.shutdown();
    }
}
