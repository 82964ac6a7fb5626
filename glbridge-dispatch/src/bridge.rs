//! The bridge facade wired to the windowing collaborator.
//!
//! ```text
//!  windowing ── on_surface_ready ──► ContextRegistry ──Attach──► render worker
//!            ── on_frame_tick ─────► FrameCoordinator ──Tick───►      │
//!            ── on_surface_destroyed ► registry.destroy ─Teardown─►   │
//!  script    ── invoke ────────────► HostApi ─────────Execute──►      ▼
//!                                                              GraphicsDevice
//! ```

use std::io;
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::broadcast;

use glbridge_core::{
    system_allocator, Args, BridgeError, BridgeResult, ConfigError, ContextAttributes, ContextId,
    ContextState, HostAllocator,
};
use glbridge_render::SurfaceSource;

use crate::completion::{may_block, Pending};
use crate::config::BridgeConfig;
use crate::dispatcher::{Dispatcher, RenderMessage, Shared};
use crate::events::{BridgeEvent, EventHub, EventStats};
use crate::frame::{CallbackId, FrameCoordinator, FrameInfo};
use crate::host::{HostApi, Invocation};
use crate::registry::{ContextRegistry, GraphicsContext, NewContext};
use crate::stats::{AtomicDispatchStats, DispatchStats};

#[derive(Error, Debug)]
pub enum StartupError {
    #[error("configuration rejected: {0}")]
    Config(#[from] ConfigError),
    #[error("failed to spawn render thread: {0}")]
    Spawn(#[from] io::Error),
}

pub struct GraphicsBridge {
    config: BridgeConfig,
    registry: Arc<ContextRegistry>,
    host: HostApi,
    frames: FrameCoordinator,
    events: Arc<EventHub>,
    stats: Arc<AtomicDispatchStats>,
    dispatcher: Dispatcher,
}

impl GraphicsBridge {
    pub fn new(config: BridgeConfig) -> Result<Self, StartupError> {
        Self::with_allocator(config, system_allocator())
    }

    pub fn with_defaults() -> Result<Self, StartupError> {
        Self::new(BridgeConfig::default())
    }

    /// Start a bridge whose owned copies come from `allocator`.
    pub fn with_allocator(config: BridgeConfig, allocator: Arc<dyn HostAllocator>) -> Result<Self, StartupError> {
        config.validate()?;
        let registry = Arc::new(ContextRegistry::new());
        let events = Arc::new(EventHub::new(config.event_capacity, config.event_min_interval()));
        let stats = Arc::new(AtomicDispatchStats::default());

        let shared = Arc::new(Shared {
            registry: registry.clone(),
            events: events.clone(),
            stats: stats.clone(),
            allocator: allocator.clone(),
            teardown: config.teardown,
        });
        let dispatcher = Dispatcher::spawn(&config, shared)?;
        log::info!(
            "graphics bridge started: {} render thread(s), teardown {:?}",
            dispatcher.workers(),
            config.teardown
        );

        Ok(Self {
            host: HostApi::new(registry.clone(), stats.clone(), allocator, config.limits()),
            frames: FrameCoordinator::new(registry.clone()),
            config,
            registry,
            events,
            stats,
            dispatcher,
        })
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }

    /// Handle for script calls; clones share this bridge.
    pub fn host(&self) -> HostApi {
        self.host.clone()
    }

    pub fn context(&self, id: ContextId) -> BridgeResult<Arc<GraphicsContext>> {
        self.registry.get(id)
    }

    // ─── Windowing collaborator ────────────────────────────────────

    /// Register a context for a ready surface with default attributes.
    pub fn on_surface_ready(&self, source: Box<dyn SurfaceSource>) -> BridgeResult<ContextId> {
        self.on_surface_ready_with(source, ContextAttributes::default())
    }

    /// Register a context for a ready surface.
    ///
    /// The native context is opened on the assigned render thread; if that
    /// fails the context is reported lost.
    pub fn on_surface_ready_with(
        &self,
        source: Box<dyn SurfaceSource>,
        attributes: ContextAttributes,
    ) -> BridgeResult<ContextId> {
        let (worker, sender) = self.dispatcher.assign();
        let spec = NewContext {
            worker,
            label: source.describe(),
            attributes,
            size: source.size(),
            sender: sender.clone(),
            max_pending: self.config.max_pending_per_context,
        };
        let context = self.registry.create(spec, |ctx| {
            sender
                .send(RenderMessage::Attach { context: ctx.clone(), source })
                .map_err(|_| BridgeError::ContextLost(ctx.id()))
        })?;
        AtomicDispatchStats::bump(&self.stats.contexts_created);
        log::info!("{}: registered {} on worker {worker}", context.id(), context.label());
        Ok(context.id())
    }

    /// Begin destroying `id`. The returned pending resolves once the native
    /// context has been released.
    pub fn on_surface_destroyed(&self, id: ContextId) -> BridgeResult<Pending<()>> {
        self.registry.destroy(id)
    }

    /// [`on_surface_destroyed`](Self::on_surface_destroyed) and wait.
    ///
    /// Refused before anything is torn down when called from a render
    /// thread or from inside an async runtime.
    pub fn destroy_blocking(&self, id: ContextId) -> BridgeResult<()> {
        may_block()?;
        self.on_surface_destroyed(id)?.wait()
    }

    pub fn on_frame_tick(&self, id: ContextId) -> BridgeResult<Option<Pending<FrameInfo>>> {
        self.frames.tick(id)
    }

    pub fn add_frame_callback(
        &self,
        id: ContextId,
        callback: impl FnMut(&FrameInfo) + Send + 'static,
    ) -> BridgeResult<CallbackId> {
        self.frames.add_callback(id, Box::new(callback))
    }

    pub fn remove_frame_callback(&self, id: ContextId, callback: CallbackId) -> BridgeResult<()> {
        self.frames.remove_callback(id, callback)
    }

    // ─── Script side ───────────────────────────────────────────────

    pub fn invoke(&self, id: ContextId, op: &str, args: &Args) -> BridgeResult<Invocation> {
        self.host.invoke(id, op, args)
    }

    pub fn context_state(&self, id: ContextId) -> BridgeResult<ContextState> {
        Ok(self.registry.get(id)?.state())
    }

    // ─── Observability ─────────────────────────────────────────────

    pub fn subscribe(&self) -> broadcast::Receiver<BridgeEvent> {
        self.events.subscribe()
    }

    pub fn stats(&self) -> DispatchStats {
        self.stats.snapshot(self.registry.len())
    }

    pub fn event_stats(&self) -> EventStats {
        self.events.stats()
    }

    pub fn live_contexts(&self) -> Vec<ContextId> {
        self.registry.live()
    }
}

impl Drop for GraphicsBridge {
    fn drop(&mut self) {
        for id in self.registry.live() {
            let _ = self.registry.destroy(id);
        }
        self.dispatcher.shutdown();
        log::info!("graphics bridge stopped");
    }
}
