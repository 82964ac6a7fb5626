//! # glbridge-dispatch
//!
//! Cross-thread command dispatch for the graphics bridge.
//!
//! ```text
//!  script thread(s)                         render thread(s)
//!  ────────────────                         ────────────────
//!  HostApi::invoke ──┬─ immediate ─► cached ContextState
//!                    └─ deferred ──► Command{seq} ──mpsc──► RenderWorker ──► GraphicsDevice
//!                                        ▲                        │
//!                        Pending<Value> ◄┴──── Completer ◄────────┘
//! ```
//!
//! ## Modules
//!
//! - [`bridge`]: facade for the windowing collaborator and script runtime
//! - [`host`]: operation table, argument validation, command encoding
//! - [`registry`]: context ids, lifecycle flags, state mirror
//! - [`dispatcher`]: render workers
//! - [`frame`]: present ticks and frame callbacks
//! - [`completion`]: single-resolution result channels
//! - [`events`]: event fan-out with per-kind throttling
//! - [`config`]: bridge configuration
//! - [`stats`]: dispatch counters

pub mod bridge;
pub mod completion;
pub mod config;
pub mod dispatcher;
pub mod events;
pub mod frame;
pub mod host;
pub mod registry;
pub mod stats;

pub use bridge::{GraphicsBridge, StartupError};
pub use completion::{Completer, Pending};
pub use config::{BridgeConfig, TeardownPolicy};
pub use dispatcher::{on_render_thread, Dispatcher};
pub use events::{BridgeEvent, EventHub, EventKind, EventStats, EventThrottle};
pub use frame::{CallbackId, FrameCallback, FrameCoordinator, FrameInfo};
pub use host::{HostApi, Invocation, OpClass, OpSpec, OP_TABLE};
pub use registry::{ContextRegistry, GraphicsContext};
pub use stats::DispatchStats;
