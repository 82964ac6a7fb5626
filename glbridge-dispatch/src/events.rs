//! Bridge event fan-out.
//!
//! ```text
//!  render threads ──publish()──► EventThrottle ──► broadcast::Sender ──► subscriber 1
//!                                  (per context,                    ├──► subscriber 2
//!                                   per kind)                       └──► ...
//! ```
//!
//! Lifecycle events (created / lost / destroyed) always go out. Frame and
//! native-error events are rate limited: after one is emitted for a
//! (context, kind) pair, further ones inside the minimum interval are
//! dropped. Suppression looks only at recency, never at payload contents.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::sync::broadcast;

use glbridge_core::ContextId;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum BridgeEvent {
    ContextCreated { context: ContextId, width: u32, height: u32 },
    ContextLost { context: ContextId, reason: String },
    ContextDestroyed { context: ContextId },
    FramePresented { context: ContextId, frame: u64, commands: u64 },
    NativeError { context: ContextId, code: u32, message: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    ContextCreated,
    ContextLost,
    ContextDestroyed,
    FramePresented,
    NativeError,
}

impl EventKind {
    pub fn is_lifecycle(self) -> bool {
        matches!(
            self,
            EventKind::ContextCreated | EventKind::ContextLost | EventKind::ContextDestroyed
        )
    }
}

impl BridgeEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            BridgeEvent::ContextCreated { .. } => EventKind::ContextCreated,
            BridgeEvent::ContextLost { .. } => EventKind::ContextLost,
            BridgeEvent::ContextDestroyed { .. } => EventKind::ContextDestroyed,
            BridgeEvent::FramePresented { .. } => EventKind::FramePresented,
            BridgeEvent::NativeError { .. } => EventKind::NativeError,
        }
    }

    pub fn context(&self) -> ContextId {
        match self {
            BridgeEvent::ContextCreated { context, .. }
            | BridgeEvent::ContextLost { context, .. }
            | BridgeEvent::ContextDestroyed { context }
            | BridgeEvent::FramePresented { context, .. }
            | BridgeEvent::NativeError { context, .. } => *context,
        }
    }
}

// ───────────────────────────────────────────────────────────────────
// Throttle
// ───────────────────────────────────────────────────────────────────

/// Last-seen cache keyed by (context, kind) with a fixed minimum interval.
#[derive(Debug)]
pub struct EventThrottle {
    min_interval: Duration,
    last_seen: HashMap<(ContextId, EventKind), Instant>,
}

impl EventThrottle {
    pub fn new(min_interval: Duration) -> Self {
        Self {
            min_interval,
            last_seen: HashMap::new(),
        }
    }

    /// Whether an event of `kind` for `context` may go out at `now`.
    /// Records `now` as last-seen when it may.
    pub fn should_emit(&mut self, context: ContextId, kind: EventKind, now: Instant) -> bool {
        if kind.is_lifecycle() {
            return true;
        }
        match self.last_seen.get(&(context, kind)) {
            Some(last) if now.saturating_duration_since(*last) < self.min_interval => false,
            _ => {
                self.last_seen.insert((context, kind), now);
                true
            }
        }
    }

    /// Drop cached entries for a destroyed context.
    pub fn forget(&mut self, context: ContextId) {
        self.last_seen.retain(|(ctx, _), _| *ctx != context);
    }

    pub fn tracked(&self) -> usize {
        self.last_seen.len()
    }
}

// ───────────────────────────────────────────────────────────────────
// Hub
// ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct EventStats {
    pub published: u64,
    pub suppressed: u64,
}

pub struct EventHub {
    sender: broadcast::Sender<BridgeEvent>,
    throttle: Mutex<EventThrottle>,
    published: AtomicU64,
    suppressed: AtomicU64,
}

impl EventHub {
    pub fn new(capacity: usize, min_interval: Duration) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            sender,
            throttle: Mutex::new(EventThrottle::new(min_interval)),
            published: AtomicU64::new(0),
            suppressed: AtomicU64::new(0),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<BridgeEvent> {
        self.sender.subscribe()
    }

    /// Publish unless throttled. Returns whether the event went out.
    pub fn publish(&self, event: BridgeEvent) -> bool {
        let context = event.context();
        let kind = event.kind();
        {
            let mut throttle = self.throttle.lock().unwrap_or_else(PoisonError::into_inner);
            if !throttle.should_emit(context, kind, Instant::now()) {
                self.suppressed.fetch_add(1, Ordering::Relaxed);
                log::trace!("{context}: {kind:?} suppressed");
                return false;
            }
            if kind == EventKind::ContextDestroyed {
                throttle.forget(context);
            }
        }
        // No subscribers is not an error.
        let _ = self.sender.send(event);
        self.published.fetch_add(1, Ordering::Relaxed);
        true
    }

    pub fn stats(&self) -> EventStats {
        EventStats {
            published: self.published.load(Ordering::Relaxed),
            suppressed: self.suppressed.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(context: u64, frame: u64) -> BridgeEvent {
        BridgeEvent::FramePresented { context: ContextId(context), frame, commands: 0 }
    }

    #[test]
    fn test_throttle_by_recency() {
        let mut throttle = EventThrottle::new(Duration::from_millis(16));
        let t0 = Instant::now();
        let ctx = ContextId(1);
        assert!(throttle.should_emit(ctx, EventKind::FramePresented, t0));
        assert!(!throttle.should_emit(ctx, EventKind::FramePresented, t0 + Duration::from_millis(5)));
        // Other kinds and contexts have their own slot
        assert!(throttle.should_emit(ctx, EventKind::NativeError, t0));
        assert!(throttle.should_emit(ContextId(2), EventKind::FramePresented, t0));
        assert!(throttle.should_emit(ctx, EventKind::FramePresented, t0 + Duration::from_millis(16)));
    }

    #[test]
    fn test_lifecycle_never_throttled() {
        let mut throttle = EventThrottle::new(Duration::from_secs(60));
        let now = Instant::now();
        for _ in 0..3 {
            assert!(throttle.should_emit(ContextId(1), EventKind::ContextLost, now));
        }
        assert_eq!(throttle.tracked(), 0);
    }

    #[tokio::test]
    async fn test_hub_fan_out_and_suppression() {
        let hub = EventHub::new(16, Duration::from_secs(60));
        let mut a = hub.subscribe();
        let mut b = hub.subscribe();

        assert!(hub.publish(frame(1, 1)));
        assert!(!hub.publish(frame(1, 2)));
        assert!(hub.publish(BridgeEvent::ContextDestroyed { context: ContextId(1) }));

        assert_eq!(a.recv().await.unwrap(), frame(1, 1));
        assert_eq!(b.recv().await.unwrap(), frame(1, 1));
        assert_eq!(a.recv().await.unwrap().kind(), EventKind::ContextDestroyed);
        assert_eq!(hub.stats(), EventStats { published: 2, suppressed: 1 });
    }

    #[test]
    fn test_destroy_forgets_context() {
        let hub = EventHub::new(4, Duration::from_secs(60));
        assert!(hub.publish(frame(9, 1)));
        hub.publish(BridgeEvent::ContextDestroyed { context: ContextId(9) });
        assert!(hub.publish(frame(9, 1)));
    }

    #[test]
    fn test_event_json_shape() {
        let json = serde_json::to_value(frame(3, 12)).unwrap();
        assert_eq!(json["type"], "framePresented");
        assert_eq!(json["context"], 3);
        assert_eq!(json["frame"], 12);
    }
}
