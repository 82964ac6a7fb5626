//! Single-resolution completion channels.
//!
//! A [`Completer`] is consumed by `resolve`, so a channel can never be
//! resolved twice. If the completer is dropped unresolved (the render thread
//! went away with the command) the [`Pending`] side reports `ContextLost`.

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::runtime::Handle;
use tokio::sync::oneshot;

use glbridge_core::{BridgeError, BridgeResult, ContextId};

use crate::dispatcher::on_render_thread;

/// Create a linked completer / pending pair for a call against `context`.
pub fn channel<T>(context: ContextId) -> (Completer<T>, Pending<T>) {
    let (tx, rx) = oneshot::channel();
    (Completer { tx }, Pending { context, rx, finish: None })
}

/// Resolving half, owned by whoever executes the call.
#[derive(Debug)]
pub struct Completer<T> {
    tx: oneshot::Sender<BridgeResult<T>>,
}

impl<T> Completer<T> {
    /// Deliver the outcome. Returns `false` if the caller stopped waiting.
    pub fn resolve(self, result: BridgeResult<T>) -> bool {
        self.tx.send(result).is_ok()
    }
}

/// Whether the current thread may park on a pending result.
pub(crate) fn may_block() -> BridgeResult<()> {
    if on_render_thread() {
        return Err(BridgeError::ReentrantCall);
    }
    if Handle::try_current().is_ok() {
        return Err(BridgeError::BlockingInRuntime);
    }
    Ok(())
}

type Finish<T> = Box<dyn FnOnce(T) -> BridgeResult<T> + Send>;

/// Waiting half handed to the caller.
pub struct Pending<T> {
    context: ContextId,
    rx: oneshot::Receiver<BridgeResult<T>>,
    /// Runs on the receiving thread once a success arrives.
    finish: Option<Finish<T>>,
}

impl<T> Pending<T> {
    /// An already-resolved pending value.
    pub fn resolved(context: ContextId, result: BridgeResult<T>) -> Self {
        let (completer, pending) = channel(context);
        completer.resolve(result);
        pending
    }

    pub fn context(&self) -> ContextId {
        self.context
    }

    /// Run `step` on the caller's side after a successful resolution.
    ///
    /// Steps run in the order they were added; an error from one skips
    /// the rest and becomes the outcome.
    pub fn and_then(mut self, step: impl FnOnce(T) -> BridgeResult<T> + Send + 'static) -> Self
    where
        T: 'static,
    {
        let finish: Finish<T> = match self.finish.take() {
            None => Box::new(step),
            Some(first) => Box::new(move |value| first(value).and_then(step)),
        };
        self.finish = Some(finish);
        self
    }

    /// Block the current thread until resolved.
    ///
    /// For callers outside any async runtime. Rejected with `ReentrantCall`
    /// on a render thread and with `BlockingInRuntime` on a thread that is
    /// driving a tokio runtime.
    pub fn wait(mut self) -> BridgeResult<T> {
        may_block()?;
        let rx = std::mem::replace(&mut self.rx, oneshot::channel().1);
        let received = rx.blocking_recv().ok();
        self.settle(received)
    }

    /// The outcome if already resolved.
    pub fn try_result(&mut self) -> Option<BridgeResult<T>> {
        match self.rx.try_recv() {
            Ok(result) => Some(self.settle(Some(result))),
            Err(oneshot::error::TryRecvError::Empty) => None,
            Err(oneshot::error::TryRecvError::Closed) => Some(self.settle(None)),
        }
    }

    fn settle(&mut self, received: Option<BridgeResult<T>>) -> BridgeResult<T> {
        let value = received.unwrap_or(Err(BridgeError::ContextLost(self.context)))?;
        match self.finish.take() {
            Some(finish) => finish(value),
            None => Ok(value),
        }
    }
}

impl<T> Future for Pending<T> {
    type Output = BridgeResult<T>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        match Pin::new(&mut this.rx).poll(cx) {
            Poll::Ready(received) => Poll::Ready(this.settle(received.ok())),
            Poll::Pending => Poll::Pending,
        }
    }
}

impl<T> fmt::Debug for Pending<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pending")
            .field("context", &self.context)
            .field("finish", &self.finish.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_resolves_once() {
        let (completer, pending) = channel::<u32>(ContextId(1));
        assert!(completer.resolve(Ok(7)));
        assert_eq!(pending.await, Ok(7));
    }

    #[tokio::test]
    async fn test_dropped_completer_is_context_lost() {
        let (completer, pending) = channel::<u32>(ContextId(4));
        drop(completer);
        assert_eq!(pending.await, Err(BridgeError::ContextLost(ContextId(4))));
    }

    #[test]
    fn test_try_result_and_wait() {
        let (completer, mut pending) = channel::<&str>(ContextId(2));
        assert!(pending.try_result().is_none());
        completer.resolve(Ok("done"));
        assert_eq!(pending.wait(), Ok("done"));

        let mut resolved = Pending::resolved(ContextId(3), Ok(()));
        assert_eq!(resolved.try_result(), Some(Ok(())));
    }

    #[test]
    fn test_resolve_after_caller_gave_up() {
        let (completer, pending) = channel::<u8>(ContextId(5));
        drop(pending);
        assert!(!completer.resolve(Ok(1)));
    }

    #[tokio::test]
    async fn test_wait_inside_runtime_is_rejected() {
        let pending = Pending::resolved(ContextId(6), Ok(1u8));
        assert_eq!(pending.wait(), Err(BridgeError::BlockingInRuntime));

        // Awaiting the same kind of value works
        assert_eq!(Pending::resolved(ContextId(6), Ok(1u8)).await, Ok(1));
    }

    #[tokio::test]
    async fn test_and_then_runs_in_order_on_success_only() {
        let (completer, pending) = channel::<u32>(ContextId(7));
        let pending = pending.and_then(|v| Ok(v + 1)).and_then(|v| Ok(v * 10));
        completer.resolve(Ok(1));
        assert_eq!(pending.await, Ok(20));

        let failing = Pending::resolved(ContextId(7), Ok(1u32))
            .and_then(|_| Err(BridgeError::invalid_argument("step failed")))
            .and_then(|v| Ok(v + 100));
        assert!(matches!(failing.await, Err(BridgeError::InvalidArgument(_))));

        let lost = Pending::<u32>::resolved(ContextId(7), Err(BridgeError::ContextLost(ContextId(7))))
            .and_then(|_| panic!("step must not run"));
        assert_eq!(lost.await, Err(BridgeError::ContextLost(ContextId(7))));
    }
}
