//! Per-request / per-connection context construction.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::watch;

use crate::error::RelayError;

/// Transport-level request description handed to the context factory.
///
/// Headers are an ordered multi-value list in arrival order.
#[derive(Clone, Debug)]
pub struct RequestInfo {
    /// Upper-cased HTTP method of the request (or upgrade request).
    pub method: String,
    /// Request path.
    pub path: String,
    /// Raw query string, empty when absent.
    pub query: String,
    /// Ordered multi-value headers.
    pub headers: Vec<(String, String)>,
}

/// Produces the caller-defined context passed into every dispatch.
///
/// Invoked once per HTTP exchange, or once per WebSocket connection at
/// upgrade time. May fail; the failure is delivered to the client as a
/// typed error.
#[async_trait]
pub trait ContextFactory<Ctx>: Send + Sync {
    /// Build a context for the given request.
    async fn create_context(&self, info: &RequestInfo) -> Result<Ctx, RelayError>;
}

#[async_trait]
impl<Ctx, F, Fut> ContextFactory<Ctx> for F
where
    F: Fn(RequestInfo) -> Fut + Send + Sync,
    Fut: std::future::Future<Output = Result<Ctx, RelayError>> + Send,
    Ctx: 'static,
{
    async fn create_context(&self, info: &RequestInfo) -> Result<Ctx, RelayError> {
        self(info.clone()).await
    }
}

enum SlotState<C> {
    Pending,
    Ready(Arc<C>),
    Failed(RelayError),
}

/// Lazily resolved shared context.
///
/// Resolution is initiated once (at upgrade time for WebSocket connections)
/// and may complete after messages have already started arriving. Callers
/// that need the context [`get`](ContextSlot::get) it: waiters queue on the
/// slot until resolution completes, and a factory failure is delivered to
/// every waiter.
pub struct ContextSlot<C> {
    rx: watch::Receiver<SlotState<C>>,
}

impl<C> Clone for ContextSlot<C> {
    fn clone(&self) -> Self {
        Self {
            rx: self.rx.clone(),
        }
    }
}

impl<C: Send + Sync + 'static> ContextSlot<C> {
    /// Spawn `fut` as the resolution task and return the slot.
    pub fn spawn<F>(fut: F) -> Self
    where
        F: std::future::Future<Output = Result<C, RelayError>> + Send + 'static,
    {
        let (tx, rx) = watch::channel(SlotState::Pending);
        drop(tokio::spawn(async move {
            let state = match fut.await {
                Ok(ctx) => SlotState::Ready(Arc::new(ctx)),
                Err(err) => {
                    tracing::warn!(code = err.code(), "context resolution failed");
                    SlotState::Failed(err)
                }
            };
            // All receivers gone means nobody is waiting; nothing to do.
            let _ = tx.send(state);
        }));
        Self { rx }
    }

    /// A slot that is already resolved.
    pub fn ready(ctx: C) -> Self {
        let (_tx, rx) = watch::channel(SlotState::Ready(Arc::new(ctx)));
        Self { rx }
    }

    /// Wait for resolution and return the shared context.
    pub async fn get(&self) -> Result<Arc<C>, RelayError> {
        let mut rx = self.rx.clone();
        loop {
            {
                let state = rx.borrow_and_update();
                match &*state {
                    SlotState::Ready(ctx) => return Ok(ctx.clone()),
                    SlotState::Failed(err) => return Err(err.clone()),
                    SlotState::Pending => {}
                }
            }
            if rx.changed().await.is_err() {
                return Err(RelayError::internal("context resolution task dropped"));
            }
        }
    }

    /// Whether resolution has completed (successfully or not).
    pub fn is_resolved(&self) -> bool {
        !matches!(&*self.rx.borrow(), SlotState::Pending)
    }
}
