//! Load-shedding middleware for dispatches.
//!
//! Rejects a message when the number of concurrent dispatches reaches
//! `max_concurrent_dispatches`, with `DispatchError::Overloaded`.

use std::sync::Arc;
use std::task::{Context, Poll};

use soapflow_core::MessageContext;
use tokio::sync::Semaphore;
use tower::{Layer, Service};
use tracing::warn;

use super::DispatchFuture;
use crate::operation::{DispatchError, DispatchReport};

// ---------------------------------------------------------------------------
// LoadShedLayer
// ---------------------------------------------------------------------------

/// Tower layer that limits concurrent dispatches via a semaphore.
///
/// When all permits are taken, incoming messages are rejected immediately
/// rather than queued.
#[derive(Debug, Clone)]
pub struct LoadShedLayer {
    semaphore: Arc<Semaphore>,
}

impl LoadShedLayer {
    #[must_use]
    pub fn new(max_concurrent: u32) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(max_concurrent as usize)),
        }
    }
}

impl<S> Layer<S> for LoadShedLayer {
    type Service = LoadShedService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        LoadShedService {
            inner,
            semaphore: Arc::clone(&self.semaphore),
        }
    }
}

// ---------------------------------------------------------------------------
// LoadShedService
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct LoadShedService<S> {
    inner: S,
    semaphore: Arc<Semaphore>,
}

impl<S> Service<MessageContext> for LoadShedService<S>
where
    S: Service<MessageContext, Response = DispatchReport, Error = DispatchError> + Send,
    S::Future: Send + 'static,
{
    type Response = DispatchReport;
    type Error = DispatchError;
    type Future = DispatchFuture;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, ctx: MessageContext) -> Self::Future {
        let Ok(permit) = Arc::clone(&self.semaphore).try_acquire_owned() else {
            warn!(service = %ctx.service, message_id = %ctx.message_id, "dispatch shed");
            return Box::pin(async { Err(DispatchError::Overloaded) });
        };

        let fut = self.inner.call(ctx);
        Box::pin(async move {
            let result = fut.await;
            drop(permit);
            result
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use soapflow_core::{Flow, Payload, QName};
    use tower::ServiceExt;

    use super::*;
    use crate::operation::DispatchOutcome;

    /// Holds every message for a fixed delay.
    struct SlowService {
        delay_ms: u64,
    }

    impl Service<MessageContext> for SlowService {
        type Response = DispatchReport;
        type Error = DispatchError;
        type Future = DispatchFuture;

        fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
            Poll::Ready(Ok(()))
        }

        fn call(&mut self, ctx: MessageContext) -> Self::Future {
            let delay = self.delay_ms;
            Box::pin(async move {
                tokio::time::sleep(Duration::from_millis(delay)).await;
                Ok(DispatchReport::new(ctx, DispatchOutcome::Completed))
            })
        }
    }

    fn message() -> MessageContext {
        MessageContext::new(
            QName::local("Echo"),
            QName::local("echo"),
            Flow::In,
            Payload::empty(),
        )
    }

    #[tokio::test]
    async fn allows_dispatches_under_limit() {
        let svc = LoadShedLayer::new(10).layer(SlowService { delay_ms: 1 });
        let report = svc.oneshot(message()).await.unwrap();
        assert_eq!(report.outcome, DispatchOutcome::Completed);
    }

    #[tokio::test]
    async fn rejects_when_overloaded() {
        let mut svc = LoadShedLayer::new(1).layer(SlowService { delay_ms: 500 });

        let _ = ServiceExt::ready(&mut svc).await.unwrap();
        let _in_flight = tokio::spawn(svc.call(message()));
        tokio::time::sleep(Duration::from_millis(10)).await;

        let err = svc.call(message()).await.unwrap_err();
        assert!(matches!(err, DispatchError::Overloaded));
    }
}
