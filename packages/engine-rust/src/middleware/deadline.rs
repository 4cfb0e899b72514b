//! Deadline middleware for dispatches.
//!
//! A message may carry its own deadline in the `DEADLINE_PROPERTY` property;
//! otherwise the layer's default applies. A dispatch that overruns returns
//! `DispatchError::DeadlineExceeded`. Handlers already running on the
//! blocking pool finish in the background; their result is discarded.

use std::task::{Context, Poll};
use std::time::Duration;

use soapflow_core::{MessageContext, Value};
use tower::{Layer, Service};

use super::DispatchFuture;
use crate::operation::{DispatchError, DispatchReport, DEADLINE_PROPERTY};

/// Tower layer enforcing a per-message dispatch deadline.
#[derive(Debug, Clone, Copy)]
pub struct DeadlineLayer {
    default_timeout_ms: u64,
}

impl DeadlineLayer {
    #[must_use]
    pub fn new(default_timeout_ms: u64) -> Self {
        Self { default_timeout_ms }
    }
}

impl<S> Layer<S> for DeadlineLayer {
    type Service = DeadlineService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        DeadlineService {
            inner,
            default_timeout_ms: self.default_timeout_ms,
        }
    }
}

#[derive(Debug, Clone)]
pub struct DeadlineService<S> {
    inner: S,
    default_timeout_ms: u64,
}

impl<S> Service<MessageContext> for DeadlineService<S>
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
        let timeout_ms = ctx
            .property(DEADLINE_PROPERTY)
            .and_then(Value::as_int)
            .and_then(|ms| u64::try_from(ms).ok())
            .unwrap_or(self.default_timeout_ms);
        let fut = self.inner.call(ctx);
        Box::pin(async move {
            match tokio::time::timeout(Duration::from_millis(timeout_ms), fut).await {
                Ok(result) => result,
                Err(_elapsed) => Err(DispatchError::DeadlineExceeded { timeout_ms }),
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use soapflow_core::{Flow, Payload, QName};
    use tower::ServiceExt;

    use super::*;
    use crate::operation::DispatchOutcome;

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

    #[tokio::test(start_paused = true)]
    async fn completes_within_default_deadline() {
        let svc = DeadlineLayer::new(1_000).layer(SlowService { delay_ms: 10 });
        assert!(svc.oneshot(message()).await.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn default_deadline_exceeded() {
        let svc = DeadlineLayer::new(50).layer(SlowService { delay_ms: 500 });
        let err = svc.oneshot(message()).await.unwrap_err();
        assert!(matches!(err, DispatchError::DeadlineExceeded { timeout_ms: 50 }));
    }

    #[tokio::test(start_paused = true)]
    async fn message_property_overrides_default() {
        let svc = DeadlineLayer::new(10_000).layer(SlowService { delay_ms: 500 });
        let mut ctx = message();
        ctx.set_property(DEADLINE_PROPERTY, 100_i64);
        let err = svc.oneshot(ctx).await.unwrap_err();
        assert!(matches!(err, DispatchError::DeadlineExceeded { timeout_ms: 100 }));
    }
}
