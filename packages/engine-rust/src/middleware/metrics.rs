//! Metrics middleware for dispatches.
//!
//! Wraps each dispatch in a `tracing` span and records a counter and a
//! duration histogram through the `metrics` facade. Without an installed
//! recorder the `metrics` calls are no-ops.

use std::task::{Context, Poll};
use std::time::Instant;

use soapflow_core::MessageContext;
use tower::{Layer, Service};
use tracing::{info_span, Instrument};

use super::DispatchFuture;
use crate::operation::{DispatchError, DispatchOutcome, DispatchReport};

/// Tower layer that instruments dispatches with timing and counting.
#[derive(Debug, Clone, Copy)]
pub struct MetricsLayer;

impl<S> Layer<S> for MetricsLayer {
    type Service = MetricsService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        MetricsService { inner }
    }
}

#[derive(Debug, Clone)]
pub struct MetricsService<S> {
    inner: S,
}

/// Label value describing how a dispatch ended.
fn outcome_label(result: &Result<DispatchReport, DispatchError>) -> &'static str {
    match result {
        Ok(report) => match report.outcome {
            DispatchOutcome::Completed => "completed",
            DispatchOutcome::ShortCircuited { .. } => "short_circuited",
            DispatchOutcome::FaultAbsorbed { .. } => "fault_absorbed",
        },
        Err(DispatchError::Fault(_)) => "fault",
        Err(DispatchError::Overloaded) => "overloaded",
        Err(DispatchError::DeadlineExceeded { .. }) => "deadline_exceeded",
        Err(DispatchError::Internal(_)) => "internal",
    }
}

impl<S> Service<MessageContext> for MetricsService<S>
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
        let service = ctx.service.local_part.clone();
        let flow = ctx.flow.to_string();
        let span = info_span!(
            "dispatch_request",
            service = %ctx.service,
            operation = %ctx.operation,
            flow = %flow,
            message_id = %ctx.message_id,
            duration_ms = tracing::field::Empty,
            outcome = tracing::field::Empty,
        );

        let fut = self.inner.call(ctx);

        Box::pin(
            async move {
                let start = Instant::now();
                let result = fut.await;
                let elapsed = start.elapsed();
                let outcome = outcome_label(&result);

                #[allow(clippy::cast_possible_truncation)]
                let duration_ms = elapsed.as_millis() as u64;
                tracing::Span::current().record("duration_ms", duration_ms);
                tracing::Span::current().record("outcome", outcome);

                metrics::counter!(
                    "soapflow.dispatch.total",
                    "service" => service.clone(),
                    "flow" => flow,
                    "outcome" => outcome
                )
                .increment(1);
                metrics::histogram!("soapflow.dispatch.duration_seconds", "service" => service)
                    .record(elapsed.as_secs_f64());

                tracing::info!(duration_ms, outcome, "dispatch complete");
                result
            }
            .instrument(span),
        )
    }
}
