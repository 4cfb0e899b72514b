//! Pipeline composition: wraps the engine in every middleware layer.

use std::sync::Arc;

use soapflow_core::MessageContext;
use tower::ServiceBuilder;

use super::deadline::DeadlineLayer;
use super::dispatch::EngineService;
use super::load_shed::LoadShedLayer;
use super::metrics::MetricsLayer;
use super::DispatchFuture;
use crate::engine::DispatchEngine;
use crate::operation::{DispatchError, DispatchReport};

/// Builds the server-side pipeline around `engine`, configured from the
/// engine's own config. Each request is received: inbound chain, then the
/// outbound chain on the response.
///
/// Layer order (outermost to innermost):
/// 1. `LoadShedLayer`: reject when overloaded, before doing any work
/// 2. `DeadlineLayer`: enforce the per-message deadline
/// 3. `MetricsLayer`: record timing and outcome around the dispatch itself
#[must_use]
pub fn build_dispatch_pipeline(
    engine: Arc<DispatchEngine>,
) -> impl tower::Service<
    MessageContext,
    Response = DispatchReport,
    Error = DispatchError,
    Future = DispatchFuture,
> + Clone
+ Send
+ 'static {
    let config = engine.config();
    ServiceBuilder::new()
        .layer(LoadShedLayer::new(config.max_concurrent_dispatches))
        .layer(DeadlineLayer::new(config.default_dispatch_timeout_ms))
        .layer(MetricsLayer)
        .service(EngineService::new(Arc::clone(&engine)))
}

#[cfg(test)]
mod tests {
    use soapflow_core::{fault_codes, Flow, Payload, PhaseRule, QName};
    use tower::ServiceExt;

    use super::*;
    use crate::config::EngineConfig;
    use crate::deployment::{HandlerSpec, ServiceSpec};
    use crate::handlers::EchoHandler;
    use crate::operation::DispatchOutcome;

    fn engine() -> Arc<DispatchEngine> {
        let engine = Arc::new(
            DispatchEngine::new(EngineConfig {
                max_concurrent_dispatches: 100,
                ..EngineConfig::default()
            })
            .unwrap(),
        );
        engine
            .deploy(ServiceSpec::new("Echo").handler(
                Flow::In,
                HandlerSpec::named("Echo", Arc::new(EchoHandler), PhaseRule::new("service")),
            ))
            .unwrap();
        engine
    }

    fn message(service: &str) -> MessageContext {
        MessageContext::new(
            QName::local(service),
            QName::local("echo"),
            Flow::In,
            Payload::from("ping"),
        )
    }

    #[tokio::test]
    async fn pipeline_dispatches_through_all_layers() {
        let svc = build_dispatch_pipeline(engine());
        let report = svc.oneshot(message("Echo")).await.unwrap();
        assert_eq!(report.outcome, DispatchOutcome::Completed);
        let response = report.response.unwrap();
        assert_eq!(response.flow, Flow::Out);
        assert_eq!(response.relates_to, Some(report.context.message_id));
        assert_eq!(response.payload.as_str(), Some("ping"));
    }

    #[tokio::test]
    async fn pipeline_surfaces_faults() {
        let svc = build_dispatch_pipeline(engine());
        let err = svc.oneshot(message("Missing")).await.unwrap_err();
        assert_eq!(err.fault().map(|f| &f.code), Some(&fault_codes::client()));
    }
}
