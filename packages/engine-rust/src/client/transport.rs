use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use soapflow_core::{Flow, MessageContext, Payload};
use tower::util::BoxCloneService;
use tower::ServiceExt;

use super::callback::CallError;
use crate::engine::DispatchEngine;
use crate::middleware::build_dispatch_pipeline;
use crate::operation::{DispatchError, DispatchReport, DEADLINE_PROPERTY};

/// Carries an outbound request to its destination and returns the
/// response body, if any.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Sends `request`. `Ok(None)` means the exchange was one-way.
    ///
    /// # Errors
    ///
    /// `CallError::Fault` if the receiver answered with a fault, or
    /// `CallError::Transport` if the message could not be delivered.
    async fn send(&self, request: &MessageContext) -> Result<Option<Payload>, CallError>;
}

type ServerPipeline = BoxCloneService<MessageContext, DispatchReport, DispatchError>;

/// Delivers requests to an engine in the same process, through that
/// engine's dispatch pipeline (load shedding, deadline, metrics).
///
/// Only what crosses a wire is handed over: service, operation, headers,
/// payload and the request deadline. The receiving engine builds its own
/// context.
pub struct LoopbackTransport {
    engine_id: String,
    pipeline: Mutex<ServerPipeline>,
}

impl LoopbackTransport {
    #[must_use]
    pub fn new(server: Arc<DispatchEngine>) -> Self {
        Self {
            engine_id: server.engine_id().to_string(),
            pipeline: Mutex::new(BoxCloneService::new(build_dispatch_pipeline(server))),
        }
    }
}

impl std::fmt::Debug for LoopbackTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoopbackTransport")
            .field("server", &self.engine_id)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl Transport for LoopbackTransport {
    async fn send(&self, request: &MessageContext) -> Result<Option<Payload>, CallError> {
        let mut inbound = MessageContext::new(
            request.service.clone(),
            request.operation.clone(),
            Flow::In,
            request.payload.clone(),
        );
        inbound.message_id = request.message_id;
        for header in &request.headers {
            inbound = inbound.with_header(header.name.clone(), header.must_understand);
        }
        if let Some(deadline) = request.property(DEADLINE_PROPERTY) {
            inbound.set_property(DEADLINE_PROPERTY, deadline.clone());
        }

        // Clones share the load-shed permits of the original.
        let pipeline = self.pipeline.lock().clone();
        let report = pipeline.oneshot(inbound).await?;
        Ok(report.response.map(|ctx| ctx.payload))
    }
}
