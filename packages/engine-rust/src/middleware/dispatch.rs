use std::sync::Arc;
use std::task::{Context, Poll};

use soapflow_core::MessageContext;
use tower::Service;

use super::DispatchFuture;
use crate::engine::DispatchEngine;
use crate::operation::{DispatchError, DispatchReport};

/// Innermost service of the pipeline: receives each request on the
/// engine's blocking pool, running the inbound chain and, for a response,
/// the outbound chain.
#[derive(Debug, Clone)]
pub struct EngineService {
    engine: Arc<DispatchEngine>,
}

impl EngineService {
    #[must_use]
    pub fn new(engine: Arc<DispatchEngine>) -> Self {
        Self { engine }
    }
}

impl Service<MessageContext> for EngineService {
    type Response = DispatchReport;
    type Error = DispatchError;
    type Future = DispatchFuture;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, ctx: MessageContext) -> Self::Future {
        Box::pin(Arc::clone(&self.engine).receive_owned(ctx))
    }
}
