//! Reusable handlers.

use std::sync::Arc;

use soapflow_core::{Fault, Handler, HandlerFlow, MessageContext};
use tracing::info;

/// Logs every message passing through its phase.
#[derive(Debug, Clone)]
pub struct LoggingHandler {
    label: String,
}

impl LoggingHandler {
    #[must_use]
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
        }
    }
}

impl Handler for LoggingHandler {
    fn invoke(&self, ctx: &mut MessageContext) -> Result<HandlerFlow, Fault> {
        info!(
            label = %self.label,
            message_id = %ctx.message_id,
            service = %ctx.service,
            operation = %ctx.operation,
            flow = %ctx.flow,
            bytes = ctx.payload.len(),
            "message"
        );
        Ok(HandlerFlow::Continue)
    }
}

/// Service provider that answers every request with its own payload.
#[derive(Debug, Clone, Copy, Default)]
pub struct EchoHandler;

impl Handler for EchoHandler {
    fn invoke(&self, ctx: &mut MessageContext) -> Result<HandlerFlow, Fault> {
        ctx.response = Some(ctx.payload.clone());
        Ok(HandlerFlow::Continue)
    }
}

/// A handler whose `invoke` is a closure.
pub struct FnHandler<F>(F);

impl<F> Handler for FnHandler<F>
where
    F: Fn(&mut MessageContext) -> Result<HandlerFlow, Fault> + Send + Sync,
{
    fn invoke(&self, ctx: &mut MessageContext) -> Result<HandlerFlow, Fault> {
        (self.0)(ctx)
    }
}

/// Wraps `f` as a shared handler.
pub fn handler_fn<F>(f: F) -> Arc<dyn Handler>
where
    F: Fn(&mut MessageContext) -> Result<HandlerFlow, Fault> + Send + Sync + 'static,
{
    Arc::new(FnHandler(f))
}

#[cfg(test)]
mod tests {
    use soapflow_core::{Flow, Payload, QName};

    use super::*;

    fn ctx(body: &'static str) -> MessageContext {
        MessageContext::new(
            QName::local("Echo"),
            QName::local("echo"),
            Flow::In,
            Payload::from(body),
        )
    }

    #[test]
    fn echo_copies_payload_into_response() {
        let mut ctx = ctx("ping");
        assert_eq!(EchoHandler.invoke(&mut ctx).unwrap(), HandlerFlow::Continue);
        assert_eq!(ctx.response.as_ref().and_then(Payload::as_str), Some("ping"));
    }

    #[test]
    fn closure_handler_can_fail() {
        let handler = handler_fn(|ctx| {
            if ctx.payload.is_empty() {
                Err(Fault::client("empty body"))
            } else {
                Ok(HandlerFlow::Done)
            }
        });
        assert_eq!(handler.invoke(&mut ctx("x")).unwrap(), HandlerFlow::Done);
        assert!(handler.invoke(&mut ctx("")).is_err());
    }

    #[test]
    fn logging_handler_continues() {
        let handler = LoggingHandler::new("audit");
        assert_eq!(handler.invoke(&mut ctx("x")).unwrap(), HandlerFlow::Continue);
    }
}
