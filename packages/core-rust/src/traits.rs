use crate::context::MessageContext;
use crate::fault::Fault;
use crate::qname::QName;
use crate::types::Payload;

/// What the chain should do after a handler returned successfully.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlerFlow {
    /// Continue with the next handler.
    Continue,
    /// Stop the chain here and report success.
    Done,
}

/// A unit of message processing plugged into a phase.
///
/// One instance serves every in-flight message of the chains it is resolved
/// into, concurrently. Per-call state belongs in the `MessageContext`, never
/// in fields of the handler.
pub trait Handler: Send + Sync {
    /// Called once when the owning service is deployed.
    fn init(&self) -> anyhow::Result<()> {
        Ok(())
    }

    /// Processes the message. Returning `Err` stops the chain and triggers
    /// compensation of the handlers that already ran.
    fn invoke(&self, ctx: &mut MessageContext) -> Result<HandlerFlow, Fault>;

    /// Compensates the work of a successful `invoke` after a later handler
    /// in the same chain failed.
    fn undo(&self, _ctx: &mut MessageContext) {}

    /// Called once when the owning service is undeployed.
    fn cleanup(&self) {}

    /// Whether this handler understands the given header block or fault code.
    fn can_handle(&self, _name: &QName) -> bool {
        false
    }
}

/// Hook installed by the encoding layer to derive the effective fault code
/// of a failure, e.g. from a fault element inside the payload.
pub trait FaultCodeExtractor: Send + Sync {
    fn extract(&self, fault: &Fault, payload: &Payload) -> QName;
}
