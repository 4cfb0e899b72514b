//! Dispatch outcomes and engine errors.

use soapflow_core::{ChainOutcome, Fault, Flow, MessageContext, QName, ResolutionError};

/// Property key a context can set (integer milliseconds) to override the
/// dispatch pipeline's default deadline.
pub const DEADLINE_PROPERTY: &str = "soapflow.dispatch.timeout_ms";

/// Successful result of a dispatch.
#[derive(Debug, Clone, PartialEq)]
pub enum DispatchOutcome {
    /// The selected chain ran to the end.
    Completed,
    /// A handler stopped the chain early with `HandlerFlow::Done`.
    ShortCircuited { handler: QName },
    /// A handler failed and a registered fault handler absorbed the fault.
    FaultAbsorbed { fault: Fault },
}

impl From<ChainOutcome> for DispatchOutcome {
    fn from(outcome: ChainOutcome) -> Self {
        match outcome {
            ChainOutcome::Completed => DispatchOutcome::Completed,
            ChainOutcome::ShortCircuited { handler } => DispatchOutcome::ShortCircuited { handler },
        }
    }
}

/// A dispatched context together with its outcome.
#[derive(Debug)]
pub struct DispatchReport {
    pub context: MessageContext,
    pub outcome: DispatchOutcome,
    /// Response produced by `receive` after the outbound chain ran on it.
    /// `None` for single-direction dispatches and one-way messages.
    pub response: Option<MessageContext>,
}

impl DispatchReport {
    #[must_use]
    pub fn new(context: MessageContext, outcome: DispatchOutcome) -> Self {
        Self {
            context,
            outcome,
            response: None,
        }
    }
}

/// Errors returned by dispatch.
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    /// A handler fault no fault handler absorbed, or the error a fault
    /// handler re-raised.
    #[error(transparent)]
    Fault(#[from] Fault),
    #[error("engine overloaded, try again later")]
    Overloaded,
    #[error("dispatch exceeded its deadline of {timeout_ms}ms")]
    DeadlineExceeded { timeout_ms: u64 },
    #[error("internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl DispatchError {
    #[must_use]
    pub fn fault(&self) -> Option<&Fault> {
        match self {
            DispatchError::Fault(fault) => Some(fault),
            _ => None,
        }
    }
}

/// Errors from deploying services or engaging handlers.
#[derive(Debug, thiserror::Error)]
pub enum DeployError {
    #[error("cannot resolve the {flow} chain of {scope}: {source}")]
    Resolution {
        scope: String,
        flow: Flow,
        #[source]
        source: ResolutionError,
    },
    #[error("handler {handler} failed to initialize: {source}")]
    HandlerInit {
        handler: QName,
        #[source]
        source: anyhow::Error,
    },
    #[error("service {0} is not deployed")]
    NotDeployed(QName),
}
