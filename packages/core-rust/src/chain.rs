//! Execution chains: the resolved, ordered phases of one message direction.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::context::MessageContext;
use crate::error::ResolutionError;
use crate::fault::Fault;
use crate::handler::HandlerDescription;
use crate::phase::Phase;
use crate::qname::QName;
use crate::traits::HandlerFlow;

/// Message direction a chain serves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Flow {
    In,
    Out,
    Fault,
}

impl fmt::Display for Flow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Flow::In => "in",
            Flow::Out => "out",
            Flow::Fault => "fault",
        })
    }
}

/// Owner of a chain: the engine as a whole or one deployed service.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ChainScope {
    Global,
    Service(QName),
}

/// How a successful chain run ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChainOutcome {
    /// Every handler ran.
    Completed,
    /// A handler returned `HandlerFlow::Done`; the rest of the chain was
    /// skipped.
    ShortCircuited { handler: QName },
}

/// A handler failure, after compensation of the handlers that ran before it.
#[derive(Debug, Clone)]
pub struct ChainFault {
    pub fault: Fault,
    /// The handler whose `invoke` failed. Its option table is the first
    /// place fault handlers are looked up.
    pub handler: Arc<HandlerDescription>,
    pub phase: String,
}

impl ChainFault {
    #[must_use]
    pub fn into_fault(self) -> Fault {
        self.fault
    }
}

impl fmt::Display for ChainFault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "handler {} in phase {:?} failed: {}",
            self.handler.name, self.phase, self.fault
        )
    }
}

impl std::error::Error for ChainFault {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.fault)
    }
}

/// Ordered phases for one direction and scope.
///
/// Built once at deployment and shared read-only (behind `Arc`) by every
/// in-flight message; redeployment builds a new chain instead of mutating
/// a published one.
#[derive(Debug, Clone)]
pub struct ExecutionChain {
    flow: Flow,
    scope: ChainScope,
    phases: Vec<Phase>,
}

impl ExecutionChain {
    #[must_use]
    pub fn new(flow: Flow, scope: ChainScope, phases: Vec<Phase>) -> Self {
        Self {
            flow,
            scope,
            phases,
        }
    }

    /// A chain of empty phases.
    #[must_use]
    pub fn with_phases(flow: Flow, scope: ChainScope, phase_names: &[String]) -> Self {
        Self::new(
            flow,
            scope,
            phase_names.iter().map(|name| Phase::empty(name.clone())).collect(),
        )
    }

    #[must_use]
    pub fn flow(&self) -> Flow {
        self.flow
    }

    #[must_use]
    pub fn scope(&self) -> &ChainScope {
        &self.scope
    }

    #[must_use]
    pub fn phases(&self) -> &[Phase] {
        &self.phases
    }

    #[must_use]
    pub fn phase(&self, name: &str) -> Option<&Phase> {
        self.phases.iter().find(|p| p.name() == name)
    }

    #[must_use]
    pub fn phase_names(&self) -> Vec<&str> {
        self.phases.iter().map(Phase::name).collect()
    }

    /// Every handler in execution order.
    pub fn handlers(&self) -> impl Iterator<Item = &Arc<HandlerDescription>> {
        self.phases.iter().flat_map(Phase::handlers)
    }

    /// Local handler names in execution order.
    #[must_use]
    pub fn handler_names(&self) -> Vec<&str> {
        self.handlers().map(|h| h.local_name()).collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.phases.iter().map(Phase::len).sum()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether any handler of the chain understands `name`.
    #[must_use]
    pub fn can_handle(&self, name: &QName) -> bool {
        self.handlers().any(|h| h.handler.can_handle(name))
    }

    /// Adds a handler to the phase its rule targets and re-resolves that
    /// phase. Only for chains not yet shared with in-flight messages.
    ///
    /// # Errors
    ///
    /// `UndeclaredPhase` if the chain has no such phase, or any error of
    /// [`Phase::resolve`]. The chain is unchanged on error.
    pub fn add_handler(&mut self, handler: Arc<HandlerDescription>) -> Result<(), ResolutionError> {
        let target = handler.rule.phase_name.clone();
        let Some(slot) = self.phases.iter_mut().find(|p| p.name() == target) else {
            return Err(ResolutionError::UndeclaredPhase {
                handler: handler.name.to_string(),
                phase: target,
            });
        };
        *slot = slot.with_handler(handler)?;
        Ok(())
    }

    /// Runs the chain against `ctx`.
    ///
    /// On the first failing handler, execution stops and every handler that
    /// already ran gets exactly one `undo`, most recent first. The fault is
    /// returned unchanged; nothing is retried.
    ///
    /// # Errors
    ///
    /// Returns the failing handler's fault wrapped in a `ChainFault`.
    pub fn execute(&self, ctx: &mut MessageContext) -> Result<ChainOutcome, ChainFault> {
        let mut invoked: Vec<&Arc<HandlerDescription>> = Vec::with_capacity(self.len());

        for phase in &self.phases {
            for desc in phase.handlers() {
                debug!(
                    flow = %self.flow,
                    phase = phase.name(),
                    handler = %desc.name,
                    message_id = %ctx.message_id,
                    "invoking handler"
                );
                match desc.handler.invoke(ctx) {
                    Ok(HandlerFlow::Continue) => invoked.push(desc),
                    Ok(HandlerFlow::Done) => {
                        debug!(handler = %desc.name, "chain short-circuited");
                        return Ok(ChainOutcome::ShortCircuited {
                            handler: desc.name.clone(),
                        });
                    }
                    Err(fault) => {
                        warn!(
                            flow = %self.flow,
                            phase = phase.name(),
                            handler = %desc.name,
                            code = %fault.code,
                            compensating = invoked.len(),
                            "handler failed"
                        );
                        while let Some(done) = invoked.pop() {
                            done.handler.undo(ctx);
                        }
                        return Err(ChainFault {
                            fault,
                            handler: Arc::clone(desc),
                            phase: phase.name().to_string(),
                        });
                    }
                }
            }
        }

        Ok(ChainOutcome::Completed)
    }
}
