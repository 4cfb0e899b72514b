//! Flow resolution: assigns handlers to phases and builds execution chains.

use std::collections::HashSet;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::chain::{ChainScope, ExecutionChain, Flow};
use crate::error::ResolutionError;
use crate::handler::HandlerDescription;
use crate::phase::Phase;

/// Well-known phase names.
pub mod phase_names {
    pub const TRANSPORT: &str = "transport";
    pub const PRE_DISPATCH: &str = "pre-dispatch";
    pub const GLOBAL: &str = "global";
    pub const SERVICE: &str = "service";
}

/// Global phase order per message direction.
///
/// Inbound messages travel transport → global → service; outbound and fault
/// processing run the reverse.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhaseOrder {
    pub inbound: Vec<String>,
    pub outbound: Vec<String>,
    pub fault: Vec<String>,
}

impl PhaseOrder {
    /// Derives outbound and fault orders by reversing `inbound`.
    #[must_use]
    pub fn from_inbound(inbound: Vec<String>) -> Self {
        let mut reversed = inbound.clone();
        reversed.reverse();
        Self {
            inbound,
            outbound: reversed.clone(),
            fault: reversed,
        }
    }

    #[must_use]
    pub fn for_flow(&self, flow: Flow) -> &[String] {
        match flow {
            Flow::In => &self.inbound,
            Flow::Out => &self.outbound,
            Flow::Fault => &self.fault,
        }
    }
}

impl Default for PhaseOrder {
    fn default() -> Self {
        Self::from_inbound(vec![
            phase_names::TRANSPORT.to_string(),
            phase_names::GLOBAL.to_string(),
            phase_names::SERVICE.to_string(),
        ])
    }
}

/// Builds execution chains from flows of handler descriptors.
#[derive(Debug, Clone, Default)]
pub struct PhaseResolver {
    order: PhaseOrder,
}

impl PhaseResolver {
    #[must_use]
    pub fn new(order: PhaseOrder) -> Self {
        Self { order }
    }

    #[must_use]
    pub fn order(&self) -> &PhaseOrder {
        &self.order
    }

    /// Builds the chain for `flow` using this resolver's phase order.
    ///
    /// # Errors
    ///
    /// See [`PhaseResolver::resolve_chain`].
    pub fn build_chain(
        &self,
        flow: Flow,
        scope: ChainScope,
        handlers: &[Arc<HandlerDescription>],
    ) -> Result<ExecutionChain, ResolutionError> {
        Self::resolve_chain(flow, scope, self.order.for_flow(flow), handlers)
    }

    /// Resolves `handlers` into one phase per entry of `phase_order`.
    ///
    /// Phases without handlers are still emitted. Handlers are grouped by
    /// their rule's target phase, keeping declaration order within a group.
    ///
    /// # Errors
    ///
    /// `DuplicatePhase` if `phase_order` repeats a name, `UndeclaredPhase` if
    /// a handler targets a phase outside `phase_order`, or any error from
    /// [`Phase::resolve`]. Nothing is returned on error.
    pub fn resolve_chain(
        flow: Flow,
        scope: ChainScope,
        phase_order: &[String],
        handlers: &[Arc<HandlerDescription>],
    ) -> Result<ExecutionChain, ResolutionError> {
        let mut declared = HashSet::with_capacity(phase_order.len());
        for name in phase_order {
            if !declared.insert(name.as_str()) {
                return Err(ResolutionError::DuplicatePhase {
                    phase: name.clone(),
                });
            }
        }

        if let Some(stray) = handlers
            .iter()
            .find(|h| !declared.contains(h.rule.phase_name.as_str()))
        {
            return Err(ResolutionError::UndeclaredPhase {
                handler: stray.name.to_string(),
                phase: stray.rule.phase_name.clone(),
            });
        }

        let phases = phase_order
            .iter()
            .map(|name| {
                let members = handlers
                    .iter()
                    .filter(|h| h.rule.phase_name == *name)
                    .cloned()
                    .collect();
                Phase::resolve(name.clone(), members)
            })
            .collect::<Result<Vec<_>, _>>()?;

        let chain = ExecutionChain::new(flow, scope, phases);
        debug!(
            flow = %flow,
            phases = ?chain.phase_names(),
            handlers = ?chain.handler_names(),
            "resolved execution chain"
        );
        Ok(chain)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::MessageContext;
    use crate::fault::Fault;
    use crate::qname::QName;
    use crate::rule::PhaseRule;
    use crate::traits::{Handler, HandlerFlow};

    struct Noop;

    impl Handler for Noop {
        fn invoke(&self, _ctx: &mut MessageContext) -> Result<HandlerFlow, Fault> {
            Ok(HandlerFlow::Continue)
        }
    }

    fn desc(name: &str, rule: PhaseRule) -> Arc<HandlerDescription> {
        Arc::new(HandlerDescription::new(QName::local(name), Arc::new(Noop), rule))
    }

    fn names(list: &[&str]) -> Vec<String> {
        list.iter().map(ToString::to_string).collect()
    }

    #[test]
    fn pre_dispatch_fixture_resolves_in_expected_order() {
        let handlers = vec![
            desc("pre-H1", PhaseRule::new("pre-dispatch")),
            desc("pre-H2", PhaseRule::new("pre-dispatch")),
            desc("H1", PhaseRule::new("global").first()),
            desc("H2", PhaseRule::new("global").after("H1")),
            desc("H3", PhaseRule::new("global").after("H1").before("H2")),
            desc("H4", PhaseRule::new("Logging")),
        ];
        let chain = PhaseResolver::resolve_chain(
            Flow::In,
            ChainScope::Global,
            &names(&["pre-dispatch", "global", "Logging"]),
            &handlers,
        )
        .unwrap();

        assert_eq!(chain.phase_names(), vec!["pre-dispatch", "global", "Logging"]);
        assert_eq!(
            chain.handler_names(),
            vec!["pre-H1", "pre-H2", "H1", "H3", "H2", "H4"]
        );
    }

    #[test]
    fn empty_phases_are_emitted_in_order() {
        let resolver = PhaseResolver::default();
        let chain = resolver
            .build_chain(
                Flow::Out,
                ChainScope::Service(QName::local("Echo")),
                &[desc("S1", PhaseRule::new("service"))],
            )
            .unwrap();
        assert_eq!(chain.phase_names(), vec!["service", "global", "transport"]);
        assert!(chain.phase("global").unwrap().is_empty());
        assert!(chain.phase("transport").unwrap().is_empty());
        assert_eq!(chain.len(), 1);
        assert_eq!(chain.scope(), &ChainScope::Service(QName::local("Echo")));
    }

    #[test]
    fn default_order_reverses_for_out_and_fault() {
        let order = PhaseOrder::default();
        assert_eq!(order.for_flow(Flow::In), names(&["transport", "global", "service"]));
        assert_eq!(order.for_flow(Flow::Out), names(&["service", "global", "transport"]));
        assert_eq!(order.for_flow(Flow::Fault), order.for_flow(Flow::Out));
    }

    #[test]
    fn handler_in_undeclared_phase_is_rejected() {
        let err = PhaseResolver::default()
            .build_chain(
                Flow::In,
                ChainScope::Global,
                &[desc("H1", PhaseRule::new("Logging"))],
            )
            .unwrap_err();
        assert_eq!(
            err,
            ResolutionError::UndeclaredPhase {
                handler: "H1".to_string(),
                phase: "Logging".to_string(),
            }
        );
    }

    #[test]
    fn duplicate_phase_in_order_is_rejected() {
        let err = PhaseResolver::resolve_chain(
            Flow::In,
            ChainScope::Global,
            &names(&["global", "global"]),
            &[],
        )
        .unwrap_err();
        assert!(matches!(err, ResolutionError::DuplicatePhase { phase } if phase == "global"));
    }

    #[test]
    fn cycle_in_one_phase_fails_whole_chain() {
        let err = PhaseResolver::default()
            .build_chain(
                Flow::In,
                ChainScope::Global,
                &[
                    desc("T1", PhaseRule::new("transport")),
                    desc("G1", PhaseRule::new("global").after("G2")),
                    desc("G2", PhaseRule::new("global").after("G1")),
                ],
            )
            .unwrap_err();
        assert!(matches!(err, ResolutionError::Cycle { phase, .. } if phase == "global"));
    }

    #[test]
    fn phase_order_deserializes() {
        let order: PhaseOrder = serde_json::from_str(
            r#"{"inbound":["transport","service"],"outbound":["service","transport"],"fault":["service"]}"#,
        )
        .unwrap();
        assert_eq!(order.for_flow(Flow::Fault), names(&["service"]));
    }
}
