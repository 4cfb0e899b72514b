//! Deployment descriptions and the builder that turns them into chains.
//!
//! A [`ServiceSpec`] lists the handlers a service contributes per flow. The
//! [`DeploymentBuilder`] names anonymous handlers, wraps every spec in a
//! shared [`HandlerDescription`], and resolves the engine's global handlers
//! plus the service's own into one [`ExecutionChain`] per flow.

use std::sync::Arc;

use soapflow_core::{
    ChainScope, ExecutionChain, Flow, Handler, HandlerDescription, HandlerOptions, OptionValue,
    PhaseOrder, PhaseResolver, PhaseRule, QName,
};

use crate::operation::DeployError;

// ---------------------------------------------------------------------------
// Specs
// ---------------------------------------------------------------------------

/// A handler as declared by a deployer, before naming and resolution.
pub struct HandlerSpec {
    pub name: Option<QName>,
    pub handler: Arc<dyn Handler>,
    pub rule: PhaseRule,
    pub options: HandlerOptions,
}

impl HandlerSpec {
    /// An anonymous handler; the builder assigns it a `handler-<n>` name.
    #[must_use]
    pub fn new(handler: Arc<dyn Handler>, rule: PhaseRule) -> Self {
        Self {
            name: None,
            handler,
            rule,
            options: HandlerOptions::new(),
        }
    }

    #[must_use]
    pub fn named(name: impl Into<QName>, handler: Arc<dyn Handler>, rule: PhaseRule) -> Self {
        Self {
            name: Some(name.into()),
            ..Self::new(handler, rule)
        }
    }

    #[must_use]
    pub fn with_option(mut self, key: impl Into<String>, value: impl Into<OptionValue>) -> Self {
        self.options.insert(key, value);
        self
    }
}

/// A service to deploy: its name, the operations it accepts, and the
/// handlers it contributes to each flow.
pub struct ServiceSpec {
    pub name: QName,
    /// Empty means every operation is accepted.
    pub operations: Vec<QName>,
    pub in_flow: Vec<HandlerSpec>,
    pub out_flow: Vec<HandlerSpec>,
    pub fault_flow: Vec<HandlerSpec>,
}

impl ServiceSpec {
    #[must_use]
    pub fn new(name: impl Into<QName>) -> Self {
        Self {
            name: name.into(),
            operations: Vec::new(),
            in_flow: Vec::new(),
            out_flow: Vec::new(),
            fault_flow: Vec::new(),
        }
    }

    #[must_use]
    pub fn operation(mut self, operation: impl Into<QName>) -> Self {
        self.operations.push(operation.into());
        self
    }

    #[must_use]
    pub fn handler(mut self, flow: Flow, spec: HandlerSpec) -> Self {
        match flow {
            Flow::In => self.in_flow.push(spec),
            Flow::Out => self.out_flow.push(spec),
            Flow::Fault => self.fault_flow.push(spec),
        }
        self
    }
}

// ---------------------------------------------------------------------------
// Flows and chains
// ---------------------------------------------------------------------------

/// Named handler descriptors per flow, in declaration order.
#[derive(Debug, Clone, Default)]
pub struct Flows {
    pub inbound: Vec<Arc<HandlerDescription>>,
    pub outbound: Vec<Arc<HandlerDescription>>,
    pub fault: Vec<Arc<HandlerDescription>>,
}

impl Flows {
    #[must_use]
    pub fn for_flow(&self, flow: Flow) -> &[Arc<HandlerDescription>] {
        match flow {
            Flow::In => &self.inbound,
            Flow::Out => &self.outbound,
            Flow::Fault => &self.fault,
        }
    }

    pub fn push(&mut self, flow: Flow, handler: Arc<HandlerDescription>) {
        match flow {
            Flow::In => self.inbound.push(handler),
            Flow::Out => self.outbound.push(handler),
            Flow::Fault => self.fault.push(handler),
        }
    }

    /// Distinct handler instances across all flows, in first-seen order.
    ///
    /// A handler shared by several flows is initialized and cleaned up once.
    #[must_use]
    pub fn unique_handlers(&self) -> Vec<(QName, Arc<dyn Handler>)> {
        let mut seen: Vec<(QName, Arc<dyn Handler>)> = Vec::new();
        for desc in self.inbound.iter().chain(&self.outbound).chain(&self.fault) {
            if !seen.iter().any(|(_, h)| Arc::ptr_eq(h, &desc.handler)) {
                seen.push((desc.name.clone(), Arc::clone(&desc.handler)));
            }
        }
        seen
    }
}

/// The three resolved chains of one scope.
#[derive(Debug, Clone)]
pub struct ServiceChains {
    pub in_chain: Arc<ExecutionChain>,
    pub out_chain: Arc<ExecutionChain>,
    pub fault_chain: Arc<ExecutionChain>,
}

impl ServiceChains {
    #[must_use]
    pub fn for_flow(&self, flow: Flow) -> &Arc<ExecutionChain> {
        match flow {
            Flow::In => &self.in_chain,
            Flow::Out => &self.out_chain,
            Flow::Fault => &self.fault_chain,
        }
    }
}

// ---------------------------------------------------------------------------
// DeploymentBuilder
// ---------------------------------------------------------------------------

/// Names handler specs and resolves them into chains.
///
/// Owns the counter used to name anonymous handlers, so names are unique
/// per builder rather than per process.
#[derive(Debug)]
pub struct DeploymentBuilder {
    resolver: PhaseResolver,
    next_index: u64,
}

impl DeploymentBuilder {
    #[must_use]
    pub fn new(order: PhaseOrder) -> Self {
        Self {
            resolver: PhaseResolver::new(order),
            next_index: 0,
        }
    }

    #[must_use]
    pub fn resolver(&self) -> &PhaseResolver {
        &self.resolver
    }

    /// Turns a spec into a shared descriptor, naming it if anonymous.
    pub fn describe(&mut self, spec: HandlerSpec) -> Arc<HandlerDescription> {
        let name = spec.name.unwrap_or_else(|| {
            self.next_index += 1;
            QName::local(format!("handler-{}", self.next_index))
        });
        let mut desc = HandlerDescription::new(name, spec.handler, spec.rule);
        desc.options = spec.options;
        Arc::new(desc)
    }

    /// Describes every handler of a service spec, keeping flow membership.
    pub fn describe_service(&mut self, spec: ServiceSpec) -> (QName, Vec<QName>, Flows) {
        let mut flows = Flows::default();
        for (flow, specs) in [
            (Flow::In, spec.in_flow),
            (Flow::Out, spec.out_flow),
            (Flow::Fault, spec.fault_flow),
        ] {
            for handler in specs {
                flows.push(flow, self.describe(handler));
            }
        }
        (spec.name, spec.operations, flows)
    }

    /// Resolves global handlers followed by `own` handlers into the chains of
    /// `scope`.
    ///
    /// # Errors
    ///
    /// Returns `DeployError::Resolution` naming the first flow that fails to
    /// resolve. No chain is produced in that case.
    pub fn build_chains(
        &self,
        scope: &ChainScope,
        globals: &Flows,
        own: &Flows,
    ) -> Result<ServiceChains, DeployError> {
        let build = |flow: Flow| -> Result<Arc<ExecutionChain>, DeployError> {
            let handlers: Vec<_> = globals
                .for_flow(flow)
                .iter()
                .chain(own.for_flow(flow))
                .cloned()
                .collect();
            self.resolver
                .build_chain(flow, scope.clone(), &handlers)
                .map(Arc::new)
                .map_err(|source| DeployError::Resolution {
                    scope: describe_scope(scope),
                    flow,
                    source,
                })
        };
        Ok(ServiceChains {
            in_chain: build(Flow::In)?,
            out_chain: build(Flow::Out)?,
            fault_chain: build(Flow::Fault)?,
        })
    }
}

fn describe_scope(scope: &ChainScope) -> String {
    match scope {
        ChainScope::Global => "the engine".to_string(),
        ChainScope::Service(name) => format!("service {name}"),
    }
}

#[cfg(test)]
mod tests {
    use soapflow_core::{Fault, HandlerFlow, MessageContext, ResolutionError};

    use super::*;

    struct Noop;

    impl Handler for Noop {
        fn invoke(&self, _ctx: &mut MessageContext) -> Result<HandlerFlow, Fault> {
            Ok(HandlerFlow::Continue)
        }
    }

    fn noop() -> Arc<dyn Handler> {
        Arc::new(Noop)
    }

    #[test]
    fn anonymous_handlers_get_sequential_names() {
        let mut builder = DeploymentBuilder::new(PhaseOrder::default());
        let a = builder.describe(HandlerSpec::new(noop(), PhaseRule::new("global")));
        let b = builder.describe(HandlerSpec::named("Audit", noop(), PhaseRule::new("global")));
        let c = builder.describe(HandlerSpec::new(noop(), PhaseRule::new("global")));
        assert_eq!(a.local_name(), "handler-1");
        assert_eq!(b.local_name(), "Audit");
        assert_eq!(c.local_name(), "handler-2");

        let mut other = DeploymentBuilder::new(PhaseOrder::default());
        let d = other.describe(HandlerSpec::new(noop(), PhaseRule::new("global")));
        assert_eq!(d.local_name(), "handler-1");
    }

    #[test]
    fn options_survive_description() {
        let mut builder = DeploymentBuilder::new(PhaseOrder::default());
        let desc = builder.describe(
            HandlerSpec::named("Log", noop(), PhaseRule::new("global")).with_option("level", "debug"),
        );
        assert_eq!(desc.options.text("level"), Some("debug"));
    }

    #[test]
    fn globals_precede_service_handlers_in_same_phase() {
        let mut builder = DeploymentBuilder::new(PhaseOrder::default());
        let mut globals = Flows::default();
        globals.push(
            Flow::In,
            builder.describe(HandlerSpec::named("G", noop(), PhaseRule::new("global"))),
        );
        let (_, _, own) = builder.describe_service(
            ServiceSpec::new("Echo")
                .handler(Flow::In, HandlerSpec::named("S", noop(), PhaseRule::new("global")))
                .handler(Flow::In, HandlerSpec::named("P", noop(), PhaseRule::new("service"))),
        );

        let chains = builder
            .build_chains(&ChainScope::Service(QName::local("Echo")), &globals, &own)
            .unwrap();
        assert_eq!(chains.in_chain.handler_names(), vec!["G", "S", "P"]);
        assert!(chains.out_chain.is_empty());
        assert_eq!(chains.fault_chain.phase_names(), vec!["service", "global", "transport"]);
    }

    #[test]
    fn resolution_failure_names_the_flow() {
        let mut builder = DeploymentBuilder::new(PhaseOrder::default());
        let (_, _, own) = builder.describe_service(ServiceSpec::new("Echo").handler(
            Flow::Out,
            HandlerSpec::named("X", noop(), PhaseRule::new("Logging")),
        ));
        let err = builder
            .build_chains(&ChainScope::Service(QName::local("Echo")), &Flows::default(), &own)
            .unwrap_err();
        match err {
            DeployError::Resolution { flow, source, .. } => {
                assert_eq!(flow, Flow::Out);
                assert!(matches!(source, ResolutionError::UndeclaredPhase { .. }));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn shared_handler_is_listed_once() {
        let shared = noop();
        let mut builder = DeploymentBuilder::new(PhaseOrder::default());
        let (_, _, flows) = builder.describe_service(
            ServiceSpec::new("Echo")
                .handler(Flow::In, HandlerSpec::named("A", Arc::clone(&shared), PhaseRule::new("global")))
                .handler(Flow::Out, HandlerSpec::named("B", shared, PhaseRule::new("global")))
                .handler(Flow::Fault, HandlerSpec::named("C", noop(), PhaseRule::new("global"))),
        );
        let names: Vec<_> = flows
            .unique_handlers()
            .into_iter()
            .map(|(name, _)| name.local_part)
            .collect();
        assert_eq!(names, vec!["A", "C"]);
    }
}
