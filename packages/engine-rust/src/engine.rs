//! The dispatch engine: deploys services, engages global handlers and runs
//! messages through the resolved chains.

use std::future::Future;
use std::sync::Arc;

use arc_swap::ArcSwap;
use parking_lot::Mutex;
use soapflow_core::{
    fault_codes, ChainScope, ExecutionChain, Fault, Flow, Handler, HandlerDescription,
    MessageContext, QName,
};
use tracing::{debug, error, info, info_span, warn};

use crate::client::callback::{AsyncResult, CallError, Callback, PendingCall, PendingCalls};
use crate::config::EngineConfig;
use crate::deployment::{DeploymentBuilder, Flows, HandlerSpec, ServiceChains, ServiceSpec};
use crate::operation::{DeployError, DispatchError, DispatchOutcome, DispatchReport};
use crate::registry::{DeployedService, ServiceRegistry};

/// Deployment state mutated under one lock: the builder with its naming
/// counter and the engine's global handlers.
struct Deployer {
    builder: DeploymentBuilder,
    globals: Flows,
}

/// Runs messages through the chains of deployed services.
///
/// Dispatch is lock-free: chains are loaded as `Arc` snapshots. Deployment
/// and engagement serialize on an internal mutex and publish new chains
/// atomically.
pub struct DispatchEngine {
    config: Arc<EngineConfig>,
    registry: ServiceRegistry,
    deployer: Mutex<Deployer>,
    global_chains: ArcSwap<ServiceChains>,
    pending: Arc<PendingCalls>,
}

impl DispatchEngine {
    /// Creates an engine with no services and no global handlers.
    ///
    /// # Errors
    ///
    /// `DeployError::Resolution` if the configured phase order is invalid
    /// (a phase listed twice in one direction).
    pub fn new(config: EngineConfig) -> Result<Self, DeployError> {
        let builder = DeploymentBuilder::new(config.phase_order.clone());
        let global_chains =
            builder.build_chains(&ChainScope::Global, &Flows::default(), &Flows::default())?;
        Ok(Self {
            config: Arc::new(config),
            registry: ServiceRegistry::new(),
            deployer: Mutex::new(Deployer {
                builder,
                globals: Flows::default(),
            }),
            global_chains: ArcSwap::from_pointee(global_chains),
            pending: Arc::new(PendingCalls::new()),
        })
    }

    #[must_use]
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    #[must_use]
    pub fn engine_id(&self) -> &str {
        &self.config.engine_id
    }

    #[must_use]
    pub fn registry(&self) -> &ServiceRegistry {
        &self.registry
    }

    #[must_use]
    pub fn pending_calls(&self) -> &Arc<PendingCalls> {
        &self.pending
    }

    /// Chains run for messages that match no deployed service.
    #[must_use]
    pub fn global_chains(&self) -> Arc<ServiceChains> {
        self.global_chains.load_full()
    }

    // -----------------------------------------------------------------------
    // Deployment
    // -----------------------------------------------------------------------

    /// Engages a handler on `flow` for the whole engine.
    ///
    /// The global chains and the chains of every deployed service are
    /// re-resolved and published together; in-flight dispatches keep the
    /// chains they started with.
    ///
    /// # Errors
    ///
    /// `DeployError::Resolution` if any affected chain fails to resolve, or
    /// `DeployError::HandlerInit` if the handler's `init` fails. Nothing
    /// changes on error.
    pub fn engage(&self, flow: Flow, spec: HandlerSpec) -> Result<Arc<HandlerDescription>, DeployError> {
        let mut deployer = self.deployer.lock();
        let desc = deployer.builder.describe(spec);
        let fresh = !deployer
            .globals
            .unique_handlers()
            .iter()
            .any(|(_, h)| Arc::ptr_eq(h, &desc.handler));

        let mut globals = deployer.globals.clone();
        globals.push(flow, Arc::clone(&desc));

        let global_chains =
            deployer
                .builder
                .build_chains(&ChainScope::Global, &globals, &Flows::default())?;
        let rebuilt = self
            .registry
            .services()
            .into_iter()
            .map(|service| {
                let scope = ChainScope::Service(service.name().clone());
                deployer
                    .builder
                    .build_chains(&scope, &globals, service.flows())
                    .map(|chains| (service, chains))
            })
            .collect::<Result<Vec<_>, _>>()?;

        if fresh {
            init_handlers(&[(desc.name.clone(), Arc::clone(&desc.handler))])?;
        }

        deployer.globals = globals;
        self.global_chains.store(Arc::new(global_chains));
        for (service, chains) in rebuilt {
            service.replace_chains(chains);
        }
        info!(handler = %desc.name, flow = %flow, phase = %desc.rule.phase_name, "global handler engaged");
        Ok(desc)
    }

    /// Deploys a service, replacing any deployment with the same name.
    ///
    /// A replaced deployment keeps serving the dispatches already running on
    /// it; its handlers are cleaned up once those finish. Handler instances
    /// the new deployment reuses carry over: they are not initialized again
    /// and the replaced deployment leaves their cleanup to the new one.
    ///
    /// # Errors
    ///
    /// `DeployError::Resolution` if a chain fails to resolve, or
    /// `DeployError::HandlerInit` if a handler's `init` fails. Handlers
    /// initialized before the failure are cleaned up and nothing is
    /// registered.
    pub fn deploy(&self, spec: ServiceSpec) -> Result<Arc<DeployedService>, DeployError> {
        let mut deployer = self.deployer.lock();
        let (name, operations, flows) = deployer.builder.describe_service(spec);
        let chains = deployer.builder.build_chains(
            &ChainScope::Service(name.clone()),
            &deployer.globals,
            &flows,
        )?;
        let previous = self.registry.get(&name);
        let carried = previous
            .as_ref()
            .map(|old| old.shared_handlers(&flows))
            .unwrap_or_default();
        let fresh: Vec<_> = flows
            .unique_handlers()
            .into_iter()
            .filter(|(_, handler)| !carried.iter().any(|h| Arc::ptr_eq(h, handler)))
            .collect();
        init_handlers(&fresh)?;

        if let Some(old) = &previous {
            old.hand_over(&carried);
        }
        let service = Arc::new(DeployedService::new(name, operations, flows, chains));
        let replaced = self.registry.insert(Arc::clone(&service));
        info!(
            service = %service.name(),
            handlers = service.flows().unique_handlers().len(),
            carried_over = carried.len(),
            replaced = replaced.is_some(),
            "service deployed"
        );
        Ok(service)
    }

    /// Removes a deployed service.
    ///
    /// # Errors
    ///
    /// `DeployError::NotDeployed` if no service has that name.
    pub fn undeploy(&self, name: &QName) -> Result<(), DeployError> {
        let _deployer = self.deployer.lock();
        match self.registry.remove(name) {
            Some(_) => {
                info!(service = %name, "service undeployed");
                Ok(())
            }
            None => Err(DeployError::NotDeployed(name.clone())),
        }
    }

    /// Releases every service in reverse deployment order, then cleans up
    /// global handlers.
    pub fn shutdown(&self) {
        let mut deployer = self.deployer.lock();
        self.registry.shutdown_all();
        let globals = std::mem::take(&mut deployer.globals);
        for (name, handler) in globals.unique_handlers().iter().rev() {
            debug!(handler = %name, "cleaning up global handler");
            handler.cleanup();
        }
        match deployer
            .builder
            .build_chains(&ChainScope::Global, &Flows::default(), &Flows::default())
        {
            Ok(chains) => self.global_chains.store(Arc::new(chains)),
            Err(e) => error!(error = %e, "failed to reset global chains"),
        }
        info!(engine_id = %self.config.engine_id, "engine shut down");
    }

    // -----------------------------------------------------------------------
    // Dispatch
    // -----------------------------------------------------------------------

    /// Runs `ctx` through the chain its service and flow select.
    ///
    /// When a handler fails, the fault is first offered to a fault handler
    /// registered for its code: in the failing handler's own options, then
    /// on the handlers of the fault chain. A matching fault handler that
    /// succeeds absorbs the fault. Without a match the fault chain runs for
    /// its side effects and the original fault is returned unchanged.
    ///
    /// A message for an undeployed service is a `Client` fault, handled by
    /// the engine's global fault chain.
    ///
    /// # Errors
    ///
    /// `DispatchError::Fault` with the unabsorbed fault, or the fault a
    /// fault handler raised in turn.
    pub fn dispatch(&self, ctx: &mut MessageContext) -> Result<DispatchOutcome, DispatchError> {
        if ctx.engine_id.is_empty() {
            ctx.engine_id.clone_from(&self.config.engine_id);
        }
        let span = info_span!(
            "dispatch",
            engine_id = %ctx.engine_id,
            service = %ctx.service,
            operation = %ctx.operation,
            flow = %ctx.flow,
            message_id = %ctx.message_id,
        );
        let _entered = span.enter();

        let Some(service) = self.registry.get(&ctx.service) else {
            let fault = Fault::client(format!("service {} is not deployed", ctx.service));
            let chains = self.global_chains();
            return handle_fault(ctx, &chains.fault_chain, None, fault);
        };
        let chains = service.chains();

        if !service.accepts(&ctx.operation) {
            let fault = Fault::client(format!(
                "operation {} is not offered by service {}",
                ctx.operation, ctx.service
            ));
            return handle_fault(ctx, &chains.fault_chain, None, fault);
        }

        let chain = chains.for_flow(ctx.flow);
        match chain.execute(ctx) {
            Ok(outcome) => {
                if ctx.flow == Flow::In {
                    if let Err(fault) = check_must_understand(ctx, chain) {
                        return handle_fault(ctx, &chains.fault_chain, None, fault);
                    }
                }
                Ok(outcome.into())
            }
            Err(failure) => handle_fault(
                ctx,
                &chains.fault_chain,
                Some(failure.handler.as_ref()),
                failure.fault,
            ),
        }
    }

    /// Server-side request handling: runs the inbound chain, then, if the
    /// service produced a response, the outbound chain on a response context
    /// correlated to the request.
    ///
    /// The report's `outcome` is the inbound one; its `response` is `None`
    /// for one-way messages.
    ///
    /// # Errors
    ///
    /// Any error of [`DispatchEngine::dispatch`] from either direction.
    pub fn receive(&self, mut request: MessageContext) -> Result<DispatchReport, DispatchError> {
        request.flow = Flow::In;
        let outcome = self.dispatch(&mut request)?;
        let Some(body) = request.response.take() else {
            debug!(message_id = %request.message_id, "one-way message, no response");
            return Ok(DispatchReport::new(request, outcome));
        };
        let mut response = request.response_context(body);
        self.dispatch(&mut response)?;
        Ok(DispatchReport {
            context: request,
            outcome,
            response: Some(response),
        })
    }

    /// [`DispatchEngine::receive`] on the blocking pool.
    ///
    /// # Errors
    ///
    /// Any error of `receive`, or `Internal` if the blocking task panicked.
    pub async fn receive_owned(self: Arc<Self>, request: MessageContext) -> Result<DispatchReport, DispatchError> {
        tokio::task::spawn_blocking(move || self.receive(request))
            .await
            .map_err(|e| DispatchError::Internal(anyhow::anyhow!("receive task failed: {e}")))?
    }

    /// Dispatches an owned context on the blocking pool.
    ///
    /// Handlers are synchronous; this keeps them off the async workers.
    ///
    /// # Errors
    ///
    /// Any error of [`DispatchEngine::dispatch`], or `Internal` if the
    /// blocking task panicked.
    pub async fn dispatch_owned(
        self: Arc<Self>,
        mut ctx: MessageContext,
    ) -> Result<DispatchReport, DispatchError> {
        tokio::task::spawn_blocking(move || {
            self.dispatch(&mut ctx)
                .map(|outcome| DispatchReport::new(ctx, outcome))
        })
        .await
        .map_err(|e| DispatchError::Internal(anyhow::anyhow!("dispatch task failed: {e}")))?
    }

    /// Dispatches `ctx` in the background and reports to `callback`.
    ///
    /// The callback receives the dispatched context, the dispatch error, or
    /// a timeout once the configured wait bound elapses, exactly once. Every
    /// call is tracked on its own, even for contexts sharing a message id.
    ///
    /// # Panics
    ///
    /// Panics if called outside a tokio runtime.
    pub fn dispatch_async(self: &Arc<Self>, ctx: MessageContext, callback: Box<dyn Callback>) -> PendingCall {
        let message_id = ctx.message_id;
        let engine = Arc::clone(self);
        self.track_call(message_id, callback, async move {
            engine
                .dispatch_owned(ctx)
                .await
                .map(|report| AsyncResult::new(report.context))
                .map_err(CallError::from)
        })
    }

    /// Registers `callback` under a fresh call id and races `work` against
    /// the wait bound. The loser's result is discarded.
    ///
    /// # Panics
    ///
    /// Panics if called outside a tokio runtime.
    pub(crate) fn track_call<F>(
        &self,
        message_id: uuid::Uuid,
        callback: Box<dyn Callback>,
        work: F,
    ) -> PendingCall
    where
        F: Future<Output = Result<AsyncResult, CallError>> + Send + 'static,
    {
        let id = uuid::Uuid::new_v4();
        let status = self.pending.register(id, message_id, callback);
        let bound = self.config.async_wait_bound();
        let pending = Arc::clone(&self.pending);
        tokio::spawn(async move {
            tokio::select! {
                result = work => {
                    pending.complete(id, result);
                }
                () = tokio::time::sleep(bound) => {
                    pending.expire(id, bound);
                }
            }
        });
        PendingCall::new(
            id,
            message_id,
            status,
            Arc::clone(&self.pending),
            self.config.async_poll_interval(),
            self.config.async_max_checks,
        )
    }
}

impl std::fmt::Debug for DispatchEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DispatchEngine")
            .field("engine_id", &self.config.engine_id)
            .field("services", &self.registry.names())
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Initializes handlers in order; on failure cleans up the ones already
/// initialized, most recent first.
fn init_handlers(handlers: &[(QName, Arc<dyn Handler>)]) -> Result<(), DeployError> {
    for (i, (name, handler)) in handlers.iter().enumerate() {
        if let Err(source) = handler.init() {
            warn!(handler = %name, error = %source, "handler init failed, rolling back");
            for (_, done) in handlers[..i].iter().rev() {
                done.cleanup();
            }
            return Err(DeployError::HandlerInit {
                handler: name.clone(),
                source,
            });
        }
    }
    Ok(())
}

/// A mandatory header is understood if a handler consumed it or a handler
/// of the chain declares it can.
fn check_must_understand(ctx: &MessageContext, chain: &ExecutionChain) -> Result<(), Fault> {
    match ctx
        .unprocessed_must_understand()
        .find(|header| !chain.can_handle(&header.name))
    {
        Some(header) => Err(Fault::new(
            fault_codes::must_understand(),
            format!("header {} was not understood", header.name),
        )),
        None => Ok(()),
    }
}

fn handle_fault(
    ctx: &mut MessageContext,
    fault_chain: &ExecutionChain,
    failing: Option<&HandlerDescription>,
    fault: Fault,
) -> Result<DispatchOutcome, DispatchError> {
    let code = ctx.fault_code(&fault);
    ctx.fault = Some(fault.clone());

    let fault_handler = failing
        .and_then(|desc| desc.options.fault_handler(&code).cloned())
        .or_else(|| fault_chain.handlers().find_map(|desc| desc.registered_for(&code)));

    let Some(handler) = fault_handler else {
        if !fault_chain.is_empty() {
            if let Err(secondary) = fault_chain.execute(ctx) {
                error!(
                    handler = %secondary.handler.name,
                    error = %secondary.fault,
                    "fault chain failed while handling a fault"
                );
            }
        }
        return Err(DispatchError::Fault(fault));
    };

    debug!(code = %code, "fault handler matched");
    match handler.invoke(ctx) {
        Ok(_) => {
            info!(code = %code, "fault absorbed");
            ctx.fault = None;
            Ok(DispatchOutcome::FaultAbsorbed { fault })
        }
        Err(raised) => {
            warn!(code = %code, raised = %raised, "fault handler raised");
            Err(DispatchError::Fault(raised))
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
