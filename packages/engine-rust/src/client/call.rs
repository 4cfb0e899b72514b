use std::sync::Arc;
use std::time::Duration;

use soapflow_core::{Fault, Flow, MessageContext, Payload, QName};
use tracing::debug;

use super::callback::{AsyncResult, CallError, Callback, PendingCall};
use super::transport::Transport;
use crate::engine::DispatchEngine;
use crate::operation::DEADLINE_PROPERTY;

/// Client-side invocation of one remote service.
///
/// Requests run through the client engine's outbound chain for the service,
/// travel over the transport, and the response runs through the inbound
/// chain. The service must be deployed on the client engine, even if it
/// contributes no handlers of its own.
pub struct Call {
    engine: Arc<DispatchEngine>,
    transport: Arc<dyn Transport>,
    service: QName,
    headers: Vec<(QName, bool)>,
    deadline: Option<Duration>,
}

impl Call {
    #[must_use]
    pub fn new(
        engine: Arc<DispatchEngine>,
        transport: Arc<dyn Transport>,
        service: impl Into<QName>,
    ) -> Self {
        Self {
            engine,
            transport,
            service: service.into(),
            headers: Vec::new(),
            deadline: None,
        }
    }

    /// Adds a header block to every request of this call.
    #[must_use]
    pub fn with_header(mut self, name: impl Into<QName>, must_understand: bool) -> Self {
        self.headers.push((name.into(), must_understand));
        self
    }

    /// Asks the receiving engine to give up on each request after
    /// `deadline`, instead of its default dispatch timeout.
    #[must_use]
    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = Some(deadline);
        self
    }

    fn request(&self, operation: QName, payload: Payload) -> MessageContext {
        let mut ctx = MessageContext::new(self.service.clone(), operation, Flow::Out, payload);
        ctx.engine_id = self.engine.engine_id().to_string();
        for (name, must_understand) in &self.headers {
            ctx = ctx.with_header(name.clone(), *must_understand);
        }
        if let Some(deadline) = self.deadline {
            let ms = i64::try_from(deadline.as_millis()).unwrap_or(i64::MAX);
            ctx.set_property(DEADLINE_PROPERTY, ms);
        }
        ctx
    }

    /// Sends a request and waits for the response, at most the engine's
    /// asynchronous wait bound.
    ///
    /// # Errors
    ///
    /// `CallError::Timeout` when the bound elapses, or whatever the outbound
    /// chain, the transport or the inbound chain failed with.
    pub async fn invoke_blocking(
        &self,
        operation: impl Into<QName>,
        payload: impl Into<Payload>,
    ) -> Result<MessageContext, CallError> {
        let request = self.request(operation.into(), payload.into());
        let bound = self.engine.config().async_wait_bound();
        let exchange = round_trip(
            Arc::clone(&self.engine),
            Arc::clone(&self.transport),
            request,
        );
        tokio::time::timeout(bound, exchange)
            .await
            .map_err(|_| CallError::timeout(bound))?
            .map(AsyncResult::into_response)
    }

    /// Sends a request and returns immediately; `callback` receives the
    /// response, the failure, or a timeout once the wait bound elapses.
    ///
    /// # Panics
    ///
    /// Panics if called outside a tokio runtime.
    pub fn invoke_non_blocking(
        &self,
        operation: impl Into<QName>,
        payload: impl Into<Payload>,
        callback: Box<dyn Callback>,
    ) -> PendingCall {
        let request = self.request(operation.into(), payload.into());
        let message_id = request.message_id;
        let exchange = round_trip(
            Arc::clone(&self.engine),
            Arc::clone(&self.transport),
            request,
        );
        self.engine.track_call(message_id, callback, exchange)
    }

    /// Sends a one-way message: outbound chain and transport only.
    ///
    /// # Errors
    ///
    /// Whatever the outbound chain or the transport failed with.
    pub async fn send(
        &self,
        operation: impl Into<QName>,
        payload: impl Into<Payload>,
    ) -> Result<(), CallError> {
        let request = self.request(operation.into(), payload.into());
        let sent = Arc::clone(&self.engine).dispatch_owned(request).await?;
        if self.transport.send(&sent.context).await?.is_some() {
            debug!(message_id = %sent.context.message_id, "response to one-way message ignored");
        }
        Ok(())
    }
}

async fn round_trip(
    engine: Arc<DispatchEngine>,
    transport: Arc<dyn Transport>,
    request: MessageContext,
) -> Result<AsyncResult, CallError> {
    let sent = Arc::clone(&engine).dispatch_owned(request).await?;
    let request = sent.context;
    let Some(body) = transport.send(&request).await? else {
        return Err(CallError::Fault(Fault::server(format!(
            "no response to request {} of operation {}",
            request.message_id, request.operation
        ))));
    };

    let mut response = request.response_context(body);
    response.flow = Flow::In;
    let received = engine.dispatch_owned(response).await?;
    Ok(AsyncResult::new(received.context))
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use async_trait::async_trait;
    use parking_lot::Mutex;
    use soapflow_core::{HandlerFlow, PhaseRule};

    use super::*;
    use crate::client::callback::{callback_fn, CallStatus};
    use crate::client::transport::LoopbackTransport;
    use crate::config::EngineConfig;
    use crate::deployment::{HandlerSpec, ServiceSpec};
    use crate::handlers::{handler_fn, EchoHandler};

    type Log = Arc<Mutex<Vec<String>>>;

    fn record(label: &'static str, log: &Log) -> HandlerSpec {
        let log = Arc::clone(log);
        HandlerSpec::named(
            label,
            handler_fn(move |ctx| {
                log.lock().push(format!("{label}:{}", ctx.flow));
                Ok(HandlerFlow::Continue)
            }),
            PhaseRule::new("global"),
        )
    }

    fn engine(id: &str) -> Arc<DispatchEngine> {
        Arc::new(
            DispatchEngine::new(EngineConfig {
                engine_id: id.to_string(),
                ..EngineConfig::default()
            })
            .unwrap(),
        )
    }

    fn echo_server() -> Arc<DispatchEngine> {
        let server = engine("server");
        server
            .deploy(ServiceSpec::new("Echo").handler(
                Flow::In,
                HandlerSpec::named("Echo", Arc::new(EchoHandler), PhaseRule::new("service")),
            ))
            .unwrap();
        server
    }

    fn client(log: &Log) -> Arc<DispatchEngine> {
        let client = engine("client");
        client
            .deploy(
                ServiceSpec::new("Echo")
                    .handler(Flow::Out, record("client-out", log))
                    .handler(Flow::In, record("client-in", log)),
            )
            .unwrap();
        client
    }

    #[tokio::test]
    async fn blocking_round_trip_runs_both_client_chains() {
        let log = Log::default();
        let call = Call::new(
            client(&log),
            Arc::new(LoopbackTransport::new(echo_server())),
            "Echo",
        );

        let response = call.invoke_blocking("echo", "hello").await.unwrap();
        assert_eq!(response.payload.as_str(), Some("hello"));
        assert_eq!(response.flow, Flow::In);
        assert_eq!(response.engine_id, "client");
        assert!(response.relates_to.is_some());
        assert_eq!(*log.lock(), vec!["client-out:out", "client-in:in"]);
    }

    #[tokio::test]
    async fn non_blocking_call_delivers_response_to_callback() {
        let log = Log::default();
        let call = Call::new(
            client(&log),
            Arc::new(LoopbackTransport::new(echo_server())),
            "Echo",
        );

        let seen: Arc<Mutex<Option<String>>> = Arc::default();
        let sink = Arc::clone(&seen);
        let pending = call.invoke_non_blocking(
            "echo",
            "async hello",
            callback_fn(move |result| {
                let result = result.unwrap();
                *sink.lock() = result.response_payload().as_str().map(str::to_string);
            }),
        );

        assert_eq!(pending.wait().await.unwrap(), CallStatus::Completed);
        assert_eq!(seen.lock().as_deref(), Some("async hello"));
    }

    #[tokio::test]
    async fn server_fault_reaches_the_caller() {
        let server = engine("server");
        server
            .deploy(ServiceSpec::new("Echo").handler(
                Flow::In,
                HandlerSpec::named(
                    "Validate",
                    handler_fn(|_ctx| Err(Fault::new(QName::new("urn:test", "BadInput"), "no"))),
                    PhaseRule::new("service"),
                ),
            ))
            .unwrap();
        let call = Call::new(
            client(&Log::default()),
            Arc::new(LoopbackTransport::new(server)),
            "Echo",
        );

        let err = call.invoke_blocking("echo", "x").await.unwrap_err();
        assert!(matches!(err, CallError::Fault(f) if f.code.local_part == "BadInput"));
    }

    #[tokio::test]
    async fn one_way_send_skips_inbound_chain() {
        let log = Log::default();
        let server = engine("server");
        server.deploy(ServiceSpec::new("Echo")).unwrap();
        let call = Call::new(client(&log), Arc::new(LoopbackTransport::new(server)), "Echo");

        call.send("notify", "fire").await.unwrap();
        assert_eq!(*log.lock(), vec!["client-out:out"]);
    }

    #[tokio::test]
    async fn request_deadline_is_enforced_by_the_server() {
        let server = engine("server");
        server
            .deploy(ServiceSpec::new("Echo").handler(
                Flow::In,
                HandlerSpec::named(
                    "Stall",
                    handler_fn(|_ctx| {
                        std::thread::sleep(Duration::from_millis(300));
                        Ok(HandlerFlow::Continue)
                    }),
                    PhaseRule::new("service"),
                ),
            ))
            .unwrap();
        let call = Call::new(
            client(&Log::default()),
            Arc::new(LoopbackTransport::new(server)),
            "Echo",
        )
        .with_deadline(Duration::from_millis(20));

        let err = call.invoke_blocking("echo", "x").await.unwrap_err();
        assert!(matches!(
            err,
            CallError::Dispatch(crate::operation::DispatchError::DeadlineExceeded { timeout_ms: 20 })
        ));
    }

    /// Never answers within any reasonable bound.
    struct Silent;

    #[async_trait]
    impl Transport for Silent {
        async fn send(&self, _request: &MessageContext) -> Result<Option<Payload>, CallError> {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok(Some(Payload::from("too late")))
        }
    }

    #[tokio::test(start_paused = true)]
    async fn unanswered_call_times_out_once_and_never_completes() {
        let client = client(&Log::default());
        let call = Call::new(Arc::clone(&client), Arc::new(Silent), "Echo");

        let deliveries = Arc::new(AtomicUsize::new(0));
        let timeouts = Arc::new(AtomicUsize::new(0));
        let (d, t) = (Arc::clone(&deliveries), Arc::clone(&timeouts));
        let pending = call.invoke_non_blocking(
            "echo",
            "hello?",
            callback_fn(move |result| {
                d.fetch_add(1, Ordering::SeqCst);
                if matches!(result, Err(CallError::Timeout { .. })) {
                    t.fetch_add(1, Ordering::SeqCst);
                }
            }),
        );
        let id = pending.id();

        let err = pending.wait().await.unwrap_err();
        assert!(matches!(err, CallError::Timeout { waited_ms: 10_000 }));

        tokio::time::sleep(Duration::from_secs(7200)).await;
        assert_eq!(deliveries.load(Ordering::SeqCst), 1);
        assert_eq!(timeouts.load(Ordering::SeqCst), 1);
        assert!(!client.pending_calls().is_pending(&id));
    }

    #[tokio::test(start_paused = true)]
    async fn blocking_call_times_out() {
        let call = Call::new(client(&Log::default()), Arc::new(Silent), "Echo");
        let err = call.invoke_blocking("echo", "hello?").await.unwrap_err();
        assert!(matches!(err, CallError::Timeout { waited_ms: 10_000 }));
    }
}
