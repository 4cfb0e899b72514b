use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use uuid::Uuid;

use crate::chain::Flow;
use crate::fault::Fault;
use crate::qname::QName;
use crate::traits::FaultCodeExtractor;
use crate::types::{Payload, Value};

/// A SOAP header block as seen by the pipeline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeaderBlock {
    pub name: QName,
    pub must_understand: bool,
    /// Set by the handler that consumed the block.
    pub processed: bool,
}

/// Per-call state threaded through an execution chain.
///
/// One context exists per message. Handlers pass data forward through the
/// property bag; the fault being handled is carried in `fault` while the
/// fault chain runs.
#[derive(Clone)]
pub struct MessageContext {
    pub message_id: Uuid,
    /// For responses: the `message_id` of the request.
    pub relates_to: Option<Uuid>,
    /// Identifier of the engine processing this context.
    pub engine_id: String,
    pub service: QName,
    pub operation: QName,
    pub flow: Flow,
    pub payload: Payload,
    pub response: Option<Payload>,
    pub headers: Vec<HeaderBlock>,
    pub fault: Option<Fault>,
    properties: BTreeMap<String, Value>,
    fault_code_extractor: Option<Arc<dyn FaultCodeExtractor>>,
}

impl MessageContext {
    #[must_use]
    pub fn new(service: QName, operation: QName, flow: Flow, payload: Payload) -> Self {
        Self {
            message_id: Uuid::new_v4(),
            relates_to: None,
            engine_id: String::new(),
            service,
            operation,
            flow,
            payload,
            response: None,
            headers: Vec::new(),
            fault: None,
            properties: BTreeMap::new(),
            fault_code_extractor: None,
        }
    }

    #[must_use]
    pub fn with_header(mut self, name: QName, must_understand: bool) -> Self {
        self.headers.push(HeaderBlock {
            name,
            must_understand,
            processed: false,
        });
        self
    }

    /// Installs the encoding layer's fault code extraction hook.
    #[must_use]
    pub fn with_fault_code_extractor(mut self, extractor: Arc<dyn FaultCodeExtractor>) -> Self {
        self.fault_code_extractor = Some(extractor);
        self
    }

    #[must_use]
    pub fn property(&self, key: &str) -> Option<&Value> {
        self.properties.get(key)
    }

    pub fn set_property(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.properties.insert(key.into(), value.into());
    }

    pub fn remove_property(&mut self, key: &str) -> Option<Value> {
        self.properties.remove(key)
    }

    #[must_use]
    pub fn properties(&self) -> &BTreeMap<String, Value> {
        &self.properties
    }

    /// Effective code of `fault`, as seen by fault handler lookup.
    #[must_use]
    pub fn fault_code(&self, fault: &Fault) -> QName {
        match &self.fault_code_extractor {
            Some(extractor) => extractor.extract(fault, &self.payload),
            None => fault.code.clone(),
        }
    }

    /// Marks a header block as consumed. Returns `false` if no block has that
    /// name.
    pub fn mark_header_processed(&mut self, name: &QName) -> bool {
        let mut found = false;
        for header in self.headers.iter_mut().filter(|h| h.name == *name) {
            header.processed = true;
            found = true;
        }
        found
    }

    /// Mandatory header blocks no handler has consumed yet.
    pub fn unprocessed_must_understand(&self) -> impl Iterator<Item = &HeaderBlock> {
        self.headers
            .iter()
            .filter(|h| h.must_understand && !h.processed)
    }

    /// Builds the outbound context carrying `response` back to the caller.
    ///
    /// Identity fields and properties carry over; headers and fault state do
    /// not.
    #[must_use]
    pub fn response_context(&self, response: Payload) -> Self {
        Self {
            message_id: Uuid::new_v4(),
            relates_to: Some(self.message_id),
            engine_id: self.engine_id.clone(),
            service: self.service.clone(),
            operation: self.operation.clone(),
            flow: Flow::Out,
            payload: response,
            response: None,
            headers: Vec::new(),
            fault: None,
            properties: self.properties.clone(),
            fault_code_extractor: self.fault_code_extractor.clone(),
        }
    }
}

impl fmt::Debug for MessageContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MessageContext")
            .field("message_id", &self.message_id)
            .field("relates_to", &self.relates_to)
            .field("engine_id", &self.engine_id)
            .field("service", &self.service)
            .field("operation", &self.operation)
            .field("flow", &self.flow)
            .field("payload_len", &self.payload.len())
            .field("headers", &self.headers)
            .field("fault", &self.fault)
            .field("properties", &self.properties)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct DetailCode;

    impl FaultCodeExtractor for DetailCode {
        fn extract(&self, fault: &Fault, _payload: &Payload) -> QName {
            match fault.detail.as_ref().and_then(Value::as_str) {
                Some(code) => QName::local(code),
                None => fault.code.clone(),
            }
        }
    }

    fn ctx() -> MessageContext {
        MessageContext::new(
            QName::local("EchoService"),
            QName::local("echo"),
            Flow::In,
            Payload::from("<echo/>"),
        )
    }

    #[test]
    fn fault_code_defaults_to_fault_code_field() {
        let fault = Fault::client("nope");
        assert_eq!(ctx().fault_code(&fault), fault.code);
    }

    #[test]
    fn fault_code_uses_installed_extractor() {
        let ctx = ctx().with_fault_code_extractor(Arc::new(DetailCode));
        let fault = Fault::server("bad").with_detail("BadInput");
        assert_eq!(ctx.fault_code(&fault), QName::local("BadInput"));
    }

    #[test]
    fn must_understand_tracking() {
        let security = QName::new("urn:sec", "Security");
        let trace = QName::new("urn:trace", "Trace");
        let mut ctx = ctx()
            .with_header(security.clone(), true)
            .with_header(trace, false);

        assert_eq!(ctx.unprocessed_must_understand().count(), 1);
        assert!(ctx.mark_header_processed(&security));
        assert_eq!(ctx.unprocessed_must_understand().count(), 0);
        assert!(!ctx.mark_header_processed(&QName::local("Missing")));
    }

    #[test]
    fn response_context_correlates_to_request() {
        let mut req = ctx();
        req.set_property("tenant", "acme");
        req.fault = Some(Fault::server("x"));

        let resp = req.response_context(Payload::from("<ok/>"));
        assert_eq!(resp.relates_to, Some(req.message_id));
        assert_eq!(resp.flow, Flow::Out);
        assert_eq!(resp.property("tenant"), Some(&Value::from("acme")));
        assert!(resp.fault.is_none());
        assert_ne!(resp.message_id, req.message_id);
    }
}
