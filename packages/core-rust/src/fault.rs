//! SOAP faults raised by handlers.

use crate::qname::QName;
use crate::types::Value;

/// Prefix of handler option keys that register a fault handler.
pub const FAULT_KEY_PREFIX: &str = "fault-";

/// Standard SOAP 1.1 fault codes.
pub mod fault_codes {
    use crate::qname::QName;

    /// SOAP 1.1 envelope namespace.
    pub const SOAP_ENV_NS: &str = "http://schemas.xmlsoap.org/soap/envelope/";

    #[must_use]
    pub fn server() -> QName {
        QName::new(SOAP_ENV_NS, "Server")
    }

    #[must_use]
    pub fn client() -> QName {
        QName::new(SOAP_ENV_NS, "Client")
    }

    #[must_use]
    pub fn must_understand() -> QName {
        QName::new(SOAP_ENV_NS, "MustUnderstand")
    }

    #[must_use]
    pub fn version_mismatch() -> QName {
        QName::new(SOAP_ENV_NS, "VersionMismatch")
    }
}

/// A processing failure raised by a handler's `invoke`.
///
/// Faults are never retried; they are a signal for fault handling. The code's
/// local part selects a fault handler (see [`Fault::lookup_key`]).
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("fault {code}: {reason}")]
pub struct Fault {
    pub code: QName,
    pub reason: String,
    pub detail: Option<Value>,
}

impl Fault {
    #[must_use]
    pub fn new(code: QName, reason: impl Into<String>) -> Self {
        Self {
            code,
            reason: reason.into(),
            detail: None,
        }
    }

    /// A `Server` fault: the receiver failed to process a valid message.
    #[must_use]
    pub fn server(reason: impl Into<String>) -> Self {
        Self::new(fault_codes::server(), reason)
    }

    /// A `Client` fault: the message itself was unacceptable.
    #[must_use]
    pub fn client(reason: impl Into<String>) -> Self {
        Self::new(fault_codes::client(), reason)
    }

    #[must_use]
    pub fn with_detail(mut self, detail: impl Into<Value>) -> Self {
        self.detail = Some(detail.into());
        self
    }

    /// Option key under which a handler for this fault is registered.
    #[must_use]
    pub fn lookup_key(&self) -> String {
        lookup_key_for(&self.code)
    }
}

/// `"fault-" + code.local_part`, matched verbatim against handler option keys.
#[must_use]
pub fn lookup_key_for(code: &QName) -> String {
    format!("{FAULT_KEY_PREFIX}{}", code.local_part)
}

impl From<anyhow::Error> for Fault {
    /// Wraps an arbitrary failure as a `Server` fault, unless it already is one.
    fn from(err: anyhow::Error) -> Self {
        match err.downcast::<Fault>() {
            Ok(fault) => fault,
            Err(err) => Fault::server(format!("{err:#}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lookup_key_uses_local_part_only() {
        let fault = Fault::new(QName::new("urn:app", "BadInput"), "bad");
        assert_eq!(fault.lookup_key(), "fault-BadInput");
    }

    #[test]
    fn anyhow_errors_become_server_faults() {
        let fault = Fault::from(anyhow::anyhow!("disk full"));
        assert_eq!(fault.code, fault_codes::server());
        assert_eq!(fault.reason, "disk full");
    }

    #[test]
    fn wrapped_fault_is_preserved() {
        let original = Fault::client("missing body").with_detail("body");
        let fault = Fault::from(anyhow::Error::new(original.clone()));
        assert_eq!(fault, original);
    }
}
