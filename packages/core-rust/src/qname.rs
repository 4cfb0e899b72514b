//! Namespace-qualified names.
//!
//! Handler names, service and operation identifiers, fault codes and SOAP
//! header block names are all `QName`s. Matching between handlers (phase
//! rules, fault keys) uses the local part only.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// A qualified XML name: `{namespace}local`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct QName {
    /// Namespace URI. Empty for unqualified names.
    pub namespace: String,
    /// Local part of the name.
    pub local_part: String,
}

impl QName {
    #[must_use]
    pub fn new(namespace: impl Into<String>, local_part: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            local_part: local_part.into(),
        }
    }

    /// Creates a name with no namespace.
    #[must_use]
    pub fn local(local_part: impl Into<String>) -> Self {
        Self::new(String::new(), local_part)
    }
}

impl fmt::Display for QName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.namespace.is_empty() {
            f.write_str(&self.local_part)
        } else {
            write!(f, "{{{}}}{}", self.namespace, self.local_part)
        }
    }
}

/// Error returned when a string is not a valid `{ns}local` name.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("malformed qualified name: {0:?}")]
pub struct ParseQNameError(pub String);

impl FromStr for QName {
    type Err = ParseQNameError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let Some(rest) = s.strip_prefix('{') else {
            if s.is_empty() || s.contains('}') {
                return Err(ParseQNameError(s.to_string()));
            }
            return Ok(Self::local(s));
        };
        match rest.split_once('}') {
            Some((ns, local)) if !local.is_empty() => Ok(Self::new(ns, local)),
            _ => Err(ParseQNameError(s.to_string())),
        }
    }
}

impl From<&str> for QName {
    /// Unqualified name. Use `str::parse` for the `{ns}local` form.
    fn from(local_part: &str) -> Self {
        Self::local(local_part)
    }
}
