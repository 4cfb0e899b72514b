//! Handler descriptors: a named handler implementation plus its options and
//! placement rule.

use std::fmt;
use std::sync::Arc;

use crate::fault::lookup_key_for;
use crate::qname::QName;
use crate::rule::PhaseRule;
use crate::traits::Handler;

/// Value of a handler configuration option.
#[derive(Clone)]
pub enum OptionValue {
    Text(String),
    /// A handler reference, e.g. the fault handler registered under a
    /// `fault-<code>` key.
    Handler(Arc<dyn Handler>),
}

impl fmt::Debug for OptionValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OptionValue::Text(s) => f.debug_tuple("Text").field(s).finish(),
            OptionValue::Handler(_) => f.write_str("Handler(..)"),
        }
    }
}

impl From<&str> for OptionValue {
    fn from(s: &str) -> Self {
        OptionValue::Text(s.to_string())
    }
}

impl From<String> for OptionValue {
    fn from(s: String) -> Self {
        OptionValue::Text(s)
    }
}

impl From<Arc<dyn Handler>> for OptionValue {
    fn from(h: Arc<dyn Handler>) -> Self {
        OptionValue::Handler(h)
    }
}

/// Insertion-ordered option table of a handler.
///
/// Small by construction; lookups are linear scans.
#[derive(Debug, Clone, Default)]
pub struct HandlerOptions {
    entries: Vec<(String, OptionValue)>,
}

impl HandlerOptions {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets an option. Replacing an existing key keeps its position.
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<OptionValue>) {
        let key = key.into();
        let value = value.into();
        match self.entries.iter_mut().find(|(k, _)| *k == key) {
            Some(entry) => entry.1 = value,
            None => self.entries.push((key, value)),
        }
    }

    #[must_use]
    pub fn get(&self, key: &str) -> Option<&OptionValue> {
        self.entries.iter().find(|(k, _)| k == key).map(|(_, v)| v)
    }

    #[must_use]
    pub fn text(&self, key: &str) -> Option<&str> {
        match self.get(key)? {
            OptionValue::Text(s) => Some(s),
            OptionValue::Handler(_) => None,
        }
    }

    /// Handler registered under `"fault-" + code.local_part`.
    ///
    /// Exact string match only: `Server.General` does not match a
    /// `fault-Server` key.
    #[must_use]
    pub fn fault_handler(&self, code: &QName) -> Option<&Arc<dyn Handler>> {
        let key = lookup_key_for(code);
        match self.get(&key)? {
            OptionValue::Handler(h) => Some(h),
            OptionValue::Text(_) => None,
        }
    }

    #[must_use]
    pub fn contains_key(&self, key: &str) -> bool {
        self.get(key).is_some()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &OptionValue)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v))
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// A deployed handler: identity, implementation, options and placement.
///
/// Immutable once deployed; shared between every chain it is resolved into.
#[derive(Clone)]
pub struct HandlerDescription {
    pub name: QName,
    pub handler: Arc<dyn Handler>,
    pub options: HandlerOptions,
    pub rule: PhaseRule,
}

impl HandlerDescription {
    #[must_use]
    pub fn new(name: QName, handler: Arc<dyn Handler>, rule: PhaseRule) -> Self {
        Self {
            name,
            handler,
            options: HandlerOptions::new(),
            rule,
        }
    }

    #[must_use]
    pub fn with_option(mut self, key: impl Into<String>, value: impl Into<OptionValue>) -> Self {
        self.options.insert(key, value);
        self
    }

    /// Local part of the name; what phase rules refer to.
    #[must_use]
    pub fn local_name(&self) -> &str {
        &self.name.local_part
    }

    /// Handler to run when this descriptor sits in a fault chain and is
    /// registered for `code`.
    ///
    /// A `fault-<code>` key holding a handler reference selects that handler;
    /// a text value selects this descriptor's own handler.
    #[must_use]
    pub fn registered_for(&self, code: &QName) -> Option<Arc<dyn Handler>> {
        match self.options.get(&lookup_key_for(code))? {
            OptionValue::Handler(h) => Some(Arc::clone(h)),
            OptionValue::Text(_) => Some(Arc::clone(&self.handler)),
        }
    }
}

impl fmt::Debug for HandlerDescription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerDescription")
            .field("name", &self.name)
            .field("options", &self.options)
            .field("rule", &self.rule)
            .finish_non_exhaustive()
    }
}
