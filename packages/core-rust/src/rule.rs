//! Declarative handler placement.

use serde::{Deserialize, Serialize};

use crate::error::ResolutionError;

/// Placement constraint attached to every handler.
///
/// `before` and `after` name other handlers (by local part) of the same
/// phase. `phase_first` pins the handler to the head of the phase,
/// `phase_last` to the tail. A handler carrying both flags must be the only
/// handler of its phase.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhaseRule {
    pub phase_name: String,
    #[serde(default)]
    pub before: Option<String>,
    #[serde(default)]
    pub after: Option<String>,
    #[serde(default)]
    pub phase_first: bool,
    #[serde(default)]
    pub phase_last: bool,
}

impl PhaseRule {
    #[must_use]
    pub fn new(phase_name: impl Into<String>) -> Self {
        Self {
            phase_name: phase_name.into(),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn before(mut self, handler: impl Into<String>) -> Self {
        self.before = Some(handler.into());
        self
    }

    #[must_use]
    pub fn after(mut self, handler: impl Into<String>) -> Self {
        self.after = Some(handler.into());
        self
    }

    #[must_use]
    pub fn first(mut self) -> Self {
        self.phase_first = true;
        self
    }

    #[must_use]
    pub fn last(mut self) -> Self {
        self.phase_last = true;
        self
    }

    /// `true` when the handler must be alone in its phase.
    #[must_use]
    pub fn is_sole(&self) -> bool {
        self.phase_first && self.phase_last
    }

    /// Checks the rule for self-contradictions, independent of the other
    /// handlers in the phase.
    ///
    /// # Errors
    ///
    /// Returns `ResolutionError::RuleConflict` when the rule names no phase,
    /// refers to its own handler, names the same handler on both sides, or
    /// orders a sole (first and last) handler against other handlers.
    pub fn validate(&self, handler: &str) -> Result<(), ResolutionError> {
        let conflict = |reason: &str| ResolutionError::RuleConflict {
            handler: handler.to_string(),
            reason: reason.to_string(),
        };

        if self.phase_name.is_empty() {
            return Err(conflict("no target phase"));
        }
        if self.before.as_deref() == Some(handler) || self.after.as_deref() == Some(handler) {
            return Err(conflict("handler refers to itself"));
        }
        if self.before.is_some() && self.before == self.after {
            return Err(conflict("same handler named in before and after"));
        }
        if self.is_sole() && (self.before.is_some() || self.after.is_some()) {
            return Err(conflict("a phase-first and phase-last handler must be alone in its phase"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_sets_constraints() {
        let rule = PhaseRule::new("global").after("H1").before("H2");
        assert_eq!(rule.phase_name, "global");
        assert_eq!(rule.after.as_deref(), Some("H1"));
        assert_eq!(rule.before.as_deref(), Some("H2"));
        assert!(!rule.phase_first);
        assert!(rule.validate("H3").is_ok());
    }

    #[test]
    fn sole_handler_with_constraint_conflicts() {
        let err = PhaseRule::new("global").first().last().after("H1").validate("H2");
        assert!(matches!(err, Err(ResolutionError::RuleConflict { handler, .. }) if handler == "H2"));
    }

    #[test]
    fn same_handler_on_both_sides_conflicts() {
        let err = PhaseRule::new("global").before("H1").after("H1").validate("H2");
        assert!(matches!(err, Err(ResolutionError::RuleConflict { .. })));
    }

    #[test]
    fn first_with_before_is_allowed() {
        assert!(PhaseRule::new("global").first().before("H2").validate("H1").is_ok());
    }

    #[test]
    fn self_reference_conflicts() {
        assert!(PhaseRule::new("global").after("H1").validate("H1").is_err());
    }

    #[test]
    fn missing_phase_name_conflicts() {
        assert!(PhaseRule::default().validate("H1").is_err());
    }

    #[test]
    fn deserializes_with_defaults() {
        let rule: PhaseRule =
            serde_json::from_str(r#"{"phase_name":"Logging","after":"H1"}"#).unwrap();
        assert_eq!(rule, PhaseRule::new("Logging").after("H1"));
    }
}
