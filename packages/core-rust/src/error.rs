/// Deployment-time failure to turn phase rules into an execution order.
///
/// Fatal to the deployment of the owning service. Never retried.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ResolutionError {
    #[error("handler {handler} targets phase {phase:?}, which is not part of the flow")]
    UndeclaredPhase { handler: String, phase: String },
    #[error("phase {phase:?} appears more than once in the phase order")]
    DuplicatePhase { phase: String },
    #[error("handler {handler} is declared twice in phase {phase:?}")]
    DuplicateHandler { phase: String, handler: String },
    #[error("handler {handler} in phase {phase:?} refers to unknown handler {reference:?}")]
    UnknownHandler {
        phase: String,
        handler: String,
        reference: String,
    },
    #[error("cyclic before/after constraints in phase {phase:?}: {}", path.join(" -> "))]
    Cycle { phase: String, path: Vec<String> },
    #[error("phase {phase:?} has several phase-first handlers with no mutual order: {handlers:?}")]
    AmbiguousFirst { phase: String, handlers: Vec<String> },
    #[error("phase {phase:?} has several phase-last handlers with no mutual order: {handlers:?}")]
    AmbiguousLast { phase: String, handlers: Vec<String> },
    #[error("conflicting phase rule on handler {handler}: {reason}")]
    RuleConflict { handler: String, reason: String },
}
