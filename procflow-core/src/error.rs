use crate::types::TriggerKind;
use std::fmt;
use thiserror::Error;
use uuid::Uuid;

// ─── Definition errors (load time, fatal) ─────────────────────

/// What kind of violation a definition carries.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DefinitionErrorKind {
    /// A flow, attachment, or default reference points at nothing.
    DanglingReference,
    /// A node is unreachable from every start event of its scope.
    OrphanNode,
    /// Flow lists and the edge set disagree, or an event node carries flows
    /// it must not have.
    MalformedCardinality,
    /// A default flow is guarded, or a gateway declares more than one.
    NoDefaultFlow,
}

impl fmt::Display for DefinitionErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DefinitionErrorKind::DanglingReference => "DanglingReference",
            DefinitionErrorKind::OrphanNode => "OrphanNode",
            DefinitionErrorKind::MalformedCardinality => "MalformedCardinality",
            DefinitionErrorKind::NoDefaultFlow => "NoDefaultFlow",
        };
        f.write_str(s)
    }
}

/// A single load-time violation. The loader collects every violation it
/// finds before failing.
#[derive(Clone, Debug, Error)]
#[error("[{kind}] {node}: {detail}")]
pub struct DefinitionError {
    pub kind: DefinitionErrorKind,
    /// Node or flow id the violation anchors to.
    pub node: String,
    pub detail: String,
}

impl DefinitionError {
    pub fn new(
        kind: DefinitionErrorKind,
        node: impl Into<String>,
        detail: impl Into<String>,
    ) -> Self {
        Self {
            kind,
            node: node.into(),
            detail: detail.into(),
        }
    }
}

/// Why `load` rejected a serialized definition.
#[derive(Debug, Error)]
pub enum LoadError {
    #[error("definition parse error: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("definition parse error: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("definition rejected with {} violation(s)", .0.len())]
    Invalid(Vec<DefinitionError>),
}

// ─── Expression evaluation ────────────────────────────────────

/// Opaque failure reported by the external expression evaluator.
#[derive(Clone, Debug, Error)]
#[error("expression evaluation failed: {message}")]
pub struct EvalError {
    pub message: String,
}

impl EvalError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

// ─── Gateway errors ───────────────────────────────────────────

#[derive(Debug, Error)]
pub enum GatewayError {
    /// Exclusive or inclusive gateway with no satisfied guard and no
    /// default flow.
    #[error("gateway {gateway}: no outgoing flow applicable")]
    NoApplicableFlow { gateway: String },
    #[error(transparent)]
    Eval(#[from] EvalError),
}

// ─── Dispatch errors (returned to external callers) ───────────

#[derive(Debug, Error)]
pub enum DispatchError {
    /// No armed catch point matches the trigger. Instance state is left
    /// untouched.
    #[error("no armed catch point matches {kind:?} trigger (reference {reference:?})")]
    UnknownTrigger {
        kind: TriggerKind,
        reference: Option<String>,
    },
    /// Resumption call referencing an activity that is no longer armed
    /// (already interrupted or already completed).
    #[error("activity {activity} is not awaiting completion in instance {instance}")]
    StaleResumption { instance: Uuid, activity: String },
}

// ─── Engine umbrella ──────────────────────────────────────────

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("unknown definition: {0}")]
    UnknownDefinition(String),
    #[error("unknown instance: {0}")]
    UnknownInstance(Uuid),
    #[error("definition {0} is not executable")]
    NotExecutable(String),
    #[error("instance {0} is in a terminal state")]
    InstanceDone(Uuid),
    #[error("instance {0} exceeded the step limit; aborting the stepper pass")]
    StepLimitExceeded(Uuid),
    #[error(transparent)]
    Load(#[from] LoadError),
    #[error(transparent)]
    Dispatch(#[from] DispatchError),
    #[error("persistor failure: {0}")]
    Persist(#[source] anyhow::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn definition_error_display_carries_kind_and_anchor() {
        let err = DefinitionError::new(
            DefinitionErrorKind::DanglingReference,
            "f1",
            "target 'ghost' does not exist",
        );
        let msg = err.to_string();
        assert!(msg.contains("DanglingReference"));
        assert!(msg.contains("f1"));
        assert!(msg.contains("ghost"));
    }

    #[test]
    fn load_error_reports_violation_count() {
        let err = LoadError::Invalid(vec![
            DefinitionError::new(DefinitionErrorKind::OrphanNode, "a", "unreachable"),
            DefinitionError::new(DefinitionErrorKind::NoDefaultFlow, "g", "two defaults"),
        ]);
        assert!(err.to_string().contains("2 violation(s)"));
    }
}
