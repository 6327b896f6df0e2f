use crate::error::EvalError;
use crate::types::{Timestamp, VariableMap};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Opaque reference to an expression in whatever language the host wired
/// in. The core never inspects the text; only the `Evaluator` resolves it.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ExprHandle(pub String);

impl ExprHandle {
    pub fn new(text: impl Into<String>) -> Self {
        Self(text.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for ExprHandle {
    fn from(text: &str) -> Self {
        Self(text.to_string())
    }
}

impl fmt::Display for ExprHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Expression-evaluation capability supplied by the host application.
///
/// Used for sequence-flow guards, script-task bodies, conditional events,
/// and timer due-time computation. Synchronous on purpose: guards are
/// evaluated inside the deterministic stepper pass.
pub trait Evaluator: Send + Sync {
    /// Evaluate an expression against the instance variables.
    fn evaluate(
        &self,
        expr: &ExprHandle,
        variables: &VariableMap,
    ) -> Result<serde_json::Value, EvalError>;

    /// Compute the absolute due time of a timer expression, given the
    /// arming instant.
    fn due_time(
        &self,
        expr: &ExprHandle,
        variables: &VariableMap,
        now: Timestamp,
    ) -> Result<Timestamp, EvalError>;
}
