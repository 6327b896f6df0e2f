use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

// ─── Scalar aliases ───────────────────────────────────────────

/// Epoch milliseconds (UTC).
pub type Timestamp = i64;

/// Instance variables: opaque JSON values keyed by name. The engine never
/// interprets them; they are handed to the external `Evaluator` and merged
/// from `complete_activity` results.
pub type VariableMap = BTreeMap<String, serde_json::Value>;

// ─── Triggers ─────────────────────────────────────────────────

/// Kind of a runtime trigger signal delivered to `Engine::signal`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum TriggerKind {
    Message,
    Timer,
    Signal,
    Error,
    Escalation,
    Cancel,
    Terminate,
    Conditional,
    Link,
}

/// A runtime trigger: a kind plus a correlation key matched against the
/// event-definition references of armed catch points.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Trigger {
    pub kind: TriggerKind,
    /// Correlation key. `None` only matches reference-less catch points.
    pub reference: Option<String>,
    /// Wall-clock instant of the trigger. Armed timers fire when their due
    /// time is at or before this.
    pub at: Timestamp,
}

impl Trigger {
    pub fn new(kind: TriggerKind, reference: Option<String>) -> Self {
        Self {
            kind,
            reference,
            at: now_ms(),
        }
    }

    pub fn message(reference: impl Into<String>) -> Self {
        Self::new(TriggerKind::Message, Some(reference.into()))
    }

    pub fn signal(reference: impl Into<String>) -> Self {
        Self::new(TriggerKind::Signal, Some(reference.into()))
    }

    pub fn error(reference: Option<String>) -> Self {
        Self::new(TriggerKind::Error, reference)
    }

    /// Timer tick at the given instant; matches every armed timer whose due
    /// time has elapsed.
    pub fn timer(at: Timestamp) -> Self {
        Self {
            kind: TriggerKind::Timer,
            reference: None,
            at,
        }
    }

    pub fn terminate() -> Self {
        Self::new(TriggerKind::Terminate, None)
    }

    pub fn cancel() -> Self {
        Self::new(TriggerKind::Cancel, None)
    }
}

// ─── Helpers ──────────────────────────────────────────────────

/// Guard results follow JSON truthiness: null and false are false, zero is
/// false, empty strings are false, everything else is true.
pub fn is_truthy(val: &serde_json::Value) -> bool {
    match val {
        serde_json::Value::Null => false,
        serde_json::Value::Bool(b) => *b,
        serde_json::Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(false),
        serde_json::Value::String(s) => !s.is_empty(),
        serde_json::Value::Array(_) | serde_json::Value::Object(_) => true,
    }
}

pub fn now_ms() -> Timestamp {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn truthiness_follows_json_conventions() {
        assert!(!is_truthy(&json!(null)));
        assert!(!is_truthy(&json!(false)));
        assert!(!is_truthy(&json!(0)));
        assert!(!is_truthy(&json!("")));
        assert!(is_truthy(&json!(true)));
        assert!(is_truthy(&json!(-3)));
        assert!(is_truthy(&json!("yes")));
        assert!(is_truthy(&json!([])));
    }
}
