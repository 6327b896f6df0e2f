//! Shared test fixtures: a scripted evaluator standing in for the host's
//! expression language.

use crate::error::EvalError;
use crate::eval::{Evaluator, ExprHandle};
use crate::types::{Timestamp, VariableMap};
use serde_json::json;
use std::collections::BTreeMap;

/// Evaluator backed by a fixed table, with a tiny `var op literal`
/// comparison fallback so guards like `"x > 0"` read against the instance
/// variables.
#[derive(Default)]
pub struct ScriptedEvaluator {
    values: BTreeMap<String, serde_json::Value>,
    due: BTreeMap<String, Timestamp>,
}

impl ScriptedEvaluator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_value(mut self, expr: &str, value: serde_json::Value) -> Self {
        self.values.insert(expr.to_string(), value);
        self
    }

    pub fn with_due(mut self, expr: &str, due: Timestamp) -> Self {
        self.due.insert(expr.to_string(), due);
        self
    }
}

impl Evaluator for ScriptedEvaluator {
    fn evaluate(
        &self,
        expr: &ExprHandle,
        variables: &VariableMap,
    ) -> Result<serde_json::Value, EvalError> {
        if let Some(value) = self.values.get(expr.as_str()) {
            return Ok(value.clone());
        }
        compare(expr.as_str(), variables)
            .ok_or_else(|| EvalError::new(format!("unknown expression: {expr}")))
    }

    fn due_time(
        &self,
        expr: &ExprHandle,
        _variables: &VariableMap,
        _now: Timestamp,
    ) -> Result<Timestamp, EvalError> {
        self.due
            .get(expr.as_str())
            .copied()
            .or_else(|| expr.as_str().parse().ok())
            .ok_or_else(|| EvalError::new(format!("unknown timer expression: {expr}")))
    }
}

fn compare(expr: &str, variables: &VariableMap) -> Option<serde_json::Value> {
    let mut parts = expr.split_whitespace();
    let (var, op, rhs) = (parts.next()?, parts.next()?, parts.next()?);
    let lhs = variables.get(var)?.as_i64()?;
    let rhs: i64 = rhs.parse().ok()?;
    let result = match op {
        ">" => lhs > rhs,
        "<" => lhs < rhs,
        ">=" => lhs >= rhs,
        "<=" => lhs <= rhs,
        "==" => lhs == rhs,
        "!=" => lhs != rhs,
        _ => return None,
    };
    Some(json!(result))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn comparison_fallback_reads_variables() {
        let eval = ScriptedEvaluator::new();
        let mut vars = VariableMap::new();
        vars.insert("x".to_string(), json!(5));
        let result = eval.evaluate(&ExprHandle::from("x > 0"), &vars).unwrap();
        assert_eq!(result, json!(true));
        let result = eval.evaluate(&ExprHandle::from("x < 0"), &vars).unwrap();
        assert_eq!(result, json!(false));
        assert!(eval.evaluate(&ExprHandle::from("y > 0"), &vars).is_err());
    }
}
