//! Condition evaluation against instance bindings
//!
//! Pure and total: evaluation never errors and never panics. A missing
//! field or a type mismatch makes the condition false (fail closed)
//! rather than aborting routing mid-instance. The one deliberate
//! exception is `NotExists`, which is true precisely when the field is
//! unbound or null.

use std::collections::HashMap;
use workorder_types::{ConditionOp, Connection, FieldValue, ProcessCondition};

/// Evaluates guard conditions. Stateless; bindings come from the
/// instance merged with any form data submitted alongside the action.
pub struct ConditionEvaluator;

impl ConditionEvaluator {
    /// Evaluate a single condition
    pub fn evaluate(condition: &ProcessCondition, bindings: &HashMap<String, FieldValue>) -> bool {
        let field = bindings.get(&condition.field);

        // Absence-sensitive operators first; everything else fails
        // closed on a missing or null field.
        match condition.op {
            ConditionOp::Exists => return field.map(|v| v.is_present()).unwrap_or(false),
            ConditionOp::NotExists => return !field.map(|v| v.is_present()).unwrap_or(false),
            _ => {}
        }
        let Some(value) = field else {
            return false;
        };
        if !value.is_present() {
            return false;
        }

        match condition.op {
            ConditionOp::Eq => values_equal(value, &condition.value),
            ConditionOp::Ne => !values_equal(value, &condition.value),
            ConditionOp::Gt => compare(value, &condition.value, |a, b| a > b),
            ConditionOp::Lt => compare(value, &condition.value, |a, b| a < b),
            ConditionOp::Ge => compare(value, &condition.value, |a, b| a >= b),
            ConditionOp::Le => compare(value, &condition.value, |a, b| a <= b),
            ConditionOp::In => list_contains(&condition.value, value),
            ConditionOp::NotIn => match &condition.value {
                FieldValue::List(_) => !list_contains(&condition.value, value),
                _ => false,
            },
            ConditionOp::Exists | ConditionOp::NotExists => unreachable!("handled above"),
        }
    }

    /// Evaluate a conjunction. Empty slices are vacuously true, which
    /// makes an unconditional connection a guard of zero conditions.
    pub fn evaluate_all(
        conditions: &[ProcessCondition],
        bindings: &HashMap<String, FieldValue>,
    ) -> bool {
        conditions.iter().all(|c| Self::evaluate(c, bindings))
    }

    /// Whether a connection fires against the given bindings
    pub fn connection_fires(connection: &Connection, bindings: &HashMap<String, FieldValue>) -> bool {
        Self::evaluate_all(&connection.conditions, bindings)
    }
}

/// Equality with numeric coercion: `Str("15")` equals `Num(15.0)`.
/// Cross-type comparisons without a numeric view are unequal.
fn values_equal(a: &FieldValue, b: &FieldValue) -> bool {
    if let (Some(x), Some(y)) = (a.as_num(), b.as_num()) {
        return x == y;
    }
    match (a, b) {
        (FieldValue::Bool(x), FieldValue::Bool(y)) => x == y,
        (FieldValue::Str(x), FieldValue::Str(y)) => x == y,
        (FieldValue::List(x), FieldValue::List(y)) => {
            x.len() == y.len() && x.iter().zip(y).all(|(i, j)| values_equal(i, j))
        }
        _ => false,
    }
}

fn compare(a: &FieldValue, b: &FieldValue, op: impl Fn(f64, f64) -> bool) -> bool {
    match (a.as_num(), b.as_num()) {
        (Some(x), Some(y)) => op(x, y),
        _ => false,
    }
}

fn list_contains(list: &FieldValue, needle: &FieldValue) -> bool {
    match list {
        FieldValue::List(items) => items.iter().any(|item| values_equal(item, needle)),
        _ => false,
    }
}
