//! Guard conditions: field/operator/value triples
//!
//! Connections carry guard conditions that route instances through the
//! graph. A condition compares one field from the instance's variable
//! bindings (merged with submitted form data) against a literal value.
//! Multiple conditions on one connection combine with logical AND;
//! OR-branching is expressed as multiple connections with disjoint guards.

use serde::{Deserialize, Serialize};

// ── Field values ─────────────────────────────────────────────────────

/// A dynamically typed value carried in variable bindings and form data.
///
/// Deliberately a closed tagged union rather than raw JSON so the
/// condition evaluator stays total: every operator has explicit
/// compatibility rules per variant.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FieldValue {
    Bool(bool),
    Num(f64),
    Str(String),
    List(Vec<FieldValue>),
    Null,
}

impl FieldValue {
    /// Numeric view of the value. Numeric-looking strings coerce,
    /// everything else is `None`.
    pub fn as_num(&self) -> Option<f64> {
        match self {
            FieldValue::Num(n) => Some(*n),
            FieldValue::Str(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    /// Whether this value counts as "present" for the exists operator.
    pub fn is_present(&self) -> bool {
        !matches!(self, FieldValue::Null)
    }
}

impl From<&str> for FieldValue {
    fn from(s: &str) -> Self {
        FieldValue::Str(s.to_string())
    }
}

impl From<String> for FieldValue {
    fn from(s: String) -> Self {
        FieldValue::Str(s)
    }
}

impl From<f64> for FieldValue {
    fn from(n: f64) -> Self {
        FieldValue::Num(n)
    }
}

impl From<i64> for FieldValue {
    fn from(n: i64) -> Self {
        FieldValue::Num(n as f64)
    }
}

impl From<bool> for FieldValue {
    fn from(b: bool) -> Self {
        FieldValue::Bool(b)
    }
}

impl std::fmt::Display for FieldValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FieldValue::Bool(b) => write!(f, "{}", b),
            FieldValue::Num(n) => write!(f, "{}", n),
            FieldValue::Str(s) => write!(f, "{}", s),
            FieldValue::List(items) => {
                write!(f, "[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", item)?;
                }
                write!(f, "]")
            }
            FieldValue::Null => write!(f, "null"),
        }
    }
}

// ── Operators ────────────────────────────────────────────────────────

/// Comparison operator of a guard condition
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConditionOp {
    Eq,
    Ne,
    Gt,
    Lt,
    Ge,
    Le,
    /// Field value is a member of the condition's list value
    In,
    /// Field value is not a member of the condition's list value
    NotIn,
    /// Field is bound and non-null (condition value ignored)
    Exists,
    /// Field is unbound or null (condition value ignored)
    NotExists,
}

// ── Process condition ────────────────────────────────────────────────

/// A single guard condition on a connection
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ProcessCondition {
    /// The binding/form field to inspect
    pub field: String,
    /// How to compare
    pub op: ConditionOp,
    /// The literal to compare against
    pub value: FieldValue,
}

impl ProcessCondition {
    pub fn new(field: impl Into<String>, op: ConditionOp, value: impl Into<FieldValue>) -> Self {
        Self {
            field: field.into(),
            op,
            value: value.into(),
        }
    }

    /// `field == value`
    pub fn eq(field: impl Into<String>, value: impl Into<FieldValue>) -> Self {
        Self::new(field, ConditionOp::Eq, value)
    }

    /// `field > value`
    pub fn gt(field: impl Into<String>, value: impl Into<FieldValue>) -> Self {
        Self::new(field, ConditionOp::Gt, value)
    }

    /// `field < value`
    pub fn lt(field: impl Into<String>, value: impl Into<FieldValue>) -> Self {
        Self::new(field, ConditionOp::Lt, value)
    }

    /// `field in [values]`
    pub fn is_in(field: impl Into<String>, values: Vec<FieldValue>) -> Self {
        Self::new(field, ConditionOp::In, FieldValue::List(values))
    }

    /// `field exists`
    pub fn exists(field: impl Into<String>) -> Self {
        Self::new(field, ConditionOp::Exists, FieldValue::Null)
    }
}

// ── Process variables ────────────────────────────────────────────────

/// A typed, named value declared by a process definition.
///
/// Variables seed an instance's bindings at creation time and are
/// referenced by guard conditions and form bindings.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ProcessVariable {
    /// Binding name
    pub name: String,
    /// Default value applied when instance creation supplies none
    pub default: FieldValue,
    /// Human-readable description
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,
}

impl ProcessVariable {
    pub fn new(name: impl Into<String>, default: impl Into<FieldValue>) -> Self {
        Self {
            name: name.into(),
            default: default.into(),
            description: String::new(),
        }
    }

    pub fn with_description(mut self, desc: impl Into<String>) -> Self {
        self.description = desc.into();
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_as_num_coercion() {
        assert_eq!(FieldValue::Num(4.5).as_num(), Some(4.5));
        assert_eq!(FieldValue::Str("15".into()).as_num(), Some(15.0));
        assert_eq!(FieldValue::Str(" 2.5 ".into()).as_num(), Some(2.5));
        assert_eq!(FieldValue::Str("abc".into()).as_num(), None);
        assert_eq!(FieldValue::Bool(true).as_num(), None);
        assert_eq!(FieldValue::Null.as_num(), None);
    }

    #[test]
    fn test_is_present() {
        assert!(FieldValue::Bool(false).is_present());
        assert!(FieldValue::Str(String::new()).is_present());
        assert!(!FieldValue::Null.is_present());
    }

    #[test]
    fn test_condition_constructors() {
        let c = ProcessCondition::gt("amount", 1000.0);
        assert_eq!(c.field, "amount");
        assert_eq!(c.op, ConditionOp::Gt);
        assert_eq!(c.value, FieldValue::Num(1000.0));

        let c = ProcessCondition::is_in("env", vec!["prod".into(), "staging".into()]);
        assert_eq!(c.op, ConditionOp::In);
        assert!(matches!(c.value, FieldValue::List(ref v) if v.len() == 2));

        let c = ProcessCondition::exists("approver");
        assert_eq!(c.op, ConditionOp::Exists);
    }

    #[test]
    fn test_field_value_serde_untagged() {
        let v: FieldValue = serde_json::from_str("42").unwrap();
        assert_eq!(v, FieldValue::Num(42.0));

        let v: FieldValue = serde_json::from_str("\"ok\"").unwrap();
        assert_eq!(v, FieldValue::Str("ok".into()));

        let v: FieldValue = serde_json::from_str("[1, 2]").unwrap();
        assert!(matches!(v, FieldValue::List(_)));

        let v: FieldValue = serde_json::from_str("null").unwrap();
        assert_eq!(v, FieldValue::Null);
    }

    #[test]
    fn test_display() {
        assert_eq!(FieldValue::Str("x".into()).to_string(), "x");
        assert_eq!(
            FieldValue::List(vec![1i64.into(), 2i64.into()]).to_string(),
            "[1, 2]"
        );
    }
}
