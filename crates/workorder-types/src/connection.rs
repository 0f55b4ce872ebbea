//! Connections: directed, optionally guarded edges between steps
//!
//! A connection with no conditions is unconditional. A connection with
//! conditions fires only when every condition holds against the
//! instance's bindings (logical AND). Declaration order doubles as the
//! tie-break rule when several connections out of a decision step match.

use crate::{ProcessCondition, StepId};
use serde::{Deserialize, Serialize};

// ── Join policy ──────────────────────────────────────────────────────

/// Rule for activating a step fed by multiple parallel branches
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum JoinPolicy {
    /// Every incoming parallel branch must complete before activation.
    /// The conservative default.
    #[default]
    All,
    /// First branch to complete activates the step; remaining branches
    /// become moot and their later completion is a no-op.
    Any,
}

// ── Connection ───────────────────────────────────────────────────────

/// A directed edge in the process graph
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Connection {
    /// Source step
    pub from: StepId,
    /// Target step
    pub to: StepId,
    /// Guard conditions, combined with AND. Empty means unconditional.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<ProcessCondition>,
    /// Human-readable label shown on the graph
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub label: String,
    /// Declaration order within the definition. Decision routing
    /// evaluates connections in ascending order.
    pub order: u32,
}

impl Connection {
    /// Create an unconditional connection
    pub fn new(from: StepId, to: StepId) -> Self {
        Self {
            from,
            to,
            conditions: Vec::new(),
            label: String::new(),
            order: 0,
        }
    }

    /// Create a connection guarded by a single condition
    pub fn guarded(from: StepId, to: StepId, condition: ProcessCondition) -> Self {
        Self {
            from,
            to,
            conditions: vec![condition],
            label: String::new(),
            order: 0,
        }
    }

    pub fn with_condition(mut self, condition: ProcessCondition) -> Self {
        self.conditions.push(condition);
        self
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = label.into();
        self
    }

    pub fn with_order(mut self, order: u32) -> Self {
        self.order = order;
        self
    }

    /// Whether this connection fires regardless of bindings
    pub fn is_unconditional(&self) -> bool {
        self.conditions.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unconditional_connection() {
        let c = Connection::new(StepId::new("a"), StepId::new("b"));
        assert!(c.is_unconditional());
        assert_eq!(c.order, 0);
    }

    #[test]
    fn test_guarded_connection() {
        let c = Connection::guarded(
            StepId::new("decide"),
            StepId::new("high"),
            ProcessCondition::gt("amount", 1000.0),
        )
        .with_label("High value")
        .with_order(1);

        assert!(!c.is_unconditional());
        assert_eq!(c.label, "High value");
        assert_eq!(c.order, 1);
    }

    #[test]
    fn test_join_policy_default() {
        assert_eq!(JoinPolicy::default(), JoinPolicy::All);
    }
}
