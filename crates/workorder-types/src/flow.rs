//! Flow actions and the immutable audit trail
//!
//! Every action applied to an instance - successful or rejected -
//! produces exactly one FlowRecord. Records are never updated or
//! deleted; replaying them reconstructs the instance's runtime state.

use crate::{FieldValue, InstanceId, StepId, UserId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

// ── Flow actions ─────────────────────────────────────────────────────

/// An action applied to a step of a running instance
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlowAction {
    /// Instance created (recorded once at launch)
    Create,
    /// Submit form data without advancing
    Submit,
    /// Approve the step and advance
    Approve,
    /// Reject the step and route to its fallback
    Reject,
    /// Reassign the step to different candidates, position unchanged
    Transfer,
    /// Set the active assignee from the candidate set
    Assign,
    /// Initiator withdraws the instance (terminates)
    Revoke,
    /// Operator cancels the instance (terminates)
    Cancel,
    /// Send the instance back to an earlier step
    Return,
    /// Complete a task step and advance
    Complete,
    /// Escalation timer fired and routed to the escalation target
    Escalate,
    /// Escalation timer fired with no target; notification only
    Reminder,
}

impl FlowAction {
    /// Actions that finish the step and trigger advancement
    pub fn advances(&self) -> bool {
        matches!(self, FlowAction::Approve | FlowAction::Complete)
    }

    /// Actions that terminate the whole instance
    pub fn terminates(&self) -> bool {
        matches!(self, FlowAction::Cancel | FlowAction::Revoke)
    }
}

impl std::fmt::Display for FlowAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            FlowAction::Create => "create",
            FlowAction::Submit => "submit",
            FlowAction::Approve => "approve",
            FlowAction::Reject => "reject",
            FlowAction::Transfer => "transfer",
            FlowAction::Assign => "assign",
            FlowAction::Revoke => "revoke",
            FlowAction::Cancel => "cancel",
            FlowAction::Return => "return",
            FlowAction::Complete => "complete",
            FlowAction::Escalate => "escalate",
            FlowAction::Reminder => "reminder",
        };
        write!(f, "{}", name)
    }
}

// ── Action result ────────────────────────────────────────────────────

/// Outcome recorded for an action application
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionResult {
    Success,
    Failed,
    Pending,
}

// ── Flow record ──────────────────────────────────────────────────────

/// One immutable audit record per action application
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FlowRecord {
    /// Unique record id
    pub record_id: String,
    /// The instance this record belongs to
    pub instance_id: InstanceId,
    /// The step the action targeted
    pub step_id: StepId,
    /// Step name snapshot (definitions evolve; records do not)
    pub step_name: String,
    /// The action applied
    pub action: FlowAction,
    /// Who applied it
    pub operator_id: UserId,
    /// Operator display name snapshot
    pub operator_name: String,
    /// Assignee at the time of the action, if any
    #[serde(skip_serializing_if = "Option::is_none")]
    pub assignee: Option<UserId>,
    /// Free-form comment
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub comment: String,
    /// Whether the application succeeded
    pub result: ActionResult,
    /// Snapshot of the form data submitted with the action
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub form_snapshot: HashMap<String, FieldValue>,
    /// When the action was applied
    pub timestamp: DateTime<Utc>,
}

impl FlowRecord {
    pub fn new(
        instance_id: InstanceId,
        step_id: StepId,
        step_name: impl Into<String>,
        action: FlowAction,
        operator_id: UserId,
    ) -> Self {
        Self {
            record_id: uuid::Uuid::new_v4().to_string(),
            instance_id,
            step_id,
            step_name: step_name.into(),
            action,
            operator_id,
            operator_name: String::new(),
            assignee: None,
            comment: String::new(),
            result: ActionResult::Success,
            form_snapshot: HashMap::new(),
            timestamp: Utc::now(),
        }
    }

    pub fn with_operator_name(mut self, name: impl Into<String>) -> Self {
        self.operator_name = name.into();
        self
    }

    pub fn with_assignee(mut self, assignee: UserId) -> Self {
        self.assignee = Some(assignee);
        self
    }

    pub fn with_comment(mut self, comment: impl Into<String>) -> Self {
        self.comment = comment.into();
        self
    }

    pub fn with_result(mut self, result: ActionResult) -> Self {
        self.result = result;
        self
    }

    pub fn with_form_snapshot(mut self, form: HashMap<String, FieldValue>) -> Self {
        self.form_snapshot = form;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_action_classification() {
        assert!(FlowAction::Approve.advances());
        assert!(FlowAction::Complete.advances());
        assert!(!FlowAction::Reject.advances());
        assert!(!FlowAction::Submit.advances());

        assert!(FlowAction::Cancel.terminates());
        assert!(FlowAction::Revoke.terminates());
        assert!(!FlowAction::Approve.terminates());
    }

    #[test]
    fn test_record_builder() {
        let record = FlowRecord::new(
            InstanceId::new("wo-1"),
            StepId::new("review"),
            "Manager Review",
            FlowAction::Approve,
            UserId::new("alice"),
        )
        .with_operator_name("Alice")
        .with_assignee(UserId::new("alice"))
        .with_comment("LGTM")
        .with_form_snapshot(HashMap::from([("score".to_string(), 95i64.into())]));

        assert_eq!(record.result, ActionResult::Success);
        assert_eq!(record.comment, "LGTM");
        assert_eq!(record.step_name, "Manager Review");
        assert!(!record.record_id.is_empty());
    }

    #[test]
    fn test_action_display() {
        assert_eq!(FlowAction::Approve.to_string(), "approve");
        assert_eq!(FlowAction::Reminder.to_string(), "reminder");
    }

    #[test]
    fn test_record_serde_roundtrip() {
        let record = FlowRecord::new(
            InstanceId::new("wo-1"),
            StepId::new("s"),
            "S",
            FlowAction::Reject,
            UserId::new("bob"),
        )
        .with_result(ActionResult::Failed);

        let json = serde_json::to_string(&record).unwrap();
        let back: FlowRecord = serde_json::from_str(&json).unwrap();
        assert_eq!(back.action, FlowAction::Reject);
        assert_eq!(back.result, ActionResult::Failed);
    }
}
