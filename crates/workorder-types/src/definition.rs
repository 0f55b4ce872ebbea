//! Process definitions: the static graph a workorder routes through
//!
//! A ProcessDefinition is a directed graph where steps are approval/task
//! nodes and connections are optionally guarded edges. Definitions are
//! immutable once published; to modify one, publish a new version.

use crate::{Connection, FlowAction, ProcessCondition, ProcessVariable};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

// ── Identifiers ──────────────────────────────────────────────────────

/// Unique identifier for a process definition
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ProcessId(pub String);

impl ProcessId {
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }
}

impl std::fmt::Display for ProcessId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Unique identifier for a step within a process definition
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct StepId(pub String);

impl StepId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }
}

impl std::fmt::Display for StepId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier of a platform user (owned by the identity collaborator)
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct UserId(pub String);

impl UserId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }
}

impl std::fmt::Display for UserId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier of a role (expanded via the role directory collaborator)
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RoleId(pub String);

impl RoleId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }
}

impl std::fmt::Display for RoleId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ── Assignment target ────────────────────────────────────────────────

/// Target of a transfer or escalation: a specific user or a role whose
/// members become the new candidate set
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AssignTarget {
    User(UserId),
    Role(RoleId),
}

// ── Step type ────────────────────────────────────────────────────────

/// The type of a process step
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepType {
    /// The single entry point of the process
    Start,
    /// A human approval gate
    Approval,
    /// A human work item
    Task,
    /// An automatic branch point; outgoing connections carry guards
    Decision,
    /// A terminal step; the instance completes once every active branch
    /// has reached one
    End,
}

// ── Process step ─────────────────────────────────────────────────────

/// A node in the process graph
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ProcessStep {
    /// Unique identifier within this definition
    pub id: StepId,
    /// Human-readable name
    pub name: String,
    /// Step type
    pub step_type: StepType,
    /// Explicit candidate users. Takes precedence over roles.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub users: Vec<UserId>,
    /// Candidate roles, expanded through the role directory when no
    /// explicit users are set
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub roles: Vec<RoleId>,
    /// Actions an operator may apply at this step
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub allowed_actions: Vec<FlowAction>,
    /// Guard conditions that must hold for the step itself (AND)
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub guard: Vec<ProcessCondition>,
    /// Minutes before the escalation timer fires. None disables the timer.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub time_limit_minutes: Option<u32>,
    /// Pick a single assignee automatically from the candidate set
    pub auto_assign: bool,
    /// All outgoing unconditional connections fire simultaneously
    pub parallel: bool,
    /// How parallel branches feeding this step synchronize
    #[serde(default)]
    pub join_policy: crate::JoinPolicy,
    /// Who the escalation timer transfers the step to on expiry. None
    /// downgrades the escalation to a reminder notification.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub escalation_target: Option<AssignTarget>,
    /// Fallback step for reject/return actions
    #[serde(skip_serializing_if = "Option::is_none")]
    pub return_to: Option<StepId>,
    /// Layout position on the designer canvas
    pub position: (i32, i32),
}

impl ProcessStep {
    /// Create a new step
    pub fn new(id: impl Into<String>, name: impl Into<String>, step_type: StepType) -> Self {
        Self {
            id: StepId::new(id),
            name: name.into(),
            step_type,
            users: Vec::new(),
            roles: Vec::new(),
            allowed_actions: Vec::new(),
            guard: Vec::new(),
            time_limit_minutes: None,
            auto_assign: false,
            parallel: false,
            join_policy: crate::JoinPolicy::default(),
            escalation_target: None,
            return_to: None,
            position: (0, 0),
        }
    }

    /// Create a start step
    pub fn start(id: impl Into<String>) -> Self {
        Self::new(id, "Start", StepType::Start)
    }

    /// Create an end step
    pub fn end(id: impl Into<String>) -> Self {
        Self::new(id, "End", StepType::End)
    }

    /// Create an approval step
    pub fn approval(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self::new(id, name, StepType::Approval)
            .with_allowed_actions(vec![FlowAction::Approve, FlowAction::Reject])
    }

    /// Create a task step
    pub fn task(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self::new(id, name, StepType::Task).with_allowed_actions(vec![FlowAction::Complete])
    }

    /// Create a decision step
    pub fn decision(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self::new(id, name, StepType::Decision)
    }

    pub fn with_user(mut self, user: UserId) -> Self {
        self.users.push(user);
        self
    }

    pub fn with_role(mut self, role: RoleId) -> Self {
        self.roles.push(role);
        self
    }

    pub fn with_allowed_actions(mut self, actions: Vec<FlowAction>) -> Self {
        self.allowed_actions = actions;
        self
    }

    pub fn with_allowed_action(mut self, action: FlowAction) -> Self {
        self.allowed_actions.push(action);
        self
    }

    pub fn with_guard(mut self, condition: ProcessCondition) -> Self {
        self.guard.push(condition);
        self
    }

    pub fn with_time_limit(mut self, minutes: u32) -> Self {
        self.time_limit_minutes = Some(minutes);
        self
    }

    pub fn with_auto_assign(mut self) -> Self {
        self.auto_assign = true;
        self
    }

    pub fn with_parallel(mut self) -> Self {
        self.parallel = true;
        self
    }

    pub fn with_join_policy(mut self, policy: crate::JoinPolicy) -> Self {
        self.join_policy = policy;
        self
    }

    pub fn with_escalation_target(mut self, target: AssignTarget) -> Self {
        self.escalation_target = Some(target);
        self
    }

    pub fn with_return_to(mut self, target: StepId) -> Self {
        self.return_to = Some(target);
        self
    }

    pub fn with_position(mut self, x: i32, y: i32) -> Self {
        self.position = (x, y);
        self
    }

    /// Whether an action is in the step's allowed set. Terminating and
    /// administrative actions (cancel, revoke, transfer, assign,
    /// submit) are permitted at every step; `allowed_actions` governs
    /// the step-semantic ones.
    pub fn allows(&self, action: FlowAction) -> bool {
        matches!(
            action,
            FlowAction::Cancel
                | FlowAction::Revoke
                | FlowAction::Transfer
                | FlowAction::Assign
                | FlowAction::Submit
        ) || self.allowed_actions.contains(&action)
    }

    /// Steps that resolve without a human assignee
    pub fn is_automatic(&self) -> bool {
        matches!(
            self.step_type,
            StepType::Start | StepType::End | StepType::Decision
        )
    }
}

// ── Process definition ───────────────────────────────────────────────

/// A process definition - the published, versioned graph for one
/// workflow type
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ProcessDefinition {
    /// Unique identifier
    pub id: ProcessId,
    /// Human-readable name
    pub name: String,
    /// Version, bumped on each publish of the same process id
    pub version: u32,
    /// The steps of the graph
    pub steps: Vec<ProcessStep>,
    /// The connections of the graph
    pub connections: Vec<Connection>,
    /// Declared variables with defaults
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub variables: Vec<ProcessVariable>,
    /// When this definition was created
    pub created_at: DateTime<Utc>,
    /// Metadata
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub metadata: HashMap<String, String>,
}

impl ProcessDefinition {
    /// Create a new, empty definition
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: ProcessId::generate(),
            name: name.into(),
            version: 1,
            steps: Vec::new(),
            connections: Vec::new(),
            variables: Vec::new(),
            created_at: Utc::now(),
            metadata: HashMap::new(),
        }
    }

    pub fn with_variable(mut self, variable: ProcessVariable) -> Self {
        self.variables.push(variable);
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Add a step. Rejects duplicate step ids.
    pub fn add_step(&mut self, step: ProcessStep) -> Result<(), crate::FlowError> {
        if self.steps.iter().any(|s| s.id == step.id) {
            return Err(crate::FlowError::Validation(format!(
                "duplicate step id '{}'",
                step.id
            )));
        }
        self.steps.push(step);
        Ok(())
    }

    /// Add a connection. Both endpoints must already exist. The
    /// connection's declaration order is assigned from insertion order.
    pub fn add_connection(&mut self, mut connection: Connection) -> Result<(), crate::FlowError> {
        if !self.steps.iter().any(|s| s.id == connection.from) {
            return Err(crate::FlowError::StepNotFound(connection.from));
        }
        if !self.steps.iter().any(|s| s.id == connection.to) {
            return Err(crate::FlowError::StepNotFound(connection.to));
        }
        connection.order = self.connections.len() as u32;
        self.connections.push(connection);
        Ok(())
    }

    /// Get a step by id
    pub fn step(&self, id: &StepId) -> Option<&ProcessStep> {
        self.steps.iter().find(|s| &s.id == id)
    }

    /// The single start step, if present
    pub fn start_step(&self) -> Option<&ProcessStep> {
        self.steps.iter().find(|s| s.step_type == StepType::Start)
    }

    /// All end steps
    pub fn end_steps(&self) -> Vec<&ProcessStep> {
        self.steps
            .iter()
            .filter(|s| s.step_type == StepType::End)
            .collect()
    }

    /// Outgoing connections of a step, in declaration order
    pub fn outgoing(&self, id: &StepId) -> Vec<&Connection> {
        let mut edges: Vec<&Connection> =
            self.connections.iter().filter(|c| &c.from == id).collect();
        edges.sort_by_key(|c| c.order);
        edges
    }

    /// Incoming connections of a step
    pub fn incoming(&self, id: &StepId) -> Vec<&Connection> {
        self.connections.iter().filter(|c| &c.to == id).collect()
    }

    /// Default bindings seeded from declared variables
    pub fn default_bindings(&self) -> HashMap<String, crate::FieldValue> {
        self.variables
            .iter()
            .map(|v| (v.name.clone(), v.default.clone()))
            .collect()
    }

    pub fn step_count(&self) -> usize {
        self.steps.len()
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_simple_definition() -> ProcessDefinition {
        let mut def = ProcessDefinition::new("Change Request");
        def.add_step(ProcessStep::start("start")).unwrap();
        def.add_step(
            ProcessStep::approval("review", "Manager Review")
                .with_role(RoleId::new("manager"))
                .with_time_limit(60),
        )
        .unwrap();
        def.add_step(ProcessStep::end("end")).unwrap();

        def.add_connection(Connection::new(StepId::new("start"), StepId::new("review")))
            .unwrap();
        def.add_connection(Connection::new(StepId::new("review"), StepId::new("end")))
            .unwrap();
        def
    }

    #[test]
    fn test_create_definition() {
        let def = make_simple_definition();
        assert_eq!(def.step_count(), 3);
        assert_eq!(def.connection_count(), 2);
        assert!(def.start_step().is_some());
        assert_eq!(def.end_steps().len(), 1);
        assert_eq!(def.version, 1);
    }

    #[test]
    fn test_duplicate_step_rejected() {
        let mut def = ProcessDefinition::new("Dup");
        def.add_step(ProcessStep::start("start")).unwrap();
        let result = def.add_step(ProcessStep::task("start", "Shadow"));
        assert!(result.is_err());
    }

    #[test]
    fn test_connection_to_missing_step_rejected() {
        let mut def = ProcessDefinition::new("Bad Edge");
        def.add_step(ProcessStep::start("start")).unwrap();
        let result = def.add_connection(Connection::new(StepId::new("start"), StepId::new("gone")));
        assert!(matches!(result, Err(crate::FlowError::StepNotFound(_))));
    }

    #[test]
    fn test_connection_declaration_order() {
        let mut def = ProcessDefinition::new("Ordered");
        def.add_step(ProcessStep::start("start")).unwrap();
        def.add_step(ProcessStep::decision("d", "Route")).unwrap();
        def.add_step(ProcessStep::end("a")).unwrap();
        def.add_step(ProcessStep::end("b")).unwrap();

        def.add_connection(Connection::new(StepId::new("start"), StepId::new("d")))
            .unwrap();
        def.add_connection(Connection::guarded(
            StepId::new("d"),
            StepId::new("a"),
            ProcessCondition::gt("x", 10.0),
        ))
        .unwrap();
        def.add_connection(Connection::new(StepId::new("d"), StepId::new("b")))
            .unwrap();

        let out = def.outgoing(&StepId::new("d"));
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].to, StepId::new("a"));
        assert_eq!(out[1].to, StepId::new("b"));
    }

    #[test]
    fn test_step_allows_actions() {
        let step = ProcessStep::approval("review", "Review");
        assert!(step.allows(FlowAction::Approve));
        assert!(step.allows(FlowAction::Reject));
        assert!(!step.allows(FlowAction::Complete));
        // Terminating and administrative actions are always permitted.
        assert!(step.allows(FlowAction::Cancel));
        assert!(step.allows(FlowAction::Revoke));
        assert!(step.allows(FlowAction::Transfer));
        assert!(step.allows(FlowAction::Submit));
    }

    #[test]
    fn test_automatic_steps() {
        assert!(ProcessStep::start("s").is_automatic());
        assert!(ProcessStep::decision("d", "D").is_automatic());
        assert!(!ProcessStep::task("t", "T").is_automatic());
        assert!(!ProcessStep::approval("a", "A").is_automatic());
    }

    #[test]
    fn test_default_bindings() {
        let def = ProcessDefinition::new("Vars")
            .with_variable(ProcessVariable::new("amount", 0i64))
            .with_variable(ProcessVariable::new("env", "dev"));

        let bindings = def.default_bindings();
        assert_eq!(bindings.get("amount"), Some(&crate::FieldValue::Num(0.0)));
        assert_eq!(
            bindings.get("env"),
            Some(&crate::FieldValue::Str("dev".into()))
        );
    }

    #[test]
    fn test_outgoing_incoming() {
        let def = make_simple_definition();
        let out = def.outgoing(&StepId::new("start"));
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].to, StepId::new("review"));

        let inc = def.incoming(&StepId::new("end"));
        assert_eq!(inc.len(), 1);
        assert_eq!(inc[0].from, StepId::new("review"));
    }
}
