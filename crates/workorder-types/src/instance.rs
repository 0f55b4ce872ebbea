//! Workorder instances: one in-flight execution of a process definition
//!
//! An instance tracks which steps are active, who they are assigned to,
//! and the variable bindings conditions evaluate against. The engine is
//! the only component that mutates instances at runtime; everything
//! here is plain state plus the mutators the engine drives.

use crate::{FieldValue, ProcessId, StepId, UserId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

// ── Instance identifier ──────────────────────────────────────────────

/// Unique identifier for a workorder instance
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct InstanceId(pub String);

impl InstanceId {
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn short(&self) -> &str {
        &self.0[..8.min(self.0.len())]
    }
}

impl std::fmt::Display for InstanceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ── Instance status ──────────────────────────────────────────────────

/// Lifecycle status of a workorder instance
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum InstanceStatus {
    /// Created but not yet launched
    #[default]
    Draft,
    /// Actively routing through the graph
    Running,
    /// Every active branch reached an end step
    Completed,
    /// Terminated by cancel/revoke
    Cancelled,
}

impl InstanceStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Cancelled)
    }
}

// ── Step runtime state ───────────────────────────────────────────────

/// Phase of one step within a running instance
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum StepPhase {
    /// Not yet reached
    #[default]
    Pending,
    /// Waiting for an operator action
    Active,
    /// A terminal action was recorded
    Completed,
    /// Losing branch of an any-join; later completion is a no-op
    Moot,
    /// Decision step with no matching connection and no default edge.
    /// Operator-visible pause, never a silent drop.
    Stuck,
    /// Assignment resolution produced no candidates. Operator-visible
    /// pause, never a silent stall.
    Unassignable,
}

/// Runtime state of one step
#[derive(Clone, Debug, Serialize, Deserialize, Default)]
pub struct StepState {
    /// Current phase
    pub phase: StepPhase,
    /// When the step was last activated
    #[serde(skip_serializing_if = "Option::is_none")]
    pub activated_at: Option<DateTime<Utc>>,
    /// When the step was completed
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    /// The active assignee, if one has been picked
    #[serde(skip_serializing_if = "Option::is_none")]
    pub assignee: Option<UserId>,
    /// Resolved candidate users for the current activation
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub candidates: Vec<UserId>,
    /// Monotonic activation counter. Return actions re-activate a step;
    /// escalation timers are keyed by this so stale timers are ignored.
    pub activation: u64,
    /// Whether the escalation timer fired during the current activation
    pub escalation_fired: bool,
}

impl StepState {
    pub fn is_active(&self) -> bool {
        self.phase == StepPhase::Active
    }
}

// ── Workorder instance ───────────────────────────────────────────────

/// One in-flight execution of a process definition
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct WorkorderInstance {
    /// Unique instance identifier
    pub id: InstanceId,
    /// The definition this instance routes through
    pub process_id: ProcessId,
    /// Definition version pinned at creation
    pub version: u32,
    /// Lifecycle status
    pub status: InstanceStatus,
    /// Runtime state per step
    pub step_states: HashMap<StepId, StepState>,
    /// Variable bindings conditions evaluate against
    pub bindings: HashMap<String, FieldValue>,
    /// Human-readable title
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub title: String,
    /// Who created the instance
    pub initiator: UserId,
    /// When the instance was created
    pub created_at: DateTime<Utc>,
    /// When the instance was last mutated
    pub updated_at: DateTime<Utc>,
    /// When the instance reached a terminal status
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

impl WorkorderInstance {
    /// Create a new draft instance
    pub fn new(process_id: ProcessId, version: u32, initiator: UserId) -> Self {
        let now = Utc::now();
        Self {
            id: InstanceId::generate(),
            process_id,
            version,
            status: InstanceStatus::Draft,
            step_states: HashMap::new(),
            bindings: HashMap::new(),
            title: String::new(),
            initiator,
            created_at: now,
            updated_at: now,
            completed_at: None,
        }
    }

    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.title = title.into();
        self
    }

    pub fn with_binding(mut self, key: impl Into<String>, value: impl Into<FieldValue>) -> Self {
        self.bindings.insert(key.into(), value.into());
        self
    }

    /// Launch the instance (Draft -> Running)
    pub fn start(&mut self) {
        self.status = InstanceStatus::Running;
        self.touch();
    }

    /// Activate a step, bumping its activation counter
    pub fn activate_step(&mut self, step_id: StepId) {
        let state = self.step_states.entry(step_id).or_default();
        state.phase = StepPhase::Active;
        state.activated_at = Some(Utc::now());
        state.completed_at = None;
        state.assignee = None;
        state.candidates.clear();
        state.activation += 1;
        state.escalation_fired = false;
        self.touch();
    }

    /// Mark a step completed
    pub fn complete_step(&mut self, step_id: &StepId) {
        if let Some(state) = self.step_states.get_mut(step_id) {
            state.phase = StepPhase::Completed;
            state.completed_at = Some(Utc::now());
        }
        self.touch();
    }

    /// Mark a step as the losing branch of an any-join
    pub fn mark_moot(&mut self, step_id: &StepId) {
        if let Some(state) = self.step_states.get_mut(step_id) {
            state.phase = StepPhase::Moot;
            state.completed_at = Some(Utc::now());
        }
        self.touch();
    }

    /// Mark a decision step stuck (no matching connection, no default)
    pub fn mark_stuck(&mut self, step_id: &StepId) {
        if let Some(state) = self.step_states.get_mut(step_id) {
            state.phase = StepPhase::Stuck;
        }
        self.touch();
    }

    /// Mark a step unassignable (empty candidate resolution)
    pub fn mark_unassignable(&mut self, step_id: &StepId) {
        if let Some(state) = self.step_states.get_mut(step_id) {
            state.phase = StepPhase::Unassignable;
        }
        self.touch();
    }

    /// Record resolved candidates for a step
    pub fn set_candidates(&mut self, step_id: &StepId, candidates: Vec<UserId>) {
        if let Some(state) = self.step_states.get_mut(step_id) {
            state.candidates = candidates;
        }
        self.touch();
    }

    /// Set the active assignee of a step
    pub fn set_assignee(&mut self, step_id: &StepId, assignee: UserId) {
        if let Some(state) = self.step_states.get_mut(step_id) {
            state.assignee = Some(assignee);
        }
        self.touch();
    }

    /// Merge submitted form data into the bindings
    pub fn merge_bindings(&mut self, form: &HashMap<String, FieldValue>) {
        for (key, value) in form {
            self.bindings.insert(key.clone(), value.clone());
        }
        self.touch();
    }

    /// Complete the instance
    pub fn complete(&mut self) {
        self.status = InstanceStatus::Completed;
        self.completed_at = Some(Utc::now());
        self.touch();
    }

    /// Cancel the instance. Every non-terminal step is dropped from the
    /// active set in the same update.
    pub fn cancel(&mut self) {
        self.status = InstanceStatus::Cancelled;
        self.completed_at = Some(Utc::now());
        let now = Utc::now();
        for state in self.step_states.values_mut() {
            if state.phase == StepPhase::Active {
                state.phase = StepPhase::Moot;
                state.completed_at = Some(now);
            }
        }
        self.touch();
    }

    // ── Queries ──────────────────────────────────────────────────────

    pub fn is_running(&self) -> bool {
        self.status == InstanceStatus::Running
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Currently active step ids, sorted for determinism
    pub fn active_steps(&self) -> Vec<StepId> {
        let mut active: Vec<StepId> = self
            .step_states
            .iter()
            .filter(|(_, s)| s.phase == StepPhase::Active)
            .map(|(id, _)| id.clone())
            .collect();
        active.sort();
        active
    }

    pub fn step_state(&self, step_id: &StepId) -> Option<&StepState> {
        self.step_states.get(step_id)
    }

    /// Whether a step's phase counts as finished for join evaluation
    pub fn step_finished(&self, step_id: &StepId) -> bool {
        self.step_states
            .get(step_id)
            .map(|s| matches!(s.phase, StepPhase::Completed | StepPhase::Moot))
            .unwrap_or(false)
    }

    fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_instance() -> WorkorderInstance {
        WorkorderInstance::new(ProcessId::new("proc-1"), 1, UserId::new("alice"))
    }

    #[test]
    fn test_create_instance() {
        let inst = make_instance();
        assert_eq!(inst.status, InstanceStatus::Draft);
        assert!(!inst.is_running());
        assert!(!inst.is_terminal());
        assert!(inst.active_steps().is_empty());
    }

    #[test]
    fn test_lifecycle() {
        let mut inst = make_instance();
        inst.start();
        assert!(inst.is_running());

        inst.activate_step(StepId::new("review"));
        assert_eq!(inst.active_steps(), vec![StepId::new("review")]);

        inst.complete_step(&StepId::new("review"));
        assert!(inst.active_steps().is_empty());
        assert!(inst.step_finished(&StepId::new("review")));

        inst.complete();
        assert!(inst.is_terminal());
        assert!(inst.completed_at.is_some());
    }

    #[test]
    fn test_activation_counter() {
        let mut inst = make_instance();
        inst.start();
        inst.activate_step(StepId::new("review"));
        assert_eq!(inst.step_state(&StepId::new("review")).unwrap().activation, 1);

        inst.complete_step(&StepId::new("review"));
        // A return action re-activates: new activation, fresh escalation.
        inst.activate_step(StepId::new("review"));
        let state = inst.step_state(&StepId::new("review")).unwrap();
        assert_eq!(state.activation, 2);
        assert!(state.is_active());
        assert!(!state.escalation_fired);
    }

    #[test]
    fn test_cancel_clears_active_steps() {
        let mut inst = make_instance();
        inst.start();
        inst.activate_step(StepId::new("a"));
        inst.activate_step(StepId::new("b"));
        inst.activate_step(StepId::new("c"));
        assert_eq!(inst.active_steps().len(), 3);

        inst.cancel();
        assert_eq!(inst.status, InstanceStatus::Cancelled);
        assert!(inst.active_steps().is_empty());
    }

    #[test]
    fn test_moot_counts_as_finished() {
        let mut inst = make_instance();
        inst.start();
        inst.activate_step(StepId::new("b"));
        inst.mark_moot(&StepId::new("b"));
        assert!(inst.step_finished(&StepId::new("b")));
        assert!(inst.active_steps().is_empty());
    }

    #[test]
    fn test_stuck_and_unassignable_remain_visible() {
        let mut inst = make_instance();
        inst.start();
        inst.activate_step(StepId::new("d"));
        inst.mark_stuck(&StepId::new("d"));
        assert_eq!(
            inst.step_state(&StepId::new("d")).unwrap().phase,
            StepPhase::Stuck
        );
        // Stuck is not finished; the branch is paused, not dropped.
        assert!(!inst.step_finished(&StepId::new("d")));

        inst.activate_step(StepId::new("t"));
        inst.mark_unassignable(&StepId::new("t"));
        assert_eq!(
            inst.step_state(&StepId::new("t")).unwrap().phase,
            StepPhase::Unassignable
        );
    }

    #[test]
    fn test_merge_bindings() {
        let mut inst = make_instance().with_binding("amount", 100i64);
        let form = HashMap::from([
            ("amount".to_string(), FieldValue::Num(250.0)),
            ("approved".to_string(), FieldValue::Bool(true)),
        ]);
        inst.merge_bindings(&form);
        assert_eq!(inst.bindings.get("amount"), Some(&FieldValue::Num(250.0)));
        assert_eq!(inst.bindings.get("approved"), Some(&FieldValue::Bool(true)));
    }

    #[test]
    fn test_assignment_state() {
        let mut inst = make_instance();
        inst.start();
        inst.activate_step(StepId::new("review"));
        inst.set_candidates(
            &StepId::new("review"),
            vec![UserId::new("bob"), UserId::new("carol")],
        );
        inst.set_assignee(&StepId::new("review"), UserId::new("bob"));

        let state = inst.step_state(&StepId::new("review")).unwrap();
        assert_eq!(state.candidates.len(), 2);
        assert_eq!(state.assignee, Some(UserId::new("bob")));

        // Re-activation clears assignment state.
        inst.activate_step(StepId::new("review"));
        let state = inst.step_state(&StepId::new("review")).unwrap();
        assert!(state.candidates.is_empty());
        assert!(state.assignee.is_none());
    }

    #[test]
    fn test_instance_id() {
        let id = InstanceId::generate();
        assert!(!id.0.is_empty());
        assert!(id.short().len() <= 8);
    }
}
