//! The instance state machine: validated application of one action
//!
//! `StateMachine::apply` is the synchronous core of every mutation. It
//! validates the request against the graph and the instance's current
//! step states, applies exactly one action's worth of change, and
//! returns the flow record describing it. The engine wraps this in
//! per-instance locking and commits the mutated instance only on
//! success, so a rejected action never leaves partial state behind.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use workorder_types::{
    AssignTarget, FieldValue, FlowAction, FlowError, FlowRecord, FlowResult, InstanceId, StepId,
    StepPhase, UserId, WorkorderInstance,
};

use crate::graph::ValidGraph;
use crate::step_resolver::{self, Advance};

/// One operator action against one step of one instance. This is the
/// action API surface: callers build it from user input and the engine
/// applies it.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ActionRequest {
    pub instance_id: InstanceId,
    pub step_id: StepId,
    pub action: FlowAction,
    pub operator: UserId,
    #[serde(default)]
    pub operator_name: String,
    #[serde(default)]
    pub comment: String,
    /// Form data merged into the instance bindings on success
    #[serde(default)]
    pub form: HashMap<String, FieldValue>,
    /// Transfer/assign target
    #[serde(default)]
    pub target: Option<AssignTarget>,
    /// Platform administrators bypass candidate checks
    #[serde(default)]
    pub admin_override: bool,
}

impl ActionRequest {
    pub fn new(
        instance_id: InstanceId,
        step_id: StepId,
        action: FlowAction,
        operator: UserId,
    ) -> Self {
        Self {
            instance_id,
            step_id,
            action,
            operator,
            operator_name: String::new(),
            comment: String::new(),
            form: HashMap::new(),
            target: None,
            admin_override: false,
        }
    }

    pub fn with_operator_name(mut self, name: impl Into<String>) -> Self {
        self.operator_name = name.into();
        self
    }

    pub fn with_comment(mut self, comment: impl Into<String>) -> Self {
        self.comment = comment.into();
        self
    }

    pub fn with_form(mut self, form: HashMap<String, FieldValue>) -> Self {
        self.form = form;
        self
    }

    pub fn with_field(mut self, key: impl Into<String>, value: impl Into<FieldValue>) -> Self {
        self.form.insert(key.into(), value.into());
        self
    }

    pub fn with_target(mut self, target: AssignTarget) -> Self {
        self.target = Some(target);
        self
    }

    pub fn with_admin_override(mut self) -> Self {
        self.admin_override = true;
        self
    }
}

/// The committed effect of a successful application
#[derive(Clone, Debug)]
pub struct Applied {
    /// The single flow record for this application
    pub record: FlowRecord,
    /// Human steps newly activated
    pub activated: Vec<StepId>,
    /// Decision step that dead-ended during advancement, if any
    pub stuck: Option<StepId>,
    /// Steps no longer active; their escalation timers must be disarmed
    pub deactivated: Vec<StepId>,
    /// Instance reached Completed
    pub completed: bool,
    /// Instance reached Cancelled
    pub terminated: bool,
}

pub struct StateMachine;

impl StateMachine {
    /// Apply one action. `target_users` is the pre-resolved user set
    /// for transfer (candidate list) and assign (single user); empty
    /// for every other action.
    pub fn apply(
        graph: &ValidGraph,
        instance: &mut WorkorderInstance,
        request: &ActionRequest,
        target_users: Vec<UserId>,
    ) -> FlowResult<Applied> {
        if !instance.is_running() {
            if instance.is_terminal() {
                return Err(FlowError::AlreadyTerminal(instance.id.clone()));
            }
            return Err(FlowError::InstanceNotRunning(instance.id.clone()));
        }

        let step = graph.step(&request.step_id)?;
        let step_name = step.name.clone();
        if !step.allows(request.action) {
            return Err(FlowError::ActionNotAllowed {
                step: step.id.clone(),
                action: request.action.to_string(),
            });
        }

        if request.action.terminates() {
            return Self::apply_terminate(graph, instance, request);
        }

        let state = instance
            .step_state(&request.step_id)
            .ok_or_else(|| FlowError::StepNotActive(request.step_id.clone()))?;
        match state.phase {
            StepPhase::Active => {}
            // The remedy for an unassignable step is reassigning it.
            StepPhase::Unassignable if request.action == FlowAction::Transfer => {}
            StepPhase::Completed | StepPhase::Moot => {
                return Err(FlowError::ConcurrentModification(instance.id.clone()));
            }
            // A dead-ended decision needs new bindings or a definition
            // fix, not an operator action here.
            StepPhase::Stuck => {
                return Err(FlowError::ConditionAmbiguous(request.step_id.clone()));
            }
            _ => return Err(FlowError::StepNotActive(request.step_id.clone())),
        }

        let authorized = request.admin_override
            || match &state.assignee {
                // Once an assignee is picked, only they act on the step.
                Some(assignee) => assignee == &request.operator,
                None => state.candidates.contains(&request.operator),
            }
            || (request.action == FlowAction::Transfer && request.operator == instance.initiator);
        if !authorized {
            return Err(FlowError::UnauthorizedAction {
                step: request.step_id.clone(),
                operator: request.operator.clone(),
            });
        }

        let previous_assignee = state.assignee.clone();
        match request.action {
            FlowAction::Submit => {
                instance.merge_bindings(&request.form);
                Ok(Self::applied(
                    instance,
                    request,
                    step_name,
                    Advance::default(),
                    vec![],
                    None,
                ))
            }
            FlowAction::Approve | FlowAction::Complete => {
                instance.merge_bindings(&request.form);
                let adv = step_resolver::advance(graph, instance, &request.step_id)?;
                Ok(Self::applied(
                    instance,
                    request,
                    step_name,
                    adv,
                    vec![request.step_id.clone()],
                    previous_assignee,
                ))
            }
            FlowAction::Reject | FlowAction::Return => {
                let target =
                    step_resolver::fallback_target(graph, instance, &request.step_id, request.action)
                        .ok_or_else(|| {
                            FlowError::Validation(format!(
                                "step '{}' has no fallback route for {}",
                                request.step_id, request.action
                            ))
                        })?;
                instance.merge_bindings(&request.form);
                instance.complete_step(&request.step_id);
                let adv = step_resolver::activate(graph, instance, &target)?;
                tracing::info!(
                    instance_id = %instance.id,
                    from = %request.step_id,
                    to = %target,
                    action = %request.action,
                    "step routed to fallback"
                );
                Ok(Self::applied(
                    instance,
                    request,
                    step_name,
                    adv,
                    vec![request.step_id.clone()],
                    previous_assignee,
                ))
            }
            FlowAction::Transfer => {
                if target_users.is_empty() {
                    return Err(FlowError::Unassignable(request.step_id.clone()));
                }
                if let Some(user) = &previous_assignee {
                    tracing::debug!(step_id = %request.step_id, from = %user, "transferring step away");
                }
                if let Some(state) = instance.step_states.get_mut(&request.step_id) {
                    state.candidates = target_users;
                    state.assignee = None;
                    if state.phase == StepPhase::Unassignable {
                        state.phase = StepPhase::Active;
                    }
                }
                Ok(Self::applied(
                    instance,
                    request,
                    step_name,
                    Advance::default(),
                    vec![],
                    previous_assignee,
                ))
            }
            FlowAction::Assign => {
                let user = target_users.first().cloned().ok_or_else(|| {
                    FlowError::Validation("assign requires a user target".into())
                })?;
                if !request.admin_override && !state.candidates.contains(&user) {
                    return Err(FlowError::Validation(format!(
                        "'{}' is not a candidate of step '{}'",
                        user, request.step_id
                    )));
                }
                instance.set_assignee(&request.step_id, user.clone());
                Ok(Self::applied(
                    instance,
                    request,
                    step_name,
                    Advance::default(),
                    vec![],
                    Some(user),
                ))
            }
            // Terminating actions were handled above; escalation
            // pseudo-actions never arrive as operator requests.
            other => Err(FlowError::ActionNotAllowed {
                step: request.step_id.clone(),
                action: other.to_string(),
            }),
        }
    }

    fn apply_terminate(
        graph: &ValidGraph,
        instance: &mut WorkorderInstance,
        request: &ActionRequest,
    ) -> FlowResult<Applied> {
        let authorized = request.admin_override
            || request.operator == instance.initiator
            || instance
                .step_state(&request.step_id)
                .map(|s| {
                    s.candidates.contains(&request.operator)
                        || s.assignee.as_ref() == Some(&request.operator)
                })
                .unwrap_or(false);
        if !authorized {
            return Err(FlowError::UnauthorizedAction {
                step: request.step_id.clone(),
                operator: request.operator.clone(),
            });
        }

        let deactivated = instance.active_steps();
        instance.cancel();
        tracing::info!(
            instance_id = %instance.id,
            operator = %request.operator,
            action = %request.action,
            "workorder instance terminated"
        );

        let step_name = graph
            .step(&request.step_id)
            .map(|s| s.name.clone())
            .unwrap_or_else(|_| request.step_id.to_string());
        let record = FlowRecord::new(
            instance.id.clone(),
            request.step_id.clone(),
            step_name,
            request.action,
            request.operator.clone(),
        )
        .with_operator_name(request.operator_name.clone())
        .with_comment(request.comment.clone());

        Ok(Applied {
            record,
            activated: vec![],
            stuck: None,
            deactivated,
            completed: false,
            terminated: true,
        })
    }

    fn applied(
        instance: &WorkorderInstance,
        request: &ActionRequest,
        step_name: String,
        adv: Advance,
        deactivated: Vec<StepId>,
        assignee: Option<UserId>,
    ) -> Applied {
        let mut record = FlowRecord::new(
            instance.id.clone(),
            request.step_id.clone(),
            step_name,
            request.action,
            request.operator.clone(),
        )
        .with_operator_name(request.operator_name.clone())
        .with_comment(request.comment.clone())
        .with_form_snapshot(request.form.clone());
        if let Some(user) = assignee {
            record = record.with_assignee(user);
        }
        let mut deactivated = deactivated;
        deactivated.extend(adv.deactivated.iter().cloned());
        Applied {
            record,
            activated: adv.activated,
            stuck: adv.stuck,
            deactivated,
            completed: adv.completed,
            terminated: false,
        }
    }
}
