//! WorkorderEngine: the single mutation path for workorder instances
//!
//! Every state change - operator actions, instance creation, timer
//! fires - funnels through this engine under a per-instance lock, so
//! one instance never sees two concurrent mutations. Losing racers are
//! told apart by origin: a human action against a step that meanwhile
//! completed gets `ConcurrentModification` (retryable, with a failure
//! record); a stale escalation timer is discarded silently, because a
//! timer losing a race is normal operation, not an auditable event.

use std::collections::HashMap;
use std::sync::{Arc, RwLock, Weak};
use tokio::sync::{mpsc, Mutex};
use workorder_types::{
    ActionResult, AssignTarget, FieldValue, FlowAction, FlowError, FlowRecord, FlowResult,
    InstanceId, InstanceStatus, ProcessDefinition, ProcessId, StepId, StepPhase, UserId,
    WorkorderInstance,
};

use crate::assignment::{AssignPolicy, AssignmentResolver, LeastLoaded};
use crate::escalation::{EscalationFired, EscalationTimers};
use crate::graph::ValidGraph;
use crate::history::FlowHistoryRecorder;
use crate::state_machine::{ActionRequest, StateMachine};
use crate::step_resolver;
use crate::store::{
    DefinitionStore, FlowHistoryStore, InstanceStore, NotificationSink, NotifyEvent, RoleDirectory,
};

/// Operator id stamped on records produced by timers
const SYSTEM_OPERATOR: &str = "system";

/// The workorder execution engine
pub struct WorkorderEngine {
    definitions: Arc<dyn DefinitionStore>,
    instances: Arc<dyn InstanceStore>,
    recorder: FlowHistoryRecorder,
    roles: Arc<dyn RoleDirectory>,
    notifier: Arc<dyn NotificationSink>,
    assignment: AssignmentResolver,
    timers: EscalationTimers,
    /// Validated graphs keyed by (process, version); definitions are
    /// immutable once published so entries never invalidate
    graphs: RwLock<HashMap<(ProcessId, u32), Arc<ValidGraph>>>,
    /// Per-instance mutation locks
    locks: Mutex<HashMap<InstanceId, Arc<Mutex<()>>>>,
}

impl WorkorderEngine {
    /// Create an engine with the default least-loaded assignment
    /// policy. Must be called within a tokio runtime; the escalation
    /// drain task is spawned here.
    pub fn new(
        definitions: Arc<dyn DefinitionStore>,
        instances: Arc<dyn InstanceStore>,
        history: Arc<dyn FlowHistoryStore>,
        roles: Arc<dyn RoleDirectory>,
        notifier: Arc<dyn NotificationSink>,
    ) -> Arc<Self> {
        Self::with_policy(
            definitions,
            instances,
            history,
            roles,
            notifier,
            Arc::new(LeastLoaded::new()),
        )
    }

    /// Create an engine with a custom assignment policy
    pub fn with_policy(
        definitions: Arc<dyn DefinitionStore>,
        instances: Arc<dyn InstanceStore>,
        history: Arc<dyn FlowHistoryStore>,
        roles: Arc<dyn RoleDirectory>,
        notifier: Arc<dyn NotificationSink>,
        policy: Arc<dyn AssignPolicy>,
    ) -> Arc<Self> {
        let (timers, fired_rx) = EscalationTimers::new();
        let engine = Arc::new(Self {
            definitions,
            instances,
            recorder: FlowHistoryRecorder::new(history),
            roles: roles.clone(),
            notifier,
            assignment: AssignmentResolver::new(roles, policy),
            timers,
            graphs: RwLock::new(HashMap::new()),
            locks: Mutex::new(HashMap::new()),
        });
        tokio::spawn(Self::drain_escalations(Arc::downgrade(&engine), fired_rx));
        engine
    }

    // ── Definition lifecycle ─────────────────────────────────────────

    /// Validate and publish a definition. Re-publishing a process id
    /// assigns the next version; running instances keep the version
    /// they were created against.
    pub async fn publish_definition(&self, definition: ProcessDefinition) -> FlowResult<u32> {
        ValidGraph::validate(&definition)?;
        let process_id = definition.id.clone();
        let version = self.definitions.publish(definition).await?;
        tracing::info!(process_id = %process_id, version, "process definition published");
        Ok(version)
    }

    // ── Instance lifecycle ───────────────────────────────────────────

    /// Create and launch an instance of the latest published version
    pub async fn create_instance(
        &self,
        process_id: &ProcessId,
        initiator: UserId,
        title: impl Into<String>,
        bindings: HashMap<String, FieldValue>,
    ) -> FlowResult<WorkorderInstance> {
        let graph = self.graph(process_id, None).await?;
        let definition = graph.definition();

        let mut instance = WorkorderInstance::new(
            definition.id.clone(),
            definition.version,
            initiator.clone(),
        )
        .with_title(title);
        instance.bindings = definition.default_bindings();
        instance.merge_bindings(&bindings);
        instance.start();

        let adv = step_resolver::activate(&graph, &mut instance, graph.start_step())?;
        self.run_activation(&graph, &mut instance, &adv.activated, adv.stuck.as_ref())
            .await?;

        let start_name = graph.step(graph.start_step())?.name.clone();
        let record = FlowRecord::new(
            instance.id.clone(),
            graph.start_step().clone(),
            start_name,
            FlowAction::Create,
            initiator,
        )
        .with_form_snapshot(bindings);
        self.recorder.record(record).await?;
        self.instances.save(&instance).await?;

        tracing::info!(
            instance_id = %instance.id,
            process_id = %process_id,
            version = instance.version,
            "workorder instance created"
        );
        Ok(instance)
    }

    /// Apply one operator action under the instance's lock
    pub async fn submit_action(&self, request: ActionRequest) -> FlowResult<InstanceStatus> {
        let lock = self.instance_lock(&request.instance_id).await;
        let _guard = lock.lock().await;

        let stored = self.instances.load(&request.instance_id).await?;
        let graph = self.graph(&stored.process_id, Some(stored.version)).await?;

        let target_users = match self.resolve_target(&request).await {
            Ok(users) => users,
            Err(err) => {
                self.record_failure(&graph, &stored, &request, &err).await;
                return Err(err);
            }
        };

        let mut instance = stored.clone();
        match StateMachine::apply(&graph, &mut instance, &request, target_users) {
            Ok(applied) => {
                self.run_activation(&graph, &mut instance, &applied.activated, applied.stuck.as_ref())
                    .await?;
                // Release assignment load for the steps this action closed.
                for step_id in &applied.deactivated {
                    if let Some(user) =
                        stored.step_state(step_id).and_then(|s| s.assignee.clone())
                    {
                        self.assignment.release(&user);
                    }
                }

                self.recorder.record(applied.record).await?;
                self.instances.save(&instance).await?;

                for step_id in &applied.deactivated {
                    self.timers.cancel(&instance.id, step_id);
                }
                if instance.is_terminal() {
                    self.timers.cancel_all(&instance.id);
                }

                tracing::info!(
                    instance_id = %instance.id,
                    step_id = %request.step_id,
                    action = %request.action,
                    operator = %request.operator,
                    status = ?instance.status,
                    "action applied"
                );
                Ok(instance.status)
            }
            Err(err) => {
                self.record_failure(&graph, &stored, &request, &err).await;
                Err(err)
            }
        }
    }

    /// Terminate an instance, any active step standing in for the
    /// action's position
    pub async fn cancel_instance(
        &self,
        instance_id: &InstanceId,
        operator: UserId,
        comment: impl Into<String>,
    ) -> FlowResult<InstanceStatus> {
        let stored = self.instances.load(instance_id).await?;
        let graph = self.graph(&stored.process_id, Some(stored.version)).await?;
        let step_id = stored
            .active_steps()
            .into_iter()
            .next()
            .unwrap_or_else(|| graph.start_step().clone());
        let request = ActionRequest::new(instance_id.clone(), step_id, FlowAction::Cancel, operator)
            .with_comment(comment);
        self.submit_action(request).await
    }

    // ── Queries ──────────────────────────────────────────────────────

    pub async fn instance(&self, id: &InstanceId) -> FlowResult<WorkorderInstance> {
        self.instances.load(id).await
    }

    pub async fn history(&self, id: &InstanceId) -> FlowResult<Vec<FlowRecord>> {
        self.recorder.list(id).await
    }

    /// Number of currently armed escalation timers
    pub fn armed_timers(&self) -> usize {
        self.timers.armed()
    }

    /// Rebuild an instance's runtime state from its flow history.
    /// Candidate sets and timers are re-resolved by the caller after
    /// recovery; replay restores routing state only.
    pub async fn replay_instance(&self, id: &InstanceId) -> FlowResult<WorkorderInstance> {
        let stored = self.instances.load(id).await?;
        let graph = self.graph(&stored.process_id, Some(stored.version)).await?;
        self.recorder.replay(&graph, id).await
    }

    // ── Escalation path ──────────────────────────────────────────────

    async fn drain_escalations(
        engine: Weak<Self>,
        mut fired_rx: mpsc::UnboundedReceiver<EscalationFired>,
    ) {
        while let Some(fired) = fired_rx.recv().await {
            let Some(engine) = engine.upgrade() else { break };
            if let Err(err) = engine.handle_escalation(fired).await {
                tracing::warn!(error = %err, "escalation handling failed");
            }
        }
    }

    async fn handle_escalation(&self, fired: EscalationFired) -> FlowResult<()> {
        let lock = self.instance_lock(&fired.instance_id).await;
        let _guard = lock.lock().await;

        // A timer can lose to any action that beat it to the lock. Its
        // defeat is silent: no record, no error.
        let Ok(stored) = self.instances.load(&fired.instance_id).await else {
            return Ok(());
        };
        if !stored.is_running() {
            return Ok(());
        }
        let Some(state) = stored.step_state(&fired.step_id) else {
            return Ok(());
        };
        if state.phase != StepPhase::Active
            || state.activation != fired.activation
            || state.escalation_fired
        {
            tracing::debug!(
                instance_id = %fired.instance_id,
                step_id = %fired.step_id,
                "stale escalation timer discarded"
            );
            return Ok(());
        }

        let graph = self.graph(&stored.process_id, Some(stored.version)).await?;
        let step = graph.step(&fired.step_id)?;
        let mut instance = stored.clone();
        if let Some(s) = instance.step_states.get_mut(&fired.step_id) {
            s.escalation_fired = true;
        }

        let target_candidates = match &step.escalation_target {
            Some(AssignTarget::User(user)) => Some(vec![user.clone()]),
            Some(AssignTarget::Role(role)) => {
                let members = self.roles.members_of(role).await?;
                if members.is_empty() {
                    tracing::warn!(
                        instance_id = %instance.id,
                        step_id = %fired.step_id,
                        role = %role,
                        "escalation target resolved to nobody; sending reminder instead"
                    );
                    None
                } else {
                    Some(members)
                }
            }
            None => None,
        };

        match target_candidates {
            Some(candidates) => {
                let previous = instance
                    .step_state(&fired.step_id)
                    .and_then(|s| s.assignee.clone());
                if let Some(s) = instance.step_states.get_mut(&fired.step_id) {
                    s.candidates = candidates.clone();
                    s.assignee = None;
                }
                if let Some(user) = &previous {
                    self.assignment.release(user);
                }

                let mut record = FlowRecord::new(
                    instance.id.clone(),
                    fired.step_id.clone(),
                    step.name.clone(),
                    FlowAction::Escalate,
                    UserId::new(SYSTEM_OPERATOR),
                )
                .with_operator_name("Escalation Timer")
                .with_comment(format!(
                    "time limit of {} minutes exceeded",
                    step.time_limit_minutes.unwrap_or(0)
                ));
                if let Some(user) = previous {
                    record = record.with_assignee(user);
                }
                self.recorder.record(record).await?;
                self.instances.save(&instance).await?;

                for user in &candidates {
                    self.notifier
                        .notify(
                            user,
                            NotifyEvent::StepEscalated {
                                instance_id: instance.id.clone(),
                                step_id: fired.step_id.clone(),
                            },
                        )
                        .await;
                }
                tracing::info!(
                    instance_id = %instance.id,
                    step_id = %fired.step_id,
                    "step escalated to new candidates"
                );
            }
            None => {
                let record = FlowRecord::new(
                    instance.id.clone(),
                    fired.step_id.clone(),
                    step.name.clone(),
                    FlowAction::Reminder,
                    UserId::new(SYSTEM_OPERATOR),
                )
                .with_operator_name("Escalation Timer");
                self.recorder.record(record).await?;
                // Persists the fired flag; active steps are untouched.
                self.instances.save(&instance).await?;

                let recipients = instance
                    .step_state(&fired.step_id)
                    .map(|s| match &s.assignee {
                        Some(assignee) => vec![assignee.clone()],
                        None => s.candidates.clone(),
                    })
                    .unwrap_or_default();
                for user in &recipients {
                    self.notifier
                        .notify(
                            user,
                            NotifyEvent::EscalationReminder {
                                instance_id: instance.id.clone(),
                                step_id: fired.step_id.clone(),
                            },
                        )
                        .await;
                }
            }
        }
        Ok(())
    }

    // ── Internals ────────────────────────────────────────────────────

    /// Resolve candidates, arm timers, and notify for newly activated
    /// steps; surface stuck decisions to the initiator.
    async fn run_activation(
        &self,
        graph: &ValidGraph,
        instance: &mut WorkorderInstance,
        activated: &[StepId],
        stuck: Option<&StepId>,
    ) -> FlowResult<()> {
        for step_id in activated {
            let step = graph.step(step_id)?;
            match self.assignment.resolve(step).await {
                Ok(resolution) => {
                    instance.set_candidates(step_id, resolution.candidates.clone());
                    if let Some(assignee) = &resolution.assignee {
                        instance.set_assignee(step_id, assignee.clone());
                    }
                    if let Some(minutes) = step.time_limit_minutes {
                        let activation = instance
                            .step_state(step_id)
                            .map(|s| s.activation)
                            .unwrap_or(0);
                        self.timers.schedule(
                            instance.id.clone(),
                            step_id.clone(),
                            activation,
                            minutes,
                        );
                    }
                    let recipients = match resolution.assignee {
                        Some(assignee) => vec![assignee],
                        None => resolution.candidates,
                    };
                    for user in &recipients {
                        self.notifier
                            .notify(
                                user,
                                NotifyEvent::StepAssigned {
                                    instance_id: instance.id.clone(),
                                    step_id: step_id.clone(),
                                    step_name: step.name.clone(),
                                },
                            )
                            .await;
                    }
                }
                Err(FlowError::Unassignable(_)) => {
                    // Configuration problem: pause the step visibly and
                    // tell the initiator instead of failing the action.
                    tracing::warn!(
                        instance_id = %instance.id,
                        step_id = %step_id,
                        "no candidates resolved; step paused as unassignable"
                    );
                    instance.mark_unassignable(step_id);
                    self.notifier
                        .notify(
                            &instance.initiator.clone(),
                            NotifyEvent::StepUnassignable {
                                instance_id: instance.id.clone(),
                                step_id: step_id.clone(),
                            },
                        )
                        .await;
                }
                Err(err) => return Err(err),
            }
        }

        if let Some(step_id) = stuck {
            self.notifier
                .notify(
                    &instance.initiator.clone(),
                    NotifyEvent::StepStuck {
                        instance_id: instance.id.clone(),
                        step_id: step_id.clone(),
                    },
                )
                .await;
        }
        Ok(())
    }

    /// Pre-resolve the user set for transfer/assign targets
    async fn resolve_target(&self, request: &ActionRequest) -> FlowResult<Vec<UserId>> {
        match (request.action, &request.target) {
            (FlowAction::Transfer | FlowAction::Assign, Some(AssignTarget::User(user))) => {
                Ok(vec![user.clone()])
            }
            (FlowAction::Transfer, Some(AssignTarget::Role(role))) => {
                self.roles.members_of(role).await
            }
            (FlowAction::Assign, Some(AssignTarget::Role(_))) => Err(FlowError::Validation(
                "assign requires a user target, not a role".into(),
            )),
            (FlowAction::Transfer | FlowAction::Assign, None) => Err(FlowError::Validation(
                format!("{} requires a target", request.action),
            )),
            _ => Ok(Vec::new()),
        }
    }

    /// Every rejected action still leaves its mark in the history
    async fn record_failure(
        &self,
        graph: &ValidGraph,
        instance: &WorkorderInstance,
        request: &ActionRequest,
        err: &FlowError,
    ) {
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
        .with_comment(err.to_string())
        .with_result(ActionResult::Failed);
        if let Err(record_err) = self.recorder.record(record).await {
            tracing::error!(
                instance_id = %instance.id,
                error = %record_err,
                "failed to append failure record"
            );
        }
        tracing::warn!(
            instance_id = %instance.id,
            step_id = %request.step_id,
            action = %request.action,
            operator = %request.operator,
            error = %err,
            "action rejected"
        );
    }

    async fn graph(
        &self,
        process_id: &ProcessId,
        version: Option<u32>,
    ) -> FlowResult<Arc<ValidGraph>> {
        if let Some(v) = version {
            let cached = {
                let graphs = self.graphs.read().unwrap_or_else(|e| e.into_inner());
                graphs.get(&(process_id.clone(), v)).cloned()
            };
            if let Some(graph) = cached {
                return Ok(graph);
            }
        }

        let definition = self.definitions.load(process_id, version).await?;
        let key = (definition.id.clone(), definition.version);
        {
            let graphs = self.graphs.read().unwrap_or_else(|e| e.into_inner());
            if let Some(graph) = graphs.get(&key) {
                return Ok(graph.clone());
            }
        }
        let graph = Arc::new(ValidGraph::validate(&definition)?);
        self.graphs
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(key, graph.clone());
        Ok(graph)
    }

    async fn instance_lock(&self, id: &InstanceId) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().await;
        locks
            .entry(id.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }
}
