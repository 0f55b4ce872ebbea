//! Flow history: append-only audit trail and replay
//!
//! Records are the source of truth for what happened to an instance.
//! `replay` folds an instance's records over the graph from an empty
//! state and rebuilds its routing state: active step set, bindings, and
//! status. Candidate sets and escalation timers are operational state
//! and are re-resolved after recovery instead of being replayed.

use std::sync::Arc;
use workorder_types::{
    ActionResult, FlowAction, FlowError, FlowRecord, FlowResult, InstanceId, WorkorderInstance,
};

use crate::graph::ValidGraph;
use crate::step_resolver;
use crate::store::FlowHistoryStore;

/// Append-only recorder over a history store
pub struct FlowHistoryRecorder {
    store: Arc<dyn FlowHistoryStore>,
}

impl FlowHistoryRecorder {
    pub fn new(store: Arc<dyn FlowHistoryStore>) -> Self {
        Self { store }
    }

    pub async fn record(&self, record: FlowRecord) -> FlowResult<()> {
        tracing::debug!(
            instance_id = %record.instance_id,
            step_id = %record.step_id,
            action = %record.action,
            result = ?record.result,
            "flow record appended"
        );
        self.store.append(record).await
    }

    pub async fn list(&self, instance_id: &InstanceId) -> FlowResult<Vec<FlowRecord>> {
        self.store.list_by_instance(instance_id).await
    }

    /// Rebuild an instance's runtime state from its records. Failed
    /// records changed nothing and are skipped; replaying twice yields
    /// the same state.
    pub async fn replay(
        &self,
        graph: &ValidGraph,
        instance_id: &InstanceId,
    ) -> FlowResult<WorkorderInstance> {
        let records = self.store.list_by_instance(instance_id).await?;
        let create = records
            .first()
            .filter(|r| r.action == FlowAction::Create && r.result == ActionResult::Success)
            .ok_or_else(|| {
                FlowError::Validation(format!(
                    "history of instance {} does not begin with a create record",
                    instance_id
                ))
            })?;

        let definition = graph.definition();
        let mut instance = WorkorderInstance::new(
            definition.id.clone(),
            definition.version,
            create.operator_id.clone(),
        );
        instance.id = instance_id.clone();
        instance.created_at = create.timestamp;
        instance.bindings = definition.default_bindings();
        instance.merge_bindings(&create.form_snapshot);
        instance.start();
        step_resolver::activate(graph, &mut instance, graph.start_step())?;

        for record in records.iter().skip(1) {
            if record.result != ActionResult::Success {
                continue;
            }
            match record.action {
                FlowAction::Create => {}
                FlowAction::Submit => {
                    instance.merge_bindings(&record.form_snapshot);
                }
                FlowAction::Approve | FlowAction::Complete => {
                    instance.merge_bindings(&record.form_snapshot);
                    step_resolver::advance(graph, &mut instance, &record.step_id)?;
                }
                FlowAction::Reject | FlowAction::Return => {
                    let target = step_resolver::fallback_target(
                        graph,
                        &instance,
                        &record.step_id,
                        record.action,
                    )
                    .ok_or_else(|| {
                        FlowError::Validation(format!(
                            "recorded {} at '{}' has no fallback route in this definition",
                            record.action, record.step_id
                        ))
                    })?;
                    instance.merge_bindings(&record.form_snapshot);
                    instance.complete_step(&record.step_id);
                    step_resolver::activate(graph, &mut instance, &target)?;
                }
                FlowAction::Transfer | FlowAction::Escalate => {
                    if let Some(state) = instance.step_states.get_mut(&record.step_id) {
                        state.assignee = None;
                        if record.action == FlowAction::Escalate {
                            state.escalation_fired = true;
                        }
                    }
                }
                FlowAction::Assign => {
                    if let Some(user) = &record.assignee {
                        instance.set_assignee(&record.step_id, user.clone());
                    }
                }
                FlowAction::Reminder => {
                    if let Some(state) = instance.step_states.get_mut(&record.step_id) {
                        state.escalation_fired = true;
                    }
                }
                FlowAction::Cancel | FlowAction::Revoke => {
                    instance.cancel();
                }
            }
        }
        Ok(instance)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryHistoryStore;
    use std::collections::HashMap;
    use workorder_types::{
        Connection, FieldValue, InstanceStatus, ProcessCondition, ProcessDefinition, ProcessStep,
        StepId, UserId,
    };

    fn decision_graph() -> ValidGraph {
        let mut def = ProcessDefinition::new("Routed");
        def.add_step(ProcessStep::start("start")).unwrap();
        def.add_step(ProcessStep::task("triage", "Triage")).unwrap();
        def.add_step(ProcessStep::decision("route", "Route"))
            .unwrap();
        def.add_step(ProcessStep::approval("high", "High Value"))
            .unwrap();
        def.add_step(ProcessStep::approval("low", "Low Value"))
            .unwrap();
        def.add_step(ProcessStep::end("end")).unwrap();
        def.add_connection(Connection::new(StepId::new("start"), StepId::new("triage")))
            .unwrap();
        def.add_connection(Connection::new(StepId::new("triage"), StepId::new("route")))
            .unwrap();
        def.add_connection(Connection::guarded(
            StepId::new("route"),
            StepId::new("high"),
            ProcessCondition::gt("amount", 1000.0),
        ))
        .unwrap();
        def.add_connection(Connection::new(StepId::new("route"), StepId::new("low")))
            .unwrap();
        def.add_connection(Connection::new(StepId::new("high"), StepId::new("end")))
            .unwrap();
        def.add_connection(Connection::new(StepId::new("low"), StepId::new("end")))
            .unwrap();
        ValidGraph::validate(&def).unwrap()
    }

    fn record(
        instance: &InstanceId,
        step: &str,
        action: FlowAction,
        form: HashMap<String, FieldValue>,
    ) -> FlowRecord {
        FlowRecord::new(
            instance.clone(),
            StepId::new(step),
            step,
            action,
            UserId::new("alice"),
        )
        .with_form_snapshot(form)
    }

    #[tokio::test]
    async fn test_replay_reconstructs_routing_state() {
        let store = Arc::new(MemoryHistoryStore::new());
        let recorder = FlowHistoryRecorder::new(store);
        let graph = decision_graph();
        let id = InstanceId::new("wo-1");

        recorder
            .record(record(&id, "start", FlowAction::Create, HashMap::new()))
            .await
            .unwrap();
        recorder
            .record(record(
                &id,
                "triage",
                FlowAction::Complete,
                HashMap::from([("amount".to_string(), FieldValue::Num(5000.0))]),
            ))
            .await
            .unwrap();

        let inst = recorder.replay(&graph, &id).await.unwrap();
        assert_eq!(inst.id, id);
        assert_eq!(inst.status, InstanceStatus::Running);
        // The decision routed on the replayed bindings.
        assert_eq!(inst.active_steps(), vec![StepId::new("high")]);
        assert_eq!(inst.bindings.get("amount"), Some(&FieldValue::Num(5000.0)));

        // Replay is idempotent: a second pass yields the same state.
        let again = recorder.replay(&graph, &id).await.unwrap();
        assert_eq!(again.active_steps(), inst.active_steps());
        assert_eq!(again.status, inst.status);
    }

    #[tokio::test]
    async fn test_replay_skips_failed_records() {
        let store = Arc::new(MemoryHistoryStore::new());
        let recorder = FlowHistoryRecorder::new(store);
        let graph = decision_graph();
        let id = InstanceId::new("wo-2");

        recorder
            .record(record(&id, "start", FlowAction::Create, HashMap::new()))
            .await
            .unwrap();
        // A rejected attempt leaves an audit record but no state change.
        recorder
            .record(
                record(&id, "triage", FlowAction::Complete, HashMap::new())
                    .with_result(ActionResult::Failed),
            )
            .await
            .unwrap();

        let inst = recorder.replay(&graph, &id).await.unwrap();
        assert_eq!(inst.active_steps(), vec![StepId::new("triage")]);
    }

    #[tokio::test]
    async fn test_replay_through_terminal_action() {
        let store = Arc::new(MemoryHistoryStore::new());
        let recorder = FlowHistoryRecorder::new(store);
        let graph = decision_graph();
        let id = InstanceId::new("wo-3");

        recorder
            .record(record(&id, "start", FlowAction::Create, HashMap::new()))
            .await
            .unwrap();
        recorder
            .record(record(&id, "triage", FlowAction::Cancel, HashMap::new()))
            .await
            .unwrap();

        let inst = recorder.replay(&graph, &id).await.unwrap();
        assert_eq!(inst.status, InstanceStatus::Cancelled);
        assert!(inst.active_steps().is_empty());
    }

    #[tokio::test]
    async fn test_replay_without_create_record_errors() {
        let store = Arc::new(MemoryHistoryStore::new());
        let recorder = FlowHistoryRecorder::new(store);
        let graph = decision_graph();
        let id = InstanceId::new("wo-4");

        assert!(recorder.replay(&graph, &id).await.is_err());

        recorder
            .record(record(&id, "triage", FlowAction::Complete, HashMap::new()))
            .await
            .unwrap();
        assert!(matches!(
            recorder.replay(&graph, &id).await,
            Err(FlowError::Validation(_))
        ));
    }
}
