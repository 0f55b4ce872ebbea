//! Collaborator interfaces and in-memory implementations
//!
//! The engine talks to its surroundings through small async traits:
//! definition and instance persistence, the append-only flow history,
//! the role directory, and the notification sink. Production deploys
//! back these with real stores; the in-memory versions here serve tests
//! and single-process embedding.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Mutex, RwLock};
use workorder_types::{
    FlowError, FlowRecord, FlowResult, InstanceId, ProcessDefinition, ProcessId, RoleId, StepId,
    UserId, WorkorderInstance,
};

// ── Traits ───────────────────────────────────────────────────────────

/// Versioned storage for published process definitions
#[async_trait]
pub trait DefinitionStore: Send + Sync {
    /// Store a definition, assigning the next version for its process
    /// id. Returns the assigned version.
    async fn publish(&self, definition: ProcessDefinition) -> FlowResult<u32>;

    /// Load a definition. `None` loads the latest published version.
    async fn load(&self, id: &ProcessId, version: Option<u32>) -> FlowResult<ProcessDefinition>;
}

/// Storage for workorder instances
#[async_trait]
pub trait InstanceStore: Send + Sync {
    async fn load(&self, id: &InstanceId) -> FlowResult<WorkorderInstance>;
    async fn save(&self, instance: &WorkorderInstance) -> FlowResult<()>;
}

/// Append-only storage for flow records
#[async_trait]
pub trait FlowHistoryStore: Send + Sync {
    async fn append(&self, record: FlowRecord) -> FlowResult<()>;
    /// Records of one instance in append order
    async fn list_by_instance(&self, id: &InstanceId) -> FlowResult<Vec<FlowRecord>>;
}

/// Resolves role membership. Owned by the identity collaborator; the
/// engine only ever reads from it.
#[async_trait]
pub trait RoleDirectory: Send + Sync {
    async fn members_of(&self, role: &RoleId) -> FlowResult<Vec<UserId>>;
}

/// Events pushed to users as steps route
#[derive(Clone, Debug, PartialEq)]
pub enum NotifyEvent {
    /// The user became a candidate or assignee of an activated step
    StepAssigned {
        instance_id: InstanceId,
        step_id: StepId,
        step_name: String,
    },
    /// Escalation fired without a target; nudge only
    EscalationReminder {
        instance_id: InstanceId,
        step_id: StepId,
    },
    /// Escalation fired and the step was transferred to the user
    StepEscalated {
        instance_id: InstanceId,
        step_id: StepId,
    },
    /// A decision dead-ended and the instance is paused
    StepStuck {
        instance_id: InstanceId,
        step_id: StepId,
    },
    /// Assignment resolution found no candidates
    StepUnassignable {
        instance_id: InstanceId,
        step_id: StepId,
    },
}

/// Outbound notification delivery. Fire-and-forget: delivery failures
/// are the sink's problem and never fail the action that caused them.
#[async_trait]
pub trait NotificationSink: Send + Sync {
    async fn notify(&self, user: &UserId, event: NotifyEvent);
}

// ── In-memory implementations ────────────────────────────────────────

/// In-memory definition store keeping every published version
#[derive(Default)]
pub struct MemoryDefinitionStore {
    inner: RwLock<HashMap<ProcessId, Vec<ProcessDefinition>>>,
}

impl MemoryDefinitionStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl DefinitionStore for MemoryDefinitionStore {
    async fn publish(&self, mut definition: ProcessDefinition) -> FlowResult<u32> {
        let mut inner = self.inner.write().unwrap_or_else(|e| e.into_inner());
        let versions = inner.entry(definition.id.clone()).or_default();
        definition.version = versions.len() as u32 + 1;
        let version = definition.version;
        versions.push(definition);
        Ok(version)
    }

    async fn load(&self, id: &ProcessId, version: Option<u32>) -> FlowResult<ProcessDefinition> {
        let inner = self.inner.read().unwrap_or_else(|e| e.into_inner());
        let versions = inner
            .get(id)
            .ok_or_else(|| FlowError::DefinitionNotFound(id.clone()))?;
        let found = match version {
            Some(v) => versions.iter().find(|d| d.version == v),
            None => versions.last(),
        };
        found
            .cloned()
            .ok_or_else(|| FlowError::DefinitionNotFound(id.clone()))
    }
}

/// In-memory instance store
#[derive(Default)]
pub struct MemoryInstanceStore {
    inner: RwLock<HashMap<InstanceId, WorkorderInstance>>,
}

impl MemoryInstanceStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl InstanceStore for MemoryInstanceStore {
    async fn load(&self, id: &InstanceId) -> FlowResult<WorkorderInstance> {
        self.inner
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(id)
            .cloned()
            .ok_or_else(|| FlowError::InstanceNotFound(id.clone()))
    }

    async fn save(&self, instance: &WorkorderInstance) -> FlowResult<()> {
        self.inner
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(instance.id.clone(), instance.clone());
        Ok(())
    }
}

/// In-memory append-only flow history
#[derive(Default)]
pub struct MemoryHistoryStore {
    inner: RwLock<HashMap<InstanceId, Vec<FlowRecord>>>,
}

impl MemoryHistoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl FlowHistoryStore for MemoryHistoryStore {
    async fn append(&self, record: FlowRecord) -> FlowResult<()> {
        self.inner
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .entry(record.instance_id.clone())
            .or_default()
            .push(record);
        Ok(())
    }

    async fn list_by_instance(&self, id: &InstanceId) -> FlowResult<Vec<FlowRecord>> {
        Ok(self
            .inner
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(id)
            .cloned()
            .unwrap_or_default())
    }
}

/// In-memory role directory
#[derive(Default)]
pub struct MemoryRoleDirectory {
    inner: RwLock<HashMap<RoleId, Vec<UserId>>>,
}

impl MemoryRoleDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_member(&self, role: RoleId, user: UserId) {
        self.inner
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .entry(role)
            .or_default()
            .push(user);
    }
}

#[async_trait]
impl RoleDirectory for MemoryRoleDirectory {
    async fn members_of(&self, role: &RoleId) -> FlowResult<Vec<UserId>> {
        Ok(self
            .inner
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(role)
            .cloned()
            .unwrap_or_default())
    }
}

/// Notification sink that records deliveries for inspection
#[derive(Default)]
pub struct MemoryNotificationSink {
    sent: Mutex<Vec<(UserId, NotifyEvent)>>,
}

impl MemoryNotificationSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sent(&self) -> Vec<(UserId, NotifyEvent)> {
        self.sent.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

#[async_trait]
impl NotificationSink for MemoryNotificationSink {
    async fn notify(&self, user: &UserId, event: NotifyEvent) {
        self.sent
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push((user.clone(), event));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use workorder_types::{Connection, FlowAction, ProcessStep};

    fn make_definition() -> ProcessDefinition {
        let mut def = ProcessDefinition::new("Stored");
        def.add_step(ProcessStep::start("start")).unwrap();
        def.add_step(ProcessStep::end("end")).unwrap();
        def.add_connection(Connection::new(StepId::new("start"), StepId::new("end")))
            .unwrap();
        def
    }

    #[tokio::test]
    async fn test_definition_versioning() {
        let store = MemoryDefinitionStore::new();
        let def = make_definition();
        let id = def.id.clone();

        assert_eq!(store.publish(def.clone()).await.unwrap(), 1);
        assert_eq!(store.publish(def).await.unwrap(), 2);

        let latest = store.load(&id, None).await.unwrap();
        assert_eq!(latest.version, 2);
        let pinned = store.load(&id, Some(1)).await.unwrap();
        assert_eq!(pinned.version, 1);
        assert!(store.load(&id, Some(9)).await.is_err());
    }

    #[tokio::test]
    async fn test_instance_roundtrip() {
        let store = MemoryInstanceStore::new();
        let inst = WorkorderInstance::new(ProcessId::new("p"), 1, UserId::new("alice"));
        store.save(&inst).await.unwrap();
        let loaded = store.load(&inst.id).await.unwrap();
        assert_eq!(loaded.id, inst.id);
        assert!(matches!(
            store.load(&InstanceId::new("missing")).await,
            Err(FlowError::InstanceNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_history_preserves_append_order() {
        let store = MemoryHistoryStore::new();
        let id = InstanceId::new("wo-1");
        for action in [FlowAction::Create, FlowAction::Approve, FlowAction::Cancel] {
            store
                .append(FlowRecord::new(
                    id.clone(),
                    StepId::new("s"),
                    "S",
                    action,
                    UserId::new("alice"),
                ))
                .await
                .unwrap();
        }
        let records = store.list_by_instance(&id).await.unwrap();
        assert_eq!(records.len(), 3);
        assert_eq!(records[0].action, FlowAction::Create);
        assert_eq!(records[2].action, FlowAction::Cancel);
    }

    #[tokio::test]
    async fn test_role_directory() {
        let dir = MemoryRoleDirectory::new();
        dir.add_member(RoleId::new("manager"), UserId::new("bob"));
        dir.add_member(RoleId::new("manager"), UserId::new("carol"));
        let members = dir.members_of(&RoleId::new("manager")).await.unwrap();
        assert_eq!(members.len(), 2);
        assert!(dir
            .members_of(&RoleId::new("empty"))
            .await
            .unwrap()
            .is_empty());
    }
}
