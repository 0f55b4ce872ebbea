//! Workorder Execution Engine
//!
//! Drives workorder instances through published process definitions:
//! condition-guarded routing, parallel fan-out and join
//! synchronization, candidate assignment, escalation timers, and an
//! append-only flow history that can rebuild runtime state by replay.
//!
//! # Architecture
//!
//! ```text
//!   ProcessDefinition ──validate──▶ ValidGraph
//!                                      │
//!   ActionRequest ──▶ WorkorderEngine ─┤ per-instance lock
//!   EscalationFired ─▶      │          │
//!                           ▼          ▼
//!                      StateMachine ─▶ step resolver ─▶ activations
//!                           │
//!                           ▼
//!                      FlowRecord (append-only, replayable)
//! ```
//!
//! The engine is the only writer of instance state. Operator actions
//! and timer fires take the same serialized path; every application,
//! successful or rejected, leaves exactly one flow record.

#![deny(unsafe_code)]

pub mod assignment;
pub mod condition;
pub mod engine;
pub mod escalation;
pub mod graph;
pub mod history;
pub mod state_machine;
pub mod step_resolver;
pub mod store;

pub use assignment::{AssignPolicy, AssignmentResolver, LeastLoaded, Resolution};
pub use condition::ConditionEvaluator;
pub use engine::WorkorderEngine;
pub use escalation::{EscalationFired, EscalationTimers};
pub use graph::ValidGraph;
pub use history::FlowHistoryRecorder;
pub use state_machine::{ActionRequest, Applied, StateMachine};
pub use step_resolver::Advance;
pub use store::{
    DefinitionStore, FlowHistoryStore, InstanceStore, MemoryDefinitionStore, MemoryHistoryStore,
    MemoryInstanceStore, MemoryNotificationSink, MemoryRoleDirectory, NotificationSink,
    NotifyEvent, RoleDirectory,
};
