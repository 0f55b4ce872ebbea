//! Workorder Domain Types
//!
//! A workorder routes an ops request through a declarative process
//! graph of approval and task steps until completion. This crate holds
//! the pure domain model; execution semantics live in
//! `workorder-engine`.
//!
//! # Key Concepts
//!
//! - **ProcessDefinition**: the published, versioned graph of steps and
//!   connections for one workflow type. Immutable once published.
//! - **Connection**: a directed edge, optionally guarded by conditions.
//!   Declaration order is the decision tie-break rule.
//! - **WorkorderInstance**: one in-flight execution, tracking active
//!   steps, assignment, and variable bindings.
//! - **FlowRecord**: one immutable audit record per action applied,
//!   successful or rejected. Replay reconstructs runtime state.
//! - **JoinPolicy**: `all`/`any` synchronization for parallel branches.
//!
//! # Design Principles
//!
//! 1. Definitions are shared read-only; instances are mutated only by
//!    the engine, one action at a time.
//! 2. Every transition leaves a flow record. No silent gaps in the
//!    audit trail.
//! 3. Routing dead-ends (stuck decisions, unassignable steps) pause the
//!    instance visibly instead of dropping it.

#![deny(unsafe_code)]

mod condition;
mod connection;
mod definition;
mod error;
mod flow;
mod instance;

pub use condition::*;
pub use connection::*;
pub use definition::*;
pub use error::*;
pub use flow::*;
pub use instance::*;
