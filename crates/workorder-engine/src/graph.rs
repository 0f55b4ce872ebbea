//! Graph validation: a ProcessDefinition becomes a ValidGraph or is rejected
//!
//! Every structural property the engine relies on at runtime is checked
//! once, at publish time. Instances only ever route through a
//! `ValidGraph`, so the resolver can index steps and connections without
//! re-checking the definition on every action.

use std::collections::{HashMap, HashSet, VecDeque};
use workorder_types::{
    Connection, FlowError, FlowResult, ProcessDefinition, ProcessStep, StepId, StepType,
};

/// A process definition that passed structural validation, with
/// adjacency indexes for routing.
#[derive(Clone, Debug)]
pub struct ValidGraph {
    definition: ProcessDefinition,
    /// Outgoing connection indices per step, in declaration order
    successors: HashMap<StepId, Vec<usize>>,
    /// Incoming connection indices per step
    predecessors: HashMap<StepId, Vec<usize>>,
    start: StepId,
}

impl ValidGraph {
    /// Validate a definition. Rejected definitions never reach the
    /// runtime; the error names the first structural problem found.
    pub fn validate(definition: &ProcessDefinition) -> FlowResult<Self> {
        let mut seen = HashSet::new();
        for step in &definition.steps {
            if !seen.insert(step.id.clone()) {
                return Err(FlowError::DefinitionInvalid(format!(
                    "duplicate step id '{}'",
                    step.id
                )));
            }
        }

        let starts: Vec<&ProcessStep> = definition
            .steps
            .iter()
            .filter(|s| s.step_type == StepType::Start)
            .collect();
        if starts.len() != 1 {
            return Err(FlowError::DefinitionInvalid(format!(
                "expected exactly one start step, found {}",
                starts.len()
            )));
        }
        let start = starts[0].id.clone();

        if definition.end_steps().is_empty() {
            return Err(FlowError::DefinitionInvalid(
                "process has no end step".into(),
            ));
        }

        let mut successors: HashMap<StepId, Vec<usize>> = HashMap::new();
        let mut predecessors: HashMap<StepId, Vec<usize>> = HashMap::new();
        for (idx, conn) in definition.connections.iter().enumerate() {
            if definition.step(&conn.from).is_none() {
                return Err(FlowError::DefinitionInvalid(format!(
                    "connection source '{}' is not a step",
                    conn.from
                )));
            }
            if definition.step(&conn.to).is_none() {
                return Err(FlowError::DefinitionInvalid(format!(
                    "connection target '{}' is not a step",
                    conn.to
                )));
            }
            successors.entry(conn.from.clone()).or_default().push(idx);
            predecessors.entry(conn.to.clone()).or_default().push(idx);
        }
        for edges in successors.values_mut() {
            edges.sort_by_key(|&idx| definition.connections[idx].order);
        }

        for step in &definition.steps {
            let has_in = predecessors.contains_key(&step.id);
            let has_out = successors.contains_key(&step.id);
            match step.step_type {
                StepType::Start => {
                    if has_in {
                        return Err(FlowError::DefinitionInvalid(format!(
                            "start step '{}' has incoming connections",
                            step.id
                        )));
                    }
                    if !has_out {
                        return Err(FlowError::DefinitionInvalid(format!(
                            "start step '{}' has no outgoing connection",
                            step.id
                        )));
                    }
                }
                StepType::End => {
                    if has_out {
                        return Err(FlowError::DefinitionInvalid(format!(
                            "end step '{}' has outgoing connections",
                            step.id
                        )));
                    }
                    if !has_in {
                        return Err(FlowError::DefinitionInvalid(format!(
                            "end step '{}' has no incoming connection",
                            step.id
                        )));
                    }
                }
                _ => {
                    if !has_in {
                        return Err(FlowError::DefinitionInvalid(format!(
                            "step '{}' is unreachable (no incoming connection)",
                            step.id
                        )));
                    }
                    if !has_out {
                        return Err(FlowError::DefinitionInvalid(format!(
                            "step '{}' is a dead end (no outgoing connection)",
                            step.id
                        )));
                    }
                }
            }
        }

        // Reachability from start. Steps with incoming edges can still sit
        // in an island the start never reaches.
        let mut reachable = HashSet::new();
        let mut queue = VecDeque::from([start.clone()]);
        reachable.insert(start.clone());
        while let Some(current) = queue.pop_front() {
            if let Some(edges) = successors.get(&current) {
                for &idx in edges {
                    let next = &definition.connections[idx].to;
                    if reachable.insert(next.clone()) {
                        queue.push_back(next.clone());
                    }
                }
            }
        }
        for step in &definition.steps {
            if !reachable.contains(&step.id) {
                return Err(FlowError::DefinitionInvalid(format!(
                    "step '{}' is not reachable from the start step",
                    step.id
                )));
            }
        }

        detect_cycle(definition, &successors, &start)?;

        Ok(Self {
            definition: definition.clone(),
            successors,
            predecessors,
            start,
        })
    }

    pub fn definition(&self) -> &ProcessDefinition {
        &self.definition
    }

    /// Get a step, erroring if the id is unknown
    pub fn step(&self, id: &StepId) -> FlowResult<&ProcessStep> {
        self.definition
            .step(id)
            .ok_or_else(|| FlowError::StepNotFound(id.clone()))
    }

    /// The single start step
    pub fn start_step(&self) -> &StepId {
        &self.start
    }

    /// Outgoing connections in declaration order
    pub fn outgoing(&self, id: &StepId) -> Vec<&Connection> {
        self.successors
            .get(id)
            .map(|edges| {
                edges
                    .iter()
                    .map(|&idx| &self.definition.connections[idx])
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Incoming connections
    pub fn incoming(&self, id: &StepId) -> Vec<&Connection> {
        self.predecessors
            .get(id)
            .map(|edges| {
                edges
                    .iter()
                    .map(|&idx| &self.definition.connections[idx])
                    .collect()
            })
            .unwrap_or_default()
    }

    /// How many branches feed a step. A step with more than one incoming
    /// connection is a join target and synchronizes per its join policy.
    pub fn join_expectation(&self, id: &StepId) -> usize {
        self.predecessors.get(id).map(|e| e.len()).unwrap_or(0)
    }
}

/// DFS back-edge detection. Only DAGs are accepted; loops in a process
/// are expressed through reject/return fallback routing, not graph
/// cycles, so parallel join synchronization stays well-defined.
fn detect_cycle(
    definition: &ProcessDefinition,
    successors: &HashMap<StepId, Vec<usize>>,
    start: &StepId,
) -> FlowResult<()> {
    #[derive(Clone, Copy, PartialEq)]
    enum Mark {
        InProgress,
        Done,
    }

    let mut marks: HashMap<StepId, Mark> = HashMap::new();
    // Iterative DFS with an explicit exit frame per node.
    let mut stack: Vec<(StepId, bool)> = vec![(start.clone(), false)];
    while let Some((node, exiting)) = stack.pop() {
        if exiting {
            marks.insert(node, Mark::Done);
            continue;
        }
        match marks.get(&node) {
            Some(Mark::Done) => continue,
            Some(Mark::InProgress) => continue,
            None => {}
        }
        marks.insert(node.clone(), Mark::InProgress);
        stack.push((node.clone(), true));
        if let Some(edges) = successors.get(&node) {
            for &idx in edges {
                let next = &definition.connections[idx].to;
                match marks.get(next) {
                    Some(Mark::InProgress) => {
                        return Err(FlowError::DefinitionInvalid(format!(
                            "cycle detected through step '{}'",
                            next
                        )));
                    }
                    Some(Mark::Done) => {}
                    None => stack.push((next.clone(), false)),
                }
            }
        }
    }
    Ok(())
}
