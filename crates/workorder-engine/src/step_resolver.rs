//! Step resolution: which steps activate after a completion
//!
//! The resolver walks the graph from a completed step and mutates the
//! instance's step states: activating successors, auto-completing
//! automatic steps, synchronizing joins, and marking skipped branches
//! moot so downstream joins never wait on a branch that can no longer
//! arrive. Decisions route to exactly one connection; a decision with no
//! matching connection and no default pauses the branch visibly as
//! Stuck instead of dropping it.

use std::collections::VecDeque;
use workorder_types::{
    FieldValue, FlowAction, FlowResult, JoinPolicy, StepId, StepPhase, StepType,
    WorkorderInstance,
};

use crate::condition::ConditionEvaluator;
use crate::graph::ValidGraph;

/// Outcome of one resolution pass
#[derive(Clone, Debug, Default)]
pub struct Advance {
    /// Human steps newly waiting for an operator
    pub activated: Vec<StepId>,
    /// Decision step that dead-ended, if any
    pub stuck: Option<StepId>,
    /// Active steps forced out of the active set without an operator
    /// action (losing branches of a won any-join); their escalation
    /// timers must be disarmed
    pub deactivated: Vec<StepId>,
    /// Whether the instance reached Completed in this pass
    pub completed: bool,
}

/// Mark a step completed and resolve everything downstream of it.
pub fn advance(
    graph: &ValidGraph,
    instance: &mut WorkorderInstance,
    completed: &StepId,
) -> FlowResult<Advance> {
    instance.complete_step(completed);
    let mut adv = Advance::default();
    let mut queue = VecDeque::from([completed.clone()]);
    drain(graph, instance, &mut queue, &mut adv)?;
    finalize(graph, instance, &mut adv);
    Ok(adv)
}

/// Activate a step directly, bypassing join synchronization. Used for
/// instance launch (the start step) and for reject/return routing,
/// where the target is re-activated regardless of its earlier phase.
pub fn activate(
    graph: &ValidGraph,
    instance: &mut WorkorderInstance,
    target: &StepId,
) -> FlowResult<Advance> {
    let mut adv = Advance::default();
    let mut queue = VecDeque::new();
    activate_step(graph, instance, target, &mut queue, &mut adv)?;
    drain(graph, instance, &mut queue, &mut adv)?;
    finalize(graph, instance, &mut adv);
    Ok(adv)
}

/// Where a reject/return action routes. An outgoing connection guarded
/// on the `action` pseudo-binding wins; otherwise the step's configured
/// `return_to`. None means the definition provides no fallback.
pub fn fallback_target(
    graph: &ValidGraph,
    instance: &WorkorderInstance,
    step_id: &StepId,
    action: FlowAction,
) -> Option<StepId> {
    let step = graph.step(step_id).ok()?;
    let mut bindings = instance.bindings.clone();
    bindings.insert("action".into(), FieldValue::Str(action.to_string()));
    for conn in graph.outgoing(step_id) {
        let routes_on_action = conn.conditions.iter().any(|c| c.field == "action");
        if routes_on_action && ConditionEvaluator::evaluate_all(&conn.conditions, &bindings) {
            return Some(conn.to.clone());
        }
    }
    step.return_to.clone()
}

// ── Worklist ─────────────────────────────────────────────────────────

fn drain(
    graph: &ValidGraph,
    instance: &mut WorkorderInstance,
    queue: &mut VecDeque<StepId>,
    adv: &mut Advance,
) -> FlowResult<()> {
    while let Some(from) = queue.pop_front() {
        route_from(graph, instance, &from, queue, adv)?;
    }
    Ok(())
}

/// Route out of a completed step: pick the connections that fire, then
/// moot the branches that can no longer arrive.
fn route_from(
    graph: &ValidGraph,
    instance: &mut WorkorderInstance,
    from: &StepId,
    queue: &mut VecDeque<StepId>,
    adv: &mut Advance,
) -> FlowResult<()> {
    let step = graph.step(from)?;
    let outgoing = graph.outgoing(from);
    if outgoing.is_empty() {
        return Ok(());
    }

    let fires: Vec<bool> = outgoing
        .iter()
        .map(|c| ConditionEvaluator::connection_fires(c, &instance.bindings))
        .collect();

    let taken: Vec<usize> = match step.step_type {
        StepType::Decision => {
            // First matching guarded connection in declaration order;
            // a conditionless connection is the default route.
            let chosen = outgoing
                .iter()
                .enumerate()
                .find(|(i, c)| !c.is_unconditional() && fires[*i])
                .or_else(|| {
                    outgoing
                        .iter()
                        .enumerate()
                        .find(|(_, c)| c.is_unconditional())
                })
                .map(|(i, _)| i);
            match chosen {
                Some(i) => vec![i],
                None => {
                    tracing::warn!(
                        instance_id = %instance.id,
                        step_id = %from,
                        "decision has no matching connection and no default; branch paused"
                    );
                    instance.mark_stuck(from);
                    adv.stuck = Some(from.clone());
                    return Ok(());
                }
            }
        }
        _ if step.parallel => (0..outgoing.len()).filter(|&i| fires[i]).collect(),
        _ => {
            // Sequential step: the first firing connection wins.
            match (0..outgoing.len()).find(|&i| fires[i]) {
                Some(i) => vec![i],
                None => {
                    tracing::warn!(
                        instance_id = %instance.id,
                        step_id = %from,
                        "no outgoing connection fires; branch paused"
                    );
                    instance.mark_stuck(from);
                    adv.stuck = Some(from.clone());
                    return Ok(());
                }
            }
        }
    };

    let targets: Vec<StepId> = taken.iter().map(|&i| outgoing[i].to.clone()).collect();
    let skipped: Vec<StepId> = (0..outgoing.len())
        .filter(|i| !taken.contains(i))
        .map(|i| outgoing[i].to.clone())
        .collect();

    for target in &targets {
        arrive(graph, instance, target, queue, adv)?;
    }
    for target in &skipped {
        propagate_moot(graph, instance, target, queue, adv)?;
    }
    Ok(())
}

/// A live branch arrived at a step. Joins synchronize here. A step
/// finished in an earlier pass re-activates, which is how the redo
/// after a reject/return walks the same stretch of graph again.
fn arrive(
    graph: &ValidGraph,
    instance: &mut WorkorderInstance,
    target: &StepId,
    queue: &mut VecDeque<StepId>,
    adv: &mut Advance,
) -> FlowResult<()> {
    let phase = instance
        .step_state(target)
        .map(|s| s.phase)
        .unwrap_or_default();
    if phase == StepPhase::Active {
        // Already waiting for an operator; a duplicate arrival must not
        // bump the activation out from under them.
        tracing::debug!(
            instance_id = %instance.id,
            step_id = %target,
            "arrival at an active step ignored"
        );
        return Ok(());
    }

    if graph.join_expectation(target) > 1 {
        let step = graph.step(target)?;
        match step.join_policy {
            JoinPolicy::All => {
                let all_finished = graph
                    .incoming(target)
                    .iter()
                    .all(|c| instance.step_finished(&c.from));
                if !all_finished {
                    return Ok(());
                }
            }
            JoinPolicy::Any => {
                // First arrival wins. The branches that did not make it
                // can no longer contribute; mark them moot, unreached
                // feeders included, so the instance finishes without a
                // superfluous human action on a losing branch.
                let losers: Vec<StepId> = graph
                    .incoming(target)
                    .iter()
                    .filter(|c| !instance.step_finished(&c.from))
                    .map(|c| c.from.clone())
                    .collect();
                for loser in &losers {
                    moot_dead_feeder(graph, instance, loser, target, adv);
                }
            }
        }
    }

    activate_step(graph, instance, target, queue, adv)
}

/// Mark a step moot when everything it feeds is already settled, then
/// walk upstream so an unreached chain behind a won any-join dies with
/// it. `resolved` is the join whose outcome made the branch dead.
fn moot_dead_feeder(
    graph: &ValidGraph,
    instance: &mut WorkorderInstance,
    step_id: &StepId,
    resolved: &StepId,
    adv: &mut Advance,
) {
    let phase = instance
        .step_state(step_id)
        .map(|s| s.phase)
        .unwrap_or_default();
    if matches!(phase, StepPhase::Completed | StepPhase::Moot) {
        return;
    }
    let dead = graph
        .outgoing(step_id)
        .iter()
        .all(|c| c.to == *resolved || instance.step_finished(&c.to));
    if !dead {
        return;
    }
    if phase == StepPhase::Active {
        adv.deactivated.push(step_id.clone());
    }
    set_moot(instance, step_id);

    let feeders: Vec<StepId> = graph
        .incoming(step_id)
        .iter()
        .map(|c| c.from.clone())
        .collect();
    for feeder in &feeders {
        moot_dead_feeder(graph, instance, feeder, resolved, adv);
    }
}

/// Activate a step unconditionally. Automatic steps complete in place
/// and are queued for further routing; human steps with a failing guard
/// are skipped rather than stalled.
fn activate_step(
    graph: &ValidGraph,
    instance: &mut WorkorderInstance,
    target: &StepId,
    queue: &mut VecDeque<StepId>,
    adv: &mut Advance,
) -> FlowResult<()> {
    let step = graph.step(target)?;
    instance.activate_step(target.clone());

    match step.step_type {
        StepType::End => {
            instance.complete_step(target);
        }
        StepType::Start | StepType::Decision => {
            instance.complete_step(target);
            queue.push_back(target.clone());
        }
        StepType::Approval | StepType::Task => {
            if !step.guard.is_empty()
                && !ConditionEvaluator::evaluate_all(&step.guard, &instance.bindings)
            {
                tracing::debug!(
                    instance_id = %instance.id,
                    step_id = %target,
                    "step guard not met; step skipped"
                );
                instance.complete_step(target);
                queue.push_back(target.clone());
            } else {
                adv.activated.push(target.clone());
            }
        }
    }
    Ok(())
}

/// A branch into `target` can no longer arrive. Mark what that makes
/// moot, unblocking downstream joins whose remaining feeds are all dead.
fn propagate_moot(
    graph: &ValidGraph,
    instance: &mut WorkorderInstance,
    target: &StepId,
    queue: &mut VecDeque<StepId>,
    adv: &mut Advance,
) -> FlowResult<()> {
    let phase = instance
        .step_state(target)
        .map(|s| s.phase)
        .unwrap_or_default();
    if phase != StepPhase::Pending {
        return Ok(());
    }

    if graph.join_expectation(target) > 1 {
        let incoming = graph.incoming(target);
        if !incoming.iter().all(|c| instance.step_finished(&c.from)) {
            // Another branch may still arrive live.
            return Ok(());
        }
        let any_live = incoming.iter().any(|c| {
            instance
                .step_state(&c.from)
                .map(|s| s.phase == StepPhase::Completed)
                .unwrap_or(false)
        });
        if any_live {
            return activate_step(graph, instance, target, queue, adv);
        }
    }

    set_moot(instance, target);
    let successors: Vec<StepId> = graph.outgoing(target).iter().map(|c| c.to.clone()).collect();
    for next in successors {
        propagate_moot(graph, instance, &next, queue, adv)?;
    }
    Ok(())
}

fn set_moot(instance: &mut WorkorderInstance, step_id: &StepId) {
    let state = instance.step_states.entry(step_id.clone()).or_default();
    state.phase = StepPhase::Moot;
    state.completed_at = Some(chrono::Utc::now());
}

/// Complete the instance once no branch is active or paused and at
/// least one end step finished live.
fn finalize(graph: &ValidGraph, instance: &mut WorkorderInstance, adv: &mut Advance) {
    if !instance.is_running() {
        return;
    }
    let open = instance.step_states.values().any(|s| {
        matches!(
            s.phase,
            StepPhase::Active | StepPhase::Stuck | StepPhase::Unassignable
        )
    });
    let end_reached = graph.definition().end_steps().iter().any(|s| {
        instance
            .step_state(&s.id)
            .map(|st| st.phase == StepPhase::Completed)
            .unwrap_or(false)
    });
    if !open && end_reached {
        instance.complete();
        adv.completed = true;
        tracing::info!(instance_id = %instance.id, "workorder instance completed");
    }
}
