//! Escalation timers: deadlines on active human steps
//!
//! Each scheduled timer is one tokio task that sleeps until the step's
//! deadline and then pushes an `EscalationFired` event into the engine's
//! action path. Timers are keyed by `(instance, step)` and stamped with
//! the step's activation sequence: a return action re-activates the
//! step under a fresh sequence, so a stale timer that fires anyway is
//! recognized and discarded. Fires at most once per activation.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use workorder_types::{InstanceId, StepId};

/// A timer deadline elapsed for a step activation
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EscalationFired {
    pub instance_id: InstanceId,
    pub step_id: StepId,
    /// Activation sequence the timer was armed for
    pub activation: u64,
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
struct TimerKey {
    instance_id: InstanceId,
    step_id: StepId,
}

/// Owns the live timer tasks and the channel they fire into
pub struct EscalationTimers {
    fired_tx: mpsc::UnboundedSender<EscalationFired>,
    handles: Mutex<HashMap<TimerKey, JoinHandle<()>>>,
}

impl EscalationTimers {
    /// Create the timer set and the receiver the engine drains
    pub fn new() -> (Self, mpsc::UnboundedReceiver<EscalationFired>) {
        let (fired_tx, fired_rx) = mpsc::unbounded_channel();
        (
            Self {
                fired_tx,
                handles: Mutex::new(HashMap::new()),
            },
            fired_rx,
        )
    }

    /// Arm a timer for a step activation, replacing any earlier timer
    /// on the same step.
    pub fn schedule(
        &self,
        instance_id: InstanceId,
        step_id: StepId,
        activation: u64,
        minutes: u32,
    ) {
        let key = TimerKey {
            instance_id: instance_id.clone(),
            step_id: step_id.clone(),
        };
        let tx = self.fired_tx.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(u64::from(minutes) * 60)).await;
            // Receiver gone means the engine is shutting down.
            let _ = tx.send(EscalationFired {
                instance_id,
                step_id,
                activation,
            });
        });

        let mut handles = self.handles.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(previous) = handles.insert(key, handle) {
            previous.abort();
        }
    }

    /// Disarm the timer of one step
    pub fn cancel(&self, instance_id: &InstanceId, step_id: &StepId) {
        let key = TimerKey {
            instance_id: instance_id.clone(),
            step_id: step_id.clone(),
        };
        let mut handles = self.handles.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(handle) = handles.remove(&key) {
            handle.abort();
        }
    }

    /// Disarm every timer of an instance (terminal transitions)
    pub fn cancel_all(&self, instance_id: &InstanceId) {
        let mut handles = self.handles.lock().unwrap_or_else(|e| e.into_inner());
        handles.retain(|key, handle| {
            if &key.instance_id == instance_id {
                handle.abort();
                false
            } else {
                true
            }
        });
    }

    /// Number of armed timers, terminated tasks included until reaped
    pub fn armed(&self) -> usize {
        self.handles
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }
}

impl Drop for EscalationTimers {
    fn drop(&mut self) {
        let handles = self.handles.lock().unwrap_or_else(|e| e.into_inner());
        for handle in handles.values() {
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_timer_fires_after_deadline() {
        let (timers, mut rx) = EscalationTimers::new();
        timers.schedule(InstanceId::new("wo-1"), StepId::new("review"), 1, 30);

        tokio::time::advance(Duration::from_secs(29 * 60)).await;
        assert!(rx.try_recv().is_err());

        tokio::time::advance(Duration::from_secs(61)).await;
        let fired = rx.recv().await.unwrap();
        assert_eq!(fired.step_id, StepId::new("review"));
        assert_eq!(fired.activation, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_prevents_fire() {
        let (timers, mut rx) = EscalationTimers::new();
        timers.schedule(InstanceId::new("wo-1"), StepId::new("review"), 1, 10);
        timers.cancel(&InstanceId::new("wo-1"), &StepId::new("review"));

        tokio::time::advance(Duration::from_secs(11 * 60)).await;
        assert!(rx.try_recv().is_err());
        assert_eq!(timers.armed(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reschedule_replaces_timer() {
        let (timers, mut rx) = EscalationTimers::new();
        timers.schedule(InstanceId::new("wo-1"), StepId::new("review"), 1, 10);
        // Re-activation arms a fresh timer under the next sequence.
        timers.schedule(InstanceId::new("wo-1"), StepId::new("review"), 2, 10);

        tokio::time::advance(Duration::from_secs(11 * 60)).await;
        let fired = rx.recv().await.unwrap();
        assert_eq!(fired.activation, 2);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_all_for_instance() {
        let (timers, mut rx) = EscalationTimers::new();
        timers.schedule(InstanceId::new("wo-1"), StepId::new("a"), 1, 5);
        timers.schedule(InstanceId::new("wo-1"), StepId::new("b"), 1, 5);
        timers.schedule(InstanceId::new("wo-2"), StepId::new("a"), 1, 5);

        timers.cancel_all(&InstanceId::new("wo-1"));
        assert_eq!(timers.armed(), 1);

        tokio::time::advance(Duration::from_secs(6 * 60)).await;
        let fired = rx.recv().await.unwrap();
        assert_eq!(fired.instance_id, InstanceId::new("wo-2"));
        assert!(rx.try_recv().is_err());
    }
}
