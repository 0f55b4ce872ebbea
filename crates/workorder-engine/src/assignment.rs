//! Assignment resolution: who may act on an activated step
//!
//! Candidates come from the step's explicit users, falling back to role
//! expansion through the role directory. When a step requests
//! auto-assignment, a pluggable policy picks the single active assignee
//! from the candidate set. A human step that resolves to nobody is a
//! configuration problem surfaced as Unassignable, never a silent stall.

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex};
use workorder_types::{FlowError, FlowResult, ProcessStep, UserId};

use crate::store::RoleDirectory;

/// Result of resolving one step activation
#[derive(Clone, Debug, Default)]
pub struct Resolution {
    /// Users who may act on the step
    pub candidates: Vec<UserId>,
    /// The single assignee picked when the step auto-assigns
    pub assignee: Option<UserId>,
}

/// Picks one assignee from a candidate set
pub trait AssignPolicy: Send + Sync {
    fn pick(&self, candidates: &[UserId]) -> Option<UserId>;

    /// Called when a pick is committed, so stateful policies can track
    /// load. Default is a no-op.
    fn note_assigned(&self, _user: &UserId) {}

    /// Called when an assignment is released (step completed or
    /// transferred away).
    fn note_released(&self, _user: &UserId) {}
}

/// Default policy: the candidate with the fewest assignments this
/// policy has handed out and not yet seen released. Ties break on user
/// id for determinism.
#[derive(Default)]
pub struct LeastLoaded {
    loads: Mutex<HashMap<UserId, usize>>,
}

impl LeastLoaded {
    pub fn new() -> Self {
        Self::default()
    }
}

impl AssignPolicy for LeastLoaded {
    fn pick(&self, candidates: &[UserId]) -> Option<UserId> {
        let loads = self.loads.lock().unwrap_or_else(|e| e.into_inner());
        candidates
            .iter()
            .min_by_key(|u| (loads.get(*u).copied().unwrap_or(0), (*u).clone()))
            .cloned()
    }

    fn note_assigned(&self, user: &UserId) {
        let mut loads = self.loads.lock().unwrap_or_else(|e| e.into_inner());
        *loads.entry(user.clone()).or_insert(0) += 1;
    }

    fn note_released(&self, user: &UserId) {
        let mut loads = self.loads.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(load) = loads.get_mut(user) {
            *load = load.saturating_sub(1);
        }
    }
}

/// Resolves candidates and assignees for activated steps
pub struct AssignmentResolver {
    directory: Arc<dyn RoleDirectory>,
    policy: Arc<dyn AssignPolicy>,
}

impl AssignmentResolver {
    pub fn new(directory: Arc<dyn RoleDirectory>, policy: Arc<dyn AssignPolicy>) -> Self {
        Self { directory, policy }
    }

    /// Resolve a step's candidate set. Automatic steps resolve empty;
    /// a human step with no candidates errors.
    pub async fn resolve(&self, step: &ProcessStep) -> FlowResult<Resolution> {
        if step.is_automatic() {
            return Ok(Resolution::default());
        }

        let candidates = if !step.users.is_empty() {
            step.users.clone()
        } else {
            // Union of role members, deduplicated and ordered.
            let mut members = BTreeSet::new();
            for role in &step.roles {
                for user in self.directory.members_of(role).await? {
                    members.insert(user);
                }
            }
            members.into_iter().collect()
        };

        if candidates.is_empty() {
            return Err(FlowError::Unassignable(step.id.clone()));
        }

        let assignee = if step.auto_assign {
            let picked = self.policy.pick(&candidates);
            if let Some(user) = &picked {
                self.policy.note_assigned(user);
                tracing::debug!(step_id = %step.id, assignee = %user, "auto-assigned step");
            }
            picked
        } else {
            None
        };

        Ok(Resolution {
            candidates,
            assignee,
        })
    }

    /// Release an assignee's load when a step leaves their queue
    pub fn release(&self, user: &UserId) {
        self.policy.note_released(user);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryRoleDirectory;
    use workorder_types::{ProcessStep, RoleId};

    fn resolver_with_managers(users: &[&str]) -> AssignmentResolver {
        let directory = MemoryRoleDirectory::new();
        for user in users {
            directory.add_member(RoleId::new("manager"), UserId::new(*user));
        }
        AssignmentResolver::new(Arc::new(directory), Arc::new(LeastLoaded::new()))
    }

    #[tokio::test]
    async fn test_explicit_users_take_precedence() {
        let resolver = resolver_with_managers(&["bob"]);
        let step = ProcessStep::approval("review", "Review")
            .with_user(UserId::new("alice"))
            .with_role(RoleId::new("manager"));
        let res = resolver.resolve(&step).await.unwrap();
        assert_eq!(res.candidates, vec![UserId::new("alice")]);
        assert!(res.assignee.is_none());
    }

    #[tokio::test]
    async fn test_role_expansion_dedupes_and_sorts() {
        let directory = MemoryRoleDirectory::new();
        directory.add_member(RoleId::new("ops"), UserId::new("carol"));
        directory.add_member(RoleId::new("ops"), UserId::new("bob"));
        directory.add_member(RoleId::new("sre"), UserId::new("bob"));
        let resolver =
            AssignmentResolver::new(Arc::new(directory), Arc::new(LeastLoaded::new()));

        let step = ProcessStep::approval("review", "Review")
            .with_role(RoleId::new("ops"))
            .with_role(RoleId::new("sre"));
        let res = resolver.resolve(&step).await.unwrap();
        assert_eq!(res.candidates, vec![UserId::new("bob"), UserId::new("carol")]);
    }

    #[tokio::test]
    async fn test_empty_resolution_is_unassignable() {
        let resolver = resolver_with_managers(&[]);
        let step = ProcessStep::approval("review", "Review").with_role(RoleId::new("manager"));
        assert!(matches!(
            resolver.resolve(&step).await,
            Err(FlowError::Unassignable(_))
        ));
    }

    #[tokio::test]
    async fn test_automatic_steps_resolve_empty() {
        let resolver = resolver_with_managers(&[]);
        let step = ProcessStep::decision("route", "Route");
        let res = resolver.resolve(&step).await.unwrap();
        assert!(res.candidates.is_empty());
        assert!(res.assignee.is_none());
    }

    #[tokio::test]
    async fn test_least_loaded_rotates_assignments() {
        let resolver = resolver_with_managers(&["bob", "carol"]);
        let step = ProcessStep::approval("review", "Review")
            .with_role(RoleId::new("manager"))
            .with_auto_assign();

        // Ties break to the lexically first user, then load shifts.
        let first = resolver.resolve(&step).await.unwrap().assignee.unwrap();
        assert_eq!(first, UserId::new("bob"));
        let second = resolver.resolve(&step).await.unwrap().assignee.unwrap();
        assert_eq!(second, UserId::new("carol"));

        // Releasing bob makes him least loaded again.
        resolver.release(&UserId::new("bob"));
        let third = resolver.resolve(&step).await.unwrap().assignee.unwrap();
        assert_eq!(third, UserId::new("bob"));
    }
}
