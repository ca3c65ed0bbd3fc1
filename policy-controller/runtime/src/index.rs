//! Indexes `PolicyDefinition` watch events and feeds their keys to the
//! reconciler's queue.
//!
//! A deleted policy is kept as a tombstone until the reconciler has removed
//! its annotations from the selected deployments, since the watch only
//! reports the name of a deleted object.

use crate::{
    k8s::{policy::PolicyDefinition, ResourceExt},
    queue::Queue,
};
use parking_lot::RwLock;
use std::{
    collections::{hash_map::Entry, HashMap},
    fmt,
    sync::Arc,
};
use tracing::{debug, warn};

pub type SharedIndex = Arc<RwLock<Index>>;

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ObjectKey {
    pub namespace: String,
    pub name: String,
}

#[derive(Clone, Debug, PartialEq)]
pub enum PolicyEvent {
    Created(Arc<PolicyDefinition>),
    Updated {
        old: Arc<PolicyDefinition>,
        new: Arc<PolicyDefinition>,
    },
    Deleted(Arc<PolicyDefinition>),
}

/// The last observed state of a policy.
#[derive(Clone, Debug, PartialEq)]
pub enum PolicyState {
    Live(Arc<PolicyDefinition>),
    Deleted(Arc<PolicyDefinition>),
}

pub struct Index {
    policies: HashMap<ObjectKey, PolicyState>,
    queue: Queue<ObjectKey>,
}

// === impl ObjectKey ===

impl ObjectKey {
    pub fn new(namespace: impl ToString, name: impl ToString) -> Self {
        Self {
            namespace: namespace.to_string(),
            name: name.to_string(),
        }
    }

    fn of(policy: &PolicyDefinition) -> Self {
        Self::new(policy.namespace().unwrap_or_default(), policy.name_any())
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

// === impl Index ===

impl Index {
    pub fn shared(queue: Queue<ObjectKey>) -> SharedIndex {
        Arc::new(RwLock::new(Self {
            policies: HashMap::new(),
            queue,
        }))
    }

    /// Records the event and queues the policy for reconciliation.
    pub fn observe(&mut self, event: PolicyEvent) {
        let key = match &event {
            PolicyEvent::Created(policy) => {
                debug!(policy = %ObjectKey::of(policy), "Created");
                let key = ObjectKey::of(policy);
                self.policies
                    .insert(key.clone(), PolicyState::Live(policy.clone()));
                key
            }
            PolicyEvent::Updated { new, .. } => {
                debug!(policy = %ObjectKey::of(new), "Updated");
                let key = ObjectKey::of(new);
                self.policies
                    .insert(key.clone(), PolicyState::Live(new.clone()));
                key
            }
            PolicyEvent::Deleted(policy) => {
                debug!(policy = %ObjectKey::of(policy), "Deleted");
                let key = ObjectKey::of(policy);
                self.policies
                    .insert(key.clone(), PolicyState::Deleted(policy.clone()));
                key
            }
        };

        if let Err(error) = self.queue.add(key.clone()) {
            warn!(policy = %key, %error, "Failed to queue policy");
        }
    }

    pub fn get(&self, key: &ObjectKey) -> Option<PolicyState> {
        self.policies.get(key).cloned()
    }

    /// Drops a tombstone once its cleanup is complete. A policy that was
    /// recreated in the meantime is kept.
    pub fn forget_deleted(&mut self, key: &ObjectKey) {
        if let Entry::Occupied(entry) = self.policies.entry(key.clone()) {
            if matches!(entry.get(), PolicyState::Deleted(_)) {
                entry.remove();
            }
        }
    }
}

impl kubert::index::IndexNamespacedResource<PolicyDefinition> for Index {
    fn apply(&mut self, policy: PolicyDefinition) {
        let new = Arc::new(policy);
        let event = match self.policies.get(&ObjectKey::of(&new)) {
            Some(PolicyState::Live(old)) => {
                // Resyncs replay every object with an unchanged version.
                if old.metadata.resource_version.is_some()
                    && old.metadata.resource_version == new.metadata.resource_version
                {
                    return;
                }
                PolicyEvent::Updated {
                    old: old.clone(),
                    new,
                }
            }
            _ => PolicyEvent::Created(new),
        };
        self.observe(event);
    }

    fn delete(&mut self, namespace: String, name: String) {
        let key = ObjectKey::new(namespace, name);
        match self.policies.get(&key) {
            Some(PolicyState::Live(policy)) => {
                let policy = policy.clone();
                self.observe(PolicyEvent::Deleted(policy));
            }
            _ => debug!(policy = %key, "Ignoring delete of unknown policy"),
        }
    }
}
