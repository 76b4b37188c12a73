//! Per-session subscription registry.
//!
//! Maps client-chosen subscription ids to the upstream request serving them.
//! REQ and COUNT share the namespace.

use crate::executor::{Cancel, HandleId};
use std::collections::{HashMap, HashSet};

/// One outstanding REQ or COUNT
#[derive(Debug)]
pub struct SubscriptionHandle {
    id: HandleId,
    seen: HashSet<String>,
    cancel: Cancel,
}

impl SubscriptionHandle {
    pub fn new(id: HandleId, cancel: Cancel) -> Self {
        Self {
            id,
            seen: HashSet::new(),
            cancel,
        }
    }

    pub fn id(&self) -> HandleId {
        self.id
    }

    /// Record `event_id`; true the first time it is seen on this handle.
    pub fn first_sighting(&mut self, event_id: &str) -> bool {
        if self.seen.contains(event_id) {
            return false;
        }
        self.seen.insert(event_id.to_string())
    }

    pub fn seen_count(&self) -> usize {
        self.seen.len()
    }

    /// Unsubscribe upstream and release the target.
    pub fn cancel(self) {
        self.cancel.cancel();
    }
}

/// Subscription id to handle, at most one handle per id
#[derive(Debug, Default)]
pub struct SubscriptionRegistry {
    entries: HashMap<String, SubscriptionHandle>,
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install `handle` under `sub_id`, cancelling whatever was there first.
    pub fn set(&mut self, sub_id: String, handle: SubscriptionHandle) {
        if let Some(previous) = self.entries.remove(&sub_id) {
            previous.cancel();
        }
        self.entries.insert(sub_id, handle);
    }

    pub fn get(&self, sub_id: &str) -> Option<&SubscriptionHandle> {
        self.entries.get(sub_id)
    }

    /// The handle under `sub_id`, but only if it is still `id`.
    pub fn get_active(&mut self, sub_id: &str, id: HandleId) -> Option<&mut SubscriptionHandle> {
        self.entries.get_mut(sub_id).filter(|handle| handle.id == id)
    }

    /// Cancel and forget `sub_id`. Returns false if nothing was registered.
    pub fn cancel_and_remove(&mut self, sub_id: &str) -> bool {
        match self.entries.remove(sub_id) {
            Some(handle) => {
                handle.cancel();
                true
            }
            None => false,
        }
    }

    /// Cancel every handle. A second call finds nothing to do.
    pub fn clear(&mut self) {
        for (_, handle) in self.entries.drain() {
            handle.cancel();
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
